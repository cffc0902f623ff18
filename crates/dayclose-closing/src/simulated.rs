use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dayclose_core::config::SimulationConfig;
use dayclose_core::{ClosingDate, JobName, UserId};
use tracing::info;
use uuid::Uuid;

use crate::collaborators::{
    ClosingJobs, CollaboratorError, JobSubmission, MetricsBackend, MetricsOutcome,
    MetricsProgress, PollResult,
};

/// In-process stand-in for the external job system and metrics backend.
///
/// Jobs report `running` for a configured number of checks and then complete
/// (or fail). Metrics runs finish instantly and report full progress.
/// Counters live in memory only.
pub struct SimulatedBackend {
    polls_until_complete: u32,
    fail_job: bool,
    total_steps: u32,
    polls: DashMap<String, u32>,
    runs: DashMap<Uuid, MetricsProgress>,
    submissions: AtomicU32,
}

impl SimulatedBackend {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            polls_until_complete: config.polls_until_complete,
            fail_job: config.fail_job,
            total_steps: config.metrics_total_steps,
            polls: DashMap::new(),
            runs: DashMap::new(),
            submissions: AtomicU32::new(0),
        }
    }

    /// Jobs submitted so far.
    pub fn submissions(&self) -> u32 {
        self.submissions.load(Ordering::SeqCst)
    }
}

/// `CLOSING_{YYYY}_{MM}_{submitted-at millis}`.
pub fn job_name_for(date: &ClosingDate, submitted_at: DateTime<Utc>) -> String {
    format!(
        "CLOSING_{}_{:02}_{}",
        date.year(),
        date.month(),
        submitted_at.timestamp_millis()
    )
}

#[async_trait]
impl ClosingJobs for SimulatedBackend {
    async fn submit_job(
        &self,
        date: &ClosingDate,
        user: &UserId,
    ) -> Result<JobSubmission, CollaboratorError> {
        let job_name = job_name_for(date, Utc::now());
        self.submissions.fetch_add(1, Ordering::SeqCst);
        self.polls.insert(job_name.clone(), 0);
        info!(%job_name, %user, "simulated closing job submitted");
        Ok(JobSubmission::Submitted {
            message: format!("Job {job_name} submitted for {date}"),
            job_name,
        })
    }

    async fn check_job_status(&self, job: &JobName) -> Result<PollResult, CollaboratorError> {
        // Jobs submitted before a restart start counting again.
        let mut polls = self.polls.entry(job.as_str().to_string()).or_insert(0);
        *polls += 1;
        if *polls <= self.polls_until_complete {
            return Ok(PollResult::Running {
                message: format!("Job {job} is running"),
            });
        }
        if self.fail_job {
            Ok(PollResult::Failed {
                message: format!("Job {job} ended with errors"),
            })
        } else {
            Ok(PollResult::Completed {
                message: format!("Job {job} completed successfully"),
            })
        }
    }
}

#[async_trait]
impl MetricsBackend for SimulatedBackend {
    async fn compute_metrics(
        &self,
        date: &ClosingDate,
        run_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> Result<MetricsOutcome, CollaboratorError> {
        self.runs.insert(
            run_id,
            MetricsProgress {
                status: "completed".to_string(),
                completed_steps: self.total_steps,
                total_steps: self.total_steps,
                error_count: 0,
                warning_count: 0,
            },
        );
        info!(%run_id, %date, %as_of, "simulated metrics run finished");
        Ok(MetricsOutcome {
            success: true,
            duration_secs: 0.0,
            message: format!("Financial metrics calculated for {date}"),
        })
    }

    async fn get_metrics_progress(
        &self,
        run_id: Uuid,
    ) -> Result<Option<MetricsProgress>, CollaboratorError> {
        Ok(self.runs.get(&run_id).map(|p| p.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn backend(polls: u32, fail_job: bool) -> SimulatedBackend {
        SimulatedBackend::new(&SimulationConfig {
            polls_until_complete: polls,
            fail_job,
            metrics_total_steps: 4,
        })
    }

    #[test]
    fn job_names_are_valid() {
        let date = ClosingDate::parse("2025-01-31").unwrap();
        let at = Utc.with_ymd_and_hms(2025, 1, 31, 17, 0, 0).unwrap();
        let name = job_name_for(&date, at);
        assert_eq!(name, format!("CLOSING_2025_01_{}", at.timestamp_millis()));
        assert!(JobName::parse(&name).is_ok());
    }

    #[tokio::test]
    async fn job_runs_then_completes() {
        let backend = backend(2, false);
        let date = ClosingDate::parse("2025-01-31").unwrap();
        let user = UserId::parse("adm").unwrap();
        let JobSubmission::Submitted { job_name, .. } =
            backend.submit_job(&date, &user).await.unwrap()
        else {
            panic!("expected submission");
        };
        let job = JobName::parse(&job_name).unwrap();

        for _ in 0..2 {
            assert!(matches!(
                backend.check_job_status(&job).await.unwrap(),
                PollResult::Running { .. }
            ));
        }
        assert!(matches!(
            backend.check_job_status(&job).await.unwrap(),
            PollResult::Completed { .. }
        ));
        assert_eq!(backend.submissions(), 1);
    }

    #[tokio::test]
    async fn failing_job_reports_failure() {
        let backend = backend(0, true);
        let date = ClosingDate::parse("2025-01-31").unwrap();
        let user = UserId::parse("adm").unwrap();
        let JobSubmission::Submitted { job_name, .. } =
            backend.submit_job(&date, &user).await.unwrap()
        else {
            panic!("expected submission");
        };
        let status = backend
            .check_job_status(&JobName::parse(&job_name).unwrap())
            .await
            .unwrap();
        assert!(matches!(status, PollResult::Failed { .. }));
    }

    #[tokio::test]
    async fn metrics_progress_is_known_after_compute() {
        let backend = backend(0, false);
        let run_id = Uuid::new_v4();
        assert_eq!(backend.get_metrics_progress(run_id).await.unwrap(), None);
        let date = ClosingDate::parse("2025-01-31").unwrap();
        backend.compute_metrics(&date, run_id, Utc::now()).await.unwrap();
        let progress = backend.get_metrics_progress(run_id).await.unwrap().unwrap();
        assert_eq!(progress.completed_steps, 4);
    }
}
