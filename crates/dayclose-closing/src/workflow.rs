use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dayclose_core::{ClosingDate, JobName, UserId};
use dayclose_engine::{Context, Handler, HandlerError, Runtime, ServiceKind, StateScope, Target};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::collaborators::{
    ClosingJobs, CollaboratorError, JobSubmission, MetricsBackend, MetricsOutcome, PollResult,
};
use crate::error::ClosingError;
use crate::types::{
    ClosingInput, ClosingOptions, ClosingResult, ClosingStep, FailureReport, StepReport,
    WorkflowState,
};

pub const SERVICE: &str = "DailyClosing";
pub const RUN_HANDLER: &str = "run";
/// State slot holding the [`WorkflowState`] snapshot.
pub const STATE_NAME: &str = "state";

pub const SUBMIT_STEP: &str = "submit-closing-job";
pub const RUN_ID_STEP: &str = "metrics-run-id";
pub const METRICS_STEP: &str = "financial-metrics";

fn check_step(attempt: u32) -> String {
    format!("check-job-status-{attempt}")
}

/// Address of the closing instance for `date`.
pub fn target(date: &ClosingDate) -> Target {
    Target::new(SERVICE, date.format(), RUN_HANDLER)
}

/// How an execution stopped short of a result.
enum Interrupt {
    /// A classified domain failure; ends the run.
    Failed(ClosingError),
    /// Engine control flow (suspension or a retryable fault) to hand back.
    Engine(HandlerError),
}

impl From<ClosingError> for Interrupt {
    fn from(err: ClosingError) -> Self {
        Interrupt::Failed(err)
    }
}

impl From<HandlerError> for Interrupt {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Terminal(message) => Interrupt::Failed(ClosingError::Engine(message)),
            other => Interrupt::Engine(other),
        }
    }
}

impl From<dayclose_core::CoreError> for Interrupt {
    fn from(err: dayclose_core::CoreError) -> Self {
        Interrupt::Failed(ClosingError::Validation(err))
    }
}

/// Transient collaborator failures are retried by the engine and never
/// journaled; everything else is recorded as the step's value.
fn settle<T>(
    result: Result<T, CollaboratorError>,
) -> Result<Result<T, CollaboratorError>, HandlerError> {
    match result {
        Err(err) if err.is_transient() => Err(HandlerError::retryable(err.message)),
        other => Ok(other),
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}

/// Identifiers learned so far; reported even when the run fails.
#[derive(Default)]
struct Progress {
    job_name: Option<String>,
    run_id: Option<Uuid>,
    oracle_closing: Option<StepReport>,
    financial_metrics: Option<StepReport>,
}

/// The `DailyClosing` workflow: submit and poll the external closing job, then
/// compute financial metrics. One instance per closing date.
pub struct DailyClosing {
    jobs: Arc<dyn ClosingJobs>,
    metrics: Arc<dyn MetricsBackend>,
    options: ClosingOptions,
}

impl DailyClosing {
    pub fn new(
        jobs: Arc<dyn ClosingJobs>,
        metrics: Arc<dyn MetricsBackend>,
        options: ClosingOptions,
    ) -> Self {
        Self {
            jobs,
            metrics,
            options,
        }
    }

    /// Register `run` on `runtime` as a workflow service.
    pub fn register(self: Arc<Self>, runtime: &Runtime) {
        runtime.register(SERVICE, ServiceKind::Workflow, RUN_HANDLER, self);
    }

    fn record_state(
        &self,
        ctx: &mut Context,
        progress: &Progress,
        step: ClosingStep,
        step_start_time: Option<DateTime<Utc>>,
    ) -> Result<(), HandlerError> {
        let state = WorkflowState {
            current_step: step,
            external_job_name: progress.job_name.clone(),
            metrics_run_id: progress.run_id,
            step_start_time,
            last_update: ctx.now()?,
        };
        ctx.set_state(STATE_NAME, &state)
    }

    async fn execute(
        &self,
        ctx: &mut Context,
        input: &ClosingInput,
        progress: &mut Progress,
    ) -> Result<(), Interrupt> {
        let date = ClosingDate::parse(input.date.as_deref().unwrap_or(ctx.key()))?;
        if date.format() != ctx.key() {
            return Err(ClosingError::DateMismatch {
                date: date.format(),
                key: ctx.key().to_string(),
            }
            .into());
        }
        let user = match input.user_id.as_deref() {
            Some(raw) => UserId::parse(raw)?,
            None => self.options.default_user.clone(),
        };

        if input.skip_oracle_closing {
            info!(%date, "skipping oracle closing");
        } else {
            let step_start = ctx.now()?;
            self.record_state(ctx, progress, ClosingStep::OracleClosing, Some(step_start))?;
            let report = self
                .oracle_closing(ctx, &date, &user, step_start, progress)
                .await?;
            progress.oracle_closing = Some(report);
        }

        if input.skip_financial_metrics {
            info!(%date, "skipping financial metrics");
        } else {
            let step_start = ctx.now()?;
            self.record_state(ctx, progress, ClosingStep::FinancialMetrics, Some(step_start))?;
            let report = self
                .financial_metrics(ctx, &date, step_start, progress)
                .await?;
            progress.financial_metrics = Some(report);
        }

        self.record_state(ctx, progress, ClosingStep::Completed, None)?;
        Ok(())
    }

    async fn oracle_closing(
        &self,
        ctx: &mut Context,
        date: &ClosingDate,
        user: &UserId,
        step_start: DateTime<Utc>,
        progress: &mut Progress,
    ) -> Result<StepReport, Interrupt> {
        let jobs = &self.jobs;
        let submission = ctx
            .run_step(SUBMIT_STEP, move || async move {
                settle(jobs.submit_job(date, user).await)
            })
            .await?;
        let (job_name, message) = match submission {
            Ok(JobSubmission::Submitted { job_name, message }) => (job_name, message),
            Ok(JobSubmission::Rejected { message }) => {
                return Err(ClosingError::Submission { message }.into())
            }
            Err(err) => {
                return Err(ClosingError::from_collaborator(err, |message| {
                    ClosingError::Submission { message }
                })
                .into())
            }
        };
        progress.job_name = Some(job_name.clone());
        let job = JobName::parse(&job_name)?;
        info!(job_name = %job, %message, "closing job submitted");

        // Persist the job name before parking so status queries can see it.
        self.record_state(ctx, progress, ClosingStep::OracleClosing, Some(step_start))?;

        info!(
            initial_delay_secs = self.options.initial_delay.as_secs(),
            poll_interval_secs = self.options.poll_interval.as_secs(),
            "waiting before first status check"
        );
        ctx.sleep(self.options.initial_delay)?;

        let max = self.options.max_poll_attempts;
        for attempt in 0..max {
            info!(job_name = %job, attempt = attempt + 1, max, "checking closing job status");
            let job_ref = &job;
            let poll = ctx
                .run_step(&check_step(attempt), move || async move {
                    settle(jobs.check_job_status(job_ref).await)
                })
                .await?;

            match poll {
                Ok(PollResult::Completed { message }) => {
                    let end_time = ctx.now()?;
                    let duration_secs = seconds_between(step_start, end_time);
                    info!(job_name = %job, duration_secs, "closing job completed");
                    return Ok(StepReport {
                        success: true,
                        start_time: step_start,
                        end_time,
                        duration_secs,
                        message,
                    });
                }
                Ok(PollResult::Failed { message }) => {
                    return Err(ClosingError::JobFailed {
                        job_name: job.to_string(),
                        message,
                    }
                    .into());
                }
                Ok(PollResult::Running { .. }) => {}
                Err(err) => {
                    return Err(ClosingError::from_collaborator(err, |message| {
                        ClosingError::JobFailed {
                            job_name: job.to_string(),
                            message,
                        }
                    })
                    .into());
                }
            }

            if attempt + 1 < max {
                info!(job_name = %job, "closing job still running");
                ctx.sleep(self.options.poll_interval)?;
            }
        }

        Err(ClosingError::Timeout {
            job_name: job.to_string(),
            budget_secs: self.options.poll_budget().as_secs(),
        }
        .into())
    }

    async fn financial_metrics(
        &self,
        ctx: &mut Context,
        date: &ClosingDate,
        step_start: DateTime<Utc>,
        progress: &mut Progress,
    ) -> Result<StepReport, Interrupt> {
        let run_id: Uuid = ctx
            .run_step(RUN_ID_STEP, || async { Ok(Uuid::new_v4()) })
            .await?;
        progress.run_id = Some(run_id);
        // Visible to status queries while the computation runs.
        self.record_state(ctx, progress, ClosingStep::FinancialMetrics, Some(step_start))?;

        let as_of = ctx.now()?;
        let metrics = &self.metrics;
        info!(%run_id, %date, "calculating financial metrics");
        let outcome: Result<MetricsOutcome, CollaboratorError> = ctx
            .run_step(METRICS_STEP, move || async move {
                settle(metrics.compute_metrics(date, run_id, as_of).await)
            })
            .await?;

        match outcome {
            Ok(outcome) if outcome.success => {
                let end_time = ctx.now()?;
                info!(%run_id, duration_secs = outcome.duration_secs, "financial metrics calculated");
                Ok(StepReport {
                    success: true,
                    start_time: step_start,
                    end_time,
                    duration_secs: outcome.duration_secs,
                    message: outcome.message,
                })
            }
            Ok(outcome) => Err(ClosingError::BusinessFailure {
                message: outcome.message,
            }
            .into()),
            Err(err) => Err(ClosingError::from_collaborator(err, |message| {
                ClosingError::BusinessFailure { message }
            })
            .into()),
        }
    }
}

#[async_trait]
impl Handler for DailyClosing {
    async fn handle(
        &self,
        ctx: &mut Context,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        let input: ClosingInput = if input.is_null() {
            ClosingInput::default()
        } else {
            serde_json::from_value(input)
                .map_err(|e| HandlerError::terminal(format!("invalid closing input: {e}")))?
        };
        let workflow_id = ctx.key().to_string();
        let date = input.date.clone().unwrap_or_else(|| workflow_id.clone());
        let started = ctx.now()?;
        info!(%workflow_id, attempt = ctx.attempt(), "daily closing started");

        let mut progress = Progress::default();
        self.record_state(ctx, &progress, ClosingStep::Idle, None)?;

        let failure = match self.execute(ctx, &input, &mut progress).await {
            Ok(()) => None,
            Err(Interrupt::Engine(HandlerError::Retryable(message))) if ctx.is_final_attempt() => {
                Some(ClosingError::Transient { message })
            }
            Err(Interrupt::Engine(err)) => return Err(err),
            Err(Interrupt::Failed(err)) => Some(err),
        };

        if let Some(err) = &failure {
            self.record_state(ctx, &progress, ClosingStep::Failed, None)?;
            error!(%workflow_id, kind = ?err.kind(), "daily closing failed: {err}");
        }
        let finished = ctx.now()?;
        let total_duration_secs = seconds_between(started, finished);
        if failure.is_none() {
            info!(%workflow_id, total_duration_secs, "daily closing completed");
        }

        let result = ClosingResult {
            workflow_id,
            date,
            oracle_closing: progress.oracle_closing,
            financial_metrics: progress.financial_metrics,
            overall_success: failure.is_none(),
            total_duration_secs,
            failure: failure.map(|err| FailureReport {
                kind: err.kind(),
                message: err.to_string(),
            }),
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn abandoned(&self, scope: &StateScope, reason: &str) -> dayclose_engine::Result<()> {
        let now = scope.now();
        let state = match scope.get::<WorkflowState>(STATE_NAME)? {
            Some(state) if state.current_step.is_terminal() => return Ok(()),
            Some(state) => WorkflowState {
                current_step: ClosingStep::Failed,
                step_start_time: None,
                last_update: now,
                ..state
            },
            None => WorkflowState {
                current_step: ClosingStep::Failed,
                external_job_name: None,
                metrics_run_id: None,
                step_start_time: None,
                last_update: now,
            },
        };
        warn!(key = scope.key(), "closing instance abandoned by the engine: {reason}");
        scope.put(STATE_NAME, &state)
    }
}
