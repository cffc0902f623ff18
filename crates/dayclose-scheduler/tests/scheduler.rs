use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use dayclose_closing::workflow::{RUN_HANDLER, SERVICE as CLOSING};
use dayclose_closing::ClosingInput;
use dayclose_core::{ClosingDate, DaycloseConfig};
use dayclose_engine::{
    Context, EngineOptions, Handler, HandlerError, InvocationStatus, ManualClock, Runtime,
    ServiceKind, Store, Target,
};
use dayclose_scheduler::actor::{KEY, SERVICE, STATE_NAME, TRIGGER_HANDLER};
use dayclose_scheduler::{start_schedule, DailyClosingScheduler, ScheduleState, SchedulerOptions};

/// Stands in for the closing workflow and records what it was started with.
#[derive(Default)]
struct Recorder {
    runs: Mutex<Vec<(String, ClosingInput)>>,
}

#[async_trait]
impl Handler for Recorder {
    async fn handle(
        &self,
        ctx: &mut Context,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        let input: ClosingInput = serde_json::from_value(input)?;
        self.runs.lock().unwrap().push((ctx.key().to_string(), input));
        Ok(serde_json::Value::Null)
    }
}

struct Harness {
    runtime: Runtime,
    clock: Arc<ManualClock>,
    recorder: Arc<Recorder>,
}

/// 23:30 on 2025-01-30 in +07:00.
fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 30, 16, 30, 0).unwrap()
}

fn midnight_local(day: u32) -> DateTime<Utc> {
    // 00:00 +07:00 is 17:00 UTC the day before.
    Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap() - TimeDelta::hours(7)
}

impl Harness {
    fn new() -> Self {
        let h = Self::without_closing();
        h.register_closing();
        h
    }

    /// Scheduler only; messages to the closing workflow have nowhere to go.
    fn without_closing() -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let runtime = Runtime::new(
            Store::open_in_memory().unwrap(),
            clock.clone(),
            EngineOptions::default(),
        );
        let options = SchedulerOptions::from_config(&DaycloseConfig::default()).unwrap();
        Arc::new(DailyClosingScheduler::new(options)).register(&runtime);
        Self {
            runtime,
            clock,
            recorder: Arc::new(Recorder::default()),
        }
    }

    fn register_closing(&self) {
        self.runtime.register(
            CLOSING,
            ServiceKind::Workflow,
            RUN_HANDLER,
            self.recorder.clone(),
        );
    }

    fn schedule(&self) -> ScheduleState {
        self.runtime.state(SERVICE, KEY, STATE_NAME).unwrap().unwrap()
    }

    fn dates(&self) -> Vec<String> {
        self.recorder
            .runs
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    async fn start(&self) {
        start_schedule(&self.runtime).unwrap();
        self.runtime.drain().await.unwrap();
    }

    async fn advance_to(&self, instant: DateTime<Utc>) {
        self.clock.set(instant);
        self.runtime.drain().await.unwrap();
    }
}

#[tokio::test]
async fn start_arms_the_next_local_midnight() {
    let h = Harness::new();
    h.start().await;

    let state = h.schedule();
    assert_eq!(state.next_fire_at, midnight_local(31));
    assert_eq!(state.armed_at, t0());
    assert!(state.last_fired_date.is_none());
    assert_eq!(h.runtime.next_timer_at().unwrap(), Some(midnight_local(31)));
}

#[tokio::test]
async fn repeated_start_keeps_the_armed_trigger() {
    let h = Harness::new();
    h.start().await;
    let first = h.schedule();

    h.clock.advance(Duration::from_secs(60));
    h.start().await;

    assert_eq!(h.schedule(), first);
    assert_eq!(h.runtime.store().timers().unwrap().len(), 1);
}

#[tokio::test]
async fn trigger_starts_todays_closing_and_rearms() {
    let h = Harness::new();
    h.start().await;
    h.advance_to(midnight_local(31)).await;

    let runs = h.recorder.runs.lock().unwrap().clone();
    assert_eq!(runs.len(), 1);
    let (key, input) = &runs[0];
    assert_eq!(key, "2025-01-31");
    assert_eq!(input.date.as_deref(), Some("2025-01-31"));
    assert!(!input.skip_oracle_closing && !input.skip_financial_metrics);
    assert_eq!(input.user_id.as_deref(), Some("adm"));

    let state = h.schedule();
    assert_eq!(state.next_fire_at, midnight_local(31) + TimeDelta::days(1));
    assert_eq!(state.last_fired_date.as_deref(), Some("2025-01-31"));
}

#[tokio::test]
async fn fires_once_per_day() {
    let h = Harness::new();
    h.start().await;
    for day in 0..3 {
        h.advance_to(midnight_local(31) + TimeDelta::days(day)).await;
    }
    assert_eq!(h.dates(), vec!["2025-01-31", "2025-02-01", "2025-02-02"]);
}

#[tokio::test]
async fn late_trigger_fires_the_current_date() {
    let h = Harness::new();
    h.start().await;
    // Down for two and a half days; only the date at wake-up is fired.
    h.advance_to(midnight_local(31) + TimeDelta::hours(60)).await;

    assert_eq!(h.dates(), vec!["2025-02-02"]);
    let state = h.schedule();
    assert_eq!(state.next_fire_at, midnight_local(31) + TimeDelta::days(3));
}

#[tokio::test]
async fn stray_trigger_is_ignored() {
    let h = Harness::new();
    h.start().await;
    let before = h.schedule();

    h.runtime
        .send(
            Target::new(SERVICE, KEY, TRIGGER_HANDLER),
            serde_json::Value::Null,
            Duration::ZERO,
        )
        .unwrap();
    h.runtime.drain().await.unwrap();

    assert!(h.dates().is_empty());
    assert_eq!(h.schedule(), before);
}

#[tokio::test]
async fn start_rearms_a_dead_chain() {
    let h = Harness::new();
    h.start().await;
    let before = h.schedule();

    // Lose the armed trigger, then come back well after it was due.
    for timer in h.runtime.store().timers().unwrap() {
        h.runtime.store().delete_timer(&timer.id).unwrap();
    }
    h.clock.set(before.next_fire_at + TimeDelta::hours(2));
    h.start().await;

    let after = h.schedule();
    assert_ne!(after.pending_trigger, before.pending_trigger);
    assert_eq!(after.next_fire_at, midnight_local(31) + TimeDelta::days(1));
    assert!(h.dates().is_empty());

    h.advance_to(after.next_fire_at).await;
    assert_eq!(h.dates(), vec!["2025-02-01"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn boot_after_an_overdue_trigger_still_fires_that_day() {
    for _ in 0..200 {
        let h = Harness::new();
        h.start().await;

        // Back up at 02:00 local: the midnight trigger and a fresh `start`
        // are due in the same tick.
        h.clock.set(midnight_local(31) + TimeDelta::hours(2));
        start_schedule(&h.runtime).unwrap();
        h.runtime.drain().await.unwrap();

        assert_eq!(h.dates(), vec!["2025-01-31"]);
        let state = h.schedule();
        assert_eq!(state.last_fired_date.as_deref(), Some("2025-01-31"));
        assert_eq!(state.next_fire_at, midnight_local(31) + TimeDelta::days(1));
        let timers = h.runtime.store().timers().unwrap();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].id, state.pending_trigger);
    }
}

#[tokio::test]
async fn start_rearms_a_trigger_lost_before_it_was_due() {
    let h = Harness::new();
    h.start().await;
    let before = h.schedule();

    for timer in h.runtime.store().timers().unwrap() {
        h.runtime.store().delete_timer(&timer.id).unwrap();
    }
    h.start().await;

    let after = h.schedule();
    assert_ne!(after.pending_trigger, before.pending_trigger);
    assert_eq!(after.next_fire_at, before.next_fire_at);

    h.advance_to(after.next_fire_at).await;
    assert_eq!(h.dates(), vec!["2025-01-31"]);
}

#[tokio::test]
async fn armed_trigger_ids_keep_a_fixed_length() {
    let h = Harness::new();
    h.start().await;
    let mut ids = vec![h.schedule().pending_trigger];
    for day in 0..5 {
        h.advance_to(midnight_local(31) + TimeDelta::days(day)).await;
        ids.push(h.schedule().pending_trigger);
    }

    assert_eq!(h.dates().len(), 5);
    for id in &ids {
        assert_eq!(id.len(), 36, "{id}");
    }
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), ids.len());
}

#[tokio::test]
async fn trigger_rearms_when_the_closing_cannot_be_enqueued() {
    let h = Harness::without_closing();
    h.start().await;
    let before = h.schedule();

    h.advance_to(midnight_local(31)).await;

    let after = h.schedule();
    assert!(after.last_fired_date.is_none());
    assert_ne!(after.pending_trigger, before.pending_trigger);
    assert_eq!(after.next_fire_at, midnight_local(31) + TimeDelta::days(1));
    let timers = h.runtime.store().timers().unwrap();
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].id, after.pending_trigger);
    assert_eq!(timers[0].target, Target::new(SERVICE, KEY, TRIGGER_HANDLER));
    let fired = h.runtime.store().invocation(&before.pending_trigger).unwrap().unwrap();
    assert_eq!(fired.status, InvocationStatus::Completed);

    // The chain keeps going and picks the closing up once it exists.
    h.register_closing();
    h.advance_to(after.next_fire_at).await;
    assert_eq!(h.dates(), vec!["2025-02-01"]);
    assert_eq!(h.schedule().last_fired_date.as_deref(), Some("2025-02-01"));
}

#[tokio::test]
async fn failed_enqueue_keeps_the_last_fired_date() {
    let h = Harness::new();
    h.start().await;
    h.advance_to(midnight_local(31)).await;
    assert_eq!(h.schedule().last_fired_date.as_deref(), Some("2025-01-31"));

    // Restarted on the same database without the closing service.
    let restarted = Harness {
        runtime: Runtime::new(
            h.runtime.store().clone(),
            h.clock.clone(),
            EngineOptions::default(),
        ),
        clock: h.clock.clone(),
        recorder: Arc::new(Recorder::default()),
    };
    let options = SchedulerOptions::from_config(&DaycloseConfig::default()).unwrap();
    Arc::new(DailyClosingScheduler::new(options)).register(&restarted.runtime);
    restarted
        .advance_to(midnight_local(31) + TimeDelta::days(1))
        .await;

    let state = restarted.schedule();
    assert_eq!(state.last_fired_date.as_deref(), Some("2025-01-31"));
    assert_eq!(state.next_fire_at, midnight_local(31) + TimeDelta::days(2));
    assert!(restarted.dates().is_empty());
}

#[tokio::test]
async fn duplicate_date_is_not_started_twice() {
    let h = Harness::new();
    h.start().await;
    h.advance_to(midnight_local(31)).await;

    // A second closing request for the same date attaches to the first.
    h.runtime
        .send(
            dayclose_closing::workflow::target(&ClosingDate::parse("2025-01-31").unwrap()),
            serde_json::Value::Null,
            Duration::ZERO,
        )
        .unwrap();
    h.runtime.drain().await.unwrap();
    assert_eq!(h.dates(), vec!["2025-01-31"]);
}
