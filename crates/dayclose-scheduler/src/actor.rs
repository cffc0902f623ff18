use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dayclose_closing::{workflow, ClosingInput};
use dayclose_engine::{Context, Handler, HandlerError, Runtime, ServiceKind, Target};
use tracing::{error, info, warn};

use crate::error::SchedulerError;
use crate::schedule::next_fire;
use crate::types::{ScheduleState, SchedulerOptions};

pub const SERVICE: &str = "DailyClosingScheduler";
/// The scheduler is a singleton; every message goes to this key.
pub const KEY: &str = "main";
pub const START_HANDLER: &str = "start";
pub const TRIGGER_HANDLER: &str = "trigger";
pub const STATE_NAME: &str = "schedule";

/// Singleton actor that starts one closing instance per day.
pub struct DailyClosingScheduler {
    options: SchedulerOptions,
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Start,
    Trigger,
}

struct Entry {
    scheduler: Arc<DailyClosingScheduler>,
    operation: Operation,
}

impl DailyClosingScheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        Self { options }
    }

    /// Register `start` and `trigger` on `runtime` as an object service.
    pub fn register(self: Arc<Self>, runtime: &Runtime) {
        for (name, operation) in [
            (START_HANDLER, Operation::Start),
            (TRIGGER_HANDLER, Operation::Trigger),
        ] {
            let entry = Entry {
                scheduler: self.clone(),
                operation,
            };
            runtime.register(SERVICE, ServiceKind::Object, name, Arc::new(entry));
        }
    }

    /// Idempotent: leaves a live trigger chain alone.
    ///
    /// The chain is live while its armed trigger is still queued or running,
    /// however overdue it is; a trigger that fired late is left to run.
    async fn start(&self, ctx: &mut Context) -> Result<serde_json::Value, HandlerError> {
        let current: Option<ScheduleState> = ctx.get_state(STATE_NAME)?;
        let state = match current {
            None => self.arm(ctx, None)?,
            Some(state) if ctx.message_pending(&state.pending_trigger)? => {
                info!(next_fire_at = %state.next_fire_at, "schedule already armed");
                state
            }
            Some(state) => {
                warn!(
                    next_fire_at = %state.next_fire_at,
                    pending_trigger = %state.pending_trigger,
                    "armed trigger is gone; re-arming"
                );
                self.arm(ctx, state.last_fired_date)?
            }
        };
        Ok(serde_json::to_value(state)?)
    }

    async fn trigger(&self, ctx: &mut Context) -> Result<serde_json::Value, HandlerError> {
        let current: Option<ScheduleState> = ctx.get_state(STATE_NAME)?;
        let Some(state) = current.filter(|s| s.pending_trigger == ctx.invocation_id()) else {
            info!(invocation_id = %ctx.invocation_id(), "stray trigger ignored");
            return Ok(serde_json::Value::Null);
        };

        let now = ctx.now()?;
        let date = self.options.zone.closing_date(now);
        let input = ClosingInput {
            date: Some(date.format()),
            skip_oracle_closing: false,
            skip_financial_metrics: false,
            user_id: Some(self.options.default_user.to_string()),
        };
        let fired = match ctx.send(
            workflow::target(&date),
            serde_json::to_value(input)?,
            Duration::ZERO,
        ) {
            Ok(_) => {
                info!(%date, local = %self.options.zone.format_local(now), "daily closing triggered");
                Some(date.format())
            }
            Err(e) => {
                // Re-arm regardless so the schedule keeps going.
                error!(%date, "failed to start daily closing: {e}");
                state.last_fired_date
            }
        };

        let state = self.arm(ctx, fired)?;
        Ok(serde_json::to_value(state)?)
    }

    /// Schedule the next trigger and record it as the only one to honour.
    fn arm(
        &self,
        ctx: &mut Context,
        last_fired_date: Option<String>,
    ) -> Result<ScheduleState, HandlerError> {
        let now = ctx.now()?;
        let next = next_fire(now, self.options.hour, self.options.minute, self.options.zone)
            .map_err(|e| HandlerError::terminal(e.to_string()))?;
        let pending_trigger = ctx.send(
            Target::new(SERVICE, KEY, TRIGGER_HANDLER),
            serde_json::Value::Null,
            next.delay,
        )?;
        let state = ScheduleState {
            next_fire_at: next.target,
            pending_trigger,
            armed_at: now,
            last_fired_date,
        };
        ctx.set_state(STATE_NAME, &state)?;
        info!(
            next_fire_at = %next.target,
            local = %self.options.zone.format_local(next.target),
            delay_secs = next.delay.as_secs(),
            "next daily closing trigger armed"
        );
        Ok(state)
    }
}

#[async_trait]
impl Handler for Entry {
    async fn handle(
        &self,
        ctx: &mut Context,
        _input: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        match self.operation {
            Operation::Start => self.scheduler.start(ctx).await,
            Operation::Trigger => self.scheduler.trigger(ctx).await,
        }
    }
}

/// Enqueue `start` for the scheduler. Safe to call on every boot.
pub fn start_schedule(runtime: &Runtime) -> crate::Result<String> {
    runtime
        .send(
            Target::new(SERVICE, KEY, START_HANDLER),
            serde_json::Value::Null,
            Duration::ZERO,
        )
        .map_err(SchedulerError::from)
}
