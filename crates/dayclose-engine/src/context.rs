use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::clock::{add_duration, Clock};
use crate::error::{EngineError, HandlerError};
use crate::runtime::Registry;
use crate::store::{Effect, NewEntry, Store};
use crate::types::{Invocation, JournalEntry, JournalKind, SendRecord, SleepRecord, Target, Timer};

/// Stored result of a `run_step` action.
///
/// Terminal failures are journaled like successes so a replay fails the same
/// way without repeating the side effect. Retryable failures never are.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
enum StepOutcome<T> {
    Ok(T),
    Terminal(String),
}

/// The handler's only door to the outside world during one attempt.
///
/// Every operation consults the journal first. Operations without an explicit
/// name are numbered in program order (`sleep#3`, `now#4`, ...), so handler
/// code must issue them deterministically.
pub struct Context {
    store: Store,
    clock: Arc<dyn Clock>,
    services: Registry,
    invocation_id: String,
    target: Target,
    attempt: u32,
    final_attempt: bool,
    seq: u32,
    progress: watch::Sender<u64>,
}

impl Context {
    pub(crate) fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        services: Registry,
        invocation: &Invocation,
        final_attempt: bool,
        progress: watch::Sender<u64>,
    ) -> Self {
        Self {
            store,
            clock,
            services,
            invocation_id: invocation.id.clone(),
            target: invocation.target.clone(),
            attempt: invocation.attempt,
            final_attempt,
            seq: 0,
            progress,
        }
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Key of the service instance (the closing date, `main`, ...).
    pub fn key(&self) -> &str {
        &self.target.key
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Zero-based attempt number of this execution.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True when a retryable failure of this attempt would exhaust the retry policy.
    pub fn is_final_attempt(&self) -> bool {
        self.final_attempt
    }

    fn next_seq(&mut self) -> u32 {
        self.seq += 1;
        self.seq
    }

    fn replay(&self, name: &str, kind: JournalKind) -> Result<Option<JournalEntry>, HandlerError> {
        let Some(entry) = self.store.journal_entry(&self.invocation_id, name)? else {
            return Ok(None);
        };
        if entry.kind != kind {
            return Err(EngineError::Nondeterminism {
                name: name.to_string(),
                expected: kind,
                found: entry.kind,
            }
            .into());
        }
        trace!(invocation_id = %self.invocation_id, name, kind = %kind, "replayed journal entry");
        Ok(Some(entry))
    }

    fn record(
        &self,
        name: &str,
        seq: u32,
        kind: JournalKind,
        value: &serde_json::Value,
        effect: Effect<'_>,
    ) -> Result<(), HandlerError> {
        self.store.append(
            &self.invocation_id,
            &NewEntry {
                name,
                seq,
                kind,
                value,
            },
            effect,
            self.clock.now(),
        )?;
        self.progress.send_modify(|n| *n += 1);
        Ok(())
    }

    /// Run `action` at most once per invocation under `name`.
    ///
    /// A journaled outcome is returned without calling `action`. Otherwise the
    /// action runs; `Ok` and `Terminal` outcomes are committed before this
    /// returns, `Retryable` and `Suspended` propagate unrecorded.
    pub async fn run_step<T, F, Fut>(&mut self, name: &str, action: F) -> Result<T, HandlerError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, HandlerError>>,
    {
        let seq = self.next_seq();
        if let Some(entry) = self.replay(name, JournalKind::Step)? {
            return match serde_json::from_value::<StepOutcome<T>>(entry.value)? {
                StepOutcome::Ok(value) => Ok(value),
                StepOutcome::Terminal(message) => Err(HandlerError::Terminal(message)),
            };
        }

        debug!(invocation_id = %self.invocation_id, step = name, "running step");
        match action().await {
            Ok(value) => {
                let stored = serde_json::to_value(StepOutcome::Ok(&value))?;
                self.record(name, seq, JournalKind::Step, &stored, Effect::None)?;
                Ok(value)
            }
            Err(HandlerError::Terminal(message)) => {
                let stored = serde_json::to_value(StepOutcome::<()>::Terminal(message.clone()))?;
                self.record(name, seq, JournalKind::Step, &stored, Effect::None)?;
                Err(HandlerError::Terminal(message))
            }
            Err(other) => Err(other),
        }
    }

    /// Durable sleep. Returns once the recorded wake time has passed, otherwise
    /// raises [`HandlerError::Suspended`], which handlers must propagate.
    pub fn sleep(&mut self, duration: Duration) -> Result<(), HandlerError> {
        let seq = self.next_seq();
        let name = format!("sleep#{seq}");
        let record: SleepRecord = match self.replay(&name, JournalKind::Sleep)? {
            Some(entry) => serde_json::from_value(entry.value)?,
            None => {
                let record = SleepRecord {
                    wake_at: add_duration(self.clock.now(), duration),
                    duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                };
                let value = serde_json::to_value(record)?;
                self.record(&name, seq, JournalKind::Sleep, &value, Effect::None)?;
                record
            }
        };

        if self.clock.now() >= record.wake_at {
            Ok(())
        } else {
            debug!(invocation_id = %self.invocation_id, wake_at = %record.wake_at, "suspending");
            Err(HandlerError::Suspended {
                wake_at: record.wake_at,
            })
        }
    }

    /// Current time, identical on every replay.
    pub fn now(&mut self) -> Result<DateTime<Utc>, HandlerError> {
        let seq = self.next_seq();
        let name = format!("now#{seq}");
        if let Some(entry) = self.replay(&name, JournalKind::Now)? {
            return Ok(serde_json::from_value(entry.value)?);
        }
        let now = self.clock.now();
        self.record(&name, seq, JournalKind::Now, &serde_json::to_value(now)?, Effect::None)?;
        Ok(now)
    }

    /// Read a state slot of this service key.
    pub fn get_state<T: DeserializeOwned>(&mut self, name: &str) -> Result<Option<T>, HandlerError> {
        let seq = self.next_seq();
        let entry_name = format!("get#{seq}");
        let value = match self.replay(&entry_name, JournalKind::GetState)? {
            Some(entry) => entry.value,
            None => {
                let value = self
                    .store
                    .get_state(&self.target.service, &self.target.key, name)?
                    .unwrap_or(serde_json::Value::Null);
                self.record(&entry_name, seq, JournalKind::GetState, &value, Effect::None)?;
                value
            }
        };
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    /// Write a state slot of this service key. Skipped on replay.
    pub fn set_state<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), HandlerError> {
        let seq = self.next_seq();
        let entry_name = format!("set#{seq}");
        if self.replay(&entry_name, JournalKind::SetState)?.is_some() {
            return Ok(());
        }
        let value = serde_json::to_value(value)?;
        let service = self.target.service.clone();
        let key = self.target.key.clone();
        self.record(
            &entry_name,
            seq,
            JournalKind::SetState,
            &value,
            Effect::SetState {
                service: &service,
                key: &key,
                name,
                value: &value,
            },
        )
    }

    /// Whether a message sent earlier (by id, as returned from [`send`]) to an
    /// object service is still waiting or running. Identical on every replay.
    ///
    /// [`send`]: Context::send
    pub fn message_pending(&mut self, message_id: &str) -> Result<bool, HandlerError> {
        let seq = self.next_seq();
        let name = format!("pending#{seq}");
        if let Some(entry) = self.replay(&name, JournalKind::Lookup)? {
            return Ok(serde_json::from_value(entry.value)?);
        }
        let pending = self.store.message_pending(message_id)?;
        self.record(&name, seq, JournalKind::Lookup, &serde_json::Value::Bool(pending), Effect::None)?;
        Ok(pending)
    }

    /// Durably enqueue a message for `target`, delivered after `delay`.
    ///
    /// Returns the id of the delivery timer; for object services this is also
    /// the id of the invocation the message will create. Fails without
    /// journaling anything when no service is registered under the target's
    /// name.
    pub fn send(
        &mut self,
        target: Target,
        input: serde_json::Value,
        delay: Duration,
    ) -> Result<String, HandlerError> {
        let seq = self.next_seq();
        let name = format!("send#{seq}");
        if let Some(entry) = self.replay(&name, JournalKind::Send)? {
            let record: SendRecord = serde_json::from_value(entry.value)?;
            return Ok(record.timer_id);
        }
        if !self.services.contains_key(&target.service) {
            return Err(EngineError::UnknownService {
                service: target.service,
            }
            .into());
        }

        let fire_at = add_duration(self.clock.now(), delay);
        let timer = Timer::invoke(
            send_timer_id(&self.invocation_id, seq),
            target.clone(),
            input,
            fire_at,
        );
        let record = SendRecord {
            timer_id: timer.id.clone(),
            target,
            fire_at,
        };
        self.record(
            &name,
            seq,
            JournalKind::Send,
            &serde_json::to_value(&record)?,
            Effect::Schedule(&timer),
        )?;
        debug!(invocation_id = %self.invocation_id, to = %record.target, %fire_at, "message enqueued");
        Ok(record.timer_id)
    }
}

/// Id of the timer created by the `seq`-th operation of `invocation_id`.
///
/// Object invocations are named after the timer that created them, so the id
/// has a fixed length however long the chain of sends grows.
fn send_timer_id(invocation_id: &str, seq: u32) -> String {
    let name = format!("{invocation_id}/send#{seq}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}
