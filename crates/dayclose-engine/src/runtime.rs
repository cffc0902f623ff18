use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dayclose_core::config::EngineConfig;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{add_duration, duration_between, Clock};
use crate::context::Context;
use crate::error::{EngineError, HandlerError, Result};
use crate::retry::RetryPolicy;
use crate::store::{PurgeStats, Store};
use crate::types::{Invocation, InvocationStatus, JournalEntry, ServiceKind, Target, Timer, TimerKind};

const TIMER_BATCH: usize = 64;
const PURGE_EVERY: Duration = Duration::from_secs(3600);

/// A registered handler.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Execute (or replay) the invocation. Must propagate
    /// [`HandlerError::Suspended`] untouched.
    async fn handle(
        &self,
        ctx: &mut Context,
        input: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, HandlerError>;

    /// Called after the runtime gave up on an invocation (abort timeout,
    /// exhausted retries, terminal error) so the handler can leave its durable
    /// state consistent. The default does nothing.
    async fn abandoned(&self, _scope: &StateScope, _reason: &str) -> Result<()> {
        Ok(())
    }
}

/// Direct state access for one service key, outside any journal.
pub struct StateScope {
    store: Store,
    clock: Arc<dyn Clock>,
    target: Target,
}

impl StateScope {
    pub fn key(&self) -> &str {
        &self.target.key
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.store
            .get_state(&self.target.service, &self.target.key, name)?
            .map(serde_json::from_value)
            .transpose()
            .map_err(EngineError::from)
    }

    pub fn put<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.store.put_state(
            &self.target.service,
            &self.target.key,
            name,
            &value,
            self.clock.now(),
        )
    }
}

/// Runtime knobs, usually built from `[engine]` config.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub tick: Duration,
    pub abort_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub workflow_retention: Duration,
    pub journal_retention: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl EngineOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        let day = 24 * 3600;
        Self {
            tick: Duration::from_millis(config.tick_ms.max(1)),
            abort_timeout: Duration::from_secs(config.abort_timeout_secs),
            inactivity_timeout: Duration::from_secs(config.inactivity_timeout_secs),
            workflow_retention: Duration::from_secs(u64::from(config.workflow_retention_days) * day),
            journal_retention: Duration::from_secs(u64::from(config.journal_retention_days) * day),
            retry: RetryPolicy::from_config(&config.retry),
        }
    }
}

pub(crate) struct Service {
    kind: ServiceKind,
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Service {
    pub(crate) fn new(kind: ServiceKind) -> Self {
        Self {
            kind,
            handlers: HashMap::new(),
        }
    }
}

/// Registered services by name, shared with every [`Context`].
pub(crate) type Registry = Arc<DashMap<String, Service>>;

struct Inner {
    store: Store,
    clock: Arc<dyn Clock>,
    options: EngineOptions,
    services: Registry,
    /// One async mutex per `service/key`; executions hold it for a whole attempt.
    key_locks: DashMap<String, Arc<Mutex<()>>>,
    wake: Notify,
}

enum Outcome {
    Finished(std::result::Result<serde_json::Value, HandlerError>),
    Inactive,
    Aborted,
}

/// Durable invocation runtime. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    pub fn new(store: Store, clock: Arc<dyn Clock>, options: EngineOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                clock,
                options,
                services: Arc::new(DashMap::new()),
                key_locks: DashMap::new(),
                wake: Notify::new(),
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.inner.clock.clone()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// Register `handler` as `service/<key>/handler_name`.
    pub fn register(
        &self,
        service: &str,
        kind: ServiceKind,
        handler_name: &str,
        handler: Arc<dyn Handler>,
    ) {
        let mut entry = self
            .inner
            .services
            .entry(service.to_string())
            .or_insert_with(|| Service::new(kind));
        entry.kind = kind;
        entry.handlers.insert(handler_name.to_string(), handler);
        debug!(service, handler = handler_name, ?kind, "handler registered");
    }

    fn service_kind(&self, service: &str) -> Option<ServiceKind> {
        self.inner.services.get(service).map(|s| s.kind)
    }

    fn handler_for(&self, target: &Target) -> Option<Arc<dyn Handler>> {
        self.inner
            .services
            .get(&target.service)
            .and_then(|s| s.handlers.get(&target.handler).cloned())
    }

    /// Durably enqueue a message from outside any handler.
    ///
    /// Returns the delivery timer id.
    #[instrument(skip(self, target, input), fields(target = %target))]
    pub fn send(&self, target: Target, input: serde_json::Value, delay: Duration) -> Result<String> {
        if self.service_kind(&target.service).is_none() {
            return Err(EngineError::UnknownService {
                service: target.service,
            });
        }
        let now = self.inner.clock.now();
        let timer = Timer::invoke(
            Uuid::now_v7().to_string(),
            target,
            input,
            add_duration(now, delay),
        );
        self.inner.store.insert_timer(&timer, now)?;
        self.inner.wake.notify_one();
        info!(timer_id = %timer.id, fire_at = %timer.fire_at, "message enqueued");
        Ok(timer.id)
    }

    /// Re-arm a resume timer for every invocation that is not finished.
    ///
    /// Covers a crash between consuming a timer and finishing the attempt.
    /// Parked invocations get their original wake time back; anything else is
    /// resumed immediately.
    pub fn recover(&self) -> Result<usize> {
        let now = self.inner.clock.now();
        let open = self.inner.store.non_terminal_invocations()?;
        for inv in &open {
            let fire_at = inv.wake_at.unwrap_or(now);
            self.inner
                .store
                .insert_timer(&Timer::resume(inv, fire_at), now)?;
        }
        if !open.is_empty() {
            info!(count = open.len(), "re-armed unfinished invocations");
        }
        Ok(open.len())
    }

    /// Deliver every due timer and spawn the resulting executions.
    pub fn tick(&self) -> Result<Vec<JoinHandle<()>>> {
        let now = self.inner.clock.now();
        let mut spawned = Vec::new();
        for timer in self.inner.store.due_timers(now, TIMER_BATCH)? {
            match timer.kind {
                TimerKind::Invoke => {
                    let Some(kind) = self.service_kind(&timer.target.service) else {
                        error!(timer_id = %timer.id, target = %timer.target, "no such service; dropping message");
                        self.inner.store.delete_timer(&timer.id)?;
                        continue;
                    };
                    let id = match kind {
                        ServiceKind::Workflow => timer.target.lock_key(),
                        ServiceKind::Object => timer.id.clone(),
                    };
                    if !self.inner.store.accept_invocation(&id, &timer, now)? {
                        info!(invocation_id = %id, "invocation already exists; duplicate message dropped");
                        continue;
                    }
                    spawned.push(self.spawn_execution(id));
                }
                TimerKind::Resume => {
                    self.inner.store.delete_timer(&timer.id)?;
                    if let Some(id) = timer.invocation_id {
                        spawned.push(self.spawn_execution(id));
                    }
                }
            }
        }
        Ok(spawned)
    }

    /// Run due work until nothing is due at the current clock reading.
    pub async fn drain(&self) -> Result<()> {
        loop {
            let spawned = self.tick()?;
            if spawned.is_empty() {
                return Ok(());
            }
            for result in futures_util::future::join_all(spawned).await {
                if let Err(e) = result {
                    error!("execution task panicked: {e}");
                }
            }
        }
    }

    /// Main loop. Delivers timers every tick until `shutdown` broadcasts `true`,
    /// and purges expired history once an hour.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("engine started");
        let mut interval = tokio::time::interval(self.inner.options.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_purge: Option<DateTime<Utc>> = None;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.inner.wake.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("engine shutting down");
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.tick() {
                error!("engine tick error: {e}");
            }

            let now = self.inner.clock.now();
            let purge_due = last_purge.map_or(true, |at| duration_between(at, now) >= PURGE_EVERY);
            if purge_due {
                last_purge = Some(now);
                if let Err(e) = self.purge() {
                    error!("retention purge failed: {e}");
                }
            }
        }
    }

    /// Delete finished invocations and journal rows past their retention.
    pub fn purge(&self) -> Result<PurgeStats> {
        let now = self.inner.clock.now();
        let cutoff = |retention: Duration| {
            chrono::TimeDelta::from_std(retention)
                .ok()
                .and_then(|d| now.checked_sub_signed(d))
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        };
        let stats = self.inner.store.purge(
            cutoff(self.inner.options.workflow_retention),
            cutoff(self.inner.options.journal_retention),
        )?;
        if stats.invocations > 0 || stats.journal_entries > 0 {
            info!(
                invocations = stats.invocations,
                journal_entries = stats.journal_entries,
                "purged expired history"
            );
        }
        Ok(stats)
    }

    // --- queries -----------------------------------------------------------

    /// Most recent invocation addressed to `service/key`.
    pub fn invocation(&self, service: &str, key: &str) -> Result<Option<Invocation>> {
        self.inner.store.latest_invocation(service, key)
    }

    pub fn state<T: DeserializeOwned>(&self, service: &str, key: &str, name: &str) -> Result<Option<T>> {
        self.inner
            .store
            .get_state(service, key, name)?
            .map(serde_json::from_value)
            .transpose()
            .map_err(EngineError::from)
    }

    pub fn journal(&self, invocation_id: &str) -> Result<Vec<JournalEntry>> {
        self.inner.store.journal(invocation_id)
    }

    pub fn next_timer_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.inner.store.next_timer_at()
    }

    // --- execution ---------------------------------------------------------

    fn spawn_execution(&self, id: String) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move { runtime.execute(id).await })
    }

    fn key_lock(&self, lock_key: String) -> Arc<Mutex<()>> {
        self.inner
            .key_locks
            .entry(lock_key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn execute(&self, id: String) {
        if let Err(e) = self.execute_attempt(&id).await {
            error!(invocation_id = %id, "execution failed: {e}");
            // Leave a way back in; `recover` would do the same on restart.
            let now = self.inner.clock.now();
            if let Ok(Some(inv)) = self.inner.store.invocation(&id) {
                if !inv.status.is_terminal() {
                    let wake = add_duration(now, self.inner.options.retry.backoff(1));
                    if let Err(e) = self.inner.store.insert_timer(&Timer::resume(&inv, wake), now) {
                        error!(invocation_id = %id, "could not re-arm invocation: {e}");
                    }
                }
            }
        }
    }

    #[instrument(
        skip(self),
        fields(
            service = tracing::field::Empty,
            key = tracing::field::Empty,
            attempt = tracing::field::Empty
        )
    )]
    async fn execute_attempt(&self, id: &str) -> Result<()> {
        let Some(inv) = self.inner.store.invocation(id)? else {
            warn!("resume for unknown invocation ignored");
            return Ok(());
        };
        let lock = self.key_lock(inv.target.lock_key());
        let _guard = lock.lock().await;

        // Re-read under the key lock: another execution may have moved it on.
        let Some(inv) = self.inner.store.invocation(id)? else {
            return Ok(());
        };
        let span = tracing::Span::current();
        span.record("service", inv.target.service.as_str());
        span.record("key", inv.target.key.as_str());
        span.record("attempt", inv.attempt);

        if inv.status.is_terminal() {
            debug!(status = %inv.status, "invocation already finished");
            return Ok(());
        }

        let now = self.inner.clock.now();
        if let Some(wake_at) = inv.wake_at {
            let parked = matches!(
                inv.status,
                InvocationStatus::Suspended | InvocationStatus::BackingOff
            );
            if parked && wake_at > now {
                debug!(%wake_at, "woken early; re-parking");
                self.inner
                    .store
                    .insert_timer(&Timer::resume(&inv, wake_at), now)?;
                return Ok(());
            }
        }

        let deadline = add_duration(inv.created_at, self.inner.options.abort_timeout);
        if now >= deadline {
            self.kill(&inv, "aborted: invocation exceeded its abort timeout")
                .await?;
            return Ok(());
        }

        let Some(handler) = self.handler_for(&inv.target) else {
            let err = EngineError::UnknownHandler {
                service: inv.target.service.clone(),
                handler: inv.target.handler.clone(),
            };
            self.inner.store.fail(&inv.id, &err.to_string(), now)?;
            error!("{err}");
            return Ok(());
        };

        self.inner.store.mark_running(&inv.id, now)?;
        let (progress_tx, progress_rx) = watch::channel(0u64);
        let final_attempt = self.inner.options.retry.is_final_attempt(inv.attempt);
        let mut ctx = Context::new(
            self.inner.store.clone(),
            self.inner.clock.clone(),
            self.inner.services.clone(),
            &inv,
            final_attempt,
            progress_tx,
        );
        debug!(target = %inv.target, "attempt started");

        let outcome = tokio::select! {
            result = handler.handle(&mut ctx, inv.input.clone()) => Outcome::Finished(result),
            _ = inactivity_watchdog(progress_rx, self.inner.options.inactivity_timeout) => Outcome::Inactive,
            _ = tokio::time::sleep(duration_between(now, deadline)) => Outcome::Aborted,
        };
        drop(ctx);

        let now = self.inner.clock.now();
        match outcome {
            Outcome::Finished(Ok(output)) => {
                self.inner.store.complete(&inv.id, &output, now)?;
                info!("invocation completed");
            }
            Outcome::Finished(Err(HandlerError::Suspended { wake_at })) => {
                // A suspension is progress: the failure streak starts over.
                self.inner.store.park(
                    &inv.id,
                    InvocationStatus::Suspended,
                    0,
                    None,
                    &Timer::resume(&inv, wake_at),
                    now,
                )?;
                info!(%wake_at, "invocation suspended");
            }
            Outcome::Finished(Err(HandlerError::Terminal(message))) => {
                self.kill(&inv, &message).await?;
            }
            Outcome::Finished(Err(HandlerError::Retryable(message))) => {
                self.retry_or_kill(&inv, &message).await?;
            }
            Outcome::Inactive => {
                let message = format!(
                    "no progress for {}s",
                    self.inner.options.inactivity_timeout.as_secs()
                );
                self.retry_or_kill(&inv, &message).await?;
            }
            Outcome::Aborted => {
                self.kill(&inv, "aborted: invocation exceeded its abort timeout")
                    .await?;
            }
        }
        Ok(())
    }

    async fn retry_or_kill(&self, inv: &Invocation, message: &str) -> Result<()> {
        let policy = &self.inner.options.retry;
        if !policy.allows_retry_after(inv.attempt) {
            let reason = format!(
                "retries exhausted after {} attempts: {message}",
                inv.attempt + 1
            );
            return self.kill(inv, &reason).await;
        }

        let now = self.inner.clock.now();
        let next_attempt = inv.attempt + 1;
        let wake = add_duration(now, policy.backoff(next_attempt));
        self.inner.store.park(
            &inv.id,
            InvocationStatus::BackingOff,
            next_attempt,
            Some(message),
            &Timer::resume(inv, wake),
            now,
        )?;
        warn!(next_attempt, retry_at = %wake, "attempt failed, backing off: {message}");
        Ok(())
    }

    /// Fail the invocation for good and let its handler clean up.
    async fn kill(&self, inv: &Invocation, reason: &str) -> Result<()> {
        let now = self.inner.clock.now();
        self.inner.store.fail(&inv.id, reason, now)?;
        warn!(invocation_id = %inv.id, "invocation killed: {reason}");

        if let Some(handler) = self.handler_for(&inv.target) {
            let scope = StateScope {
                store: self.inner.store.clone(),
                clock: self.inner.clock.clone(),
                target: inv.target.clone(),
            };
            if let Err(e) = handler.abandoned(&scope, reason).await {
                error!(invocation_id = %inv.id, "abandon hook failed: {e}");
            }
        }
        Ok(())
    }
}

/// Resolves once `limit` passes without a journal append.
async fn inactivity_watchdog(mut progress: watch::Receiver<u64>, limit: Duration) {
    loop {
        match tokio::time::timeout(limit, progress.changed()).await {
            Ok(Ok(())) => continue,
            // The context is gone; the attempt is finishing on its own.
            Ok(Err(_)) => std::future::pending::<()>().await,
            Err(_) => return,
        }
    }
}
