use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How invocations addressed to a service are identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// One invocation per key for the lifetime of the key; repeated sends to
    /// the same key attach to the existing instance instead of starting a new one.
    Workflow,
    /// Every message is its own invocation; executions are serialized per key.
    Object,
}

/// Address of a handler: `service/key/handler`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub service: String,
    pub key: String,
    pub handler: String,
}

impl Target {
    pub fn new(
        service: impl Into<String>,
        key: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            key: key.into(),
            handler: handler.into(),
        }
    }

    /// Identity executions are serialized on.
    pub fn lock_key(&self) -> String {
        format!("{}/{}", self.service, self.key)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.service, self.key, self.handler)
    }
}

/// Lifecycle state of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationStatus {
    /// Accepted, not yet executed.
    Pending,
    /// An attempt is executing (or the process died while one was).
    Running,
    /// Parked in a durable sleep until `wake_at`.
    Suspended,
    /// Waiting out the retry backoff until `wake_at`.
    BackingOff,
    Completed,
    Failed,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvocationStatus::Completed | InvocationStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Pending => "pending",
            InvocationStatus::Running => "running",
            InvocationStatus::Suspended => "suspended",
            InvocationStatus::BackingOff => "backing-off",
            InvocationStatus::Completed => "completed",
            InvocationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvocationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InvocationStatus::Pending),
            "running" => Ok(InvocationStatus::Running),
            "suspended" => Ok(InvocationStatus::Suspended),
            "backing-off" => Ok(InvocationStatus::BackingOff),
            "completed" => Ok(InvocationStatus::Completed),
            "failed" => Ok(InvocationStatus::Failed),
            other => Err(format!("unknown invocation status: {other}")),
        }
    }
}

/// A persisted invocation record.
#[derive(Debug, Clone, Serialize)]
pub struct Invocation {
    pub id: String,
    pub target: Target,
    pub input: serde_json::Value,
    pub status: InvocationStatus,
    /// Zero-based index of the current (or next) attempt.
    pub attempt: u32,
    pub output: Option<serde_json::Value>,
    pub failure: Option<String>,
    /// Continuation wake time while suspended or backing off.
    pub wake_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last time the journal grew.
    pub last_progress_at: DateTime<Utc>,
}

/// Kind of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JournalKind {
    Step,
    Sleep,
    Now,
    GetState,
    SetState,
    Send,
    Lookup,
}

impl JournalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalKind::Step => "step",
            JournalKind::Sleep => "sleep",
            JournalKind::Now => "now",
            JournalKind::GetState => "get-state",
            JournalKind::SetState => "set-state",
            JournalKind::Send => "send",
            JournalKind::Lookup => "lookup",
        }
    }
}

impl fmt::Display for JournalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JournalKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "step" => Ok(JournalKind::Step),
            "sleep" => Ok(JournalKind::Sleep),
            "now" => Ok(JournalKind::Now),
            "get-state" => Ok(JournalKind::GetState),
            "set-state" => Ok(JournalKind::SetState),
            "send" => Ok(JournalKind::Send),
            "lookup" => Ok(JournalKind::Lookup),
            other => Err(format!("unknown journal kind: {other}")),
        }
    }
}

/// One write-once record in an invocation's journal.
#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub name: String,
    /// Position in program order within the invocation.
    pub seq: u32,
    pub kind: JournalKind,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Stored shape of a `sleep` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepRecord {
    pub wake_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Stored shape of a `send` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRecord {
    pub timer_id: String,
    pub target: Target,
    pub fire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Deliver a message: creates an invocation when it fires.
    Invoke,
    /// Re-run an existing invocation.
    Resume,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::Invoke => "invoke",
            TimerKind::Resume => "resume",
        }
    }
}

impl FromStr for TimerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "invoke" => Ok(TimerKind::Invoke),
            "resume" => Ok(TimerKind::Resume),
            other => Err(format!("unknown timer kind: {other}")),
        }
    }
}

/// A durable, at-least-once wake-up.
#[derive(Debug, Clone)]
pub struct Timer {
    pub id: String,
    pub fire_at: DateTime<Utc>,
    pub kind: TimerKind,
    /// Set for `Resume` timers.
    pub invocation_id: Option<String>,
    pub target: Target,
    pub input: serde_json::Value,
}

impl Timer {
    pub fn invoke(
        id: impl Into<String>,
        target: Target,
        input: serde_json::Value,
        fire_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            fire_at,
            kind: TimerKind::Invoke,
            invocation_id: None,
            target,
            input,
        }
    }

    /// Resume timer for `invocation`; the id is derived from the wake time so
    /// re-arming the same continuation twice is a no-op.
    pub fn resume(invocation: &Invocation, fire_at: DateTime<Utc>) -> Self {
        Self {
            id: format!(
                "{}/resume@{}",
                invocation.id,
                fire_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
            ),
            fire_at,
            kind: TimerKind::Resume,
            invocation_id: Some(invocation.id.clone()),
            target: invocation.target.clone(),
            input: serde_json::Value::Null,
        }
    }
}
