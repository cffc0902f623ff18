//! `dayclose-engine` — durable execution for long-running closing procedures.
//!
//! # Overview
//!
//! Every unit of work is an *invocation* of a registered [`runtime::Handler`]
//! addressed by `(service, key, handler)`. Handlers talk to the engine only
//! through a [`context::Context`], whose operations are journaled in SQLite:
//!
//! | Operation    | Journal kind | Replay behaviour                              |
//! |--------------|--------------|-----------------------------------------------|
//! | `run_step`   | `step`       | stored result returned, side effect skipped   |
//! | `sleep`      | `sleep`      | stored wake time; suspends until it passes    |
//! | `now`        | `now`        | stored instant                                |
//! | `get_state`  | `get-state`  | stored read                                   |
//! | `set_state`  | `set-state`  | write skipped                                 |
//! | `send`       | `send`       | message not enqueued again                    |
//!
//! A handler that hits an unexpired `sleep` returns
//! [`HandlerError::Suspended`]; the runtime parks the invocation and arms a
//! durable `resume` timer. When it fires the handler is re-run from the top and
//! fast-forwards through its journal, so a process restart anywhere in between
//! loses nothing.
//!
//! Executions addressed to the same `(service, key)` never overlap.

pub mod clock;
pub mod context;
pub mod db;
pub mod error;
pub mod retry;
pub mod runtime;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::Context;
pub use error::{EngineError, HandlerError, Result};
pub use retry::RetryPolicy;
pub use runtime::{EngineOptions, Handler, Runtime, StateScope};
pub use store::Store;
pub use types::{Invocation, InvocationStatus, JournalEntry, JournalKind, ServiceKind, Target};
