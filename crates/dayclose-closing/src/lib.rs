//! `dayclose-closing` — the daily closing workflow.
//!
//! One durable instance per closing date runs two steps:
//!
//! 1. **Oracle closing**: submit the external closing job, wait out its
//!    warm-up, then poll it a bounded number of times.
//! 2. **Financial metrics**: compute the day's metrics once under a run id
//!    that status queries can follow.
//!
//! Either step can be skipped per run. Progress is kept in a
//! [`WorkflowState`] snapshot readable through [`status::status`].

pub mod collaborators;
pub mod error;
pub mod simulated;
pub mod status;
pub mod types;
pub mod workflow;

pub use collaborators::{
    ClosingJobs, CollaboratorError, CollaboratorErrorKind, JobSubmission, MetricsBackend,
    MetricsOutcome, MetricsProgress, PollResult,
};
pub use error::{ClosingError, ErrorKind, Result};
pub use simulated::SimulatedBackend;
pub use types::{
    ClosingInput, ClosingOptions, ClosingResult, ClosingStatus, ClosingStep, FailureReport,
    StepReport, WorkflowState,
};
pub use workflow::DailyClosing;
