//! `dayclose-core` — configuration, validated identifiers and the
//! target-zone clock utility shared by every dayclose crate.

pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use config::DaycloseConfig;
pub use error::{CoreError, Result};
pub use time::TargetZone;
pub use types::{ClosingDate, JobName, UserId};
