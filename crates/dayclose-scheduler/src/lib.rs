//! `dayclose-scheduler` — the recurring trigger behind daily closings.
//!
//! # Overview
//!
//! A single object-service instance (`DailyClosingScheduler/main`) keeps a
//! [`types::ScheduleState`] and a chain of durable delayed messages to itself:
//!
//! | Handler   | Behaviour                                                  |
//! |-----------|------------------------------------------------------------|
//! | `start`   | Arms the first trigger unless a live chain already exists  |
//! | `trigger` | Starts `DailyClosing/<date>` for today, then re-arms       |
//!
//! The next trigger instant comes from [`schedule::next_fire`], evaluated in
//! the configured fixed-offset zone.

pub mod actor;
pub mod error;
pub mod schedule;
pub mod types;

pub use actor::{start_schedule, DailyClosingScheduler};
pub use error::{Result, SchedulerError};
pub use schedule::{next_fire, NextFire};
pub use types::{ScheduleState, SchedulerOptions};
