use chrono::{DateTime, Utc};
use dayclose_core::{DaycloseConfig, TargetZone, UserId};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Persisted slot of the scheduler instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    /// When the armed trigger is due.
    pub next_fire_at: DateTime<Utc>,
    /// Invocation id the armed trigger will run under. Any other `trigger`
    /// delivery is a stray and is ignored.
    pub pending_trigger: String,
    pub armed_at: DateTime<Utc>,
    /// Closing date the last trigger started, `YYYY-MM-DD`.
    #[serde(default)]
    pub last_fired_date: Option<String>,
}

/// When to trigger and what to start.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub hour: u32,
    pub minute: u32,
    pub zone: TargetZone,
    /// Operator the scheduled runs are submitted as.
    pub default_user: UserId,
}

impl SchedulerOptions {
    pub fn from_config(config: &DaycloseConfig) -> Result<Self> {
        Ok(Self {
            hour: config.schedule.hour,
            minute: config.schedule.minute,
            zone: config.schedule.zone()?,
            default_user: UserId::parse(&config.closing.default_user_id)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_follow_config() {
        let mut config = DaycloseConfig::default();
        config.schedule.hour = 23;
        config.schedule.minute = 30;
        let options = SchedulerOptions::from_config(&config).unwrap();
        assert_eq!((options.hour, options.minute), (23, 30));
        assert_eq!(options.zone.to_string(), "+07:00");
        assert_eq!(options.default_user.as_str(), "adm");
    }

    #[test]
    fn bad_offset_is_a_config_error() {
        let mut config = DaycloseConfig::default();
        config.schedule.utc_offset = "+25:00".into();
        assert!(SchedulerOptions::from_config(&config).is_err());
    }
}
