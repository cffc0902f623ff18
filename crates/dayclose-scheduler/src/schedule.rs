use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use dayclose_core::TargetZone;

use crate::error::{Result, SchedulerError};

/// The next trigger: how long to wait and the instant it lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextFire {
    pub delay: Duration,
    pub target: DateTime<Utc>,
}

/// Compute the next trigger strictly after `now` for a daily `hour:minute`
/// in `zone`.
///
/// Builds today's `hour:minute` in the zone; if that instant is not after
/// `now` the trigger moves to the same time tomorrow. The delay is therefore
/// always positive and never more than one day.
pub fn next_fire(now: DateTime<Utc>, hour: u32, minute: u32, zone: TargetZone) -> Result<NextFire> {
    let local_time = zone
        .local_date(now)
        .and_hms_opt(hour, minute, 0)
        .ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!("{hour:02}:{minute:02} is not a time of day"))
        })?;
    // A fixed offset maps every local time to exactly one instant.
    let today = zone
        .offset()
        .from_local_datetime(&local_time)
        .single()
        .ok_or_else(|| SchedulerError::InvalidSchedule(format!("{local_time} in {zone}")))?
        .with_timezone(&Utc);

    let target = if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    };
    let delay = (target - now)
        .to_std()
        .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;
    Ok(NextFire { delay, target })
}
