use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CoreError, Result};
use crate::types::ClosingDate;

/// The fixed-offset zone daily closings are scheduled and dated in.
///
/// The closing calendar follows a single business location without daylight
/// saving, so a constant UTC offset is the whole zone rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetZone(FixedOffset);

impl TargetZone {
    pub fn new(offset: FixedOffset) -> Self {
        Self(offset)
    }

    /// Offset east of UTC in seconds, e.g. `25200` for `+07:00`.
    pub fn from_seconds(east_secs: i32) -> Result<Self> {
        FixedOffset::east_opt(east_secs)
            .map(Self)
            .ok_or_else(|| CoreError::InvalidOffset {
                value: east_secs.to_string(),
            })
    }

    pub fn utc() -> Self {
        Self(Utc.fix())
    }

    pub fn offset(&self) -> FixedOffset {
        self.0
    }

    /// Wall-clock date and time in the target zone.
    pub fn local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.with_timezone(&self.0).naive_local()
    }

    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        self.local(instant).date()
    }

    /// The closing date an instant belongs to: its calendar date in the zone.
    pub fn closing_date(&self, instant: DateTime<Utc>) -> ClosingDate {
        ClosingDate::from_naive(self.local_date(instant))
    }

    /// Human-readable form for log lines: `2025-01-31 23:30 (+07:00)`.
    pub fn format_local(&self, instant: DateTime<Utc>) -> String {
        format!("{} ({})", self.local(instant).format("%Y-%m-%d %H:%M"), self)
    }
}

impl fmt::Display for TargetZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TargetZone {
    type Err = CoreError;

    /// Accepts `Z`, `+HH:MM`, `-HH:MM` and `+HHMM`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CoreError::InvalidOffset {
            value: s.to_string(),
        };
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
            return Ok(Self::utc());
        }

        let (sign, rest) = match trimmed.chars().next() {
            Some('+') => (1, &trimmed[1..]),
            Some('-') => (-1, &trimmed[1..]),
            _ => return Err(invalid()),
        };
        let digits: String = rest.chars().filter(|c| *c != ':').collect();
        if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
        let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
        if hours > 14 || minutes > 59 {
            return Err(invalid());
        }
        Self::from_seconds(sign * (hours * 3600 + minutes * 60)).map_err(|_| invalid())
    }
}

impl Serialize for TargetZone {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TargetZone {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn jakarta() -> TargetZone {
        "+07:00".parse().expect("valid offset")
    }

    #[test]
    fn parses_offsets() {
        assert_eq!(jakarta().offset().local_minus_utc(), 7 * 3600);
        let west: TargetZone = "-03:30".parse().expect("valid offset");
        assert_eq!(west.offset().local_minus_utc(), -(3 * 3600 + 30 * 60));
        let compact: TargetZone = "+0530".parse().expect("valid offset");
        assert_eq!(compact.offset().local_minus_utc(), 5 * 3600 + 30 * 60);
        assert_eq!("Z".parse::<TargetZone>().expect("utc"), TargetZone::utc());
    }

    #[test]
    fn rejects_bad_offsets() {
        assert!("07:00".parse::<TargetZone>().is_err());
        assert!("+7".parse::<TargetZone>().is_err());
        assert!("+25:00".parse::<TargetZone>().is_err());
        assert!("Asia/Jakarta".parse::<TargetZone>().is_err());
    }

    #[test]
    fn closing_date_rolls_over_at_local_midnight() {
        let zone = jakarta();
        // 16:59 UTC = 23:59 local, still the 30th.
        let before = Utc.with_ymd_and_hms(2025, 1, 30, 16, 59, 0).unwrap();
        assert_eq!(zone.closing_date(before).to_string(), "2025-01-30");
        // 17:00 UTC = 00:00 local on the 31st.
        let after = Utc.with_ymd_and_hms(2025, 1, 30, 17, 0, 0).unwrap();
        assert_eq!(zone.closing_date(after).to_string(), "2025-01-31");
    }

    #[test]
    fn format_local_includes_offset() {
        let instant = Utc.with_ymd_and_hms(2025, 1, 31, 16, 30, 0).unwrap();
        assert_eq!(jakarta().format_local(instant), "2025-01-31 23:30 (+07:00)");
    }
}
