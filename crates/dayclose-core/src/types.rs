use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CoreError, Result};

/// Calendar date a closing run belongs to; also the workflow instance key.
///
/// Wire format is always `YYYY-MM-DD` (zero padded). Anything else, including
/// impossible dates such as `2025-02-30`, is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClosingDate(NaiveDate);

impl ClosingDate {
    pub fn parse(s: &str) -> Result<Self> {
        let well_formed = s.len() == 10
            && s.char_indices().all(|(i, c)| match i {
                4 | 7 => c == '-',
                _ => c.is_ascii_digit(),
            });
        if !well_formed {
            return Err(CoreError::InvalidDate {
                value: s.to_string(),
            });
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Self)
            .map_err(|_| CoreError::InvalidDate {
                value: s.to_string(),
            })
    }

    pub fn from_naive(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn naive(&self) -> NaiveDate {
        self.0
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }

    /// Canonical `YYYY-MM-DD` form used as the workflow key.
    pub fn format(&self) -> String {
        self.0.format("%Y-%m-%d").to_string()
    }
}

impl fmt::Display for ClosingDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

impl Serialize for ClosingDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.format())
    }
}

impl<'de> Deserialize<'de> for ClosingDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ClosingDate::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Operator identity passed to the external closing job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn parse(s: &str) -> Result<Self> {
        let valid = !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(CoreError::InvalidUserId {
                value: s.to_string(),
            });
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        UserId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Name of a job in the external scheduler, e.g. `GENIUS_CLOSING_2025_01_1738000000000`.
///
/// The name ends up interpolated into the external system's job catalogue,
/// so only upper-case letters, digits and underscores are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobName(String);

impl JobName {
    pub fn parse(s: &str) -> Result<Self> {
        let valid = !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(CoreError::InvalidJobName {
                value: s.to_string(),
            });
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for JobName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        JobName::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_date_accepts_canonical_form() {
        let date = ClosingDate::parse("2025-01-31").expect("valid date");
        assert_eq!(date.year(), 2025);
        assert_eq!(date.month(), 1);
        assert_eq!(date.to_string(), "2025-01-31");
    }

    #[test]
    fn closing_date_rejects_unpadded_and_impossible_dates() {
        assert!(ClosingDate::parse("2025-1-31").is_err());
        assert!(ClosingDate::parse("2025-02-30").is_err());
        assert!(ClosingDate::parse("20250131").is_err());
        assert!(ClosingDate::parse("2025-01-31T00:00").is_err());
    }

    #[test]
    fn closing_date_serde_uses_string_form() {
        let date = ClosingDate::parse("2024-12-01").expect("valid date");
        let json = serde_json::to_string(&date).expect("serialize");
        assert_eq!(json, "\"2024-12-01\"");
        let back: ClosingDate = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, date);
        assert!(serde_json::from_str::<ClosingDate>("\"2024-13-01\"").is_err());
    }

    #[test]
    fn user_id_rules() {
        assert!(UserId::parse("adm").is_ok());
        assert!(UserId::parse("ops_user_2").is_ok());
        assert!(UserId::parse("").is_err());
        assert!(UserId::parse("robert'); drop").is_err());
    }

    #[test]
    fn job_name_rules() {
        assert!(JobName::parse("GENIUS_CLOSING_2025_01_1738000000000").is_ok());
        assert!(JobName::parse("genius_closing").is_err());
        assert!(JobName::parse("JOB-1").is_err());
    }
}
