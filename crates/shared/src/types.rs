//! Common types used across Memberpass

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::{Date, OffsetDateTime, UtcOffset};

use crate::error::SharedError;

// =============================================================================
// Money
// =============================================================================

/// A non-negative amount in the currency's minor unit (cents for USD).
///
/// All money crosses crate and HTTP boundaries in this form. There is no
/// decimal parsing anywhere in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct MinorUnits(i64);

impl MinorUnits {
    pub const ZERO: MinorUnits = MinorUnits(0);

    pub fn new(amount: i64) -> Result<Self, SharedError> {
        if amount < 0 {
            return Err(SharedError::InvalidAmount(format!(
                "amount must not be negative, got {}",
                amount
            )));
        }
        Ok(Self(amount))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for MinorUnits {
    type Error = SharedError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MinorUnits> for i64 {
    fn from(value: MinorUnits) -> Self {
        value.0
    }
}

impl fmt::Display for MinorUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

// =============================================================================
// Calendar months
// =============================================================================

/// A calendar month in UTC, represented by its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Month(Date);

impl Month {
    pub fn new(year: i32, month: u8) -> Result<Self, SharedError> {
        let month = time::Month::try_from(month)
            .map_err(|e| SharedError::InvalidMonth(e.to_string()))?;
        let date = Date::from_calendar_date(year, month, 1)
            .map_err(|e| SharedError::InvalidMonth(e.to_string()))?;
        Ok(Self(date))
    }

    /// The month containing the given instant, evaluated in UTC
    pub fn containing(at: OffsetDateTime) -> Self {
        let date = at.to_offset(UtcOffset::UTC).date();
        // Day 1 always exists for a date that already exists
        Self(date.replace_day(1).unwrap_or(date))
    }

    /// Normalize any date to the month it falls in
    pub fn from_date(date: Date) -> Self {
        Self(date.replace_day(1).unwrap_or(date))
    }

    pub fn year(self) -> i32 {
        self.0.year()
    }

    pub fn number(self) -> u8 {
        u8::from(self.0.month())
    }

    pub fn first_day(self) -> Date {
        self.0
    }

    /// Midnight UTC on the first day of the month
    pub fn start(self) -> OffsetDateTime {
        self.0.midnight().assume_utc()
    }

    pub fn next(self) -> Self {
        let (year, month) = match self.0.month() {
            time::Month::December => (self.0.year() + 1, time::Month::January),
            other => (self.0.year(), other.next()),
        };
        Date::from_calendar_date(year, month, 1)
            .map(Self)
            .unwrap_or(self)
    }

    /// Half-open interval `[start of month, start of next month)`
    pub fn interval(self) -> (OffsetDateTime, OffsetDateTime) {
        (self.start(), self.next().start())
    }

    pub fn contains(self, at: OffsetDateTime) -> bool {
        let (start, end) = self.interval();
        at >= start && at < end
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.number())
    }
}

impl FromStr for Month {
    type Err = SharedError;

    /// Parses `YYYY-MM`, or a full `YYYY-MM-DD` date which is normalized to its month
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '-');
        let year = parts
            .next()
            .and_then(|p| p.parse::<i32>().ok())
            .ok_or_else(|| SharedError::InvalidMonth(s.to_string()))?;
        let month = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(|| SharedError::InvalidMonth(s.to_string()))?;
        if let Some(day) = parts.next() {
            day.parse::<u8>()
                .map_err(|_| SharedError::InvalidMonth(s.to_string()))?;
        }
        Month::new(year, month)
    }
}

impl TryFrom<String> for Month {
    type Error = SharedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Month> for String {
    fn from(value: Month) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_minor_units_rejects_negative() {
        assert!(MinorUnits::new(-1).is_err());
        assert_eq!(MinorUnits::new(4500).unwrap().get(), 4500);
    }

    #[test]
    fn test_minor_units_display() {
        assert_eq!(MinorUnits::new(4500).unwrap().to_string(), "45.00");
        assert_eq!(MinorUnits::new(7).unwrap().to_string(), "0.07");
    }

    #[test]
    fn test_minor_units_deserialize_validates() {
        let ok: MinorUnits = serde_json::from_str("1999").unwrap();
        assert_eq!(ok.get(), 1999);
        assert!(serde_json::from_str::<MinorUnits>("-5").is_err());
        assert!(serde_json::from_str::<MinorUnits>("19.99").is_err());
    }

    #[test]
    fn test_month_containing_and_interval() {
        let month = Month::containing(datetime!(2026-07-31 23:59:59 UTC));
        assert_eq!(month, Month::new(2026, 7).unwrap());
        let (start, end) = month.interval();
        assert_eq!(start, datetime!(2026-07-01 00:00:00 UTC));
        assert_eq!(end, datetime!(2026-08-01 00:00:00 UTC));
        assert!(month.contains(datetime!(2026-07-15 12:00:00 UTC)));
        assert!(!month.contains(end));
    }

    #[test]
    fn test_month_containing_uses_utc() {
        let local = datetime!(2026-08-01 01:00:00 +03:00);
        assert_eq!(Month::containing(local), Month::new(2026, 7).unwrap());
    }

    #[test]
    fn test_month_next_wraps_year() {
        let december = Month::new(2026, 12).unwrap();
        assert_eq!(december.next(), Month::new(2027, 1).unwrap());
    }

    #[test]
    fn test_month_parse_and_display() {
        let month: Month = "2026-07".parse().unwrap();
        assert_eq!(month.to_string(), "2026-07");
        let from_date: Month = "2026-07-19".parse().unwrap();
        assert_eq!(from_date, month);
        assert!("2026-13".parse::<Month>().is_err());
        assert!("july".parse::<Month>().is_err());
    }

    #[test]
    fn test_month_serde_roundtrip_as_string() {
        let month = Month::new(2026, 3).unwrap();
        let json = serde_json::to_string(&month).unwrap();
        assert_eq!(json, "\"2026-03\"");
    }
}
