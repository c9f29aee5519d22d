//! Duration and start-time directives
//!
//! Durations are written as `<integer><unit>` with units `s`, `m`, `h` and `d`
//! (for example `30s`, `10m`, `1h`, `7d`). The start time of a rule is described by
//! an optional day anchor (`$startDay`) and an optional time of day (`$startDayTime`).

use crate::RuleError;
use chrono::{Datelike, Duration as ChronoDuration, Months, NaiveDate, NaiveDateTime, NaiveTime};
use std::time::Duration;

/// Parses a duration string such as `5s`, `10m`, `1h` or `7d`
///
/// # Arguments
///
/// * `directive` - Name of the directive being parsed, used in error messages
/// * `value` - The raw duration string
///
/// # Returns
///
/// * `Ok(Duration)` - A strictly positive duration
/// * `Err(RuleError)` - Malformed string, unknown unit, or non-positive magnitude
pub fn parse_duration(directive: &str, value: &str) -> Result<Duration, RuleError> {
    let invalid = || RuleError::InvalidDuration {
        directive: directive.to_string(),
        value: value.to_string(),
    };

    let trimmed = value.trim().to_ascii_lowercase();
    let unit = trimmed.chars().last().ok_or_else(invalid)?;
    let magnitude: i64 = trimmed[..trimmed.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| invalid())?;

    if magnitude <= 0 {
        return Err(invalid());
    }

    let seconds_per_unit: u64 = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        _ => return Err(invalid()),
    };

    (magnitude as u64)
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

/// Day on which a rule should first run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayAnchor {
    /// Day of week, Sunday = 0 through Saturday = 6 (`w0`..`w6`)
    Weekday(u32),
    /// Day of month, 1 through 30 (`m1`..`m30`)
    MonthDay(u32),
    /// Day of year, 1 through 365 (`y1`..`y365`)
    YearDay(u32),
}

impl DayAnchor {
    /// Parses a `$startDay` value
    pub fn parse(value: &str) -> Result<Self, RuleError> {
        let invalid = || RuleError::InvalidStartDay(value.to_string());

        let lower = value.trim().to_ascii_lowercase();
        if lower.len() < 2 || !lower.is_char_boundary(1) {
            return Err(invalid());
        }
        let (kind, number) = lower.split_at(1);
        let number: u32 = number.parse().map_err(|_| invalid())?;

        match kind {
            "w" if number <= 6 => Ok(DayAnchor::Weekday(number)),
            "m" if (1..=30).contains(&number) => Ok(DayAnchor::MonthDay(number)),
            "y" if (1..=365).contains(&number) => Ok(DayAnchor::YearDay(number)),
            _ => Err(invalid()),
        }
    }

    /// Returns the anchored date in the cycle containing `today`
    ///
    /// For weekdays this is the next matching day on or after `today`; for month and
    /// year days it is the matching day of the current month or year, which may lie
    /// before `today`.
    fn date_in_cycle(&self, today: NaiveDate) -> NaiveDate {
        match *self {
            DayAnchor::Weekday(day) => {
                let current = today.weekday().num_days_from_sunday();
                let ahead = (day + 7 - current) % 7;
                today + ChronoDuration::days(ahead as i64)
            }
            DayAnchor::MonthDay(day) => {
                let first = today.with_day(1).unwrap_or(today);
                // Days past the end of a short month spill into the next one
                first + ChronoDuration::days(day as i64 - 1)
            }
            DayAnchor::YearDay(day) => {
                let first = today.with_ordinal(1).unwrap_or(today);
                first + ChronoDuration::days(day as i64 - 1)
            }
        }
    }

    /// Moves an anchored date forward by one cycle
    fn next_cycle(&self, date: NaiveDate) -> NaiveDate {
        match *self {
            DayAnchor::Weekday(_) => date + ChronoDuration::days(7),
            DayAnchor::MonthDay(_) => {
                let first = date.with_day(1).unwrap_or(date);
                let next_month = first.checked_add_months(Months::new(1)).unwrap_or(first);
                self.date_in_cycle(next_month)
            }
            DayAnchor::YearDay(_) => {
                let first = date.with_ordinal(1).unwrap_or(date);
                let next_year = first.checked_add_months(Months::new(12)).unwrap_or(first);
                self.date_in_cycle(next_year)
            }
        }
    }
}

/// Parses a `$startDayTime` value in `HH:MM:SS` form
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, RuleError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M:%S")
        .map_err(|_| RuleError::InvalidStartTime(value.to_string()))
}

/// Computes how long to wait before the first run
///
/// The day anchor and time of day are composed into one instant. When that instant is
/// already in the past it is moved forward exactly once by the anchor's cycle (a week,
/// month or year), or by one day when only a time of day was given.
///
/// # Arguments
///
/// * `day` - Optional day anchor
/// * `time` - Optional time of day
/// * `now` - The reference instant
///
/// # Returns
///
/// The delay from `now` to the first run; zero when neither anchor is set.
pub fn compute_start_delay(
    day: Option<DayAnchor>,
    time: Option<NaiveTime>,
    now: NaiveDateTime,
) -> Duration {
    if day.is_none() && time.is_none() {
        return Duration::ZERO;
    }

    let today = now.date();
    let time_of_day = time.unwrap_or_else(|| now.time());
    let date = day.map(|d| d.date_in_cycle(today)).unwrap_or(today);

    let mut next = date.and_time(time_of_day);
    if next < now {
        next = match day {
            Some(anchor) => anchor.next_cycle(date).and_time(time_of_day),
            None => next + ChronoDuration::days(1),
        };
    }

    (next - now).to_std().unwrap_or(Duration::ZERO)
}
