//! Calendar and clock values as they travel over the wire.
//!
//! These types mirror MySQL's DATE, TIME and DATETIME/TIMESTAMP columns
//! rather than any particular date library. A zero date (`0000-00-00`) is
//! representable because servers may return one.
//!
//! `TIME` is a signed interval, not a time of day: it may exceed 24 hours
//! (the binary protocol carries a separate day count) and may be negative.

use crate::Result;
use crate::error::{Error, TypeError, TypeErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const MICROS_PER_SECOND: u64 = 1_000_000;
const SECONDS_PER_DAY: u64 = 86_400;

/// A calendar date (DATE column).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Date {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

/// A signed time interval (TIME column).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Time {
    pub negative: bool,
    pub days: u32,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub microseconds: u32,
}

/// A date with time of day (DATETIME and TIMESTAMP columns).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub microsecond: u32,
}

impl Date {
    /// Create a date, returning `None` if a field is out of range.
    ///
    /// Month and day may both be zero (MySQL zero dates); otherwise the day
    /// must exist in the given month.
    pub fn new(year: u16, month: u8, day: u8) -> Option<Self> {
        let date = Self { year, month, day };
        date.is_valid().then_some(date)
    }

    /// Check field ranges.
    pub fn is_valid(&self) -> bool {
        if self.year > 9999 || self.month > 12 {
            return false;
        }
        if self.month == 0 || self.day == 0 {
            return self.day <= 31;
        }
        self.day <= days_in_month(self.year, self.month)
    }

    /// `0000-00-00`.
    pub fn is_zero(&self) -> bool {
        self.year == 0 && self.month == 0 && self.day == 0
    }
}

impl Time {
    /// Create a time from its parts, normalizing nothing.
    ///
    /// Returns `None` if hours, minutes, seconds or microseconds are out of range.
    pub fn new(
        negative: bool,
        days: u32,
        hours: u8,
        minutes: u8,
        seconds: u8,
        microseconds: u32,
    ) -> Option<Self> {
        let time = Self {
            negative,
            days,
            hours,
            minutes,
            seconds,
            microseconds,
        };
        time.is_valid().then_some(time)
    }

    /// Check field ranges.
    pub fn is_valid(&self) -> bool {
        self.hours < 24
            && self.minutes < 60
            && self.seconds < 60
            && u64::from(self.microseconds) < MICROS_PER_SECOND
    }

    /// A zero-length interval (sign is ignored).
    pub fn is_zero(&self) -> bool {
        self.days == 0
            && self.hours == 0
            && self.minutes == 0
            && self.seconds == 0
            && self.microseconds == 0
    }

    /// Build a time from an unsigned duration and a sign.
    ///
    /// Returns `None` if the duration's day count does not fit in `u32`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_duration(negative: bool, duration: Duration) -> Option<Self> {
        let total = duration.as_secs();
        let days = u32::try_from(total / SECONDS_PER_DAY).ok()?;
        let rem = total % SECONDS_PER_DAY;
        Some(Self {
            negative,
            days,
            hours: (rem / 3600) as u8,
            minutes: ((rem % 3600) / 60) as u8,
            seconds: (rem % 60) as u8,
            microseconds: duration.subsec_micros(),
        })
    }

    /// The magnitude of this interval.
    pub fn to_duration(&self) -> Duration {
        let secs = u64::from(self.days) * SECONDS_PER_DAY
            + u64::from(self.hours) * 3600
            + u64::from(self.minutes) * 60
            + u64::from(self.seconds);
        Duration::from_secs(secs) + Duration::from_micros(u64::from(self.microseconds))
    }
}

impl DateTime {
    /// Create a datetime, returning `None` if any field is out of range.
    pub fn new(
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        microsecond: u32,
    ) -> Option<Self> {
        let dt = Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
            microsecond,
        };
        dt.is_valid().then_some(dt)
    }

    /// Midnight on the given date.
    pub fn from_date(date: Date) -> Self {
        Self {
            year: date.year,
            month: date.month,
            day: date.day,
            ..Self::default()
        }
    }

    /// Check field ranges.
    pub fn is_valid(&self) -> bool {
        self.date().is_valid()
            && self.hour < 24
            && self.minute < 60
            && self.second < 60
            && u64::from(self.microsecond) < MICROS_PER_SECOND
    }

    /// The calendar part.
    pub fn date(&self) -> Date {
        Date {
            year: self.year,
            month: self.month,
            day: self.day,
        }
    }

    /// The clock part as a non-negative interval below one day.
    pub fn time_of_day(&self) -> Time {
        Time {
            negative: false,
            days: 0,
            hours: self.hour,
            minutes: self.minute,
            seconds: self.second,
            microseconds: self.microsecond,
        }
    }

    /// `0000-00-00 00:00:00`.
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

fn is_leap_year(year: u16) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 31,
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hours = u64::from(self.days) * 24 + u64::from(self.hours);
        if self.negative && !self.is_zero() {
            write!(f, "-")?;
        }
        write!(f, "{:02}:{:02}:{:02}", hours, self.minutes, self.seconds)?;
        if self.microseconds > 0 {
            write!(f, ".{:06}", self.microseconds)?;
        }
        Ok(())
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:02}:{:02}:{:02}",
            self.date(),
            self.hour,
            self.minute,
            self.second
        )?;
        if self.microsecond > 0 {
            write!(f, ".{:06}", self.microsecond)?;
        }
        Ok(())
    }
}

fn parse_error(expected: &'static str, input: &str) -> Error {
    Error::Type(TypeError {
        kind: TypeErrorKind::Mismatch,
        expected,
        actual: format!("'{}'", input),
        column: None,
        rust_type: None,
    })
}

fn parse_num<T: FromStr>(part: &str, expected: &'static str, input: &str) -> Result<T> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(parse_error(expected, input));
    }
    part.parse().map_err(|_| parse_error(expected, input))
}

/// Parse a `.ffffff` suffix (1 to 6 digits, right-padded) into microseconds.
#[allow(clippy::cast_possible_truncation)]
fn parse_fraction(frac: &str, expected: &'static str, input: &str) -> Result<u32> {
    if frac.is_empty() || frac.len() > 6 {
        return Err(parse_error(expected, input));
    }
    let value: u32 = parse_num(frac, expected, input)?;
    Ok(value * 10u32.pow(6 - frac.len() as u32))
}

/// Split `HH:MM:SS[.ffffff]` into its parts; hours may be wider than two digits.
fn parse_clock(s: &str, expected: &'static str, input: &str) -> Result<(u64, u8, u8, u32)> {
    let (clock, micros) = match s.split_once('.') {
        Some((clock, frac)) => (clock, parse_fraction(frac, expected, input)?),
        None => (s, 0),
    };
    let mut parts = clock.split(':');
    let (Some(h), Some(m), Some(sec), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(parse_error(expected, input));
    };
    Ok((
        parse_num(h, expected, input)?,
        parse_num(m, expected, input)?,
        parse_num(sec, expected, input)?,
        micros,
    ))
}

impl FromStr for Date {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('-');
        let (Some(y), Some(m), Some(d), None) = (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(parse_error("DATE 'YYYY-MM-DD'", s));
        };
        Date::new(
            parse_num(y, "DATE year", s)?,
            parse_num(m, "DATE month", s)?,
            parse_num(d, "DATE day", s)?,
        )
        .ok_or_else(|| parse_error("valid DATE", s))
    }
}

impl FromStr for Time {
    type Err = Error;

    #[allow(clippy::cast_possible_truncation)]
    fn from_str(s: &str) -> Result<Self> {
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (hours, minutes, seconds, microseconds) = parse_clock(body, "TIME '[-]HH:MM:SS'", s)?;
        let days = u32::try_from(hours / 24).map_err(|_| parse_error("TIME in range", s))?;
        Time::new(
            negative,
            days,
            (hours % 24) as u8,
            minutes,
            seconds,
            microseconds,
        )
        .ok_or_else(|| parse_error("valid TIME", s))
    }
}

impl FromStr for DateTime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (date_part, clock_part) = match s.split_once(' ').or_else(|| s.split_once('T')) {
            Some(parts) => parts,
            None => (s, "00:00:00"),
        };
        let date: Date = date_part.parse()?;
        let (hour, minute, second, microsecond) =
            parse_clock(clock_part, "DATETIME 'YYYY-MM-DD HH:MM:SS'", s)?;
        let hour = u8::try_from(hour).map_err(|_| parse_error("valid DATETIME", s))?;
        DateTime::new(
            date.year,
            date.month,
            date.day,
            hour,
            minute,
            second,
            microsecond,
        )
        .ok_or_else(|| parse_error("valid DATETIME", s))
    }
}
