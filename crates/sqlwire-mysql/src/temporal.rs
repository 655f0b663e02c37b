//! Binary protocol encoding of DATE, TIME and DATETIME values.
//!
//! # Format
//!
//! Every value starts with a length byte; the fields present depend on it.
//!
//! DATE, DATETIME and TIMESTAMP:
//!
//! | length | fields |
//! |--------|--------|
//! | 0      | all zero |
//! | 4      | year (u16), month, day |
//! | 7      | + hour, minute, second |
//! | 11     | + microsecond (u32) |
//!
//! TIME:
//!
//! | length | fields |
//! |--------|--------|
//! | 0      | zero interval |
//! | 8      | is_negative, days (u32), hours, minutes, seconds |
//! | 12     | + microseconds (u32) |
//!
//! Encoding always picks the shortest length that preserves the value.
//! Decoding rejects any other length, a truncated buffer, or a field out of
//! range with `ProtocolErrorKind::InvalidTemporalEncoding`.

use sqlwire_core::error::ProtocolErrorKind;
use sqlwire_core::{Date, DateTime, Result, Time, Value};

use crate::protocol::{PacketReader, PacketWriter, protocol_error};

/// Which temporal layout a column or parameter uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalKind {
    Date,
    Time,
    DateTime,
}

fn invalid(msg: impl Into<String>) -> sqlwire_core::Error {
    protocol_error(ProtocolErrorKind::InvalidTemporalEncoding, msg)
}

/// Encode a DATE, length byte included.
pub fn encode_date(date: &Date) -> Result<Vec<u8>> {
    if !date.is_valid() {
        return Err(invalid(format!("DATE {} is out of range", date)));
    }
    let mut w = PacketWriter::with_capacity(5);
    if date.is_zero() {
        w.write_u8(0);
    } else {
        w.write_u8(4);
        write_ymd(&mut w, date.year, date.month, date.day);
    }
    Ok(w.into_bytes())
}

/// Encode a DATETIME or TIMESTAMP, length byte included.
pub fn encode_datetime(dt: &DateTime) -> Result<Vec<u8>> {
    if !dt.is_valid() {
        return Err(invalid(format!("DATETIME {} is out of range", dt)));
    }
    let mut w = PacketWriter::with_capacity(12);
    let has_clock = dt.hour != 0 || dt.minute != 0 || dt.second != 0;
    let len = match (dt.is_zero(), has_clock, dt.microsecond != 0) {
        (true, _, _) => 0,
        (false, _, true) => 11,
        (false, true, false) => 7,
        (false, false, false) => 4,
    };
    w.write_u8(len);
    if len >= 4 {
        write_ymd(&mut w, dt.year, dt.month, dt.day);
    }
    if len >= 7 {
        w.write_u8(dt.hour);
        w.write_u8(dt.minute);
        w.write_u8(dt.second);
    }
    if len == 11 {
        w.write_u32_le(dt.microsecond);
    }
    Ok(w.into_bytes())
}

/// Encode a TIME, length byte included.
///
/// A negative zero interval encodes as plain zero.
pub fn encode_time(time: &Time) -> Result<Vec<u8>> {
    if !time.is_valid() {
        return Err(invalid(format!("TIME {} is out of range", time)));
    }
    let mut w = PacketWriter::with_capacity(13);
    if time.is_zero() {
        w.write_u8(0);
        return Ok(w.into_bytes());
    }
    w.write_u8(if time.microseconds == 0 { 8 } else { 12 });
    w.write_u8(u8::from(time.negative));
    w.write_u32_le(time.days);
    w.write_u8(time.hours);
    w.write_u8(time.minutes);
    w.write_u8(time.seconds);
    if time.microseconds != 0 {
        w.write_u32_le(time.microseconds);
    }
    Ok(w.into_bytes())
}

fn write_ymd(w: &mut PacketWriter, year: u16, month: u8, day: u8) {
    w.write_u16_le(year);
    w.write_u8(month);
    w.write_u8(day);
}

/// Split `encoded` into its length byte and body, checking the length is allowed.
fn body<'a>(encoded: &'a [u8], allowed: &[u8], kind: &str) -> Result<PacketReader<'a>> {
    let Some((&len, rest)) = encoded.split_first() else {
        return Err(invalid(format!("empty {} value", kind)));
    };
    if !allowed.contains(&len) {
        return Err(invalid(format!("invalid {} length {}", kind, len)));
    }
    if rest.len() != usize::from(len) {
        return Err(invalid(format!(
            "{} declares {} bytes but {} are present",
            kind,
            len,
            rest.len()
        )));
    }
    Ok(PacketReader::new(rest))
}

/// Decode a DATE from its length byte and body.
pub fn decode_date(encoded: &[u8]) -> Result<Date> {
    let dt = decode_datetime_with(encoded, &[0, 4], "DATE")?;
    Ok(dt.date())
}

/// Decode a DATETIME or TIMESTAMP from its length byte and body.
pub fn decode_datetime(encoded: &[u8]) -> Result<DateTime> {
    decode_datetime_with(encoded, &[0, 4, 7, 11], "DATETIME")
}

fn decode_datetime_with(encoded: &[u8], allowed: &[u8], kind: &str) -> Result<DateTime> {
    let mut r = body(encoded, allowed, kind)?;
    let mut dt = DateTime::default();
    let truncated = || invalid(format!("truncated {} value", kind));
    if r.remaining() >= 4 {
        dt.year = r.read_u16_le().ok_or_else(truncated)?;
        dt.month = r.read_u8().ok_or_else(truncated)?;
        dt.day = r.read_u8().ok_or_else(truncated)?;
    }
    if r.remaining() >= 3 {
        dt.hour = r.read_u8().ok_or_else(truncated)?;
        dt.minute = r.read_u8().ok_or_else(truncated)?;
        dt.second = r.read_u8().ok_or_else(truncated)?;
    }
    if r.remaining() >= 4 {
        dt.microsecond = r.read_u32_le().ok_or_else(truncated)?;
    }
    if !dt.is_valid() {
        return Err(invalid(format!("{} field out of range: {:?}", kind, dt)));
    }
    Ok(dt)
}

/// Decode a TIME from its length byte and body.
pub fn decode_time(encoded: &[u8]) -> Result<Time> {
    let mut r = body(encoded, &[0, 8, 12], "TIME")?;
    let mut time = Time::default();
    let truncated = || invalid("truncated TIME value");
    if r.remaining() >= 8 {
        time.negative = match r.read_u8().ok_or_else(truncated)? {
            0 => false,
            1 => true,
            other => return Err(invalid(format!("invalid TIME sign byte {}", other))),
        };
        time.days = r.read_u32_le().ok_or_else(truncated)?;
        time.hours = r.read_u8().ok_or_else(truncated)?;
        time.minutes = r.read_u8().ok_or_else(truncated)?;
        time.seconds = r.read_u8().ok_or_else(truncated)?;
    }
    if r.remaining() >= 4 {
        time.microseconds = r.read_u32_le().ok_or_else(truncated)?;
    }
    if !time.is_valid() {
        return Err(invalid(format!("TIME field out of range: {:?}", time)));
    }
    Ok(time)
}

/// Decode a temporal value of the given kind into a `Value`.
pub fn decode_temporal(encoded: &[u8], kind: TemporalKind) -> Result<Value> {
    match kind {
        TemporalKind::Date => decode_date(encoded).map(Value::Date),
        TemporalKind::Time => decode_time(encoded).map(Value::Time),
        TemporalKind::DateTime => decode_datetime(encoded).map(Value::DateTime),
    }
}

/// Read one length-prefixed temporal value from a binary row.
pub(crate) fn read_temporal(reader: &mut PacketReader<'_>, kind: TemporalKind) -> Result<Value> {
    let len = reader
        .peek()
        .ok_or_else(|| invalid("missing temporal length byte"))?;
    let encoded = reader
        .read_bytes(1 + usize::from(len))
        .ok_or_else(|| invalid(format!("temporal value of length {} is truncated", len)))?;
    decode_temporal(encoded, kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn is_invalid(err: &sqlwire_core::Error) -> bool {
        err.protocol_kind() == Some(ProtocolErrorKind::InvalidTemporalEncoding)
    }

    #[test]
    fn test_date_lengths() {
        assert_eq!(encode_date(&Date::default()).unwrap(), vec![0]);
        let d = Date::new(2024, 1, 15).unwrap();
        assert_eq!(encode_date(&d).unwrap(), vec![4, 0xE8, 0x07, 1, 15]);
    }

    #[test]
    fn test_datetime_picks_shortest_form() {
        let midnight = DateTime::new(2024, 1, 15, 0, 0, 0, 0).unwrap();
        assert_eq!(encode_datetime(&midnight).unwrap()[0], 4);
        let seconds = DateTime::new(2024, 1, 15, 10, 30, 45, 0).unwrap();
        assert_eq!(encode_datetime(&seconds).unwrap()[0], 7);
        let micros = DateTime::new(2024, 1, 15, 10, 30, 45, 123_456).unwrap();
        let bytes = encode_datetime(&micros).unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes[0], 11);
        assert_eq!(encode_datetime(&DateTime::default()).unwrap(), vec![0]);
        // microseconds without a clock still need the full form
        let only_micros = DateTime::new(2024, 1, 15, 0, 0, 0, 1).unwrap();
        assert_eq!(encode_datetime(&only_micros).unwrap()[0], 11);
    }

    #[test]
    fn test_time_forms() {
        let t = Time::new(true, 1, 2, 3, 4, 0).unwrap();
        assert_eq!(
            encode_time(&t).unwrap(),
            vec![8, 1, 1, 0, 0, 0, 2, 3, 4]
        );
        let t = Time::new(false, 0, 12, 0, 0, 500_000).unwrap();
        assert_eq!(encode_time(&t).unwrap().len(), 13);
        assert_eq!(
            encode_time(&Time {
                negative: true,
                ..Time::default()
            })
            .unwrap(),
            vec![0]
        );
    }

    #[test]
    fn test_decode_microsecond_datetime() {
        let bytes = [11, 0xE8, 0x07, 1, 15, 10, 30, 45, 0x40, 0xE2, 0x01, 0x00];
        let dt = decode_datetime(&bytes).unwrap();
        assert_eq!(dt, DateTime::new(2024, 1, 15, 10, 30, 45, 123_456).unwrap());
    }

    #[test]
    fn test_decode_date_only_datetime() {
        let dt = decode_datetime(&[4, 0xE8, 0x07, 2, 29]).unwrap();
        assert_eq!((dt.hour, dt.minute, dt.second), (0, 0, 0));
        assert_eq!(dt.date(), Date::new(2024, 2, 29).unwrap());
    }

    #[test]
    fn test_reject_invalid_lengths() {
        for len in [1u8, 2, 3, 5, 6, 8, 9, 10, 12] {
            let mut bytes = vec![len];
            bytes.resize(1 + usize::from(len), 1);
            assert!(is_invalid(&decode_datetime(&bytes).unwrap_err()), "len {len}");
        }
        for len in [1u8, 4, 7, 11, 13] {
            let mut bytes = vec![len];
            bytes.resize(1 + usize::from(len), 0);
            assert!(is_invalid(&decode_time(&bytes).unwrap_err()), "len {len}");
        }
        assert!(is_invalid(&decode_date(&[7, 0xE8, 7, 1, 1, 0, 0, 0]).unwrap_err()));
    }

    #[test]
    fn test_reject_truncated_and_out_of_range() {
        assert!(is_invalid(&decode_date(&[4, 0xE8, 0x07, 1]).unwrap_err()));
        assert!(is_invalid(&decode_date(&[]).unwrap_err()));
        assert!(is_invalid(&decode_date(&[4, 0xE8, 0x07, 13, 1]).unwrap_err()));
        assert!(is_invalid(
            &decode_time(&[8, 2, 0, 0, 0, 0, 1, 0, 0]).unwrap_err()
        ));
        assert!(is_invalid(
            &decode_time(&[8, 0, 0, 0, 0, 0, 24, 0, 0]).unwrap_err()
        ));
    }

    #[test]
    fn test_encode_rejects_out_of_range() {
        let bad = Time {
            hours: 30,
            ..Time::default()
        };
        assert!(is_invalid(&encode_time(&bad).unwrap_err()));
    }

    #[test]
    fn test_read_temporal_advances_reader() {
        let data = [4, 0xE8, 0x07, 1, 15, 0x2A];
        let mut reader = PacketReader::new(&data);
        let value = read_temporal(&mut reader, TemporalKind::Date).unwrap();
        assert_eq!(value, Value::Date(Date::new(2024, 1, 15).unwrap()));
        assert_eq!(reader.read_u8(), Some(0x2A));
    }

    prop_compose! {
        fn any_datetime()(
            year in 0u16..=9999,
            month in 1u8..=12,
            day in 1u8..=28,
            hour in 0u8..24,
            minute in 0u8..60,
            second in 0u8..60,
            micro in prop_oneof![Just(0u32), 0u32..1_000_000],
        ) -> DateTime {
            DateTime { year, month, day, hour, minute, second, microsecond: micro }
        }
    }

    prop_compose! {
        fn any_time()(
            negative in any::<bool>(),
            days in 0u32..100_000,
            hours in 0u8..24,
            minutes in 0u8..60,
            seconds in 0u8..60,
            micros in prop_oneof![Just(0u32), 0u32..1_000_000],
        ) -> Time {
            Time { negative, days, hours, minutes, seconds, microseconds: micros }
        }
    }

    proptest! {
        #[test]
        fn prop_datetime_round_trip(dt in any_datetime()) {
            let bytes = encode_datetime(&dt).unwrap();
            prop_assert!([1usize, 5, 8, 12].contains(&bytes.len()));
            prop_assert_eq!(decode_datetime(&bytes).unwrap(), dt);
            // shortest form is canonical
            prop_assert_eq!(encode_datetime(&decode_datetime(&bytes).unwrap()).unwrap(), bytes);
        }

        #[test]
        fn prop_date_round_trip(dt in any_datetime()) {
            let date = dt.date();
            let bytes = encode_date(&date).unwrap();
            prop_assert_eq!(decode_date(&bytes).unwrap(), date);
        }

        #[test]
        fn prop_time_round_trip(t in any_time()) {
            prop_assume!(!(t.negative && t.is_zero()));
            let bytes = encode_time(&t).unwrap();
            prop_assert!([1usize, 9, 13].contains(&bytes.len()));
            prop_assert_eq!(decode_time(&bytes).unwrap(), t);
        }

        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..16)) {
            let _ = decode_datetime(&bytes);
            let _ = decode_time(&bytes);
            let _ = decode_date(&bytes);
        }
    }
}
