use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};

use super::{unexpected_value, Converter, ConverterRegistry};
use crate::error::{Error, Result};
use crate::value::Value;

pub(crate) const WIRE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const WIRE_FORMAT_TZ: &str = "%Y-%m-%d %H:%M:%S%.6f%:z";

/// `timestamp`, `timestamptz`, `date`.
///
/// Values carrying an offset decode to [`Value::TimestampTz`], the others
/// to [`Value::Timestamp`]. Dates decode to midnight.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampConverter;

/// Parse a server timestamp, with or without offset.
pub(crate) fn parse_timestamp(s: &str, type_name: &str) -> Result<Value> {
    let s = s.trim();
    let fail = |reason: &str| Error::conversion(type_name, s, reason);

    if s.len() == 10 {
        let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| fail(&e.to_string()))?;
        return Ok(Value::Timestamp(date.and_time(NaiveTime::MIN)));
    }
    if s.len() < 19 || !s.is_char_boundary(19) {
        return Err(fail("not a timestamp"));
    }

    // Anything past the seconds that is not a fraction is the offset.
    let tail = &s[19..];
    let frac_len = tail
        .strip_prefix('.')
        .map(|f| 1 + f.chars().take_while(char::is_ascii_digit).count())
        .unwrap_or(0);
    let (local, offset) = s.split_at(19 + frac_len);

    let naive = NaiveDateTime::parse_from_str(local, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(local, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|e| fail(&e.to_string()))?;

    let offset = offset.trim();
    if offset.is_empty() {
        return Ok(Value::Timestamp(naive));
    }
    let offset = parse_offset(offset).ok_or_else(|| fail("invalid time zone offset"))?;
    let aware: DateTime<FixedOffset> = offset
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| fail("ambiguous local time"))?;
    Ok(Value::TimestampTz(aware))
}

/// `Z`, `+01`, `-05:30`, `+0530`, `+05:30:15`.
fn parse_offset(s: &str) -> Option<FixedOffset> {
    if s == "Z" {
        return FixedOffset::east_opt(0);
    }
    let (sign, digits) = if let Some(rest) = s.strip_prefix('+') {
        (1, rest)
    } else {
        (-1, s.strip_prefix('-')?)
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit() || b == b':') {
        return None;
    }
    let parts: Vec<&str> = if digits.contains(':') {
        digits.split(':').collect()
    } else if digits.len() == 4 {
        vec![&digits[..2], &digits[2..]]
    } else {
        vec![digits]
    };
    if parts.len() > 3 {
        return None;
    }
    let mut seconds = 0i32;
    for (part, unit) in parts.iter().zip([3600, 60, 1]) {
        let n: i32 = part.parse().ok()?;
        seconds = seconds.checked_add(n.checked_mul(unit)?)?;
    }
    FixedOffset::east_opt(sign * seconds)
}

pub(crate) fn format_naive(ts: &NaiveDateTime) -> String {
    ts.format(WIRE_FORMAT).to_string()
}

impl Converter for TimestampConverter {
    fn to_native(
        &self,
        data: Option<&str>,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Value> {
        match data {
            None => Ok(Value::Null),
            Some(s) => parse_timestamp(s, type_name),
        }
    }

    fn to_wire(
        &self,
        value: &Value,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Option<String>> {
        match value {
            Value::Null => Ok(None),
            Value::Timestamp(ts) => Ok(Some(format_naive(ts))),
            Value::TimestampTz(ts) => Ok(Some(ts.format(WIRE_FORMAT_TZ).to_string())),
            other => Err(unexpected_value(type_name, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ConverterRegistry {
        ConverterRegistry::with_builtins()
    }

    #[test]
    fn test_naive_timestamp_keeps_microseconds() {
        let r = registry();
        let v = r.to_native("timestamp", Some("2024-03-01 10:11:12.123456")).unwrap();
        let Value::Timestamp(ts) = &v else {
            panic!("expected timestamp, got {:?}", v);
        };
        assert_eq!(ts.and_utc().timestamp_subsec_micros(), 123_456);
        assert_eq!(
            r.to_wire("timestamp", &v).unwrap().as_deref(),
            Some("2024-03-01 10:11:12.123456")
        );
    }

    #[test]
    fn test_timestamptz_offsets() {
        let r = registry();
        let v = r.to_native("timestamptz", Some("2024-03-01 10:11:12+01")).unwrap();
        let Value::TimestampTz(ts) = &v else {
            panic!("expected timestamptz, got {:?}", v);
        };
        assert_eq!(ts.offset().local_minus_utc(), 3600);
        assert_eq!(
            r.to_wire("timestamptz", &v).unwrap().as_deref(),
            Some("2024-03-01 10:11:12.000000+01:00")
        );

        let v = r.to_native("timestamptz", Some("2024-03-01 10:11:12.5-05:30")).unwrap();
        let Value::TimestampTz(ts) = &v else {
            panic!("expected timestamptz, got {:?}", v);
        };
        assert_eq!(ts.offset().local_minus_utc(), -(5 * 3600 + 30 * 60));
    }

    #[test]
    fn test_date_is_midnight() {
        let r = registry();
        let v = r.to_native("date", Some("2024-02-29")).unwrap();
        assert_eq!(
            r.to_wire("date", &v).unwrap().as_deref(),
            Some("2024-02-29 00:00:00.000000")
        );
    }

    #[test]
    fn test_invalid_timestamps() {
        let r = registry();
        assert!(r.to_native("timestamp", Some("infinity")).is_err());
        assert!(r.to_native("timestamp", Some("2024-13-01 00:00:00")).is_err());
        assert!(r.to_native("timestamptz", Some("2024-01-01 00:00:00+xx")).is_err());
    }

    #[test]
    fn test_malformed_offsets_are_conversion_errors() {
        let r = registry();
        for raw in [
            "2024-01-01 00:00:00+a\u{e9}b",
            "2024-01-01 00:00:00+\u{e9}\u{e9}",
            "2024-01-01 00:00:00+999999999",
            "2024-01-01 00:00:00+99:99:99999999",
            "2024-01-01 00:00:00+",
        ] {
            let err = r.to_native("timestamptz", Some(raw)).unwrap_err();
            assert!(matches!(err, Error::Conversion { .. }), "{}: {:?}", raw, err);
        }
    }
}
