use chrono::NaiveDateTime;

use super::text::{self, RangeParts};
use super::timestamp::{format_naive, parse_timestamp};
use super::{normalize_type_name, unexpected_value, Converter, ConverterRegistry};
use crate::error::{Error, Result};
use crate::value::{Number, Range, Value};

fn format_range<T>(range: &Range<T>, bound: impl Fn(&T) -> String) -> String {
    format!(
        "{}{},{}{}",
        if range.lower_inclusive { '[' } else { '(' },
        range.lower.as_ref().map(&bound).unwrap_or_default(),
        range.upper.as_ref().map(&bound).unwrap_or_default(),
        if range.upper_inclusive { ']' } else { ')' },
    )
}

fn build_range<T>(
    parts: RangeParts,
    mut bound: impl FnMut(&str) -> Result<T>,
) -> Result<Range<T>> {
    Ok(Range::unbounded(
        parts.lower.as_deref().map(&mut bound).transpose()?,
        parts.upper.as_deref().map(&mut bound).transpose()?,
        parts.lower_inclusive,
        parts.upper_inclusive,
    ))
}

/// `int4range`, `int8range`, `numrange`. `empty` reads as NULL.
#[derive(Debug, Default, Clone, Copy)]
pub struct NumberRangeConverter;

impl Converter for NumberRangeConverter {
    fn to_native(
        &self,
        data: Option<&str>,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Value> {
        let Some(s) = data else {
            return Ok(Value::Null);
        };
        let Some(parts) = text::parse_range(s, type_name)? else {
            return Ok(Value::Null);
        };
        build_range(parts, |b| {
            Number::parse(b).ok_or_else(|| Error::conversion(type_name, s, "bound is not a number"))
        })
        .map(Value::NumberRange)
    }

    fn to_wire(
        &self,
        value: &Value,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Option<String>> {
        match value {
            Value::Null => Ok(None),
            Value::NumberRange(r) => Ok(Some(format_range(r, Number::to_string))),
            other => Err(unexpected_value(type_name, other)),
        }
    }
}

/// `tsrange`, `tstzrange`, `daterange`. Offset-aware bounds are normalized
/// to UTC and written back with an explicit `+00`, so the session time zone
/// never shifts them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampRangeConverter;

fn timestamp_bound(s: &str, type_name: &str) -> Result<NaiveDateTime> {
    match parse_timestamp(s, type_name)? {
        Value::Timestamp(ts) => Ok(ts),
        Value::TimestampTz(ts) => Ok(ts.naive_utc()),
        _ => Err(Error::conversion(type_name, s, "bound is not a timestamp")),
    }
}

impl Converter for TimestampRangeConverter {
    fn to_native(
        &self,
        data: Option<&str>,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Value> {
        let Some(s) = data else {
            return Ok(Value::Null);
        };
        let Some(parts) = text::parse_range(s, type_name)? else {
            return Ok(Value::Null);
        };
        build_range(parts, |b| timestamp_bound(b, type_name)).map(Value::TimestampRange)
    }

    fn to_wire(
        &self,
        value: &Value,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Option<String>> {
        match value {
            Value::Null => Ok(None),
            Value::TimestampRange(r) => {
                let offset = if normalize_type_name(type_name).ends_with("tstzrange") {
                    "+00"
                } else {
                    ""
                };
                Ok(Some(format_range(r, |ts| {
                    format!("\"{}{}\"", format_naive(ts), offset)
                })))
            }
            other => Err(unexpected_value(type_name, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn registry() -> ConverterRegistry {
        ConverterRegistry::with_builtins()
    }

    #[test]
    fn test_number_range_round_trip() {
        let r = registry();
        let v = r.to_native("int4range", Some("[-5,45)")).unwrap();
        assert_eq!(
            v,
            Value::NumberRange(Range::new(Number::Int(-5), Number::Int(45), true, false))
        );
        assert_eq!(r.to_wire("int4range", &v).unwrap().as_deref(), Some("[-5,45)"));

        let v = r.to_native("numrange", Some("(1.5,)")).unwrap();
        assert_eq!(
            v,
            Value::NumberRange(Range::unbounded(Some(Number::Float(1.5)), None, false, false))
        );
        assert_eq!(r.to_wire("numrange", &v).unwrap().as_deref(), Some("(1.5,)"));
    }

    #[test]
    fn test_empty_range_is_null() {
        let r = registry();
        assert_eq!(r.to_native("int4range", Some("empty")).unwrap(), Value::Null);
        assert_eq!(r.to_native("tsrange", Some("empty")).unwrap(), Value::Null);
    }

    #[test]
    fn test_timestamp_range() {
        let r = registry();
        let v = r
            .to_native("tsrange", Some(r#"["2024-01-01 10:00:00","2024-01-02 00:00:00")"#))
            .unwrap();
        let lower = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let upper = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(v, Value::TimestampRange(Range::new(lower, upper, true, false)));
        assert_eq!(
            r.to_wire("tsrange", &v).unwrap().as_deref(),
            Some(r#"["2024-01-01 10:00:00.000000","2024-01-02 00:00:00.000000")"#)
        );
    }

    #[test]
    fn test_tz_bounds_are_utc() {
        let r = registry();
        let v = r
            .to_native("tstzrange", Some(r#"["2024-01-01 10:00:00+02",)"#))
            .unwrap();
        let Value::TimestampRange(range) = v else {
            panic!("expected range");
        };
        assert_eq!(
            range.lower,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(8, 0, 0)
        );
        assert_eq!(range.upper, None);

        let wire = r.to_wire("tstzrange", &Value::TimestampRange(range)).unwrap();
        assert_eq!(wire.as_deref(), Some(r#"["2024-01-01 08:00:00.000000+00",)"#));
        let again = r.to_native("tstzrange", wire.as_deref()).unwrap();
        let Value::TimestampRange(again) = again else {
            panic!("expected range");
        };
        assert_eq!(
            again.lower,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(8, 0, 0)
        );
    }

    #[test]
    fn test_numrange_keeps_exact_decimals() {
        let r = registry();
        let raw = "[0.12345678901234567890123,1)";
        let v = r.to_native("numrange", Some(raw)).unwrap();
        assert_eq!(
            v,
            Value::NumberRange(Range::new(
                Number::Decimal("0.12345678901234567890123".to_string()),
                Number::Int(1),
                true,
                false
            ))
        );
        assert_eq!(r.to_wire("numrange", &v).unwrap().as_deref(), Some(raw));
    }

    #[test]
    fn test_invalid_bounds() {
        let r = registry();
        assert!(r.to_native("int4range", Some("[a,b)")).is_err());
        assert!(r.to_native("int4range", Some("1,2")).is_err());
    }
}
