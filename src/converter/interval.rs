use super::{unexpected_value, Converter, ConverterRegistry};
use crate::error::{Error, Result};
use crate::value::{Interval, Value, MICROS_PER_HOUR, MICROS_PER_MINUTE, MICROS_PER_SECOND};

/// `interval`. Reads the `postgres`, `postgres_verbose` and `iso_8601`
/// output styles; writes the `postgres` style.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntervalConverter;

#[derive(Default)]
struct Accumulator {
    months: i64,
    days: i64,
    micros: i64,
}

/// `amount * factor` rounded, or `None` when it does not fit an `i64`.
fn scaled(amount: f64, factor: i64) -> Option<i64> {
    let product = (amount * factor as f64).round();
    // i64::MAX as f64 rounds up to 2^63, which is already out of range.
    (product.is_finite() && product >= i64::MIN as f64 && product < i64::MAX as f64)
        .then_some(product as i64)
}

fn bump(total: &mut i64, amount: i64) -> Option<()> {
    *total = total.checked_add(amount)?;
    Some(())
}

impl Accumulator {
    fn add(&mut self, amount: f64, unit: &str) -> Option<()> {
        match unit {
            "y" | "yr" | "yrs" | "year" | "years" => bump(&mut self.months, scaled(amount, 12)?),
            "mon" | "mons" | "month" | "months" => bump(&mut self.months, scaled(amount.trunc(), 1)?),
            "w" | "week" | "weeks" => bump(&mut self.days, scaled(amount.trunc(), 7)?),
            "d" | "day" | "days" => bump(&mut self.days, scaled(amount.trunc(), 1)?),
            "h" | "hr" | "hrs" | "hour" | "hours" => {
                bump(&mut self.micros, scaled(amount, MICROS_PER_HOUR)?)
            }
            "m" | "min" | "mins" | "minute" | "minutes" => {
                bump(&mut self.micros, scaled(amount, MICROS_PER_MINUTE)?)
            }
            "s" | "sec" | "secs" | "second" | "seconds" => {
                bump(&mut self.micros, scaled(amount, MICROS_PER_SECOND)?)
            }
            _ => None,
        }
    }

    fn finish(self, negate: bool) -> Option<Interval> {
        let sign = if negate { -1 } else { 1 };
        Some(Interval::new(
            i32::try_from(self.months.checked_mul(sign)?).ok()?,
            i32::try_from(self.days.checked_mul(sign)?).ok()?,
            self.micros.checked_mul(sign)?,
        ))
    }
}

/// `[-]HH:MM[:SS[.ffffff]]`
fn parse_clock(s: &str) -> Option<i64> {
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let mut parts = body.split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: f64 = match parts.next() {
        Some(sec) => sec.parse().ok()?,
        None => 0.0,
    };
    if parts.next().is_some() {
        return None;
    }
    let micros = hours
        .checked_mul(MICROS_PER_HOUR)?
        .checked_add(minutes.checked_mul(MICROS_PER_MINUTE)?)?
        .checked_add(scaled(seconds, MICROS_PER_SECOND)?)?;
    if negative {
        micros.checked_neg()
    } else {
        Some(micros)
    }
}

fn parse_verbose(s: &str) -> Option<Interval> {
    let mut acc = Accumulator::default();
    let mut negate = false;
    let mut tokens = s.split_whitespace().peekable();

    while let Some(token) = tokens.next() {
        if token == "@" {
            continue;
        }
        if token == "ago" {
            negate = true;
            continue;
        }
        if token.contains(':') {
            bump(&mut acc.micros, parse_clock(token)?)?;
            continue;
        }

        // `3 days` or the compact `3days`.
        let split = token
            .char_indices()
            .find(|(i, c)| c.is_ascii_alphabetic() && *i > 0)
            .map(|(i, _)| i);
        let (number, unit) = match split {
            Some(i) => (&token[..i], token[i..].to_string()),
            None => (token, tokens.next()?.to_ascii_lowercase()),
        };
        let amount: f64 = number.parse().ok()?;
        acc.add(amount, &unit)?;
    }
    acc.finish(negate)
}

fn parse_iso8601(s: &str) -> Option<Interval> {
    let (negate, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let body = body.strip_prefix('P')?;
    let mut acc = Accumulator::default();
    let mut in_time = false;
    let mut number = String::new();

    for c in body.chars() {
        match c {
            'T' => in_time = true,
            '0'..='9' | '.' | '-' | '+' => number.push(c),
            designator => {
                let amount: f64 = number.parse().ok()?;
                number.clear();
                let unit = match (designator, in_time) {
                    ('Y', false) => "year",
                    ('M', false) => "month",
                    ('W', false) => "week",
                    ('D', false) => "day",
                    ('H', true) => "hour",
                    ('M', true) => "minute",
                    ('S', true) => "second",
                    _ => return None,
                };
                acc.add(amount, unit)?;
            }
        }
    }
    if !number.is_empty() {
        return None;
    }
    acc.finish(negate)
}

pub(crate) fn parse_interval(s: &str) -> Option<Interval> {
    let s = s.trim();
    if s.starts_with('P') || s.starts_with("-P") {
        parse_iso8601(s)
    } else {
        parse_verbose(s)
    }
}

impl Converter for IntervalConverter {
    fn to_native(
        &self,
        data: Option<&str>,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Value> {
        match data {
            None => Ok(Value::Null),
            Some(s) => parse_interval(s)
                .map(Value::Interval)
                .ok_or_else(|| Error::conversion(type_name, s, "not an interval")),
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
            Value::Interval(i) => Ok(Some(i.to_string())),
            other => Err(unexpected_value(type_name, other)),
        }
    }
}
