use super::{unexpected_value, Converter, ConverterRegistry};
use crate::error::{Error, Result};
use crate::value::Value;

/// `int2`, `int4`, `int8`, `oid`.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntegerConverter;

impl Converter for IntegerConverter {
    fn to_native(
        &self,
        data: Option<&str>,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Value> {
        match data {
            None => Ok(Value::Null),
            Some(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|e| Error::conversion(type_name, s, e.to_string())),
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
            Value::Int(i) => Ok(Some(i.to_string())),
            other => Err(unexpected_value(type_name, other)),
        }
    }
}

/// `float4`, `float8`. Non-finite values use the server spellings.
#[derive(Debug, Default, Clone, Copy)]
pub struct FloatConverter;

impl Converter for FloatConverter {
    fn to_native(
        &self,
        data: Option<&str>,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Value> {
        let Some(s) = data else {
            return Ok(Value::Null);
        };
        let parsed = match s.trim() {
            "NaN" => f64::NAN,
            "Infinity" => f64::INFINITY,
            "-Infinity" => f64::NEG_INFINITY,
            other => other
                .parse::<f64>()
                .map_err(|e| Error::conversion(type_name, s, e.to_string()))?,
        };
        Ok(Value::Float(parsed))
    }

    fn to_wire(
        &self,
        value: &Value,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Option<String>> {
        let f = match value {
            Value::Null => return Ok(None),
            Value::Float(f) => *f,
            Value::Int(i) => *i as f64,
            other => return Err(unexpected_value(type_name, other)),
        };
        let text = if f.is_nan() {
            "NaN".to_string()
        } else if f.is_infinite() {
            if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
        } else {
            f.to_string()
        };
        Ok(Some(text))
    }
}

/// `numeric`, kept as text so no precision is lost.
#[derive(Debug, Default, Clone, Copy)]
pub struct NumericConverter;

fn is_numeric_literal(s: &str) -> bool {
    if s == "NaN" {
        return true;
    }
    let body = s.strip_prefix(['-', '+']).unwrap_or(s);
    let (mantissa, exponent) = match body.find(['e', 'E']) {
        Some(i) => (&body[..i], Some(&body[i + 1..])),
        None => (body, None),
    };
    let mut dots = 0;
    let mut digits = 0;
    for c in mantissa.chars() {
        match c {
            '0'..='9' => digits += 1,
            '.' => dots += 1,
            _ => return false,
        }
    }
    let exponent_ok = exponent.map_or(true, |e| {
        let e = e.strip_prefix(['-', '+']).unwrap_or(e);
        !e.is_empty() && e.chars().all(|c| c.is_ascii_digit())
    });
    digits > 0 && dots <= 1 && exponent_ok
}

impl Converter for NumericConverter {
    fn to_native(
        &self,
        data: Option<&str>,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Value> {
        let Some(s) = data else {
            return Ok(Value::Null);
        };
        let s = s.trim();
        if !is_numeric_literal(s) {
            return Err(Error::conversion(type_name, s, "not a numeric literal"));
        }
        Ok(Value::Numeric(s.to_string()))
    }

    fn to_wire(
        &self,
        value: &Value,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Option<String>> {
        match value {
            Value::Null => Ok(None),
            Value::Numeric(s) if is_numeric_literal(s) => Ok(Some(s.clone())),
            Value::Int(i) => Ok(Some(i.to_string())),
            Value::Float(f) if f.is_finite() => Ok(Some(f.to_string())),
            other => Err(unexpected_value(type_name, other)),
        }
    }
}
