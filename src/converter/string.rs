use super::{unexpected_value, Converter, ConverterRegistry};
use crate::error::{Error, Result};
use crate::value::Value;

/// Text-like types passed through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringConverter;

impl Converter for StringConverter {
    fn to_native(
        &self,
        data: Option<&str>,
        _type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Value> {
        Ok(data.map_or(Value::Null, |s| Value::Text(s.to_string())))
    }

    fn to_wire(
        &self,
        value: &Value,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Option<String>> {
        match value {
            Value::Null => Ok(None),
            Value::Text(s) | Value::Numeric(s) => Ok(Some(s.clone())),
            Value::Uuid(u) => Ok(Some(u.hyphenated().to_string())),
            other => Err(unexpected_value(type_name, other)),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidConverter;

impl Converter for UuidConverter {
    fn to_native(
        &self,
        data: Option<&str>,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Value> {
        match data {
            None => Ok(Value::Null),
            Some(s) => uuid::Uuid::parse_str(s.trim())
                .map(Value::Uuid)
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
            Value::Uuid(u) => Ok(Some(u.hyphenated().to_string())),
            other => Err(unexpected_value(type_name, other)),
        }
    }
}
