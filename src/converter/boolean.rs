use super::{unexpected_value, Converter, ConverterRegistry};
use crate::error::{Error, Result};
use crate::value::Value;

/// `bool`: `t`/`f` on the wire. An empty string reads as NULL.
#[derive(Debug, Default, Clone, Copy)]
pub struct BooleanConverter;

impl Converter for BooleanConverter {
    fn to_native(
        &self,
        data: Option<&str>,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Value> {
        let Some(data) = data else {
            return Ok(Value::Null);
        };
        match data.trim().to_ascii_lowercase().as_str() {
            "" => Ok(Value::Null),
            "t" | "true" | "y" | "yes" | "on" | "1" => Ok(Value::Bool(true)),
            "f" | "false" | "n" | "no" | "off" | "0" => Ok(Value::Bool(false)),
            _ => Err(Error::conversion(type_name, data, "not a boolean")),
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
            Value::Bool(b) => Ok(Some(if *b { "t" } else { "f" }.to_string())),
            other => Err(unexpected_value(type_name, other)),
        }
    }
}
