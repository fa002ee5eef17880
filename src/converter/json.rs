use super::{unexpected_value, Converter, ConverterRegistry};
use crate::error::{Error, Result};
use crate::value::Value;

/// How JSON documents are surfaced to callers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum JsonMode {
    /// Decoded into [`Value::Json`].
    #[default]
    Structured,
    /// Validated, then kept as [`Value::Text`].
    Raw,
}

/// `json`, `jsonb`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonConverter {
    mode: JsonMode,
}

impl JsonConverter {
    pub fn new(mode: JsonMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> JsonMode {
        self.mode
    }
}

impl Converter for JsonConverter {
    fn to_native(
        &self,
        data: Option<&str>,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Value> {
        let Some(s) = data else {
            return Ok(Value::Null);
        };
        let parsed: serde_json::Value =
            serde_json::from_str(s).map_err(|e| Error::conversion(type_name, s, e.to_string()))?;
        Ok(match self.mode {
            JsonMode::Structured => Value::Json(parsed),
            JsonMode::Raw => Value::Text(s.to_string()),
        })
    }

    fn to_wire(
        &self,
        value: &Value,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Option<String>> {
        match value {
            Value::Null => Ok(None),
            Value::Json(doc) => serde_json::to_string(doc)
                .map(Some)
                .map_err(|e| Error::conversion(type_name, doc.to_string(), e.to_string())),
            Value::Text(s) => {
                serde_json::from_str::<serde_json::Value>(s)
                    .map_err(|e| Error::conversion(type_name, s.as_str(), e.to_string()))?;
                Ok(Some(s.clone()))
            }
            other => Err(unexpected_value(type_name, other)),
        }
    }
}
