use super::text::{self, ArrayItem};
use super::{unexpected_value, Converter, ConverterRegistry, TypeDescriptor};
use crate::error::{Error, Result};
use crate::value::Value;

/// `elem[]` in both directions. Elements go through the converter resolved
/// for the element descriptor, so `int4[]`, `Integer[]` and
/// `public.book[]` all work.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrayConverter;

impl ArrayConverter {
    fn element_type(type_name: &str) -> Result<String> {
        let descriptor = TypeDescriptor::parse(type_name);
        if !descriptor.is_array() {
            return Err(Error::conversion(
                type_name,
                "",
                "array converter needs an element type ('elem[]')",
            ));
        }
        Ok(descriptor.base().to_string())
    }

    fn items_to_native(
        items: Vec<ArrayItem>,
        element_type: &str,
        registry: &ConverterRegistry,
    ) -> Result<Vec<Value>> {
        let converter = registry.resolve(element_type)?;
        items
            .into_iter()
            .map(|item| match item {
                ArrayItem::Null => Ok(Value::Null),
                ArrayItem::Text(s) => converter.to_native(Some(&s), element_type, registry),
                ArrayItem::Nested(inner) => {
                    Self::items_to_native(inner, element_type, registry).map(Value::Array)
                }
            })
            .collect()
    }

    fn items_to_wire(
        items: &[Value],
        element_type: &str,
        registry: &ConverterRegistry,
    ) -> Result<String> {
        let converter = registry.resolve(element_type)?;
        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            let part = match item {
                Value::Null => "NULL".to_string(),
                Value::Array(nested) => Self::items_to_wire(nested, element_type, registry)?,
                other => match converter.to_wire(other, element_type, registry)? {
                    Some(s) => text::quote_array_element(&s),
                    None => "NULL".to_string(),
                },
            };
            parts.push(part);
        }
        Ok(format!("{{{}}}", parts.join(",")))
    }
}

impl Converter for ArrayConverter {
    fn to_native(
        &self,
        data: Option<&str>,
        type_name: &str,
        registry: &ConverterRegistry,
    ) -> Result<Value> {
        let Some(data) = data else {
            return Ok(Value::Null);
        };
        if data.trim() == "{NULL}" {
            return Ok(Value::Null);
        }

        let element_type = Self::element_type(type_name)?;
        let items = text::parse_array(data, type_name)?;
        Self::items_to_native(items, &element_type, registry).map(Value::Array)
    }

    fn to_wire(
        &self,
        value: &Value,
        type_name: &str,
        registry: &ConverterRegistry,
    ) -> Result<Option<String>> {
        match value {
            Value::Null => Ok(None),
            Value::Array(items) => {
                let element_type = Self::element_type(type_name)?;
                Self::items_to_wire(items, &element_type, registry).map(Some)
            }
            other => Err(unexpected_value(type_name, other)),
        }
    }
}
