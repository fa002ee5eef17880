use std::collections::BTreeMap;

use super::text::{self, quote_row_field};
use super::{unexpected_value, Converter, ConverterRegistry};
use crate::entity::{Entity, Status};
use crate::error::Result;
use crate::value::Value;

/// Key holding composite fields beyond the declared structure.
pub const EXTRA_FIELDS_KEY: &str = "_extra";

/// Composite types, decoded field by field through the registry.
#[derive(Debug, Clone)]
pub struct RowConverter {
    /// `(field name, type descriptor)` in column order.
    fields: Vec<(String, String)>,
}

impl RowConverter {
    pub fn new<N, T, I>(fields: I) -> Self
    where
        N: Into<String>,
        T: Into<String>,
        I: IntoIterator<Item = (N, T)>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|(n, t)| (n.into(), t.into()))
                .collect(),
        }
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    fn decode(
        &self,
        data: &str,
        type_name: &str,
        registry: &ConverterRegistry,
    ) -> Result<BTreeMap<String, Value>> {
        let raw = text::parse_row(data, type_name)?;
        let mut raw = raw.into_iter();
        let mut out = BTreeMap::new();

        for (name, descriptor) in &self.fields {
            let field = raw.next().flatten();
            let value = registry.to_native(descriptor, field.as_deref())?;
            out.insert(name.clone(), value);
        }

        let extra: Vec<Value> = raw
            .map(|f| f.map_or(Value::Null, Value::Text))
            .collect();
        if !extra.is_empty() {
            out.insert(EXTRA_FIELDS_KEY.to_string(), Value::Array(extra));
        }
        Ok(out)
    }

    fn encode(
        &self,
        fields: &BTreeMap<String, Value>,
        registry: &ConverterRegistry,
    ) -> Result<String> {
        let mut parts = Vec::with_capacity(self.fields.len());
        for (name, descriptor) in &self.fields {
            let value = fields.get(name).unwrap_or(&Value::Null);
            let part = match registry.to_wire(descriptor, value)? {
                Some(s) => quote_row_field(&s),
                None => String::new(),
            };
            parts.push(part);
        }
        Ok(format!("({})", parts.join(",")))
    }
}

impl Converter for RowConverter {
    fn to_native(
        &self,
        data: Option<&str>,
        type_name: &str,
        registry: &ConverterRegistry,
    ) -> Result<Value> {
        match data {
            None => Ok(Value::Null),
            Some(s) => self.decode(s, type_name, registry).map(Value::Row),
        }
    }

    fn to_wire(
        &self,
        value: &Value,
        type_name: &str,
        registry: &ConverterRegistry,
    ) -> Result<Option<String>> {
        match value {
            Value::Null => Ok(None),
            Value::Row(fields) => self.encode(fields, registry).map(Some),
            Value::Entity(entity) => self.encode(entity.fields(), registry).map(Some),
            other => Err(unexpected_value(type_name, other)),
        }
    }
}

/// Composite types that map to entities of one kind.
///
/// Decoded entities carry the `EXIST` status: they came from the database.
#[derive(Debug, Clone)]
pub struct EntityConverter {
    kind: String,
    row: RowConverter,
}

impl EntityConverter {
    pub fn new(kind: impl Into<String>, row: RowConverter) -> Self {
        Self {
            kind: kind.into(),
            row,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl Converter for EntityConverter {
    fn to_native(
        &self,
        data: Option<&str>,
        type_name: &str,
        registry: &ConverterRegistry,
    ) -> Result<Value> {
        let Some(s) = data else {
            return Ok(Value::Null);
        };
        let fields = self.row.decode(s, type_name, registry)?;
        let mut entity = Entity::with_fields(self.kind.clone(), fields);
        entity.set_status(Status::EXIST);
        Ok(Value::Entity(Box::new(entity)))
    }

    fn to_wire(
        &self,
        value: &Value,
        type_name: &str,
        registry: &ConverterRegistry,
    ) -> Result<Option<String>> {
        self.row.to_wire(value, type_name, registry)
    }
}
