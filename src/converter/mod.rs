//! Type conversion between native values and the server's text encoding.
//!
//! A [`ConverterRegistry`] maps logical converter names (`"Integer"`,
//! `"Point"`) to [`Converter`] instances, and database type names (`int4`,
//! `point`, `public.book`) to converter names. Resolution is lazy: an unknown
//! type only fails when a value of that type is converted.
//!
//! Array types are detected explicitly from the `[]` suffix and handled by
//! the converter registered under [`ARRAY`], which delegates element
//! conversion back to the registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::value::Value;

mod array;
mod boolean;
mod bytea;
mod geometry;
mod hstore;
mod interval;
mod json;
mod ltree;
mod number;
mod range;
mod row;
mod string;
mod text;
mod timestamp;

pub use array::ArrayConverter;
pub use boolean::BooleanConverter;
pub use bytea::ByteaConverter;
pub use geometry::{CircleConverter, PointConverter, SegmentConverter};
pub use hstore::HStoreConverter;
pub use interval::IntervalConverter;
pub use json::{JsonConverter, JsonMode};
pub use ltree::LTreeConverter;
pub use number::{FloatConverter, IntegerConverter, NumericConverter};
pub use range::{NumberRangeConverter, TimestampRangeConverter};
pub use row::{EntityConverter, RowConverter, EXTRA_FIELDS_KEY};
pub use string::{StringConverter, UuidConverter};
pub use timestamp::TimestampConverter;

/// Name of the converter handling every `[]` type.
pub const ARRAY: &str = "Array";

/// Bidirectional codec between a native [`Value`] and its wire text.
///
/// `None` on the wire side is SQL NULL. `type_name` is the descriptor the
/// conversion was requested for; converters that delegate (arrays, rows) use
/// it together with the registry to find their element converters.
pub trait Converter: Send + Sync {
    fn to_native(
        &self,
        data: Option<&str>,
        type_name: &str,
        registry: &ConverterRegistry,
    ) -> Result<Value>;

    fn to_wire(
        &self,
        value: &Value,
        type_name: &str,
        registry: &ConverterRegistry,
    ) -> Result<Option<String>>;
}

// ============================================================================
// Type descriptors
// ============================================================================

/// `base_type_name ('[]')?`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    base: String,
    array: bool,
}

impl TypeDescriptor {
    pub fn parse(descriptor: &str) -> Self {
        let trimmed = descriptor.trim();
        match trimmed.strip_suffix("[]") {
            Some(base) => Self {
                base: base.trim_end().to_string(),
                array: true,
            },
            None => Self {
                base: trimmed.to_string(),
                array: false,
            },
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn is_array(&self) -> bool {
        self.array
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.array {
            write!(f, "{}[]", self.base)
        } else {
            f.write_str(&self.base)
        }
    }
}

/// Canonical form of a raw database type name: lowercase, without type
/// modifiers, SQL standard spellings folded onto the internal names.
pub fn normalize_type_name(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let without_modifiers = match (lowered.find('('), lowered.rfind(')')) {
        (Some(open), Some(close)) if open < close => {
            format!("{}{}", &lowered[..open], &lowered[close + 1..])
        }
        _ => lowered,
    };
    let name = without_modifiers.trim();
    let canonical = match name {
        "integer" | "int" => "int4",
        "smallint" => "int2",
        "bigint" => "int8",
        "boolean" => "bool",
        "real" => "float4",
        "double precision" => "float8",
        "decimal" => "numeric",
        "character varying" => "varchar",
        "character" => "bpchar",
        "timestamp without time zone" => "timestamp",
        "timestamp with time zone" => "timestamptz",
        "time without time zone" => "time",
        "time with time zone" => "timetz",
        other => other,
    };
    canonical.to_string()
}

// ============================================================================
// Registry
// ============================================================================

struct Entry {
    converter: Arc<dyn Converter>,
    types: Vec<String>,
}

#[derive(Default)]
struct RegistryInner {
    converters: HashMap<String, Entry>,
    /// Normalized type name -> converter name.
    types: HashMap<String, String>,
}

/// Registry of converters, shared by every connection of a database.
///
/// Entries can be added at any time and are never removed. Registering a
/// name again replaces its converter; registering a type name again points
/// it at the newest converter.
#[derive(Default)]
pub struct ConverterRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConverterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in converter.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(ARRAY, ArrayConverter, &[]);
        registry.register("Boolean", BooleanConverter, &["bool"]);
        registry.register("Integer", IntegerConverter, &["int2", "int4", "int8", "oid"]);
        registry.register("Float", FloatConverter, &["float4", "float8"]);
        registry.register("Numeric", NumericConverter, &["numeric"]);
        registry.register(
            "String",
            StringConverter,
            &[
                "varchar", "char", "bpchar", "text", "name", "xml", "tsvector", "time", "timetz",
                "inet", "cidr",
            ],
        );
        registry.register("Uuid", UuidConverter, &["uuid"]);
        registry.register(
            "Timestamp",
            TimestampConverter,
            &["timestamp", "timestamptz", "date"],
        );
        registry.register("Interval", IntervalConverter, &["interval"]);
        registry.register("Binary", ByteaConverter, &["bytea"]);
        registry.register("Point", PointConverter, &["point"]);
        registry.register("Circle", CircleConverter, &["circle"]);
        registry.register("Segment", SegmentConverter, &["lseg"]);
        registry.register("Json", JsonConverter::default(), &["json", "jsonb"]);
        registry.register("HStore", HStoreConverter, &["hstore"]);
        registry.register("LTree", LTreeConverter, &["ltree"]);
        registry.register(
            "NumberRange",
            NumberRangeConverter,
            &["int4range", "int8range", "numrange"],
        );
        registry.register(
            "TimestampRange",
            TimestampRangeConverter,
            &["tsrange", "tstzrange", "daterange"],
        );
        registry
    }

    /// Register `converter` under `name`, handling the given type names.
    pub fn register<C: Converter + 'static>(&self, name: &str, converter: C, types: &[&str]) {
        self.register_arc(name, Arc::new(converter), types);
    }

    pub fn register_arc(&self, name: &str, converter: Arc<dyn Converter>, types: &[&str]) {
        let mut inner = self.inner.write();
        let types: Vec<String> = types.iter().map(|t| normalize_type_name(t)).collect();

        for ty in &types {
            if let Some(previous) = inner.types.insert(ty.clone(), name.to_string()) {
                if previous != name {
                    debug!(type_name = %ty, from = %previous, to = %name, "type re-bound to another converter");
                }
            }
        }

        if inner.converters.contains_key(name) {
            debug!(converter = %name, "replacing registered converter");
        }
        inner
            .converters
            .insert(name.to_string(), Entry { converter, types });
    }

    /// Look a converter up by its logical name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Converter>> {
        self.inner
            .read()
            .converters
            .get(name)
            .map(|e| Arc::clone(&e.converter))
            .ok_or_else(|| Error::ConverterNotFound(name.to_string()))
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.read().converters.contains_key(name)
    }

    /// Type names bound to converter `name`.
    pub fn types_of(&self, name: &str) -> Vec<String> {
        self.inner
            .read()
            .converters
            .get(name)
            .map(|e| e.types.clone())
            .unwrap_or_default()
    }

    /// Find the converter handling a raw database type name.
    pub fn resolve_for_type(&self, raw_type: &str) -> Result<Arc<dyn Converter>> {
        let descriptor = TypeDescriptor::parse(raw_type);
        if descriptor.is_array() {
            return self.get(ARRAY);
        }

        let normalized = normalize_type_name(descriptor.base());
        let inner = self.inner.read();
        let name = inner.types.get(&normalized).or_else(|| {
            // `schema.type` falls back to the unqualified name.
            normalized
                .rsplit_once('.')
                .and_then(|(_, unqualified)| inner.types.get(unqualified))
        });

        name.and_then(|n| inner.converters.get(n))
            .map(|e| Arc::clone(&e.converter))
            .ok_or_else(|| Error::ConverterNotFound(raw_type.to_string()))
    }

    /// Resolve a descriptor that is either a converter name or a type name.
    pub fn resolve(&self, descriptor: &str) -> Result<Arc<dyn Converter>> {
        let descriptor = descriptor.trim();
        if let Ok(converter) = self.get(descriptor) {
            return Ok(converter);
        }
        self.resolve_for_type(descriptor)
    }

    pub fn to_native(&self, descriptor: &str, data: Option<&str>) -> Result<Value> {
        self.resolve(descriptor)?.to_native(data, descriptor, self)
    }

    pub fn to_wire(&self, descriptor: &str, value: &Value) -> Result<Option<String>> {
        self.resolve(descriptor)?.to_wire(value, descriptor, self)
    }

    /// Names of every registered converter, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().converters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("converters", &self.names())
            .finish()
    }
}

/// Error for a value of the wrong native kind handed to `to_wire`.
pub(crate) fn unexpected_value(type_name: &str, value: &Value) -> Error {
    Error::conversion(
        type_name,
        format!("{:?}", value),
        format!("unexpected {} value", value.kind()),
    )
}
