//! PostgreSQL type identifiers and their canonical names.
//!
//! Result columns only carry type OIDs. Built-in OIDs are named from a
//! static table; everything else (extension and composite types) is looked
//! up in `pg_type` by the driver and cached per connection.

use std::collections::HashMap;

use once_cell::sync::Lazy;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    /// Let the server infer the parameter type.
    pub const UNSPECIFIED: Oid = Oid(0);

    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID_TYPE: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const NUMERIC: Oid = Oid(1700);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);

    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Canonical name for built-in types (`int4`, `int4[]`).
    pub fn builtin_name(self) -> Option<&'static str> {
        BUILTIN_BY_OID.get(&self.0).copied()
    }

    /// OID of a built-in type name, used as a parameter type hint.
    pub fn for_type_name(name: &str) -> Option<Oid> {
        BUILTIN_BY_NAME.get(name).map(|oid| Oid(*oid))
    }
}

/// `(oid, name)` for every built-in type the converters know about.
const BUILTIN_TYPES: &[(i32, &str)] = &[
    (16, "bool"),
    (17, "bytea"),
    (18, "char"),
    (19, "name"),
    (20, "int8"),
    (21, "int2"),
    (23, "int4"),
    (25, "text"),
    (26, "oid"),
    (114, "json"),
    (142, "xml"),
    (600, "point"),
    (601, "lseg"),
    (650, "cidr"),
    (700, "float4"),
    (701, "float8"),
    (718, "circle"),
    (869, "inet"),
    (1042, "bpchar"),
    (1043, "varchar"),
    (1082, "date"),
    (1083, "time"),
    (1114, "timestamp"),
    (1184, "timestamptz"),
    (1186, "interval"),
    (1266, "timetz"),
    (1700, "numeric"),
    (2950, "uuid"),
    (3614, "tsvector"),
    (3802, "jsonb"),
    (3904, "int4range"),
    (3906, "numrange"),
    (3908, "tsrange"),
    (3910, "tstzrange"),
    (3912, "daterange"),
    (3926, "int8range"),
    // Arrays
    (143, "xml[]"),
    (199, "json[]"),
    (651, "cidr[]"),
    (719, "circle[]"),
    (1000, "bool[]"),
    (1001, "bytea[]"),
    (1002, "char[]"),
    (1003, "name[]"),
    (1005, "int2[]"),
    (1007, "int4[]"),
    (1009, "text[]"),
    (1014, "bpchar[]"),
    (1015, "varchar[]"),
    (1016, "int8[]"),
    (1017, "point[]"),
    (1018, "lseg[]"),
    (1021, "float4[]"),
    (1022, "float8[]"),
    (1028, "oid[]"),
    (1041, "inet[]"),
    (1115, "timestamp[]"),
    (1182, "date[]"),
    (1183, "time[]"),
    (1185, "timestamptz[]"),
    (1187, "interval[]"),
    (1231, "numeric[]"),
    (1270, "timetz[]"),
    (2951, "uuid[]"),
    (3643, "tsvector[]"),
    (3807, "jsonb[]"),
    (3905, "int4range[]"),
    (3907, "numrange[]"),
    (3909, "tsrange[]"),
    (3911, "tstzrange[]"),
    (3913, "daterange[]"),
    (3927, "int8range[]"),
];

static BUILTIN_BY_OID: Lazy<HashMap<i32, &'static str>> =
    Lazy::new(|| BUILTIN_TYPES.iter().copied().collect());

static BUILTIN_BY_NAME: Lazy<HashMap<&'static str, i32>> =
    Lazy::new(|| BUILTIN_TYPES.iter().map(|(oid, name)| (*name, *oid)).collect());

/// Query naming non built-in types. `{}` is replaced by a comma separated
/// OID list. Columns: oid, schema, name, element schema, element name.
pub const TYPE_LOOKUP_SQL: &str = "SELECT t.oid::text, n.nspname, t.typname, \
     en.nspname, e.typname \
     FROM pg_catalog.pg_type t \
     JOIN pg_catalog.pg_namespace n ON n.oid = t.typnamespace \
     LEFT JOIN pg_catalog.pg_type e ON e.oid = t.typelem AND t.typcategory = 'A' \
     LEFT JOIN pg_catalog.pg_namespace en ON en.oid = e.typnamespace \
     WHERE t.oid IN ({})";

/// Canonical name of a type found in `pg_type`: catalog types unqualified,
/// everything else `schema.name`, arrays suffixed with `[]`.
pub fn qualified_type_name(
    schema: &str,
    name: &str,
    element_schema: Option<&str>,
    element_name: Option<&str>,
) -> String {
    let qualify = |schema: &str, name: &str| {
        if schema == "pg_catalog" {
            name.to_string()
        } else {
            format!("{}.{}", schema, name)
        }
    };
    match (element_schema, element_name) {
        (Some(es), Some(en)) => format!("{}[]", qualify(es, en)),
        _ => qualify(schema, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names() {
        assert_eq!(Oid::INT4.builtin_name(), Some("int4"));
        assert_eq!(Oid::INT4_ARRAY.builtin_name(), Some("int4[]"));
        assert_eq!(Oid(999_999).builtin_name(), None);
        assert_eq!(Oid::for_type_name("timestamptz"), Some(Oid::TIMESTAMPTZ));
        assert_eq!(Oid::for_type_name("public.book"), None);
    }

    #[test]
    fn test_qualified_type_name() {
        assert_eq!(qualified_type_name("public", "hstore", None, None), "public.hstore");
        assert_eq!(qualified_type_name("pg_catalog", "int4", None, None), "int4");
        assert_eq!(
            qualified_type_name("public", "_book", Some("public"), Some("book")),
            "public.book[]"
        );
    }
}
