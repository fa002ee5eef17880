//! Converted query results.

use std::collections::BTreeMap;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::converter::{Converter, ConverterRegistry};
use crate::driver::{RawColumn, RawResult, SharedColumns};
use crate::error::{ContractViolation, Result};
use crate::value::Value;

/// Most rows are narrow; keep their values inline.
type RowValues = SmallVec<[Value; 8]>;

/// One result row, values already converted to native form.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: SharedColumns,
    values: RowValues,
}

impl Row {
    pub fn new(columns: SharedColumns, values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            columns,
            values: values.into_iter().collect(),
        }
    }

    /// Value of the first column named `name`.
    pub fn get(&self, name: &str) -> Result<&Value> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .and_then(|i| self.values.get(i))
            .ok_or_else(|| {
                ContractViolation::UnknownField {
                    kind: "row".to_string(),
                    field: name.to_string(),
                }
                .into()
            })
    }

    #[inline]
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn columns(&self) -> &[RawColumn] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(|c| c.name.as_str())
            .zip(self.values.iter())
    }

    /// Column name to value. A repeated column name keeps its last value.
    pub fn into_fields(self) -> BTreeMap<String, Value> {
        self.columns
            .iter()
            .map(|c| c.name.clone())
            .zip(self.values)
            .collect()
    }
}

/// Rows of one statement plus its command tag.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    columns: SharedColumns,
    rows: Vec<Row>,
    command_tag: String,
}

impl ResultSet {
    /// Convert every cell of `raw` with the converter registered for its
    /// column type.
    ///
    /// Converters are only resolved when there is at least one row, so an
    /// empty result never fails on an unknown column type.
    pub fn from_raw(raw: RawResult, registry: &ConverterRegistry) -> Result<Self> {
        let RawResult {
            columns,
            rows: raw_rows,
            command_tag,
        } = raw;

        let converters: Vec<Arc<dyn Converter>> = if raw_rows.is_empty() {
            Vec::new()
        } else {
            columns
                .iter()
                .map(|c| registry.resolve_for_type(&c.type_name))
                .collect::<Result<_>>()?
        };

        let mut rows = Vec::with_capacity(raw_rows.len());
        for raw_row in raw_rows {
            let values = raw_row
                .iter()
                .zip(columns.iter().zip(&converters))
                .map(|(cell, (column, converter))| {
                    converter.to_native(cell.as_deref(), &column.type_name, registry)
                })
                .collect::<Result<RowValues>>()?;
            rows.push(Row {
                columns: Arc::clone(&columns),
                values,
            });
        }

        Ok(Self {
            columns,
            rows,
            command_tag,
        })
    }

    pub fn columns(&self) -> &[RawColumn] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn command_tag(&self) -> &str {
        &self.command_tag
    }

    pub fn rows_affected(&self) -> u64 {
        self.command_tag
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

impl IntoIterator for ResultSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::rows;
    use crate::Error;

    #[test]
    fn test_cells_are_converted_by_column_type() {
        let raw = rows(
            &[("id", "int4"), ("tags", "text[]"), ("done", "bool")],
            vec![
                vec![Some("1"), Some("{a,\"b c\"}"), Some("t")],
                vec![Some("2"), None, Some("f")],
            ],
        );
        let result = ResultSet::from_raw(raw, &ConverterRegistry::with_builtins()).unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result.rows_affected(), 2);
        let first = result.first().unwrap();
        assert_eq!(first.get("id").unwrap(), &Value::Int(1));
        assert_eq!(
            first.get("tags").unwrap(),
            &Value::Array(vec![Value::from("a"), Value::from("b c")])
        );
        assert_eq!(result.rows()[1].get_index(1), Some(&Value::Null));
        assert_eq!(result.rows()[1].get("done").unwrap(), &Value::Bool(false));
    }

    #[test]
    fn test_unknown_column_name() {
        let raw = rows(&[("id", "int4")], vec![vec![Some("1")]]);
        let result = ResultSet::from_raw(raw, &ConverterRegistry::with_builtins()).unwrap();
        let err = result.first().unwrap().get("title").unwrap_err();
        assert!(matches!(err, Error::Contract(ContractViolation::UnknownField { .. })));
    }

    #[test]
    fn test_unknown_type_fails_only_with_rows() {
        let registry = ConverterRegistry::with_builtins();
        let empty = rows(&[("mood", "public.mood")], vec![]);
        assert!(ResultSet::from_raw(empty, &registry).unwrap().is_empty());

        let one = rows(&[("mood", "public.mood")], vec![vec![Some("happy")]]);
        let err = ResultSet::from_raw(one, &registry).unwrap_err();
        assert!(matches!(err, Error::ConverterNotFound(_)));
    }

    #[test]
    fn test_into_fields() {
        let raw = rows(&[("id", "int8"), ("title", "text")], vec![vec![Some("7"), Some("t")]]);
        let row = ResultSet::from_raw(raw, &ConverterRegistry::with_builtins())
            .unwrap()
            .into_rows()
            .remove(0);
        let fields = row.into_fields();
        assert_eq!(fields["id"], Value::Int(7));
        assert_eq!(fields["title"], Value::from("t"));
    }
}
