use std::collections::BTreeMap;

use super::text::{quote_with_backslashes, Scanner};
use super::{unexpected_value, Converter, ConverterRegistry};
use crate::error::Result;
use crate::value::Value;

/// `hstore`: `"k"=>"v", "k2"=>NULL`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HStoreConverter;

fn parse_hstore(s: &str, type_name: &str) -> Result<BTreeMap<String, Option<String>>> {
    let mut scanner = Scanner::new(s, type_name);
    let mut map = BTreeMap::new();

    scanner.skip_whitespace();
    while !scanner.is_done() {
        let key = if scanner.peek() == Some('"') {
            scanner.quoted()?
        } else {
            scanner.unquoted(&['=', ' '])?
        };
        scanner.skip_whitespace();
        if !scanner.eat("=>") {
            return Err(scanner.error("expected '=>'"));
        }
        scanner.skip_whitespace();

        let value = if scanner.peek() == Some('"') {
            Some(scanner.quoted()?)
        } else {
            let raw = scanner.unquoted(&[',', ' '])?;
            if raw.eq_ignore_ascii_case("NULL") {
                None
            } else {
                Some(raw)
            }
        };
        map.insert(key, value);

        scanner.skip_whitespace();
        match scanner.bump() {
            Some(',') => scanner.skip_whitespace(),
            None => break,
            Some(c) => return Err(scanner.error(format!("unexpected '{}' in hstore", c))),
        }
    }
    Ok(map)
}

fn format_hstore(map: &BTreeMap<String, Option<String>>) -> String {
    map.iter()
        .map(|(k, v)| match v {
            Some(v) => format!("{}=>{}", quote_with_backslashes(k), quote_with_backslashes(v)),
            None => format!("{}=>NULL", quote_with_backslashes(k)),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

impl Converter for HStoreConverter {
    fn to_native(
        &self,
        data: Option<&str>,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Value> {
        match data {
            None => Ok(Value::Null),
            Some(s) => parse_hstore(s, type_name).map(Value::HStore),
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
            Value::HStore(map) => Ok(Some(format_hstore(map))),
            other => Err(unexpected_value(type_name, other)),
        }
    }
}
