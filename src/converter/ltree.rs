use super::{unexpected_value, Converter, ConverterRegistry};
use crate::error::{Error, Result};
use crate::value::Value;

/// `ltree`: dot separated label paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct LTreeConverter;

fn valid_label(label: &str) -> bool {
    !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

impl Converter for LTreeConverter {
    fn to_native(
        &self,
        data: Option<&str>,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Value> {
        let Some(s) = data else {
            return Ok(Value::Null);
        };
        if s.is_empty() {
            return Ok(Value::LTree(Vec::new()));
        }
        let labels: Vec<String> = s.split('.').map(str::to_string).collect();
        if let Some(bad) = labels.iter().find(|l| !valid_label(l)) {
            return Err(Error::conversion(
                type_name,
                s,
                format!("invalid label '{}'", bad),
            ));
        }
        Ok(Value::LTree(labels))
    }

    fn to_wire(
        &self,
        value: &Value,
        type_name: &str,
        _registry: &ConverterRegistry,
    ) -> Result<Option<String>> {
        match value {
            Value::Null => Ok(None),
            Value::LTree(labels) if labels.iter().all(|l| valid_label(l)) => {
                Ok(Some(labels.join(".")))
            }
            other => Err(unexpected_value(type_name, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ltree() {
        let r = ConverterRegistry::with_builtins();
        let v = r.to_native("ltree", Some("Top.Science.Astronomy")).unwrap();
        assert_eq!(
            v,
            Value::LTree(vec![
                "Top".to_string(),
                "Science".to_string(),
                "Astronomy".to_string()
            ])
        );
        assert_eq!(
            r.to_wire("ltree", &v).unwrap().as_deref(),
            Some("Top.Science.Astronomy")
        );
        assert_eq!(r.to_native("ltree", Some("")).unwrap(), Value::LTree(vec![]));
        assert!(r.to_native("ltree", Some("a..b")).is_err());
    }
}
