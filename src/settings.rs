//! Per-addon configuration (`config.json`).
//!
//! The file holds an ordered list of field descriptors. Each descriptor has a
//! name, a type and a current value, plus whatever presentation keys the
//! addon author added (title, tip, options, rule...), which are preserved.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

use crate::error::{AddonError, AddonResult};
use crate::fsutil::is_really_writable;

/// Config schema file name inside an addon directory.
pub const CONFIG_FILE: &str = "config.json";

/// Field name to value.
pub type ConfigValues = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_kind() -> String {
    "string".to_string()
}

impl ConfigField {
    pub fn new(name: &str, kind: &str, value: Value) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            value,
            extra: Map::new(),
        }
    }
}

/// Load the full field list. An addon without `config.json` has an empty schema.
pub fn get_fullconfig(addon_dir: &Path) -> AddonResult<Vec<ConfigField>> {
    let path = addon_dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(&path)
        .map_err(|e| AddonError::Operation(format!("Failed to read {:?}: {}", path, e)))?;
    serde_json::from_str(&content)
        .map_err(|e| AddonError::Operation(format!("Malformed config file {:?}: {}", path, e)))
}

/// Overwrite `config.json` with the given field list.
pub fn set_fullconfig(addon_dir: &Path, fields: &[ConfigField]) -> AddonResult<()> {
    let path = addon_dir.join(CONFIG_FILE);
    if !is_really_writable(&path) {
        return Err(AddonError::Operation(format!("No write permission: {:?}", path)));
    }
    let content = serde_json::to_string_pretty(fields)
        .map_err(|e| AddonError::Operation(format!("Failed to encode config: {}", e)))?;
    fs::write(&path, content + "\n")
        .map_err(|e| AddonError::Operation(format!("No write permission: {:?}: {}", path, e)))
}

/// Current values keyed by field name. Empty when the addon has no schema.
pub fn get_config(addon_dir: &Path) -> AddonResult<ConfigValues> {
    Ok(values_of(&get_fullconfig(addon_dir)?))
}

/// Apply `values` to the schema and persist it.
///
/// Only fields present in the schema are updated; unknown keys are ignored.
pub fn set_config(addon_dir: &Path, values: &ConfigValues) -> AddonResult<()> {
    let mut fields = get_fullconfig(addon_dir)?;
    apply_values(&mut fields, values);
    set_fullconfig(addon_dir, &fields)
}

pub fn values_of(fields: &[ConfigField]) -> ConfigValues {
    fields
        .iter()
        .map(|field| (field.name.clone(), field.value.clone()))
        .collect()
}

/// Copy matching values into the field list. A list value given for a
/// non-`array` field is stored joined with commas.
pub fn apply_values(fields: &mut [ConfigField], values: &ConfigValues) {
    for field in fields.iter_mut() {
        let Some(value) = values.get(&field.name) else {
            continue;
        };
        field.value = match value {
            Value::Array(items) if field.kind != "array" => Value::String(
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            other => other.clone(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn schema_dir() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"[
  {"name": "title", "title": "Site title", "type": "string", "value": "Demo"},
  {"name": "tags", "type": "checkbox", "value": "a", "content": {"a": "A", "b": "B"}},
  {"name": "hosts", "type": "array", "value": {"x": "1"}}
]"#,
        )
        .unwrap();
        tmp
    }

    #[test]
    fn test_set_then_get_round_trip() {
        let tmp = schema_dir();
        let mut values = ConfigValues::new();
        values.insert("title".into(), json!("Renamed"));
        values.insert("hosts".into(), json!({"y": "2"}));

        set_config(tmp.path(), &values).unwrap();
        let stored = get_config(tmp.path()).unwrap();

        assert_eq!(stored["title"], json!("Renamed"));
        assert_eq!(stored["hosts"], json!({"y": "2"}));
        assert_eq!(stored["tags"], json!("a"));
    }

    #[test]
    fn test_list_value_joined_for_scalar_field() {
        let tmp = schema_dir();
        let mut values = ConfigValues::new();
        values.insert("tags".into(), json!(["a", "b"]));
        values.insert("unknown".into(), json!(1));

        set_config(tmp.path(), &values).unwrap();
        let fields = get_fullconfig(tmp.path()).unwrap();

        assert_eq!(fields.len(), 3);
        assert_eq!(fields[1].value, json!("a,b"));
        // Presentation keys survive the rewrite.
        assert_eq!(fields[1].extra["content"], json!({"a": "A", "b": "B"}));
        assert_eq!(fields[0].extra["title"], json!("Site title"));
    }

    #[test]
    fn test_missing_schema_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(get_fullconfig(tmp.path()).unwrap().is_empty());
        assert!(get_config(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_set_without_schema_file_fails() {
        let tmp = TempDir::new().unwrap();
        let err = set_fullconfig(tmp.path(), &[ConfigField::new("a", "string", json!(1))])
            .unwrap_err();
        assert!(err.to_string().starts_with("No write permission"));
    }
}
