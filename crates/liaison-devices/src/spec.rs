/*!
 * Declarative device specs.
 *
 * A spec is a list of maps, one per device. Each map carries `type`, an
 * optional `name` and the factory parameters. Specs can be written as JSON
 * or YAML.
 */
use std::fs;
use std::path::Path;

use yaml_rust::{Yaml, YamlLoader};

use liaison_core::types::{Metadata, Value};

use crate::device::{DeviceError, Result};

/// Parse a JSON device spec
pub fn parse_json(text: &str) -> Result<Vec<Metadata>> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| DeviceError::ConfigurationError(format!("Invalid device spec: {}", e)))?;
    into_entries(value)
}

/// Parse a YAML device spec
pub fn parse_yaml(text: &str) -> Result<Vec<Metadata>> {
    let documents = YamlLoader::load_from_str(text)
        .map_err(|e| DeviceError::ConfigurationError(format!("Invalid device spec: {}", e)))?;
    match documents.into_iter().next() {
        Some(document) => into_entries(yaml_to_value(document)?),
        None => Ok(Vec::new()),
    }
}

/// Load a spec file, choosing the format by extension
pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Vec<Metadata>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| {
        DeviceError::ConfigurationError(format!("Failed to read {}: {}", path.display(), e))
    })?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => parse_yaml(&text),
        _ => parse_json(&text),
    }
}

fn into_entries(value: Value) -> Result<Vec<Metadata>> {
    let items = match value {
        Value::Array(items) => items,
        // A single map is a one-device spec.
        Value::Object(map) => return Ok(vec![map]),
        other => {
            return Err(DeviceError::ConfigurationError(format!(
                "Device spec must be a list, got {}",
                other.type_name()
            )))
        }
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => Ok(map),
            other => Err(DeviceError::ConfigurationError(format!(
                "Device spec entry {} must be a map, got {}",
                i,
                other.type_name()
            ))),
        })
        .collect()
}

fn yaml_to_value(yaml: Yaml) -> Result<Value> {
    Ok(match yaml {
        Yaml::Null => Value::Null,
        Yaml::Boolean(b) => Value::Bool(b),
        Yaml::Integer(i) => Value::Integer(i),
        Yaml::Real(text) => text
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| DeviceError::ConfigurationError(format!("Invalid number {}", text)))?,
        Yaml::String(s) => Value::String(s),
        Yaml::Array(items) => Value::Array(
            items
                .into_iter()
                .map(yaml_to_value)
                .collect::<Result<Vec<_>>>()?,
        ),
        Yaml::Hash(hash) => {
            let mut map = Metadata::new();
            for (key, value) in hash {
                let key = match key {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Boolean(b) => b.to_string(),
                    other => {
                        return Err(DeviceError::ConfigurationError(format!(
                            "Unsupported spec key {:?}",
                            other
                        )))
                    }
                };
                map.insert(key, yaml_to_value(value)?);
            }
            Value::Object(map)
        }
        Yaml::Alias(_) | Yaml::BadValue => {
            return Err(DeviceError::ConfigurationError(
                "Unsupported YAML value in device spec".to_string(),
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_json_spec() {
        let spec = parse_json(r#"[{"type": "TPad", "port": "COM3"}, {"type": "TPad", "name": "pad2", "pauseDuration": 0.02}]"#)
            .unwrap();
        assert_eq!(spec.len(), 2);
        assert_eq!(spec[0].get("port"), Some(&Value::from("COM3")));
        assert_eq!(spec[1].get("pauseDuration"), Some(&Value::Float(0.02)));
    }

    #[test]
    fn test_parse_yaml_spec() {
        let text = "
- type: TPad
  port: COM3
  poll: false
- type: TPad
  name: second
  settle: 16
";
        let spec = parse_yaml(text).unwrap();
        assert_eq!(spec.len(), 2);
        assert_eq!(spec[0].get("poll"), Some(&Value::Bool(false)));
        assert_eq!(spec[1].get("settle"), Some(&Value::Integer(16)));
        assert_eq!(spec[1].get("name"), Some(&Value::from("second")));
        assert!(parse_yaml("").unwrap().is_empty());
    }

    #[test]
    fn test_spec_shape_errors() {
        assert!(matches!(
            parse_json("42"),
            Err(DeviceError::ConfigurationError(_))
        ));
        assert!(matches!(
            parse_json(r#"[{"type": "TPad"}, "oops"]"#),
            Err(DeviceError::ConfigurationError(_))
        ));
        assert!(matches!(
            parse_json("[{"),
            Err(DeviceError::ConfigurationError(_))
        ));
        assert_eq!(parse_json(r#"{"type": "TPad"}"#).unwrap().len(), 1);
    }

    #[test]
    fn test_load_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.yaml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "- type: TPad\n  port: COM7").unwrap();

        let spec = load_file(&path).unwrap();
        assert_eq!(spec[0].get("port"), Some(&Value::from("COM7")));
        assert!(load_file(dir.path().join("missing.json")).is_err());
    }
}
