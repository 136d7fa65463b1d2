//! Upload staging step and helpers for writing stagers.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};
use crate::models::FileData;
use crate::traits::UploadStager;

/// Staged file name: first 12 hex chars of SHA-256 over the stager config
/// and the elements file name. Stable across runs with the same config.
pub fn staged_filename(stager_config: &Value, elements_path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stager_config.to_string().as_bytes());
    if let Some(name) = elements_path.file_name() {
        hasher.update(name.to_string_lossy().as_bytes());
    }
    hex::encode(hasher.finalize())[..12].to_string()
}

/// Run `stager` for one unit, writing into `staging_dir`.
pub fn stage_unit(
    stager: &dyn UploadStager,
    elements_path: &Path,
    file_data: &FileData,
    staging_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(staging_dir)?;
    let filename = staged_filename(&stager.config(), elements_path);
    let path = stager.run(elements_path, file_data, staging_dir, &filename)?;
    tracing::debug!(
        connector_type = %file_data.connector_type,
        identifier = %file_data.identifier,
        path = %path.display(),
        "staged"
    );
    Ok(path)
}

/// Read a JSON array of element records.
pub fn read_elements(path: &Path) -> Result<Vec<Value>> {
    let content = std::fs::read(path)?;
    match serde_json::from_slice::<Value>(&content)? {
        Value::Array(items) => Ok(items),
        _ => Err(IngestError::Value(format!(
            "{} does not contain a JSON array of elements",
            path.display()
        ))),
    }
}

pub fn write_elements(path: &Path, elements: &[Value]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec(elements)?)?;
    Ok(())
}

/// Flatten nested objects and arrays into one level, joining keys with
/// `separator` and dropping nulls.
///
/// `{"a": {"b": 1, "c": null}, "l": [2, 3]}` with `"-"` becomes
/// `{"a-b": 1, "l-0": 2, "l-1": 3}`.
pub fn flatten_metadata(value: &Value, separator: &str) -> Map<String, Value> {
    let mut out = Map::new();
    flatten_into(&mut out, None, value, separator);
    out
}

fn flatten_into(out: &mut Map<String, Value>, prefix: Option<&str>, value: &Value, sep: &str) {
    let join = |key: &str| match prefix {
        Some(p) => format!("{}{}{}", p, sep, key),
        None => key.to_string(),
    };
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (k, v) in map {
                flatten_into(out, Some(&join(k)), v, sep);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(out, Some(&join(&i.to_string())), v, sep);
            }
        }
        scalar => {
            if let Some(p) = prefix {
                out.insert(p.to_string(), scalar.clone());
            }
        }
    }
}

/// Deterministic UUID-shaped id for a record that arrived without one.
pub fn stable_element_id(file_data: &FileData, index: usize, record: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_data.connector_type.as_bytes());
    hasher.update(file_data.identifier.as_bytes());
    hasher.update((index as u64).to_le_bytes());
    hasher.update(record.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct UppercaseStager;

    impl UploadStager for UppercaseStager {
        fn config(&self) -> Value {
            json!({"mode": "upper"})
        }

        fn run(
            &self,
            elements_path: &Path,
            _file_data: &FileData,
            output_dir: &Path,
            output_filename: &str,
        ) -> Result<PathBuf> {
            let elements: Vec<Value> = read_elements(elements_path)?
                .into_iter()
                .map(|e| json!(e["text"].as_str().unwrap_or_default().to_uppercase()))
                .collect();
            let path = output_dir.join(format!("{}.json", output_filename));
            write_elements(&path, &elements)?;
            Ok(path)
        }
    }

    #[test]
    fn flatten_drops_nulls_and_indexes_lists() {
        let flat = flatten_metadata(
            &json!({"a": {"b": 1, "c": null}, "l": [2, {"x": "y"}], "s": "t"}),
            "-",
        );
        assert_eq!(
            Value::Object(flat),
            json!({"a-b": 1, "l-0": 2, "l-1-x": "y", "s": "t"})
        );
    }

    #[test]
    fn stable_ids_are_deterministic_and_distinct() {
        let fd = FileData::new("doc", "sqlite").unwrap();
        let rec = json!({"text": "x"});
        let a = stable_element_id(&fd, 0, &rec);
        assert_eq!(a, stable_element_id(&fd, 0, &rec));
        assert_ne!(a, stable_element_id(&fd, 1, &rec));
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn staging_is_deterministic_and_leaves_input_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let elements = tmp.path().join("doc.json");
        write_elements(&elements, &[json!({"text": "hi"})]).unwrap();
        let before = std::fs::read(&elements).unwrap();

        let fd = FileData::new("doc", "local").unwrap();
        let staging = tmp.path().join("staged");
        let first = stage_unit(&UppercaseStager, &elements, &fd, &staging).unwrap();
        let first_content = std::fs::read(&first).unwrap();
        let second = stage_unit(&UppercaseStager, &elements, &fd, &staging).unwrap();

        assert_eq!(first, second);
        assert_eq!(first_content, std::fs::read(&second).unwrap());
        assert_eq!(read_elements(&first).unwrap(), vec![json!("HI")]);
        assert_eq!(std::fs::read(&elements).unwrap(), before);
        assert_eq!(first.file_stem().unwrap().len(), 12);
    }

    #[test]
    fn read_elements_requires_an_array() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x.json");
        std::fs::write(&path, r#"{"text": "not a list"}"#).unwrap();
        assert!(matches!(
            read_elements(&path).unwrap_err(),
            IngestError::Value(_)
        ));
    }
}
