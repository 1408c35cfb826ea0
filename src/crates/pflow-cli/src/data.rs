//! Reading batch input sources and writing line outputs

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use pflow_core::input_mapping::{InputSources, InputsMapping, Record, LINE_NUMBER_KEY};
use pflow_core::BatchResult;
use serde_json::Value;
use tracing::debug;

/// Records of one source file
///
/// `.json` files hold an array of objects; anything else is read as JSONL,
/// one object per non-blank line.
pub fn read_records(path: &Path) -> Result<Vec<Record>> {
    let is_json_array = path.extension().and_then(|e| e.to_str()) == Some("json");
    if is_json_array {
        let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let records: Vec<Record> = serde_json::from_str(&content)
            .with_context(|| format!("{} is not a JSON array of objects", path.display()))?;
        return Ok(records);
    }

    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)
            .with_context(|| format!("line {} of {} is not valid JSON", index + 1, path.display()))?;
        match value {
            Value::Object(record) => records.push(record),
            other => bail!(
                "line {} of {} is not a JSON object: {}",
                index + 1,
                path.display(),
                other
            ),
        }
    }
    Ok(records)
}

/// Load every `NAME=PATH` source, relative paths resolved against `base_dir`
pub fn load_sources(pairs: &[(String, String)], base_dir: &Path) -> Result<InputSources> {
    let mut sources = InputSources::new();
    for (name, path) in pairs {
        if sources.contains_key(name) {
            bail!("input source '{}' is given more than once", name);
        }
        let path = base_dir.join(path);
        let records = read_records(&path)?;
        debug!(source = %name, records = records.len(), path = %path.display(), "input source loaded");
        sources.insert(name.clone(), records);
    }
    Ok(sources)
}

/// Column mapping from `INPUT=VALUE` pairs
///
/// Values that parse as JSON scalars, arrays or objects become literals of
/// that type; everything else, including `${source.column}`, stays a string.
pub fn column_mapping(pairs: &[(String, String)]) -> InputsMapping {
    pairs
        .iter()
        .map(|(input, raw)| {
            let value = match serde_json::from_str::<Value>(raw) {
                Ok(Value::String(_)) | Err(_) => Value::String(raw.clone()),
                Ok(parsed) => parsed,
            };
            (input.clone(), value)
        })
        .collect()
}

/// Write one JSONL row per successful line: its line number and outputs
pub fn write_outputs(path: &Path, result: &BatchResult) -> Result<usize> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut rows = 0;
    for (line_number, output) in result.outputs() {
        let mut row = Record::new();
        row.insert(LINE_NUMBER_KEY.to_string(), Value::from(line_number));
        row.extend(output.iter().map(|(k, v)| (k.clone(), v.clone())));
        serde_json::to_writer(&mut writer, &row)?;
        writer.write_all(b"\n")?;
        rows += 1;
    }
    writer.flush()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_read_jsonl_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        std::fs::write(&path, "{\"q\": \"a\"}\n\n{\"q\": \"b\"}\n").unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["q"], json!("b"));
    }

    #[test]
    fn test_read_jsonl_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        std::fs::write(&path, "{\"q\": \"a\"}\n[1, 2]\n").unwrap();

        let err = read_records(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"), "{}", err);
    }

    #[test]
    fn test_read_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, r#"[{"q": "a"}, {"q": "b", "line_number": 7}]"#).unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records[1][LINE_NUMBER_KEY], json!(7));
    }

    #[test]
    fn test_duplicate_source_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jsonl"), "{}\n").unwrap();
        let pairs = vec![
            ("data".to_string(), "a.jsonl".to_string()),
            ("data".to_string(), "a.jsonl".to_string()),
        ];
        assert!(load_sources(&pairs, dir.path()).is_err());
    }

    #[test]
    fn test_column_mapping_literals() {
        let mapping = column_mapping(&[
            ("question".to_string(), "${data.q}".to_string()),
            ("top_k".to_string(), "3".to_string()),
            ("tags".to_string(), "[\"a\"]".to_string()),
            ("style".to_string(), "formal".to_string()),
        ]);
        assert_eq!(mapping["question"], json!("${data.q}"));
        assert_eq!(mapping["top_k"], json!(3));
        assert_eq!(mapping["tags"], json!(["a"]));
        assert_eq!(mapping["style"], json!("formal"));
    }
}
