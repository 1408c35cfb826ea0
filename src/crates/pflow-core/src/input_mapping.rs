//! Mapping batch input sources onto flow inputs
//!
//! A batch is fed by one or more named sources (`data`, `baseline`, `output`,
//! ...), each a list of flat records. Lines are assembled in two steps:
//!
//! 1. [`merge_input_dicts_by_line`] groups records by line. A source with any
//!    record carrying a `line_number` is keyed: its records are placed by that
//!    number, falling back to their position when it is absent. Sources with
//!    no numbered record are placed by position, so they must all have the same
//!    length. Lines missing a record from any source are dropped; the rest get
//!    their `line_number` alongside the source records.
//! 2. [`apply_inputs_mapping`] evaluates each `${source.path}` expression of the
//!    mapping against the merged line. Other values pass through as literals.
//!
//! ```rust
//! use indexmap::IndexMap;
//! use pflow_core::input_mapping::apply_inputs_mapping_for_all_lines;
//! use serde_json::json;
//!
//! let mut sources = IndexMap::new();
//! sources.insert(
//!     "data".to_string(),
//!     vec![json!({"q": "q1"}).as_object().cloned().unwrap()],
//! );
//! let mut mapping = IndexMap::new();
//! mapping.insert("question".to_string(), json!("${data.q}"));
//!
//! let lines = apply_inputs_mapping_for_all_lines(&sources, &mapping).unwrap();
//! assert_eq!(lines[0].inputs["question"], json!("q1"));
//! ```

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FlowError, MissingMapping, Result};
use crate::flow::{reference_expression, Flow};

/// Key that pins a record to a line
pub const LINE_NUMBER_KEY: &str = "line_number";

/// One flat input record
pub type Record = Map<String, Value>;

/// Named record lists
pub type InputSources = IndexMap<String, Vec<Record>>;

/// Flow input name to `${source.path}` expression or literal
pub type InputsMapping = IndexMap<String, Value>;

/// Inputs of one line after mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineInputs {
    pub line_number: usize,
    pub inputs: Record,
}

fn line_number_of(record: &Record) -> Option<usize> {
    record
        .get(LINE_NUMBER_KEY)
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
}

fn is_keyed(records: &[Record]) -> bool {
    records.iter().any(|r| line_number_of(r).is_some())
}

/// Group records of every source by line
///
/// Each merged line maps source name to that source's record, plus
/// `line_number` to the line's number.
pub fn merge_input_dicts_by_line(sources: &InputSources) -> Result<BTreeMap<usize, Record>> {
    if sources.is_empty() {
        return Err(FlowError::EmptyInputListError {
            message: "No input source is provided".to_string(),
        });
    }
    if let Some((name, _)) = sources.iter().find(|(_, records)| records.is_empty()) {
        return Err(FlowError::EmptyInputListError {
            message: format!("List from key '{}' is empty", name),
        });
    }

    let positional: Vec<(&String, usize)> = sources
        .iter()
        .filter(|(_, records)| !is_keyed(records))
        .map(|(name, records)| (name, records.len()))
        .collect();
    if positional.windows(2).any(|pair| pair[0].1 != pair[1].1) {
        let lengths = positional
            .iter()
            .map(|(name, len)| format!("'{}': {}", name, len))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(FlowError::LineNumberNotAlign {
            message: format!(
                "Line numbers are not aligned. Some lists have dictionaries missing the \
                 '{}' key, and the lengths of these lists are different. List lengths are: {{{}}}",
                LINE_NUMBER_KEY, lengths
            ),
        });
    }

    let mut merged: BTreeMap<usize, Record> = BTreeMap::new();
    for (name, records) in sources {
        let keyed = is_keyed(records);
        for (index, record) in records.iter().enumerate() {
            let line = if keyed {
                line_number_of(record).unwrap_or(index)
            } else {
                index
            };
            merged
                .entry(line)
                .or_default()
                .insert(name.clone(), Value::Object(record.clone()));
        }
    }

    merged.retain(|_, line| line.len() == sources.len());
    for (line_number, line) in merged.iter_mut() {
        line.entry(LINE_NUMBER_KEY).or_insert(Value::from(*line_number));
    }
    if merged.is_empty() {
        let names = sources.keys().cloned().collect::<Vec<_>>().join(", ");
        return Err(FlowError::EmptyInputListError {
            message: format!(
                "Input dict is empty after merging; no line has a record from every source: {}",
                names
            ),
        });
    }
    Ok(merged)
}

/// Look up a dotted path, trying the longest compound key first
fn lookup<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    if let Some(value) = record.get(path) {
        return Some(value);
    }
    let parts: Vec<&str> = path.split('.').collect();
    for cut in (1..parts.len()).rev() {
        let head = parts[..cut].join(".");
        if let Some(Value::Object(inner)) = record.get(&head) {
            if let Some(value) = lookup(inner, &parts[cut..].join(".")) {
                return Some(value);
            }
        }
    }
    None
}

fn describe_miss(line: &Record, path: &str) -> MissingMapping {
    let source = path.split('.').next().unwrap_or_default();
    match line.get(source) {
        Some(Value::Object(inner)) if source != path => MissingMapping {
            path: path.to_string(),
            source: Some(source.to_string()),
            available_keys: inner.keys().cloned().collect(),
        },
        _ => MissingMapping {
            path: path.to_string(),
            source: None,
            available_keys: line.keys().cloned().collect(),
        },
    }
}

/// Apply a mapping to one merged line
///
/// Every unresolved expression is reported together.
pub fn apply_inputs_mapping(line: &Record, mapping: &InputsMapping) -> Result<Record> {
    let mut result = Record::new();
    let mut missing = Vec::new();
    for (key, value) in mapping {
        let expression = value.as_str().and_then(reference_expression);
        match expression {
            None => {
                result.insert(key.clone(), value.clone());
            }
            Some(path) => match lookup(line, path) {
                Some(resolved) => {
                    result.insert(key.clone(), resolved.clone());
                }
                None => missing.push(describe_miss(line, path)),
            },
        }
    }
    if !missing.is_empty() {
        return Err(FlowError::MappingSourceNotFound { missing });
    }
    Ok(result)
}

/// Merge all sources and map every line
pub fn apply_inputs_mapping_for_all_lines(
    sources: &InputSources,
    mapping: &InputsMapping,
) -> Result<Vec<LineInputs>> {
    if mapping.is_empty() {
        return match sources.len() {
            0 => Err(FlowError::EmptyInputListError {
                message: "No input source is provided".to_string(),
            }),
            1 => Ok(sources
                .values()
                .flat_map(|records| records.iter().enumerate())
                .map(|(index, record)| LineInputs {
                    line_number: line_number_of(record).unwrap_or(index),
                    inputs: record.clone(),
                })
                .collect()),
            _ => Err(FlowError::EmptyInputMappingError {
                sources: sources.keys().cloned().collect(),
            }),
        };
    }

    let merged = merge_input_dicts_by_line(sources)?;
    merged
        .iter()
        .map(|(line_number, line)| {
            Ok(LineInputs {
                line_number: *line_number,
                inputs: apply_inputs_mapping(line, mapping)?,
            })
        })
        .collect()
}

/// Map every flow input from the same-named column of the `data` source
pub fn default_inputs_mapping(flow: &Flow) -> InputsMapping {
    flow.inputs
        .keys()
        .map(|name| (name.clone(), Value::String(format!("${{data.{}}}", name))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowInputDefinition, ValueType};
    use serde_json::json;

    fn records(value: Value) -> Vec<Record> {
        value
            .as_array()
            .map(|items| items.iter().filter_map(|v| v.as_object().cloned()).collect())
            .unwrap_or_default()
    }

    fn mapping(value: Value) -> InputsMapping {
        value
            .as_object()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_missing_mapping_lists_available_keys() {
        let mut sources = InputSources::new();
        sources.insert(
            "data".into(),
            records(json!([{"q": "q1", "a": "ans1"}, {"q": "q2", "a": "ans2"}])),
        );
        let err = apply_inputs_mapping_for_all_lines(
            &sources,
            &mapping(json!({"question": "${data.q}", "groundtruth": "${data.answer}"})),
        )
        .unwrap_err();
        match &err {
            FlowError::MappingSourceNotFound { missing } => {
                assert_eq!(missing.len(), 1);
                assert_eq!(missing[0].path, "data.answer");
                assert_eq!(missing[0].available_keys, vec!["q", "a"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("['q', 'a']"));
    }

    #[test]
    fn test_keyed_source_merges_with_positional_source() {
        let mut sources = InputSources::new();
        sources.insert("data".into(), records(json!([{"q": "q0"}, {"q": "q1"}])));
        sources.insert(
            "baseline".into(),
            records(json!([{"line_number": 1, "answer": "b1"}])),
        );

        let merged = merge_input_dicts_by_line(&sources).unwrap();
        assert_eq!(merged.len(), 1);
        let line = &merged[&1];
        assert_eq!(line[LINE_NUMBER_KEY], json!(1));
        assert_eq!(line["data"], json!({"q": "q1"}));
        assert_eq!(line["baseline"]["answer"], json!("b1"));

        let lines = apply_inputs_mapping_for_all_lines(
            &sources,
            &mapping(json!({"q": "${data.q}", "a": "${baseline.answer}"})),
        )
        .unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line_number, 1);
        assert_eq!(lines[0].inputs, mapping_record(json!({"q": "q1", "a": "b1"})));
    }

    #[test]
    fn test_mixed_source_is_placed_by_its_numbered_records() {
        let mut sources = InputSources::new();
        sources.insert("data".into(), records(json!([{"q": "q0"}, {"q": "q1"}, {"q": "q2"}])));
        sources.insert(
            "baseline".into(),
            records(json!([{"line_number": 2, "a": "b2"}, {"a": "b1"}])),
        );

        let merged = merge_input_dicts_by_line(&sources).unwrap();
        assert_eq!(merged.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(merged[&2]["data"], json!({"q": "q2"}));
        assert_eq!(merged[&2]["baseline"]["a"], json!("b2"));
        assert_eq!(merged[&1]["baseline"]["a"], json!("b1"));
        assert!(merged.values().all(|line| line.contains_key(LINE_NUMBER_KEY)));

        let lines = apply_inputs_mapping_for_all_lines(
            &sources,
            &mapping(json!({"q": "${data.q}", "n": "${line_number}"})),
        )
        .unwrap();
        assert_eq!(lines[1].inputs, mapping_record(json!({"q": "q2", "n": 2})));
    }

    fn mapping_record(value: Value) -> Record {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_positional_length_mismatch() {
        let mut sources = InputSources::new();
        sources.insert("data".into(), records(json!([{"q": 1}, {"q": 2}])));
        sources.insert("output".into(), records(json!([{"o": 1}])));
        let err = merge_input_dicts_by_line(&sources).unwrap_err();
        match err {
            FlowError::LineNumberNotAlign { message } => {
                assert!(message.contains("'data': 2"));
                assert!(message.contains("'output': 1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_source_and_no_complete_line() {
        let mut sources = InputSources::new();
        sources.insert("data".into(), Vec::new());
        assert!(matches!(
            merge_input_dicts_by_line(&sources),
            Err(FlowError::EmptyInputListError { .. })
        ));

        let mut sources = InputSources::new();
        sources.insert("data".into(), records(json!([{"line_number": 0, "q": 1}])));
        sources.insert("baseline".into(), records(json!([{"line_number": 5, "a": 1}])));
        assert!(matches!(
            merge_input_dicts_by_line(&sources),
            Err(FlowError::EmptyInputListError { .. })
        ));
    }

    #[test]
    fn test_empty_mapping_passes_single_source_through() {
        let mut sources = InputSources::new();
        sources.insert("data".into(), records(json!([{"q": "a"}, {"q": "b"}])));
        let lines = apply_inputs_mapping_for_all_lines(&sources, &InputsMapping::new()).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].line_number, 1);
        assert_eq!(lines[1].inputs["q"], json!("b"));

        sources.insert("baseline".into(), records(json!([{"a": 1}, {"a": 2}])));
        let err = apply_inputs_mapping_for_all_lines(&sources, &InputsMapping::new()).unwrap_err();
        assert!(matches!(err, FlowError::EmptyInputMappingError { sources } if sources.len() == 2));
    }

    #[test]
    fn test_compound_key_wins_over_nested_lookup() {
        let line = mapping_record(json!({
            "data.test": {"question": "flat"},
            "data": {"test": {"question": "nested"}, "other": 1}
        }));
        let resolved = apply_inputs_mapping(
            &line,
            &mapping(json!({"q": "${data.test.question}", "o": "${data.other}"})),
        )
        .unwrap();
        assert_eq!(resolved["q"], json!("flat"));
        assert_eq!(resolved["o"], json!(1));
    }

    #[test]
    fn test_literals_pass_through() {
        let line = mapping_record(json!({"data": {"q": 1}}));
        let resolved = apply_inputs_mapping(
            &line,
            &mapping(json!({"lang": "en", "k": 3, "raw": "data.q"})),
        )
        .unwrap();
        assert_eq!(resolved, mapping_record(json!({"lang": "en", "k": 3, "raw": "data.q"})));
    }

    #[test]
    fn test_default_mapping_uses_data_columns() {
        let flow = Flow::new("f")
            .with_input("question", FlowInputDefinition::new(ValueType::String))
            .with_input("k", FlowInputDefinition::new(ValueType::Int));
        let mapping = default_inputs_mapping(&flow);
        assert_eq!(mapping["question"], json!("${data.question}"));
        assert_eq!(mapping["k"], json!("${data.k}"));
    }
}
