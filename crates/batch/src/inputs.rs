//! Batch input processor.
//!
//! Turns data sources (JSONL files or directories of them, plus prepared
//! parent-run sources) and a column mapping into a finite, ordered stream
//! of line inputs. Alignment is by explicit `line_number` when every record
//! of every source carries one, positional otherwise.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::info;

use engine::models::FlowInputDefinition;

use crate::error::BatchError;

/// Reserved column aligning records across sources.
pub const LINE_NUMBER_KEY: &str = "line_number";

pub struct BatchInputsProcessor {
    flow_inputs: BTreeMap<String, FlowInputDefinition>,
    max_lines: Option<usize>,
}

impl BatchInputsProcessor {
    pub fn new(
        flow_inputs: BTreeMap<String, FlowInputDefinition>,
        max_lines: Option<usize>,
    ) -> Self {
        Self {
            flow_inputs,
            max_lines,
        }
    }

    /// Load every source, align records, and apply the mapping. `sources`
    /// carries pre-loaded aliases (e.g. `run.outputs`); `input_dirs` maps
    /// aliases to JSONL files or directories.
    pub fn process_batch_inputs(
        &self,
        input_dirs: &BTreeMap<String, PathBuf>,
        mut sources: BTreeMap<String, Vec<BTreeMap<String, Value>>>,
        inputs_mapping: Option<&BTreeMap<String, Value>>,
    ) -> Result<Vec<BTreeMap<String, Value>>, BatchError> {
        let Some(mapping) = inputs_mapping else {
            return Err(BatchError::Unexpected(
                "Input mapping is required for batch run. Please make sure to set up a proper \
                 input mapping before proceeding."
                    .to_string(),
            ));
        };
        let mapping = self.complete_inputs_mapping_by_default_value(mapping);

        for (alias, path) in input_dirs {
            sources.insert(alias.clone(), load_source(path)?);
        }
        let merged = self.merge_input_dicts_by_line(sources)?;
        let merged = match self.max_lines {
            Some(max) => merged.into_iter().take(max).collect(),
            None => merged,
        };

        let mut lines = Vec::with_capacity(merged.len());
        for record in &merged {
            lines.push(apply_inputs_mapping(record, &mapping)?);
        }
        info!(lines = lines.len(), "batch inputs resolved");
        Ok(lines)
    }

    /// Fill in `${data.<name>}` for every required flow input absent from
    /// the mapping. Inputs with defaults are left out: their defaults apply
    /// at execution.
    pub fn complete_inputs_mapping_by_default_value(
        &self,
        mapping: &BTreeMap<String, Value>,
    ) -> BTreeMap<String, Value> {
        let mut completed = mapping.clone();
        for (name, definition) in &self.flow_inputs {
            if definition.default.is_some() || completed.contains_key(name) {
                continue;
            }
            completed.insert(name.clone(), Value::String(format!("${{data.{name}}}")));
        }
        completed
    }

    /// Align records across sources into per-line dicts of the shape
    /// `{alias: record, ..., "line_number": n}`.
    pub fn merge_input_dicts_by_line(
        &self,
        sources: BTreeMap<String, Vec<BTreeMap<String, Value>>>,
    ) -> Result<Vec<BTreeMap<String, Value>>, BatchError> {
        for (alias, records) in &sources {
            if records.is_empty() {
                return Err(BatchError::InputMapping(format!(
                    "The input for batch run is incorrect. Input from key '{alias}' is an empty \
                     list, which means we cannot generate a single line input for the flow run. \
                     Please rectify the input and try again."
                )));
            }
        }

        let all_keyed = sources.values().all(|records| {
            records
                .iter()
                .all(|record| record.get(LINE_NUMBER_KEY).is_some_and(Value::is_u64))
        });

        if all_keyed {
            // Inner join on explicit line numbers.
            let keyed: BTreeMap<&String, BTreeMap<u64, &BTreeMap<String, Value>>> = sources
                .iter()
                .map(|(alias, records)| {
                    let by_line = records
                        .iter()
                        .map(|record| {
                            let line = record[LINE_NUMBER_KEY].as_u64().expect("checked above");
                            (line, record)
                        })
                        .collect();
                    (alias, by_line)
                })
                .collect();
            let mut common: Vec<u64> = keyed
                .values()
                .next()
                .map(|m| m.keys().copied().collect())
                .unwrap_or_default();
            common.retain(|line| keyed.values().all(|m| m.contains_key(line)));
            common.sort_unstable();

            return Ok(common
                .into_iter()
                .map(|line| {
                    let mut row: BTreeMap<String, Value> = keyed
                        .iter()
                        .map(|(alias, by_line)| {
                            let record = by_line[&line];
                            let object: serde_json::Map<String, Value> = record
                                .iter()
                                .map(|(k, v)| (k.clone(), v.clone()))
                                .collect();
                            ((*alias).clone(), Value::Object(object))
                        })
                        .collect();
                    row.insert(LINE_NUMBER_KEY.to_string(), Value::from(line));
                    row
                })
                .collect());
        }

        // Positional alignment requires equal lengths.
        let lengths: BTreeMap<&String, usize> =
            sources.iter().map(|(alias, r)| (alias, r.len())).collect();
        let distinct: std::collections::HashSet<usize> = lengths.values().copied().collect();
        if distinct.len() > 1 {
            let formatted = lengths
                .iter()
                .map(|(alias, len)| format!("'{alias}': {len}"))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(BatchError::InputMapping(format!(
                "The input for batch run is incorrect. Line numbers are not aligned. Some lists \
                 have dictionaries missing the 'line_number' key, and the lengths of these lists \
                 are different. List lengths are: {{{formatted}}}. Please make sure these lists \
                 have the same length or add 'line_number' key to each dictionary."
            )));
        }

        let count = distinct.into_iter().next().unwrap_or(0);
        Ok((0..count)
            .map(|index| {
                let mut row: BTreeMap<String, Value> = sources
                    .iter()
                    .map(|(alias, records)| {
                        let object: serde_json::Map<String, Value> = records[index]
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        (alias.clone(), Value::Object(object))
                    })
                    .collect();
                row.insert(LINE_NUMBER_KEY.to_string(), Value::from(index as u64));
                row
            })
            .collect())
    }
}

/// Substitute one merged record through the mapping. `${alias.column}`
/// expressions resolve against the record (shorter alias keys win);
/// non-reference values pass through as literals; the reserved
/// `line_number` mapping key is ignored.
pub fn apply_inputs_mapping(
    record: &BTreeMap<String, Value>,
    mapping: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, BatchError> {
    let mut result = BTreeMap::new();
    let mut unresolved: Vec<String> = Vec::new();

    for (target, expression) in mapping {
        if target == LINE_NUMBER_KEY {
            continue;
        }
        let Some(body) = expression
            .as_str()
            .and_then(|s| s.strip_prefix("${"))
            .and_then(|s| s.strip_suffix('}'))
        else {
            result.insert(target.clone(), expression.clone());
            continue;
        };
        let parts: Vec<&str> = body.split('.').collect();
        let mut found = None;
        for split in 1..parts.len() {
            let alias = parts[..split].join(".");
            let column = parts[split..].join(".");
            if let Some(Value::Object(fields)) = record.get(&alias) {
                if let Some(value) = fields.get(&column) {
                    found = Some(value.clone());
                    break;
                }
            }
        }
        match found {
            Some(value) => {
                result.insert(target.clone(), value);
            }
            None => unresolved.push(expression.as_str().unwrap_or_default().to_string()),
        }
    }

    if !unresolved.is_empty() {
        unresolved.sort();
        return Err(BatchError::InputMapping(format!(
            "Couldn't find these mapping relations: {}. Please make sure your input mapping keys \
             and values match your YAML input section and input data.",
            unresolved.join(", ")
        )));
    }

    if let Some(line) = record.get(LINE_NUMBER_KEY) {
        result.insert(LINE_NUMBER_KEY.to_string(), line.clone());
    }
    Ok(result)
}

/// Load one source: a JSONL file, a JSON array file, or a directory of
/// them (sorted by name, concatenated).
fn load_source(path: &Path) -> Result<Vec<BTreeMap<String, Value>>, BatchError> {
    let mut files: Vec<PathBuf> = if path.is_dir() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(path)
            .map_err(|e| BatchError::InputMapping(format!(
                "The input for batch run is incorrect. Cannot read input directory '{}': {e}.",
                path.display()
            )))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| {
                p.extension()
                    .is_some_and(|ext| ext == "jsonl" || ext == "json")
            })
            .collect();
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };
    files.retain(|p| p.is_file());

    let mut records = Vec::new();
    for file in files {
        let content = std::fs::read_to_string(&file).map_err(|e| {
            BatchError::InputMapping(format!(
                "The input for batch run is incorrect. Cannot read input file '{}': {e}.",
                file.display()
            ))
        })?;
        let parse = |text: &str, what: &str| -> Result<Value, BatchError> {
            serde_json::from_str(text).map_err(|e| {
                BatchError::InputMapping(format!(
                    "The input for batch run is incorrect. Invalid JSON in {what} of '{}': {e}.",
                    file.display()
                ))
            })
        };
        if file.extension().is_some_and(|ext| ext == "json") {
            let value = parse(&content, "body")?;
            if let Value::Array(items) = value {
                for item in items {
                    records.push(value_to_record(item));
                }
            } else {
                records.push(value_to_record(value));
            }
        } else {
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                records.push(value_to_record(parse(line, "line")?));
            }
        }
    }
    Ok(records)
}

fn value_to_record(value: Value) -> BTreeMap<String, Value> {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        other => BTreeMap::from([("value".to_string(), other)]),
    }
}
