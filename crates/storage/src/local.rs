//! Local storage operations — the durable layout of one run.
//!
//! Directory layout under the run's `output_path`:
//!
//! ```text
//! meta.json                      {"batch_size": N}
//! snapshot/                      flow directory copy, variant-resolved DAG
//!   .promptflow/flow.tools.json
//! flow_outputs/output.jsonl      one object per completed line
//! flow_artifacts/<lo>_<hi>.jsonl line-run records per block
//! node_artifacts/<node>/<line>.jsonl
//! metrics.json
//! exception.json                 present iff a batch-level error was captured
//! inputs.jsonl / outputs.jsonl
//! log
//! ```
//!
//! Two files see concurrent writers and take file locks: the block files in
//! `flow_artifacts/` (multiple lines share a block when the batch size is
//! greater than one) and each reduce node's `000000000.jsonl`. Everything
//! else writes to disjoint paths.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use db::config::home_dir;
use db::Run;
use engine::{FlowRunInfo, NodeRunInfo, RunStorage};

use crate::error::StorageError;
use crate::multimedia::externalize_media;
use crate::records::{LineRunRecord, NodeRunRecord};

pub const LINE_NUMBER_WIDTH: usize = 9;
pub const DEFAULT_BATCH_SIZE: usize = 1;
pub const BATCH_SIZE_ENV_VAR: &str = "LOCAL_STORAGE_BATCH_SIZE";

/// Placeholder written into the outputs table for failed lines.
pub const FAILED_OUTPUT: &str = "(Failed)";

/// Directory names ignored when snapshotting a flow directory.
const SNAPSHOT_IGNORE: &[&str] = &[".git", "__pycache__", ".runs", "node_modules", ".venv"];

/// Reconstructed run detail.
#[derive(Debug, Default)]
pub struct Detail {
    pub flow_runs: Vec<Value>,
    pub node_runs: Vec<Value>,
}

pub struct LocalStorageOperations {
    run_name: String,
    path: PathBuf,
    batch_size: usize,
    snapshot_path: PathBuf,
    dag_path: PathBuf,
    tools_json_path: PathBuf,
    outputs_folder: PathBuf,
    node_infos_folder: PathBuf,
    run_infos_folder: PathBuf,
    inputs_path: PathBuf,
    sdk_outputs_path: PathBuf,
    metrics_path: PathBuf,
    exception_path: PathBuf,
    detail_path: PathBuf,
    log_file: Mutex<File>,
    log_path: PathBuf,
}

impl LocalStorageOperations {
    /// Prepare the run folder. The batch size honors
    /// `LOCAL_STORAGE_BATCH_SIZE` when set.
    pub fn new(run: &Run) -> Result<Self, StorageError> {
        let batch_size = std::env::var(BATCH_SIZE_ENV_VAR)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        Self::with_batch_size(run, batch_size)
    }

    pub fn with_batch_size(run: &Run, batch_size: usize) -> Result<Self, StorageError> {
        let path = run.output_path.clone();
        let snapshot_path = path.join("snapshot");
        let outputs_folder = path.join("flow_outputs");
        let node_infos_folder = path.join("node_artifacts");
        let run_infos_folder = path.join("flow_artifacts");
        for dir in [
            &path,
            &snapshot_path,
            &outputs_folder,
            &node_infos_folder,
            &run_infos_folder,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| StorageError::io(dir.display(), e))?;
        }

        let meta_path = path.join("meta.json");
        std::fs::write(
            &meta_path,
            serde_json::to_string(&json!({ "batch_size": batch_size }))?,
        )
        .map_err(|e| StorageError::io(meta_path.display(), e))?;

        let log_path = path.join("log");
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| StorageError::io(log_path.display(), e))?;

        Ok(Self {
            run_name: run.name.clone(),
            dag_path: snapshot_path.join("flow.dag.yaml"),
            tools_json_path: snapshot_path.join(".promptflow").join("flow.tools.json"),
            snapshot_path,
            outputs_folder,
            node_infos_folder,
            run_infos_folder,
            inputs_path: path.join("inputs.jsonl"),
            sdk_outputs_path: path.join("outputs.jsonl"),
            metrics_path: path.join("metrics.json"),
            exception_path: path.join("exception.json"),
            detail_path: path.join("detail.json"),
            log_file: Mutex::new(log_file),
            log_path,
            path,
            batch_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Append one line to the run's combined log stream.
    pub fn append_log(&self, line: &str) {
        let mut file = self.log_file.lock().unwrap();
        if let Err(e) = writeln!(file, "{line}") {
            warn!(error = %e, "failed to append to run log");
        }
    }

    // -----------------------------------------------------------------------
    // Snapshot
    // -----------------------------------------------------------------------

    /// Copy the flow directory into `snapshot/`, overwrite the DAG file
    /// with the variant-resolved document, and write the tools manifest.
    pub fn dump_snapshot(
        &self,
        flow_dir: &Path,
        resolved_dag: &str,
        tools_json: &Value,
    ) -> Result<(), StorageError> {
        // Never recurse into our own output tree.
        let own_output_parent = self
            .path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string());
        copy_tree(flow_dir, &self.snapshot_path, &own_output_parent)?;
        std::fs::write(&self.dag_path, resolved_dag)
            .map_err(|e| StorageError::io(self.dag_path.display(), e))?;
        if let Some(parent) = self.tools_json_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent.display(), e))?;
        }
        std::fs::write(&self.tools_json_path, serde_json::to_string_pretty(tools_json)?)
            .map_err(|e| StorageError::io(self.tools_json_path.display(), e))?;
        Ok(())
    }

    pub fn load_dag_as_string(&self) -> Result<String, StorageError> {
        std::fs::read_to_string(&self.dag_path)
            .map_err(|e| StorageError::io(self.dag_path.display(), e))
    }

    // -----------------------------------------------------------------------
    // Tables
    // -----------------------------------------------------------------------

    /// Resolved inputs per line, one object per line.
    pub fn dump_inputs(&self, lines: &[BTreeMap<String, Value>]) -> Result<(), StorageError> {
        write_jsonl(
            &self.inputs_path,
            lines.iter().map(|line| {
                Value::Object(line.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            }),
        )
    }

    /// Post-processed outputs per line (`outputs.jsonl`).
    pub fn dump_outputs(&self, rows: &[Value]) -> Result<(), StorageError> {
        write_jsonl(&self.sdk_outputs_path, rows.iter().cloned())
    }

    /// Executor-facing outputs keyed by line number
    /// (`flow_outputs/output.jsonl`).
    pub fn dump_flow_outputs(&self, rows: &[Value]) -> Result<(), StorageError> {
        write_jsonl(&self.outputs_folder.join("output.jsonl"), rows.iter().cloned())
    }

    pub fn dump_metrics(&self, metrics: &Value) -> Result<(), StorageError> {
        std::fs::write(&self.metrics_path, serde_json::to_string(metrics)?)
            .map_err(|e| StorageError::io(self.metrics_path.display(), e))
    }

    /// Write `exception.json`. Call only when a batch-level error was
    /// captured; absence of the file means a clean run.
    pub fn dump_exception(&self, error_dict: &Value) -> Result<(), StorageError> {
        std::fs::write(&self.exception_path, serde_json::to_string(error_dict)?)
            .map_err(|e| StorageError::io(self.exception_path.display(), e))
    }

    // -----------------------------------------------------------------------
    // Readers
    // -----------------------------------------------------------------------

    /// Reconstruct flow and node run infos. A legacy `detail.json` wins;
    /// otherwise the artifact files are scanned and concatenated.
    pub fn load_detail(&self) -> Result<Detail, StorageError> {
        if self.detail_path.is_file() {
            let content = std::fs::read_to_string(&self.detail_path)
                .map_err(|e| StorageError::io(self.detail_path.display(), e))?;
            let legacy: Value = serde_json::from_str(&content)?;
            return Ok(Detail {
                flow_runs: legacy["flow_runs"].as_array().cloned().unwrap_or_default(),
                node_runs: legacy["node_runs"].as_array().cloned().unwrap_or_default(),
            });
        }

        let mut detail = Detail::default();
        for path in sorted_files(&self.run_infos_folder, "jsonl")? {
            for record in read_jsonl(&path)? {
                detail.flow_runs.push(record["run_info"].clone());
            }
        }
        let mut node_dirs: Vec<PathBuf> = std::fs::read_dir(&self.node_infos_folder)
            .map_err(|e| StorageError::io(self.node_infos_folder.display(), e))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.is_dir())
            .collect();
        node_dirs.sort();
        for node_dir in node_dirs {
            for path in sorted_files(&node_dir, "jsonl")? {
                for record in read_jsonl(&path)? {
                    detail.node_runs.push(record["run_info"].clone());
                }
            }
        }
        Ok(detail)
    }

    /// Tabular inputs/outputs view, aligned on `line_number`. Lines with no
    /// output row (failed lines) are padded with `"(Failed)"`.
    pub fn load_inputs_and_outputs(&self) -> Result<Vec<Value>, StorageError> {
        let input_rows = read_jsonl(&self.inputs_path)?;
        let output_rows = read_jsonl(&self.outputs_folder.join("output.jsonl"))?;

        let mut outputs_by_line: BTreeMap<u64, &Value> = BTreeMap::new();
        let mut output_columns: Vec<String> = Vec::new();
        for row in &output_rows {
            if let Some(line) = row["line_number"].as_u64() {
                outputs_by_line.insert(line, row);
            }
            if let Some(map) = row.as_object() {
                for key in map.keys() {
                    if key != "line_number" && !output_columns.iter().any(|c| c == key) {
                        output_columns.push(key.clone());
                    }
                }
            }
        }

        let mut table = Vec::with_capacity(input_rows.len());
        for (index, inputs) in input_rows.iter().enumerate() {
            let line = inputs["line_number"].as_u64().unwrap_or(index as u64);
            let mut row = serde_json::Map::new();
            row.insert("line_number".to_string(), json!(line));
            if let Some(map) = inputs.as_object() {
                for (key, value) in map {
                    if key != "line_number" {
                        row.insert(format!("inputs.{key}"), value.clone());
                    }
                }
            }
            let outputs = outputs_by_line.get(&line);
            for column in &output_columns {
                let value = outputs
                    .and_then(|o| o.get(column))
                    .cloned()
                    .unwrap_or_else(|| json!(FAILED_OUTPUT));
                row.insert(format!("outputs.{column}"), value);
            }
            table.push(Value::Object(row));
        }
        Ok(table)
    }

    pub fn load_metrics(&self) -> Result<Value, StorageError> {
        let content = std::fs::read_to_string(&self.metrics_path)
            .map_err(|e| StorageError::io(self.metrics_path.display(), e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Read `exception.json`, or `{}` when the run finished clean.
    pub fn load_exception(&self) -> Value {
        std::fs::read_to_string(&self.exception_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_else(|| json!({}))
    }

    // -----------------------------------------------------------------------
    // Artifact write paths
    // -----------------------------------------------------------------------

    fn zfill(line: usize) -> String {
        format!("{line:0width$}", width = LINE_NUMBER_WIDTH)
    }

    /// Lock file path for a contended artifact target. Locks live outside
    /// the run folder so artifact readers never see them.
    fn lock_path(&self, target: &str) -> PathBuf {
        let locks = home_dir().join("locks");
        let _ = std::fs::create_dir_all(&locks);
        locks.join(format!("{}.{target}.lock", self.run_name))
    }

    fn with_file_lock<T>(
        &self,
        target: &str,
        action: impl FnOnce() -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let lock_path = self.lock_path(target);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| StorageError::io(lock_path.display(), e))?;
        let mut lock = fd_lock::RwLock::new(file);
        let _guard = lock
            .write()
            .map_err(|e| StorageError::io(lock_path.display(), e))?;
        action()
    }
}

#[async_trait]
impl RunStorage for LocalStorageOperations {
    /// One file per node per line; reduce nodes land in `000000000.jsonl`
    /// under a file lock because every line's reduce record targets it.
    async fn persist_node_run(&self, run_info: &NodeRunInfo) -> anyhow::Result<()> {
        let node_folder = self.node_infos_folder.join(&run_info.node);
        std::fs::create_dir_all(&node_folder)
            .map_err(|e| StorageError::io(node_folder.display(), e))?;

        let mut info = run_info.clone();
        if let Some(inputs) = &info.inputs {
            info.inputs = Some(
                inputs
                    .iter()
                    .map(|(k, v)| (k.clone(), externalize_media(v, &node_folder)))
                    .collect(),
            );
        }
        if let Some(output) = &info.output {
            info.output = Some(externalize_media(output, &node_folder));
        }

        let record = NodeRunRecord::from_run_info(&info)?;
        let line = info.index.unwrap_or(0);
        let path = node_folder.join(format!("{}.jsonl", Self::zfill(line)));
        let content = serde_json::to_string(&record)?;
        if info.index.is_none() {
            // Reduce-node target: contended across parallel writers.
            self.with_file_lock(&info.node, || {
                std::fs::write(&path, format!("{content}\n"))
                    .map_err(|e| StorageError::io(path.display(), e))
            })?;
        } else {
            std::fs::write(&path, format!("{content}\n"))
                .map_err(|e| StorageError::io(path.display(), e))?;
        }
        Ok(())
    }

    /// Line records append into `<lo>_<hi>.jsonl` blocks; the block file is
    /// shared by `batch_size` lines, so the append takes a file lock.
    async fn persist_flow_run(&self, run_info: &FlowRunInfo) -> anyhow::Result<()> {
        if !run_info.status.is_terminated() {
            info!(run_id = %run_info.run_id, "line run not terminated, skipping persist");
            return Ok(());
        }
        let mut info = run_info.clone();
        if let Some(inputs) = &info.inputs {
            info.inputs = Some(
                inputs
                    .iter()
                    .map(|(k, v)| (k.clone(), externalize_media(v, &self.run_infos_folder)))
                    .collect(),
            );
        }
        if let Some(output) = &info.output {
            info.output = Some(externalize_media(output, &self.run_infos_folder));
        }

        let record = LineRunRecord::from_flow_run_info(&info)?;
        let line = info.index.unwrap_or(0);
        let lower = line / self.batch_size * self.batch_size;
        let upper = lower + self.batch_size - 1;
        let filename = format!("{}_{}.jsonl", Self::zfill(lower), Self::zfill(upper));
        let path = self.run_infos_folder.join(&filename);
        let content = serde_json::to_string(&record)?;
        self.with_file_lock(&filename, || {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| StorageError::io(path.display(), e))?;
            writeln!(file, "{content}").map_err(|e| StorageError::io(path.display(), e))?;
            Ok(())
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn write_jsonl(
    path: &Path,
    rows: impl Iterator<Item = Value>,
) -> Result<(), StorageError> {
    let mut content = String::new();
    for row in rows {
        content.push_str(&serde_json::to_string(&row)?);
        content.push('\n');
    }
    std::fs::write(path, content).map_err(|e| StorageError::io(path.display(), e))
}

fn read_jsonl(path: &Path) -> Result<Vec<Value>, StorageError> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let content =
        std::fs::read_to_string(path).map_err(|e| StorageError::io(path.display(), e))?;
    let mut rows = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        rows.push(serde_json::from_str(line)?);
    }
    Ok(rows)
}

fn sorted_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, StorageError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| StorageError::io(dir.display(), e))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().is_some_and(|e| e == extension))
        .collect();
    files.sort();
    Ok(files)
}

/// Recursive directory copy skipping the ignore set.
fn copy_tree(
    source: &Path,
    target: &Path,
    extra_ignore: &Option<String>,
) -> Result<(), StorageError> {
    if !source.is_dir() {
        // In-memory flows have no directory to snapshot; the resolved DAG
        // and tools manifest are still written by the caller.
        return Ok(());
    }
    std::fs::create_dir_all(target).map_err(|e| StorageError::io(target.display(), e))?;
    let entries = std::fs::read_dir(source).map_err(|e| StorageError::io(source.display(), e))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        if SNAPSHOT_IGNORE.contains(&name.as_str()) || Some(&name) == extra_ignore.as_ref() {
            continue;
        }
        let source_path = entry.path();
        let target_path = target.join(&name);
        if source_path.is_dir() {
            copy_tree(&source_path, &target_path, extra_ignore)?;
        } else {
            std::fs::copy(&source_path, &target_path)
                .map_err(|e| StorageError::io(source_path.display(), e))?;
        }
    }
    Ok(())
}
