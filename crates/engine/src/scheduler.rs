//! Node scheduler — concurrent execution of one line's DAG.
//!
//! Ready nodes are spawned onto the runtime behind a semaphore capped at
//! `min(configured, 16)`. The DAG manager is only ever touched from this
//! task; workers hand back `(node, result)` pairs through the join set. The
//! first node failure aborts everything still in flight and surfaces.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::context::FlowExecutionContext;
use crate::dag::DagManager;
use crate::error::EngineError;
use crate::executor::ResolvedTool;
use crate::models::Node;

/// Hard ceiling on intra-line concurrency.
pub const DEFAULT_CONCURRENCY_FLOW: usize = 16;

pub struct NodeScheduler {
    concurrency: usize,
}

impl NodeScheduler {
    pub fn new(node_concurrency: usize) -> Self {
        Self {
            concurrency: node_concurrency.clamp(1, DEFAULT_CONCURRENCY_FLOW),
        }
    }

    /// Drive the DAG to completion. Returns the completed outputs (bypassed
    /// nodes resolve to `null`) and the bypassed node set.
    pub async fn execute(
        &self,
        tools: &HashMap<String, ResolvedTool>,
        mut dag: DagManager,
        context: &FlowExecutionContext,
    ) -> Result<(HashMap<String, Value>, Vec<Node>), EngineError> {
        info!(concurrency = self.concurrency, "starting node scheduler");
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight: JoinSet<(String, Result<Value, EngineError>)> = JoinSet::new();

        loop {
            // Skip nodes until there is nothing left to bypass; bypassing a
            // node can make its dependents bypassable.
            loop {
                let bypassable = dag.pop_bypassable_nodes();
                if bypassable.is_empty() {
                    break;
                }
                for node in bypassable {
                    context.bypass_node(&node).await;
                }
            }

            // Submit nodes that are ready to run.
            for node in dag.pop_ready_nodes() {
                let resolved = tools
                    .get(&node.name)
                    .cloned()
                    .ok_or_else(|| EngineError::ResolveTool {
                        node: node.name.clone(),
                        tool: node.tool.clone(),
                        message: "tool was not resolved at executor construction".into(),
                        user_error: false,
                    })?;
                let args = dag.get_node_valid_inputs(&node, resolved.tool.signature())?;
                let ctx = context.clone();
                let permit_source = Arc::clone(&semaphore);
                in_flight.spawn(async move {
                    let _permit = permit_source
                        .acquire_owned()
                        .await
                        .expect("scheduler semaphore closed");
                    let name = node.name.clone();
                    let result = ctx.invoke_tool(&node, &resolved, args).await;
                    (name, result)
                });
            }

            if dag.completed() {
                break;
            }

            let Some(joined) = in_flight.join_next().await else {
                return Err(EngineError::NoNodeExecuted);
            };
            match joined {
                Ok((name, Ok(output))) => {
                    dag.complete_nodes(HashMap::from([(name, output)]));
                }
                Ok((name, Err(e))) => {
                    error!(node = %name, "node failed, cancelling remaining nodes");
                    in_flight.shutdown().await;
                    return Err(e);
                }
                Err(join_error) => {
                    in_flight.shutdown().await;
                    return Err(EngineError::Unexpected(format!(
                        "node task aborted: {join_error}"
                    )));
                }
            }
        }

        let mut outputs = dag.completed_outputs().clone();
        let bypassed: Vec<Node> = dag.bypassed_nodes().values().cloned().collect();
        for node in &bypassed {
            outputs.insert(node.name.clone(), Value::Null);
        }
        Ok((outputs, bypassed))
    }
}
