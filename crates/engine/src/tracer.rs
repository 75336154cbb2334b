//! Per-node-execution trace capture.
//!
//! A `Tracer` is created when a node invocation starts and consumed when it
//! ends; it is owned by the execution context for that node, so there is no
//! process-global tracing state. `push` opens a frame, `pop` closes the top
//! frame and attaches it to its parent (or to the completed roots).

use serde_json::Value;
use tracing::warn;

use crate::trace::{now_seconds, Trace};

pub struct Tracer {
    run_id: String,
    node_name: Option<String>,
    traces: Vec<Trace>,
    stack: Vec<Trace>,
}

impl Tracer {
    pub fn start_tracing(run_id: impl Into<String>, node_name: Option<String>) -> Self {
        Self {
            run_id: run_id.into(),
            node_name,
            traces: Vec::new(),
            stack: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Open a new frame as a child of the current top of stack.
    ///
    /// Input values must already be scrubbed of secrets by the caller; the
    /// tracer serializes whatever it is handed.
    pub fn push(&mut self, mut trace: Trace) {
        if trace.start_time == 0.0 {
            trace.start_time = now_seconds();
        }
        if self.stack.is_empty() {
            trace.node_name = self.node_name.clone();
        }
        self.stack.push(trace);
    }

    /// Close the top frame with the given output/error.
    pub fn pop(&mut self, output: Option<Value>, error: Option<Value>) {
        let Some(mut trace) = self.stack.pop() else {
            warn!(run_id = %self.run_id, "tracer pop with no active frame");
            return;
        };
        trace.end_time = Some(now_seconds());
        trace.output = output;
        trace.error = error;
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(trace),
            None => self.traces.push(trace),
        }
    }

    /// Finish tracing and return the completed root traces. Frames left
    /// open (a tool that panicked mid-call tree) are closed without output.
    pub fn end_tracing(mut self) -> Vec<Trace> {
        while !self.stack.is_empty() {
            self.pop(None, None);
        }
        self.traces
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TraceType;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn nested_frames_build_a_tree() {
        let mut tracer = Tracer::start_tracing("run1_fetch_0", Some("fetch".into()));
        tracer.push(Trace::new("outer", TraceType::Tool, BTreeMap::new()));
        tracer.push(Trace::new("inner", TraceType::Function, BTreeMap::new()));
        tracer.pop(Some(json!("inner-out")), None);
        tracer.pop(Some(json!("outer-out")), None);

        let traces = tracer.end_tracing();
        assert_eq!(traces.len(), 1);
        let root = &traces[0];
        assert_eq!(root.name, "outer");
        assert_eq!(root.node_name.as_deref(), Some("fetch"));
        assert_eq!(root.output, Some(json!("outer-out")));
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.children[0].name, "inner");
        // Child frames never carry the node name.
        assert_eq!(root.children[0].node_name, None);
        assert!(root.end_time.unwrap() >= root.start_time);
    }

    #[test]
    fn error_is_recorded_on_the_frame() {
        let mut tracer = Tracer::start_tracing("run1_n_0", Some("n".into()));
        tracer.push(Trace::new("call", TraceType::Tool, BTreeMap::new()));
        tracer.pop(None, Some(json!({"message": "boom"})));
        let traces = tracer.end_tracing();
        assert_eq!(traces[0].error, Some(json!({"message": "boom"})));
        assert_eq!(traces[0].output, None);
    }

    #[test]
    fn unclosed_frames_are_closed_on_end() {
        let mut tracer = Tracer::start_tracing("run1_n_0", None);
        tracer.push(Trace::new("a", TraceType::Tool, BTreeMap::new()));
        tracer.push(Trace::new("b", TraceType::Tool, BTreeMap::new()));
        let traces = tracer.end_tracing();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].children.len(), 1);
        assert!(traces[0].end_time.is_some());
    }
}
