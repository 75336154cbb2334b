//! Registry mapping tool ids to [`Tool`] implementations.

use std::collections::HashMap;
use std::sync::Arc;

use crate::builtin;
use crate::traits::Tool;

/// Name → tool lookup used at executor construction.
///
/// Variant-enabled nodes register distinct entries per variant, so the
/// registry never needs to understand variants itself.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(builtin::TemplateTool::id(), Arc::new(builtin::TemplateTool::new()));
        registry.register(builtin::EchoLlmTool::id(), Arc::new(builtin::EchoLlmTool::new()));
        registry
    }

    pub fn register(&mut self, id: impl Into<String>, tool: Arc<dyn Tool>) {
        self.tools.insert(id.into(), tool);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(id).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
