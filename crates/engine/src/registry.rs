//! Tool adapter registry
//!
//! Maps tool identifiers to adapter implementations. Task graphs resolve
//! their tools here at build time, so an unknown tool never reaches the
//! dispatcher.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ToolError;

/// Values produced by one tool invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub values: Map<String, Value>,
    pub evidence_uris: Vec<String>,
}

impl ToolOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }

    pub fn with_evidence(mut self, uri: impl Into<String>) -> Self {
        self.evidence_uris.push(uri.into());
        self
    }
}

/// External capability invoked by tasks.
///
/// The dispatcher may call `invoke` more than once for the same logical
/// attempt under retry; implementations must not duplicate side effects.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    async fn invoke(&self, inputs: &Map<String, Value>) -> Result<ToolOutput, ToolError>;
}

/// Static description of a registered tool
#[derive(Debug, Clone, Default)]
pub struct ToolMetadata {
    pub description: String,
    /// Cap on simultaneous invocations of this tool within one dispatch
    pub max_concurrency: Option<usize>,
    /// Timeout applied when a task does not declare one
    pub default_timeout: Option<Duration>,
}

impl ToolMetadata {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}

/// A registered adapter with its metadata
#[derive(Clone)]
pub struct RegisteredTool {
    pub name: String,
    pub adapter: Arc<dyn ToolAdapter>,
    pub metadata: ToolMetadata,
}

impl fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("name", &self.name)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Tool registry
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter; a name can only be registered once
    pub fn register(
        &mut self,
        name: &str,
        adapter: Arc<dyn ToolAdapter>,
        metadata: ToolMetadata,
    ) -> specwright_common::Result<()> {
        if self.tools.contains_key(name) {
            return Err(specwright_common::Error::AlreadyExists {
                kind: "tool".to_string(),
                id: name.to_string(),
            });
        }
        self.tools.insert(
            name.to_string(),
            RegisteredTool {
                name: name.to_string(),
                adapter,
                metadata,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

type ToolFn = dyn Fn(&Map<String, Value>) -> Result<ToolOutput, ToolError> + Send + Sync;

/// Adapter backed by a synchronous closure
pub struct FnTool {
    f: Box<ToolFn>,
}

impl FnTool {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<ToolOutput, ToolError> + Send + Sync + 'static,
    {
        Self { f: Box::new(f) }
    }

    pub fn arc<F>(f: F) -> Arc<dyn ToolAdapter>
    where
        F: Fn(&Map<String, Value>) -> Result<ToolOutput, ToolError> + Send + Sync + 'static,
    {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl ToolAdapter for FnTool {
    async fn invoke(&self, inputs: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
        (self.f)(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_invoke() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                "echo",
                FnTool::arc(|inputs| Ok(ToolOutput::new().with("echo", json!(inputs.clone())))),
                ToolMetadata::new("echo inputs").max_concurrency(2),
            )
            .unwrap();

        let tool = registry.get("echo").unwrap();
        assert_eq!(tool.metadata.max_concurrency, Some(2));

        let mut inputs = Map::new();
        inputs.insert("a".into(), json!(1));
        let out = tool.adapter.invoke(&inputs).await.unwrap();
        assert_eq!(out.values["echo"], json!({"a": 1}));
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = ToolRegistry::new();
        let tool = FnTool::arc(|_| Ok(ToolOutput::new()));
        registry.register("t", tool.clone(), ToolMetadata::default()).unwrap();
        assert!(registry.register("t", tool, ToolMetadata::default()).is_err());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["t"]);
    }
}
