//! Built-in tool adapters

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use specwright_e2e::{AutomationDriver, AutomationSpec, TestStep};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::ToolError;
use crate::heuristics;
use crate::registry::{ToolAdapter, ToolMetadata, ToolOutput, ToolRegistry};

pub const FETCH_DOC_TOOL: &str = "filesystem.fetch_doc";
pub const PROBE_SELECTORS_TOOL: &str = "browser.probe_selectors";

fn string_input<'a>(inputs: &'a Map<String, Value>, name: &str) -> Result<&'a str, ToolError> {
    inputs
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::invalid_input(format!("missing string input '{}'", name)))
}

/// Reads a UTF-8 document below a root directory
pub struct FetchDocTool {
    root: PathBuf,
}

impl FetchDocTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve `relative` under the root, refusing anything that escapes it
    fn resolve(&self, relative: &str) -> Result<PathBuf, ToolError> {
        let requested = Path::new(relative);
        if requested.is_absolute()
            || requested
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(ToolError::invalid_input(format!(
                "path '{}' escapes the document root",
                relative
            )));
        }
        Ok(self.root.join(requested))
    }
}

#[async_trait]
impl ToolAdapter for FetchDocTool {
    async fn invoke(&self, inputs: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let relative = string_input(inputs, "path")?;
        let path = self.resolve(relative)?;

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::execution(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), bytes = content.len(), "Fetched document");

        Ok(ToolOutput::new()
            .with("bytes", json!(content.len()))
            .with("path", json!(relative))
            .with("content", Value::String(content))
            .with_evidence(format!("file://{}", path.display())))
    }
}

/// Snapshots a page and ranks selectors for an element description
pub struct ProbeSelectorsTool {
    driver: Arc<dyn AutomationDriver>,
    min_confidence: f64,
    limit: usize,
}

impl ProbeSelectorsTool {
    pub fn new(driver: Arc<dyn AutomationDriver>, min_confidence: f64, limit: usize) -> Self {
        Self {
            driver,
            min_confidence,
            limit,
        }
    }
}

#[async_trait]
impl ToolAdapter for ProbeSelectorsTool {
    async fn invoke(&self, inputs: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let url = string_input(inputs, "url")?;
        let hint = string_input(inputs, "hint")?;

        let probe = AutomationSpec {
            id: "probe".to_string(),
            title: format!("Probe {}", url),
            requirement_ids: Vec::new(),
            tags: Vec::new(),
            timeout_s: None,
            viewport: specwright_e2e::spec::Viewport {
                width: 1280,
                height: 720,
            },
            steps: vec![TestStep::Navigate {
                url: url.to_string(),
                wait_for_selector: None,
            }],
        };
        let snapshot = self
            .driver
            .snapshot(&probe, url)
            .await
            .map_err(|e| ToolError::execution(e.to_string()))?;

        let ranked = heuristics::rank(hint, &snapshot, self.min_confidence, self.limit);
        let selectors: Vec<Value> = ranked
            .iter()
            .map(|c| json!({ "selector": c.selector, "confidence": c.confidence, "source": c.source }))
            .collect();
        let best = ranked.first().map(|c| json!(c.selector)).unwrap_or(Value::Null);

        Ok(ToolOutput::new()
            .with("selectors", Value::Array(selectors))
            .with("best", best)
            .with("elements", json!(snapshot.elements.len())))
    }
}

/// Registry holding the built-in adapters
pub fn builtin_registry(
    doc_root: impl Into<PathBuf>,
    driver: Arc<dyn AutomationDriver>,
    min_confidence: f64,
    max_candidates: usize,
) -> specwright_common::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(
        FETCH_DOC_TOOL,
        Arc::new(FetchDocTool::new(doc_root)),
        ToolMetadata::new("Read a document below the plan's document root"),
    )?;
    registry.register(
        PROBE_SELECTORS_TOOL,
        Arc::new(ProbeSelectorsTool::new(driver, min_confidence, max_candidates)),
        ToolMetadata::new("Rank selectors on a live page for an element hint").max_concurrency(2),
    )?;
    Ok(registry)
}
