//! Automation driver capability

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::DriverResult;
use crate::spec::AutomationSpec;

/// How a spec should be executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Execute every step
    Full,
    /// Resolve selectors against the live page without mutating steps or
    /// capturing screenshots
    DryRun,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Full => write!(f, "full"),
            RunMode::DryRun => write!(f, "dry_run"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Passed,
    Failed,
}

/// Outcome of one driver invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverReport {
    pub status: DriverStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub evidence_uris: Vec<String>,
    /// Raw error payload reported by the driver; drift detection reads it
    #[serde(default)]
    pub error: Option<String>,
}

impl DriverReport {
    pub fn passed(duration_ms: u64) -> Self {
        Self {
            status: DriverStatus::Passed,
            duration_ms,
            evidence_uris: Vec::new(),
            error: None,
        }
    }

    pub fn failed(duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            status: DriverStatus::Failed,
            duration_ms,
            evidence_uris: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn with_evidence(mut self, uris: Vec<String>) -> Self {
        self.evidence_uris = uris;
        self
    }

    pub fn is_passed(&self) -> bool {
        self.status == DriverStatus::Passed
    }
}

/// One element captured from a page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementInfo {
    pub tag: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub text: String,
    /// Ancestor tag names, nearest first
    #[serde(default)]
    pub ancestors: Vec<String>,
    /// Position among same-tag siblings, zero based
    #[serde(default)]
    pub index: usize,
}

impl ElementInfo {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Structural snapshot of a page used for selector healing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub elements: Vec<ElementInfo>,
}

/// External automation capability invoked by the suite runner
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Driver name for logs and reports
    fn name(&self) -> &str;

    /// Execute a spec. A failing test is `Ok` with a failed report; `Err` is
    /// reserved for the driver itself being unusable.
    async fn run(&self, spec: &AutomationSpec, mode: RunMode) -> DriverResult<DriverReport>;

    /// Capture the structure of the page at `url` as the spec would see it
    async fn snapshot(&self, spec: &AutomationSpec, url: &str) -> DriverResult<PageSnapshot>;
}
