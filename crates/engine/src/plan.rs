//! Plan input format
//!
//! A plan is the YAML or JSON description of a task graph: a variable
//! catalog plus the tool tasks that produce and consume those variables.
//!
//! ```yaml
//! variables:
//!   - name: login_url
//!     type: string
//!     validation: { pattern: "^https?://" }
//! tasks:
//!   - id: fetch_docs
//!     tool: filesystem.fetch_doc
//!     inputs: { path: "docs/login.md" }
//!     outputs: [login_doc]
//!   - id: probe_login
//!     tool: browser.probe_selectors
//!     inputs:
//!       url: "${login_url}"
//!       hint: { var: login_hint }
//!     outputs: [login_selectors]
//!     quality:
//!       - check: min_items
//!         field: selectors
//!         count: 1
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::GraphError;
use crate::resolver::VarType;
use crate::retry::RetryPolicy;

fn default_true() -> bool {
    true
}

/// A complete plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    pub tasks: Vec<TaskSpec>,
}

/// Variable catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: VarType,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub validation: ValidationSpec,
}

/// Constraints a bound value must satisfy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<Value>>,
    #[serde(default)]
    pub non_empty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_items: Option<usize>,
}

/// One tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputBinding>,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Ordering-only dependencies
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub timeout_s: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub quality: Vec<QualityCheck>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
            depends_on: Vec::new(),
            timeout_s: None,
            retry: None,
            quality: Vec::new(),
        }
    }

    pub fn input(mut self, name: &str, binding: InputBinding) -> Self {
        self.inputs.insert(name.to_string(), binding);
        self
    }

    pub fn output(mut self, name: &str) -> Self {
        self.outputs.push(name.to_string());
        self
    }
}

/// Reference to a variable by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VarRef {
    pub var: String,
}

/// Where a task input comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputBinding {
    /// `{var: name}`
    Variable(VarRef),
    /// Any other JSON value; strings may embed `${name}` placeholders
    Literal(Value),
}

impl InputBinding {
    pub fn var(name: impl Into<String>) -> Self {
        Self::Variable(VarRef { var: name.into() })
    }

    pub fn literal(value: Value) -> Self {
        Self::Literal(value)
    }

    /// Variable names this input reads
    pub fn references(&self) -> Vec<String> {
        match self {
            InputBinding::Variable(r) => vec![r.var.clone()],
            InputBinding::Literal(v) => specwright_common::template::value_placeholders(v)
                .into_iter()
                .collect(),
        }
    }
}

/// Acceptance predicate over a task's outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum QualityCheck {
    /// Field present and not null, blank, or empty
    NonEmpty { field: String },
    /// Field present, any value
    RequiredField { field: String },
    /// At least `count` evidence URIs
    MinEvidence { count: usize },
    /// Field is a list with at least `count` items
    MinItems { field: String, count: usize },
}

impl Plan {
    pub fn from_yaml(text: &str) -> Result<Self, GraphError> {
        serde_yaml::from_str(text).map_err(|e| GraphError::Parse(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, GraphError> {
        serde_json::from_str(text).map_err(|e| GraphError::Parse(e.to_string()))
    }

    /// Load a plan, choosing the format by extension
    pub fn from_file(path: &Path) -> Result<Self, GraphError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GraphError::Parse(format!("{}: {}", path.display(), e)))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_yaml(&text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PLAN: &str = r#"
name: login
variables:
  - name: login_url
    type: string
    validation:
      pattern: "^https?://"
  - name: notes
    required: false
tasks:
  - id: discover
    tool: filesystem.fetch_doc
    inputs:
      path: docs/login.md
    outputs: [login_url]
    retry:
      max_attempts: 5
  - id: probe
    tool: browser.probe_selectors
    inputs:
      url: "${login_url}/form"
      hint: { var: login_hint }
      limits: { max: 3 }
    outputs: [login_selectors]
    depends_on: [discover]
    timeout_s: 30
    quality:
      - check: min_items
        field: selectors
        count: 1
      - check: min_evidence
        count: 1
"#;

    #[test]
    fn test_parse_yaml_plan() {
        let plan = Plan::from_yaml(PLAN).unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.variables[0].var_type, VarType::String);
        assert!(plan.variables[0].required);
        assert!(!plan.variables[1].required);
        assert_eq!(plan.variables[1].var_type, VarType::Any);

        let discover = &plan.tasks[0];
        let retry = discover.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.base_delay_ms, RetryPolicy::default().base_delay_ms);

        let probe = &plan.tasks[1];
        assert_eq!(probe.inputs["hint"], InputBinding::var("login_hint"));
        assert_eq!(probe.inputs["limits"], InputBinding::literal(json!({"max": 3})));
        assert_eq!(probe.quality.len(), 2);
        assert_eq!(probe.timeout_s, Some(30));
    }

    #[test]
    fn test_input_references() {
        let plan = Plan::from_yaml(PLAN).unwrap();
        let probe = &plan.tasks[1];
        assert_eq!(probe.inputs["url"].references(), vec!["login_url".to_string()]);
        assert_eq!(probe.inputs["hint"].references(), vec!["login_hint".to_string()]);
        assert!(probe.inputs["limits"].references().is_empty());
    }

    #[test]
    fn test_parse_json_plan() {
        let plan = Plan::from_json(
            r#"{"tasks":[{"id":"a","tool":"t","inputs":{"n":{"var":"x","extra":1}}}]}"#,
        )
        .unwrap();
        // Extra keys make the object a literal, not a variable reference
        assert!(matches!(plan.tasks[0].inputs["n"], InputBinding::Literal(_)));
    }

    #[test]
    fn test_malformed_plan() {
        assert!(matches!(Plan::from_yaml("tasks: 3"), Err(GraphError::Parse(_))));
    }
}
