//! Declarative YAML automation specification

use serde::{Deserialize, Serialize};
use serde_json::Value;
use specwright_common::template;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{DriverError, DriverResult};

/// A complete automation spec parsed from YAML.
///
/// Specs are values: healing a selector yields a new spec rather than
/// editing one in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationSpec {
    /// Unique id for this test
    pub id: String,

    /// Human-readable title
    #[serde(default)]
    pub title: String,

    /// Requirements this test covers
    #[serde(default)]
    pub requirement_ids: Vec<String>,

    /// Tags for filtering tests
    #[serde(default)]
    pub tags: Vec<String>,

    /// Per-test timeout; the suite default applies when absent
    #[serde(default)]
    pub timeout_s: Option<u64>,

    /// Viewport size for the browser
    #[serde(default = "default_viewport")]
    pub viewport: Viewport,

    /// Steps to execute in order
    pub steps: Vec<TestStep>,
}

fn default_viewport() -> Viewport {
    Viewport { width: 1280, height: 720 }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// A single step in a test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TestStep {
    /// Navigate to a URL (relative to base)
    Navigate {
        url: String,
        #[serde(default)]
        wait_for_selector: Option<String>,
    },

    /// Click an element
    Click {
        selector: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Fill an input field
    Fill {
        selector: String,
        value: String,
        #[serde(default)]
        clear_first: bool,
    },

    /// Type text with keyboard simulation
    Type {
        selector: String,
        text: String,
        #[serde(default)]
        delay_ms: Option<u64>,
    },

    /// Press a key
    Press {
        #[serde(default)]
        selector: Option<String>,
        key: String,
    },

    /// Wait for an element to reach a state
    Wait {
        selector: String,
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
        #[serde(default)]
        state: WaitState,
    },

    /// Assert something about an element
    Assert {
        selector: String,
        #[serde(default)]
        visible: Option<bool>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        text_contains: Option<String>,
        #[serde(default)]
        attribute: Option<AttributeAssertion>,
        #[serde(default)]
        count: Option<usize>,
    },

    /// Take a screenshot
    Screenshot {
        name: String,
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        full_page: bool,
    },

    /// Hover over an element
    Hover { selector: String },

    /// Select an option from a dropdown
    Select { selector: String, value: String },

    /// Check a checkbox
    Check { selector: String },

    /// Uncheck a checkbox
    Uncheck { selector: String },
}

fn default_wait_timeout() -> u64 {
    5000 // 5 seconds default
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeAssertion {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub contains: Option<String>,
}

impl TestStep {
    /// Selector this step targets, if any
    pub fn selector(&self) -> Option<&str> {
        match self {
            TestStep::Navigate { .. } => None,
            TestStep::Press { selector, .. } | TestStep::Screenshot { selector, .. } => {
                selector.as_deref()
            }
            TestStep::Click { selector, .. }
            | TestStep::Fill { selector, .. }
            | TestStep::Type { selector, .. }
            | TestStep::Wait { selector, .. }
            | TestStep::Assert { selector, .. }
            | TestStep::Hover { selector }
            | TestStep::Select { selector, .. }
            | TestStep::Check { selector }
            | TestStep::Uncheck { selector } => Some(selector),
        }
    }

    fn selector_mut(&mut self) -> Option<&mut String> {
        match self {
            TestStep::Navigate { wait_for_selector, .. } => wait_for_selector.as_mut(),
            TestStep::Press { selector, .. } | TestStep::Screenshot { selector, .. } => {
                selector.as_mut()
            }
            TestStep::Click { selector, .. }
            | TestStep::Fill { selector, .. }
            | TestStep::Type { selector, .. }
            | TestStep::Wait { selector, .. }
            | TestStep::Assert { selector, .. }
            | TestStep::Hover { selector }
            | TestStep::Select { selector, .. }
            | TestStep::Check { selector }
            | TestStep::Uncheck { selector } => Some(selector),
        }
    }

    /// Whether executing this step can change application state
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            TestStep::Click { .. }
                | TestStep::Fill { .. }
                | TestStep::Type { .. }
                | TestStep::Press { .. }
                | TestStep::Select { .. }
                | TestStep::Check { .. }
                | TestStep::Uncheck { .. }
        )
    }

    /// Short label used in logs and generated scripts
    pub fn label(&self) -> String {
        match self {
            TestStep::Navigate { url, .. } => format!("navigate:{}", url),
            TestStep::Click { selector, .. } => format!("click:{}", selector),
            TestStep::Fill { selector, .. } => format!("fill:{}", selector),
            TestStep::Type { selector, .. } => format!("type:{}", selector),
            TestStep::Press { key, .. } => format!("press:{}", key),
            TestStep::Wait { selector, .. } => format!("wait:{}", selector),
            TestStep::Assert { selector, .. } => format!("assert:{}", selector),
            TestStep::Screenshot { name, .. } => format!("screenshot:{}", name),
            TestStep::Hover { selector } => format!("hover:{}", selector),
            TestStep::Select { selector, .. } => format!("select:{}", selector),
            TestStep::Check { selector } => format!("check:{}", selector),
            TestStep::Uncheck { selector } => format!("uncheck:{}", selector),
        }
    }
}

impl AutomationSpec {
    /// Parse a spec from YAML string
    pub fn from_yaml(yaml: &str) -> DriverResult<Self> {
        let spec: Self = serde_yaml::from_str(yaml)?;
        if spec.id.trim().is_empty() {
            return Err(DriverError::SpecParse("spec id must not be empty".to_string()));
        }
        Ok(spec)
    }

    /// Parse a spec from a YAML file
    pub fn from_file(path: &Path) -> DriverResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
            .map_err(|e| DriverError::SpecParse(format!("{}: {}", path.display(), e)))
    }

    /// Load all specs from a directory, sorted by id
    pub fn load_all(dir: &Path) -> DriverResult<Vec<Self>> {
        let mut specs = Vec::new();

        for entry in walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            specs.push(Self::from_file(entry.path())?);
        }

        specs.sort_by(|a, b| a.id.cmp(&b.id));
        for pair in specs.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(DriverError::SpecParse(format!("duplicate spec id '{}'", pair[0].id)));
            }
        }

        Ok(specs)
    }

    /// Filter specs by tag
    pub fn filter_by_tag<'a>(specs: &'a [Self], tag: &str) -> Vec<&'a Self> {
        specs.iter().filter(|s| s.tags.iter().any(|t| t == tag)).collect()
    }

    /// Effective timeout for this test
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_s.map(Duration::from_secs).unwrap_or(default)
    }

    /// Distinct selectors in step order
    pub fn selectors(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for step in &self.steps {
            let candidates = match step {
                TestStep::Navigate { wait_for_selector, .. } => wait_for_selector.as_deref(),
                other => other.selector(),
            };
            if let Some(sel) = candidates {
                if seen.insert(sel) {
                    out.push(sel);
                }
            }
        }
        out
    }

    /// URL of the page a selector is first used on: the most recent
    /// navigation before the first step referencing it.
    pub fn page_for_selector(&self, selector: &str) -> Option<&str> {
        let mut page = None;
        for step in &self.steps {
            if let TestStep::Navigate { url, wait_for_selector } = step {
                page = Some(url.as_str());
                if wait_for_selector.as_deref() == Some(selector) {
                    return page;
                }
                continue;
            }
            if step.selector() == Some(selector) {
                return page;
            }
        }
        None
    }

    /// New spec with every occurrence of `from` replaced by `to`
    pub fn with_selector_replaced(&self, from: &str, to: &str) -> Self {
        let mut patched = self.clone();
        for step in &mut patched.steps {
            if let Some(sel) = step.selector_mut() {
                if sel == from {
                    *sel = to.to_string();
                }
            }
        }
        patched
    }

    /// Placeholder names referenced anywhere in the spec
    pub fn placeholders(&self) -> BTreeSet<String> {
        match serde_json::to_value(self) {
            Ok(value) => template::value_placeholders(&value),
            Err(_) => BTreeSet::new(),
        }
    }

    /// New spec with `${name}` placeholders rendered through `lookup`
    pub fn substitute<F>(&self, mut lookup: F) -> DriverResult<Self>
    where
        F: FnMut(&str) -> Option<Value>,
    {
        let value = serde_json::to_value(self)?;
        let rendered = template::render_value(&value, &mut |name: &str| {
            // Spec fields are text; keep rendered values textual.
            lookup(name).map(|v| match v {
                Value::String(s) => Value::String(s),
                other => Value::String(other.to_string()),
            })
        })
        .map_err(|names| DriverError::Unresolved {
            spec: self.id.clone(),
            names,
        })?;
        Ok(serde_json::from_value(rendered)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    const LOGIN: &str = r#"
id: AT-1
title: Login flow
requirement_ids: [REQ-1]
tags: [auth, smoke]
timeout_s: 30
steps:
  - action: navigate
    url: ${login_path}
    wait_for_selector: '[data-testid="login-page"]'
  - action: fill
    selector: '#username'
    value: ${username}
  - action: click
    selector: button.primary
  - action: navigate
    url: /home
  - action: assert
    selector: button.primary
    visible: true
  - action: screenshot
    name: home
"#;

    #[test]
    fn test_parse_spec() {
        let spec = AutomationSpec::from_yaml(LOGIN).unwrap();
        assert_eq!(spec.id, "AT-1");
        assert_eq!(spec.steps.len(), 6);
        assert_eq!(spec.timeout(Duration::from_secs(5)), Duration::from_secs(30));
        assert_eq!(spec.viewport.width, 1280);
    }

    #[test]
    fn test_empty_id_rejected() {
        let err = AutomationSpec::from_yaml("id: ''\nsteps: []\n").unwrap_err();
        assert!(matches!(err, DriverError::SpecParse(_)));
    }

    #[test]
    fn test_selectors_and_pages() {
        let spec = AutomationSpec::from_yaml(LOGIN).unwrap();
        assert_eq!(
            spec.selectors(),
            vec!["[data-testid=\"login-page\"]", "#username", "button.primary"]
        );
        assert_eq!(spec.page_for_selector("button.primary"), Some("${login_path}"));
        assert_eq!(spec.page_for_selector("#missing"), None);
    }

    #[test]
    fn test_selector_replacement_yields_new_spec() {
        let spec = AutomationSpec::from_yaml(LOGIN).unwrap();
        let patched = spec.with_selector_replaced("button.primary", "[data-qa=submit]");

        assert!(spec.selectors().contains(&"button.primary"));
        assert!(!patched.selectors().contains(&"button.primary"));
        assert_eq!(
            patched.steps.iter().filter(|s| s.selector() == Some("[data-qa=submit]")).count(),
            2
        );
    }

    #[test]
    fn test_substitute_placeholders() {
        let spec = AutomationSpec::from_yaml(LOGIN).unwrap();
        let names: Vec<String> = spec.placeholders().into_iter().collect();
        assert_eq!(names, vec!["login_path".to_string(), "username".to_string()]);

        let rendered = spec
            .substitute(|n| match n {
                "login_path" => Some(json!("/login")),
                "username" => Some(json!("alice")),
                _ => None,
            })
            .unwrap();
        assert!(matches!(&rendered.steps[0], TestStep::Navigate { url, .. } if url == "/login"));
        assert!(rendered.placeholders().is_empty());

        let err = spec.substitute(|_| None).unwrap_err();
        assert!(matches!(err, DriverError::Unresolved { names, .. } if names.len() == 2));
    }

    #[test_case("auth", &["AT-1"] ; "shared tag")]
    #[test_case("smoke", &["AT-1", "AT-2"] ; "tag on both")]
    #[test_case("billing", &[] ; "unknown tag")]
    fn test_filter_by_tag(tag: &str, expected: &[&str]) {
        let login = AutomationSpec::from_yaml(LOGIN).unwrap();
        let search = AutomationSpec::from_yaml("id: AT-2\ntags: [smoke]\nsteps: []\n").unwrap();
        let specs = vec![login, search];
        let ids: Vec<&str> = AutomationSpec::filter_by_tag(&specs, tag)
            .into_iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_mutating_steps() {
        let spec = AutomationSpec::from_yaml(LOGIN).unwrap();
        let mutating: Vec<bool> = spec.steps.iter().map(TestStep::is_mutating).collect();
        assert_eq!(mutating, vec![false, true, true, false, false, false]);
    }
}
