//! Locator drift detection
//!
//! A failed test is treated as drift when its error reads like a missing or
//! ambiguous element rather than an environment problem. Network failures
//! never count: healing a selector cannot fix an unreachable host.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use specwright_common::{context_key, ErrorKind, ExecutionResult, TaskStatus};
use specwright_e2e::AutomationSpec;
use tracing::debug;

static LOCATOR_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(locator|selector|waiting for|no element|element not found|not attached|strict mode violation|resolved to \d+ elements|nosuchelement)",
    )
    .expect("locator marker pattern")
});

static NETWORK_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(net::ERR_|ECONNREFUSED|ENOTFOUND|ECONNRESET|getaddrinfo|socket hang up|NS_ERROR_|connection refused)",
    )
    .expect("network marker pattern")
});

/// Quoted selector in a driver message, e.g. `locator('#submit')` or
/// `waiting for selector "#submit"`
static QUOTED_SELECTOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(?:locator|selector|waiting for)\s*\(?\s*["'`]([^"'`]+)["'`]"#)
        .expect("selector extraction pattern")
});

/// A failure attributed to a drifted locator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftSignal {
    pub test_id: String,
    pub selector: String,
    /// Page the selector was used on
    pub page: String,
    pub context_key: String,
    pub message: String,
}

/// Whether an error message looks like a locator failure
pub fn is_locator_failure(message: &str) -> bool {
    LOCATOR_MARKERS.is_match(message) && !is_network_failure(message)
}

pub fn is_network_failure(message: &str) -> bool {
    NETWORK_MARKERS.is_match(message)
}

/// Selector named in a driver error message, if any
pub fn extract_selector(message: &str) -> Option<String> {
    QUOTED_SELECTOR
        .captures(message)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Whether `selector` appears in `message` wrapped in quotes or parens
fn mentions(message: &str, selector: &str) -> bool {
    if selector.is_empty() {
        return false;
    }
    [('\'', '\''), ('"', '"'), ('`', '`'), ('(', ')')]
        .iter()
        .any(|(open, close)| message.contains(&format!("{open}{selector}{close}")))
}

#[derive(Debug, Clone, Default)]
pub struct DriftDetector;

impl DriftDetector {
    pub fn new() -> Self {
        Self
    }

    /// Attribute a failed test result to one of the spec's selectors
    pub fn detect(&self, result: &ExecutionResult, spec: &AutomationSpec) -> Option<DriftSignal> {
        if result.status != TaskStatus::Failed {
            return None;
        }
        let error = result.error.as_ref()?;
        if error.kind != ErrorKind::Execution || !is_locator_failure(&error.message) {
            return None;
        }

        let selectors = spec.selectors();
        let selector = match extract_selector(&error.message) {
            Some(extracted) if selectors.contains(&extracted.as_str()) => extracted,
            extracted => {
                // Only whole, delimited mentions count, so `a` is not found in
                // "waiting for navigation"; the longest wins so that `#a .b`
                // is not reported as `#a`.
                let Some(known) = selectors
                    .into_iter()
                    .filter(|s| mentions(&error.message, s))
                    .max_by_key(|s| s.len())
                else {
                    debug!(
                        test_id = %spec.id,
                        selector = ?extracted,
                        "Drifted selector is not used by the spec"
                    );
                    return None;
                };
                known.to_string()
            }
        };

        let page = spec.page_for_selector(&selector).unwrap_or_default().to_string();
        Some(DriftSignal {
            test_id: spec.id.clone(),
            context_key: context_key(&page, &selector),
            selector,
            page,
            message: error.message.clone(),
        })
    }
}
