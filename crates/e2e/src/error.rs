//! Error types for automation drivers

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Playwright not found. Install with: npx playwright install")]
    PlaywrightNotFound,

    #[error("Playwright error: {0}")]
    Playwright(String),

    #[error("Automation spec parse error: {0}")]
    SpecParse(String),

    #[error("Unresolved placeholders in spec {spec}: {}", names.join(", "))]
    Unresolved { spec: String, names: Vec<String> },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type DriverResult<T> = Result<T, DriverError>;
