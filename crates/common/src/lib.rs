//! Specwright Common Library
//!
//! Shared data model, error type and the durable learning store used by the
//! execution engine and the automation driver.

pub mod db;
pub mod error;
pub mod template;
pub mod types;

pub use db::{LearningStore, RankedSelector, SqliteLearningStore};
pub use error::{Error, Result};
pub use types::*;

/// Specwright version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".specwright")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
