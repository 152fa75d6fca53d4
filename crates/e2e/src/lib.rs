//! Specwright automation layer
//!
//! This crate owns the boundary between the execution engine and external
//! browser/mobile automation:
//! - Parses declarative YAML automation specs
//! - Defines the [`AutomationDriver`] capability the suite runner calls
//! - Drives Playwright through generated Node scripts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 AutomationDriver (trait)                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │    ├── run(spec, Full | DryRun) -> DriverReport             │
//! │    │     status, duration, evidence URIs, error payload     │
//! │    └── snapshot(spec, url) -> PageSnapshot                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  AutomationSpec (YAML)                                      │
//! │    ├── id, title, requirement_ids, tags, timeout_s          │
//! │    └── steps: navigate | click | fill | type | press |      │
//! │               wait | assert | screenshot | hover |          │
//! │               select | check | uncheck                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod driver;
pub mod error;
pub mod playwright;
pub mod spec;

pub use driver::{AutomationDriver, DriverReport, DriverStatus, ElementInfo, PageSnapshot, RunMode};
pub use error::{DriverError, DriverResult};
pub use playwright::{Browser, PlaywrightConfig, PlaywrightDriver};
pub use spec::{AutomationSpec, TestStep};
