//! Specwright execution engine
//!
//! Turns a campaign plan into a dependency graph of tool invocations,
//! dispatches it with bounded concurrency and retries, runs the resulting
//! automation suite, and repairs broken selectors before reporting.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ RunManager     start / check / cancel / wait, callbacks      │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Campaign       stage sequencing and report assembly          │
//! ├───────────────┬──────────────────────┬───────────────────────┤
//! │ Dispatcher    │ SuiteRunner          │ DriftDetector, Healer │
//! │  step() core  │  flake probe reruns  │  learned + heuristic  │
//! ├───────────────┴──────────────────────┴───────────────────────┤
//! │ TaskGraph, VariableResolver, ToolRegistry, RetryPolicy       │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod callback;
pub mod campaign;
pub mod config;
pub mod dispatcher;
pub mod drift;
pub mod error;
pub mod graph;
pub mod healer;
pub mod heuristics;
pub mod plan;
pub mod quality;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod run_manager;
pub mod state;
pub mod suite;
pub mod tools;

pub use callback::{CallbackClient, CallbackPayload};
pub use campaign::{Campaign, Stage};
pub use config::EngineConfig;
pub use dispatcher::{DispatchOutcome, Dispatcher, RunControl};
pub use drift::{DriftDetector, DriftSignal};
pub use error::{CampaignError, CampaignResult, GraphError, ToolError, ValidationError};
pub use graph::TaskGraph;
pub use healer::{HealAttempt, HealResult, Healer};
pub use plan::{InputBinding, Plan, TaskSpec};
pub use registry::{FnTool, ToolAdapter, ToolMetadata, ToolOutput, ToolRegistry};
pub use report::RunReport;
pub use resolver::{VarType, VariableResolver};
pub use retry::RetryPolicy;
pub use run_manager::{RunManager, RunRequest, RunSnapshot};
pub use suite::{SingleRun, SuiteReport, SuiteRunner, TestRecord};
