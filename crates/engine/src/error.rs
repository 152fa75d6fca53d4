//! Error types for the execution engine

use specwright_common::ErrorKind;
use thiserror::Error;

use crate::resolver::VarType;

/// Plan rejected before any execution begins
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Output variable '{variable}' is produced by both '{first}' and '{second}'")]
    DuplicateOutput {
        variable: String,
        first: String,
        second: String,
    },

    #[error("Task '{task}' reads variable '{variable}' which no task produces")]
    UnboundInput { task: String, variable: String },

    #[error("Task '{task}' uses unknown tool '{tool}'")]
    UnknownTool { task: String, tool: String },

    #[error("Duplicate task id '{0}'")]
    DuplicateTask(String),

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Invalid validation rule for '{variable}': {reason}")]
    InvalidValidationRule { variable: String, reason: String },

    #[error("Plan parse error: {0}")]
    Parse(String),
}

/// Variable binding rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Variable '{name}' expects {expected}, got {found}")]
    TypeMismatch {
        name: String,
        expected: VarType,
        found: String,
    },

    #[error("Variable '{name}' violates rule: {rule}")]
    RuleViolation { name: String, rule: String },

    #[error("Variable '{0}' is not declared")]
    Undeclared(String),

    #[error("Variable '{0}' is already bound to a different value")]
    AlreadyBound(String),

    #[error("Task '{task}' did not produce declared output '{name}'")]
    MissingOutput { task: String, name: String },
}

/// Read of a variable that has not been bound
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Variable '{0}' is not bound")]
pub struct Unbound(pub String);

/// Failure reported by a tool adapter
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
    /// Evidence captured before the failure
    pub evidence_uris: Vec<String>,
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Execution,
            message: message.into(),
            evidence_uris: Vec::new(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: message.into(),
            evidence_uris: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, uris: Vec<String>) -> Self {
        self.evidence_uris = uris;
        self
    }
}

/// Campaign-level failure; the run never produced a report
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Driver error: {0}")]
    Driver(#[from] specwright_e2e::DriverError),

    #[error("Store error: {0}")]
    Store(#[from] specwright_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CampaignResult<T> = std::result::Result<T, CampaignError>;
