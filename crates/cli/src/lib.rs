//! Specwright CLI
//!
//! Command-line interface for running campaigns, validating plans and
//! inspecting the selector learning store.

pub mod commands;
pub mod output;
