//! Validate Command
//!
//! Builds the task graph without dispatching anything and checks that every
//! placeholder used by the automation specs names a declared variable.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use specwright_e2e::{AutomationSpec, PlaywrightDriver};
use specwright_engine::{tools, EngineConfig, Plan, TaskGraph};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::output::{self, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct ValidateArgs {
    /// Plan file (YAML or JSON)
    #[arg(short, long)]
    pub plan: PathBuf,

    /// Directory of automation specs to check against the plan
    #[arg(short, long)]
    pub specs: Option<PathBuf>,
}

/// One task, in topological order
#[derive(Debug, Serialize)]
pub struct TaskRow {
    pub order: usize,
    pub task_id: String,
    pub tool: String,
    pub depends_on: Vec<String>,
    pub outputs: Vec<String>,
    pub timeout_s: u64,
    pub max_attempts: u32,
}

impl TableDisplay for TaskRow {
    fn headers() -> Vec<&'static str> {
        vec!["#", "TASK", "TOOL", "DEPENDS ON", "OUTPUTS", "TIMEOUT", "ATTEMPTS"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.order.to_string(),
            self.task_id.clone(),
            self.tool.clone(),
            self.depends_on.join(", "),
            self.outputs.join(", "),
            format!("{}s", self.timeout_s),
            self.max_attempts.to_string(),
        ]
    }
}

/// A spec placeholder no variable declares
#[derive(Debug, Serialize, PartialEq)]
pub struct UnknownPlaceholder {
    pub spec: String,
    pub variable: String,
}

#[derive(Debug, Serialize)]
pub struct Validation {
    pub plan: String,
    pub tasks: Vec<TaskRow>,
    pub variables: usize,
    pub specs: usize,
    pub unknown_placeholders: Vec<UnknownPlaceholder>,
}

/// Graph rows plus placeholders the catalog cannot satisfy
pub fn check(plan: &Plan, graph: &TaskGraph, specs: &[AutomationSpec]) -> Validation {
    let tasks = graph
        .topological_order()
        .iter()
        .filter_map(|id| graph.node(id))
        .enumerate()
        .map(|(i, node)| TaskRow {
            order: i + 1,
            task_id: node.id.clone(),
            tool: node.tool_name.clone(),
            depends_on: node.dependencies().iter().cloned().collect(),
            outputs: node.declared_outputs.iter().cloned().collect(),
            timeout_s: node.timeout.as_secs(),
            max_attempts: node.retry_policy.attempts(),
        })
        .collect();

    let declared: BTreeSet<&str> = graph.catalog().iter().map(|d| d.name.as_str()).collect();
    let unknown_placeholders = specs
        .iter()
        .flat_map(|spec| {
            spec.placeholders()
                .into_iter()
                .filter(|name| !declared.contains(name.as_str()))
                .map(|variable| UnknownPlaceholder {
                    spec: spec.id.clone(),
                    variable,
                })
                .collect::<Vec<_>>()
        })
        .collect();

    Validation {
        plan: plan.name.clone(),
        tasks,
        variables: graph.catalog().len(),
        specs: specs.len(),
        unknown_placeholders,
    }
}

pub async fn execute(args: ValidateArgs, config: &EngineConfig, format: OutputFormat) -> Result<i32> {
    let plan = Plan::from_file(&args.plan)
        .with_context(|| format!("reading plan {}", args.plan.display()))?;
    let specs = super::load_specs(args.specs.as_deref(), None)?;

    // Building the graph never launches a browser
    let driver = Arc::new(PlaywrightDriver::unchecked(super::playwright_config(config)));
    let registry = tools::builtin_registry(
        ".",
        driver,
        config.healing.min_confidence,
        config.healing.max_candidates,
    )?;
    let graph = match TaskGraph::build_with(&plan, &registry, &config.dispatcher.graph_defaults()) {
        Ok(graph) => graph,
        Err(e) => {
            output::print_error(&format!("Plan is invalid: {}", e));
            return Ok(1);
        }
    };

    let validation = check(&plan, &graph, &specs);
    match format {
        OutputFormat::Table => {
            output::print_list(&validation.tasks, format)?;
            for gap in &validation.unknown_placeholders {
                output::print_warning(&format!(
                    "Spec '{}' uses undeclared variable '{}'",
                    gap.spec, gap.variable
                ));
            }
            if validation.unknown_placeholders.is_empty() {
                output::print_success(&format!(
                    "Plan '{}' is valid: {} tasks, {} variables, {} specs",
                    validation.plan,
                    validation.tasks.len(),
                    validation.variables,
                    validation.specs
                ));
            }
        }
        _ => output::print_structured(&validation, format)?,
    }

    Ok(if validation.unknown_placeholders.is_empty() { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use specwright_engine::{FnTool, ToolMetadata, ToolOutput, ToolRegistry};

    #[test]
    fn test_check_orders_tasks_and_flags_placeholders() {
        let plan = Plan::from_yaml(
            r#"
name: login
tasks:
  - id: probe
    tool: noop
    inputs: { url: "${base_url}" }
    outputs: [submit_selector]
  - id: base
    tool: noop
    outputs: [base_url]
"#,
        )
        .unwrap();
        let mut registry = ToolRegistry::new();
        registry
            .register("noop", FnTool::arc(|_| Ok(ToolOutput::new())), ToolMetadata::default())
            .unwrap();
        let graph = TaskGraph::build(&plan, &registry).unwrap();

        let spec = AutomationSpec::from_yaml(
            r##"
id: login
steps:
  - action: navigate
    url: "${base_url}/login"
  - action: click
    selector: "${submit_selector}"
  - action: fill
    selector: "#user"
    value: "${username}"
"##,
        )
        .unwrap();

        let validation = check(&plan, &graph, &[spec]);
        let order: Vec<&str> = validation.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(order, vec!["base", "probe"]);
        assert_eq!(validation.tasks[1].depends_on, vec!["base".to_string()]);
        assert_eq!(
            validation.unknown_placeholders,
            vec![UnknownPlaceholder {
                spec: "login".into(),
                variable: "username".into()
            }]
        );
    }
}
