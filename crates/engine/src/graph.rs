//! Task graph model
//!
//! A [`TaskGraph`] is built once per run from a [`Plan`]. Edges come from
//! variable flow (a task reading a variable depends on the task producing
//! it) plus explicit `depends_on` ordering. Construction rejects cycles,
//! ambiguous or missing producers and unknown tools, so the dispatcher only
//! ever sees a well-formed DAG.

use specwright_common::TaskStatus;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::GraphError;
use crate::plan::{InputBinding, Plan, QualityCheck};
use crate::registry::{ToolAdapter, ToolRegistry};
use crate::resolver::{VariableDecl, VariableResolver};
use crate::retry::RetryPolicy;
use crate::state::ExecutionState;

/// Defaults applied to tasks that do not declare their own
#[derive(Debug, Clone)]
pub struct GraphDefaults {
    pub task_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for GraphDefaults {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// One tool task. Immutable once the graph is built.
#[derive(Clone)]
pub struct TaskNode {
    pub id: String,
    pub tool_name: String,
    pub declared_inputs: BTreeMap<String, InputBinding>,
    pub declared_outputs: BTreeSet<String>,
    pub timeout: Duration,
    pub quality_gate: Vec<QualityCheck>,
    pub retry_policy: RetryPolicy,
    /// Position in the plan; ready tasks are dispatched in this order
    pub order: usize,
    /// Cap shared by all tasks using this tool
    pub max_concurrency: Option<usize>,
    dependencies: BTreeSet<String>,
    adapter: Arc<dyn ToolAdapter>,
}

impl TaskNode {
    /// Ids of the tasks this one waits for
    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub fn adapter(&self) -> Arc<dyn ToolAdapter> {
        Arc::clone(&self.adapter)
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("tool_name", &self.tool_name)
            .field("declared_outputs", &self.declared_outputs)
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Directed acyclic graph of tasks
#[derive(Debug, Clone)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    index: HashMap<String, usize>,
    dependents: HashMap<String, BTreeSet<String>>,
    topo_order: Vec<String>,
    catalog: Vec<VariableDecl>,
}

impl TaskGraph {
    /// Build a graph with default timeouts and retry policy
    pub fn build(plan: &Plan, registry: &ToolRegistry) -> Result<Self, GraphError> {
        Self::build_with(plan, registry, &GraphDefaults::default())
    }

    pub fn build_with(
        plan: &Plan,
        registry: &ToolRegistry,
        defaults: &GraphDefaults,
    ) -> Result<Self, GraphError> {
        // Variable catalog
        let mut catalog: BTreeMap<String, VariableDecl> = BTreeMap::new();
        for spec in &plan.variables {
            catalog.insert(spec.name.clone(), VariableDecl::from_spec(spec)?);
        }

        // Task ids and producers
        let mut index = HashMap::new();
        let mut producers: HashMap<&str, &str> = HashMap::new();
        for (i, task) in plan.tasks.iter().enumerate() {
            if index.insert(task.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateTask(task.id.clone()));
            }
            for output in &task.outputs {
                if let Some(first) = producers.insert(output.as_str(), task.id.as_str()) {
                    return Err(GraphError::DuplicateOutput {
                        variable: output.clone(),
                        first: first.to_string(),
                        second: task.id.clone(),
                    });
                }
                match catalog.get_mut(output) {
                    Some(decl) => decl.source_task_id = Some(task.id.clone()),
                    None => {
                        catalog.insert(output.clone(), VariableDecl::implicit(output, &task.id));
                    }
                }
            }
        }

        // Nodes and edges
        let mut nodes = Vec::with_capacity(plan.tasks.len());
        let mut dependents: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (order, task) in plan.tasks.iter().enumerate() {
            let tool = registry.get(&task.tool).ok_or_else(|| GraphError::UnknownTool {
                task: task.id.clone(),
                tool: task.tool.clone(),
            })?;

            let mut dependencies = BTreeSet::new();
            for binding in task.inputs.values() {
                for variable in binding.references() {
                    let producer = producers.get(variable.as_str()).ok_or_else(|| {
                        GraphError::UnboundInput {
                            task: task.id.clone(),
                            variable: variable.clone(),
                        }
                    })?;
                    dependencies.insert(producer.to_string());
                }
            }
            for dep in &task.depends_on {
                if !index.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                dependencies.insert(dep.clone());
            }
            for dep in &dependencies {
                dependents.entry(dep.clone()).or_default().insert(task.id.clone());
            }

            let timeout = task
                .timeout_s
                .map(Duration::from_secs)
                .or(tool.metadata.default_timeout)
                .unwrap_or(defaults.task_timeout);

            nodes.push(TaskNode {
                id: task.id.clone(),
                tool_name: task.tool.clone(),
                declared_inputs: task.inputs.clone(),
                declared_outputs: task.outputs.iter().cloned().collect(),
                timeout,
                quality_gate: task.quality.clone(),
                retry_policy: task.retry.clone().unwrap_or_else(|| defaults.retry.clone()),
                order,
                max_concurrency: tool.metadata.max_concurrency,
                dependencies,
                adapter: Arc::clone(&tool.adapter),
            });
        }

        let mut graph = Self {
            nodes,
            index,
            dependents,
            topo_order: Vec::new(),
            catalog: catalog.into_values().collect(),
        };
        graph.topo_order = graph.topological_sort()?;

        debug!(
            "Built task graph: {} tasks, {} variables",
            graph.nodes.len(),
            graph.catalog.len()
        );
        Ok(graph)
    }

    /// Kahn's algorithm, breaking ties by declaration order
    fn topological_sort(&self) -> Result<Vec<String>, GraphError> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut queue: VecDeque<usize> = (0..self.nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(i) = queue.pop_front() {
            let node = &self.nodes[i];
            order.push(node.id.clone());
            let mut released = Vec::new();
            for dependent in self.dependents_of(&node.id) {
                let j = self.index[dependent.as_str()];
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    released.push(j);
                }
            }
            released.sort_unstable();
            queue.extend(released);
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            Err(GraphError::Cycle {
                path: self.find_cycle().unwrap_or_default(),
            })
        }
    }

    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for node in &self.nodes {
            if !visited.contains(node.id.as_str()) {
                if let Some(cycle) = self.dfs_cycle(&node.id, &mut visited, &mut rec_stack, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs_cycle<'a>(
        &'a self,
        id: &'a str,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(id);
        rec_stack.insert(id);
        path.push(id);

        if let Some(node) = self.node(id) {
            for dep in &node.dependencies {
                if !visited.contains(dep.as_str()) {
                    if let Some(cycle) = self.dfs_cycle(dep, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(dep.as_str()) {
                    let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.clone());
                    // Dependencies point backwards; report in execution order.
                    cycle.reverse();
                    return Some(cycle);
                }
            }
        }

        rec_stack.remove(id);
        path.pop();
        None
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Override one task's timeout after construction
    pub(crate) fn set_timeout(&mut self, id: &str, timeout: Duration) {
        if let Some(&i) = self.index.get(id) {
            self.nodes[i].timeout = timeout;
        }
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// A topological order consistent with declaration order
    pub fn topological_order(&self) -> &[String] {
        &self.topo_order
    }

    /// Direct dependents of a task
    pub fn dependents_of(&self, id: &str) -> impl Iterator<Item = &String> {
        self.dependents.get(id).into_iter().flatten()
    }

    /// Every task reachable downstream of `id`, in declaration order
    pub fn transitive_dependents(&self, id: &str) -> Vec<&TaskNode> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&String> = self.dependents_of(id).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.as_str()) {
                stack.extend(self.dependents_of(next));
            }
        }
        self.nodes.iter().filter(|n| seen.contains(n.id.as_str())).collect()
    }

    /// Pending nodes whose dependencies all succeeded or were skipped, in
    /// declaration order
    pub fn ready_set(&self, state: &ExecutionState) -> Vec<&TaskNode> {
        self.nodes
            .iter()
            .filter(|n| state.status(&n.id) == Some(TaskStatus::Pending))
            .filter(|n| {
                n.dependencies
                    .iter()
                    .all(|d| state.status(d).map(|s| s.unblocks_dependents()).unwrap_or(false))
            })
            .collect()
    }

    /// Nodes with no dependencies at all
    pub fn roots(&self) -> Vec<&TaskNode> {
        self.nodes.iter().filter(|n| n.dependencies.is_empty()).collect()
    }

    /// Variable catalog including implicit output declarations
    pub fn catalog(&self) -> &[VariableDecl] {
        &self.catalog
    }

    /// Fresh binding table for a run of this graph
    pub fn new_resolver(&self) -> VariableResolver {
        VariableResolver::new(self.catalog.iter().cloned())
    }
}
