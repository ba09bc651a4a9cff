//! DAG model: tasks, dependency edges, and load-time validation.
//!
//! The graph is an explicit adjacency structure (petgraph arena keyed by
//! task id), so cycle detection is a plain traversal at build time and
//! tasks never hold mutual references to each other.

use crate::error::{Error, Result};
use crate::schedule::{ScheduleConfig, ScheduleInterval};
use chrono::{DateTime, Duration, Utc};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Policy determining when a task becomes runnable based on the states of
/// its immediate upstream instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRule {
    AllSuccess,
    AllFailed,
    AllDone,
    OneSuccess,
    OneFailed,
}

impl Default for TriggerRule {
    fn default() -> Self {
        TriggerRule::AllSuccess
    }
}

/// A task as resolved at DAG build time. Immutable after load; defaults
/// have already been merged in.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    /// Operator kind looked up in the operator registry at dispatch time.
    pub kind: String,
    /// Payload for command-running operators.
    pub command: Option<String>,
    pub trigger_rule: TriggerRule,
    pub depends_on_past: bool,
    /// Number of retries after the first attempt fails.
    pub retries: u32,
    pub retry_delay: Duration,
    /// Named resource pool; `None` means unconstrained.
    pub pool: Option<String>,
    pub priority_weight: i32,
}

/// DAG-level defaults applied to every task that leaves the field unset.
/// Merged exactly once at build time, never at call time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDefaults {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub trigger_rule: Option<TriggerRule>,
    #[serde(default)]
    pub depends_on_past: Option<bool>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub priority_weight: Option<i32>,
}

/// User-authored task definition (YAML).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub trigger_rule: Option<TriggerRule>,
    #[serde(default)]
    pub depends_on_past: Option<bool>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub priority_weight: Option<i32>,
}

/// User-authored DAG definition (YAML).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagDefinition {
    pub id: String,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    pub start_date: DateTime<Utc>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub defaults: TaskDefaults,
    pub tasks: Vec<TaskDefinition>,
}

fn default_concurrency() -> usize {
    16
}

/// Static definition of tasks and dependency edges, plus schedule
/// metadata. Cycle presence is a load-time error.
#[derive(Debug, Clone)]
pub struct Dag {
    pub id: String,
    pub schedule: ScheduleInterval,
    pub start_date: DateTime<Utc>,
    /// Max simultaneously active task instances across the whole DAG.
    pub concurrency: usize,
    pub paused: bool,
    graph: DiGraph<Task, ()>,
    id_to_index: HashMap<String, NodeIndex>,
}

impl Dag {
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.id_to_index
            .get(task_id)
            .and_then(|&idx| self.graph.node_weight(idx))
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Immediate upstream tasks of `task_id`.
    pub fn upstream(&self, task_id: &str) -> Vec<&Task> {
        self.neighbors(task_id, Direction::Incoming)
    }

    /// Immediate downstream tasks of `task_id`.
    pub fn downstream(&self, task_id: &str) -> Vec<&Task> {
        self.neighbors(task_id, Direction::Outgoing)
    }

    /// Tasks with no upstream dependencies.
    pub fn roots(&self) -> Vec<&Task> {
        self.boundary(Direction::Incoming)
    }

    /// Terminal tasks with no downstream dependents. DagRun state is the
    /// aggregate of these tasks' instance states.
    pub fn leaves(&self) -> Vec<&Task> {
        self.boundary(Direction::Outgoing)
    }

    /// Tasks in dependency order.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        toposort(&self.graph, None)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&idx| self.graph.node_weight(idx))
                    .collect()
            })
            .map_err(|_| Error::DagCycle(self.id.clone()))
    }

    fn neighbors(&self, task_id: &str, dir: Direction) -> Vec<&Task> {
        self.id_to_index
            .get(task_id)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, dir)
                    .filter_map(|n| self.graph.node_weight(n))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn boundary(&self, dir: Direction) -> Vec<&Task> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph.neighbors_directed(idx, dir).count() == 0)
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }
}

/// Builder for constructing validated DAGs from definitions.
pub struct DagBuilder;

impl DagBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build a DAG from a definition, merging defaults and validating the
    /// schedule, edge references, and acyclicity.
    pub fn build(&self, definition: &DagDefinition) -> Result<Dag> {
        if definition.tasks.is_empty() {
            return Err(Error::EmptyDag(definition.id.clone()));
        }

        let schedule = ScheduleInterval::parse(&definition.id, &definition.schedule)?;

        let mut graph = DiGraph::new();
        let mut id_to_index = HashMap::new();

        for task_def in &definition.tasks {
            if id_to_index.contains_key(&task_def.id) {
                return Err(Error::DuplicateTask {
                    dag: definition.id.clone(),
                    task: task_def.id.clone(),
                });
            }
            let task = merge_defaults(task_def, &definition.defaults);
            let idx = graph.add_node(task);
            id_to_index.insert(task_def.id.clone(), idx);
        }

        for task_def in &definition.tasks {
            let task_idx = id_to_index[&task_def.id];
            for upstream in &task_def.depends_on {
                let upstream_idx =
                    id_to_index
                        .get(upstream)
                        .ok_or_else(|| Error::UnknownDependency {
                            dag: definition.id.clone(),
                            task: task_def.id.clone(),
                            upstream: upstream.clone(),
                        })?;
                graph.add_edge(*upstream_idx, task_idx, ());
            }
        }

        let dag = Dag {
            id: definition.id.clone(),
            schedule,
            start_date: definition.start_date,
            concurrency: definition.concurrency,
            paused: definition.paused,
            graph,
            id_to_index,
        };

        // Verify no cycles
        dag.topological_order()?;

        Ok(dag)
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_defaults(def: &TaskDefinition, defaults: &TaskDefaults) -> Task {
    Task {
        id: def.id.clone(),
        kind: def
            .kind
            .clone()
            .or_else(|| defaults.kind.clone())
            .unwrap_or_else(|| "noop".to_string()),
        command: def.command.clone(),
        trigger_rule: def
            .trigger_rule
            .or(defaults.trigger_rule)
            .unwrap_or_default(),
        depends_on_past: def
            .depends_on_past
            .or(defaults.depends_on_past)
            .unwrap_or(false),
        retries: def.retries.or(defaults.retries).unwrap_or(0),
        retry_delay: Duration::seconds(
            def.retry_delay_secs
                .or(defaults.retry_delay_secs)
                .unwrap_or(300) as i64,
        ),
        pool: def.pool.clone().or_else(|| defaults.pool.clone()),
        priority_weight: def
            .priority_weight
            .or(defaults.priority_weight)
            .unwrap_or(1),
    }
}
