use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::sync::Arc;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;

use crate::engine::flow::{Flow, FlowId, Relation};
use crate::engine::task::{TaskId, TaskState};
use crate::engine::{RankShared, TaskExecution};
use crate::handle::Permission;
use crate::publish::{Leak, PendingFetch};

/// Execution diagnostics of one rank.
///
/// Returned by [`Runtime::finalize`](crate::Runtime::finalize).
#[derive(Debug, Default, Clone, Serialize)]
pub struct Diagnostics {
    /// Timing of every task that ran.
    pub execution_times: HashMap<TaskId, TaskExecution>,
    /// Names of the tasks in `execution_times`.
    pub names: HashMap<TaskId, String>,
    /// Publications that were fetched fewer times than declared.
    pub leaked: Vec<Leak>,
}

impl Diagnostics {
    /// Number of tasks that ran.
    pub fn tasks_run(&self) -> usize {
        self.execution_times.len()
    }

    /// Renders executed tasks as a Mermaid diagram, colored from green for
    /// the fastest to red for the slowest.
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let (min, max) = self
            .execution_times
            .values()
            .map(|t| t.duration.as_secs_f64())
            .fold((f64::MAX, f64::MIN), |(lo, hi), secs| (lo.min(secs), hi.max(secs)));

        // all equal, or nothing ran
        let span = if max > min { max - min } else { 1.0 };

        let mut ids: Vec<_> = self.execution_times.keys().copied().collect();
        ids.sort();

        for id in ids {
            let exec = &self.execution_times[&id];
            let name = self.names.get(&id).map(String::as_str).unwrap_or("?");
            let t = ((exec.duration.as_secs_f64() - min) / span).clamp(0.0, 1.0);

            let (r, g) = if t < 0.5 {
                ((510.0 * t) as u8, 255)
            } else {
                (255, (510.0 * (1.0 - t)) as u8)
            };

            let _ = writeln!(
                f,
                "    {id}[\"{}\\n{:.2?}\"]",
                name.replace('"', "\\\""),
                exec.duration
            );
            let _ = writeln!(f, "    style {id} fill:#{r:02X}{g:02X}00");
        }

        f
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UseInfo {
    pub key: String,
    pub input: FlowId,
    pub output: FlowId,
    pub scheduling: Permission,
    pub immediate: Permission,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    /// Dependencies still unsatisfied.
    pub outstanding: usize,
    pub uses: Vec<UseInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowInfo {
    pub id: FlowId,
    pub key: String,
    pub version: String,
    pub type_name: String,
    pub relation: Relation,
    pub ready: bool,
    pub readers: usize,
    /// Tasks waiting for the flow to become ready.
    pub waiting_tasks: Vec<TaskId>,
    /// Tasks waiting for the flow to become ready and drained of readers.
    pub consumers: Vec<TaskId>,
    pub forwards: Vec<FlowId>,
    /// Flows that take this one's value once it is drained of readers.
    pub drained_forwards: Vec<FlowId>,
    /// Publications waiting for the value.
    pub publications: usize,
    /// Fetch placeholders those publications will satisfy.
    pub fetches: Vec<FlowId>,
}

/// A modify that cannot proceed because readers still hold its input.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedConsumer {
    pub flow: FlowId,
    pub key: String,
    pub version: String,
    pub readers: usize,
    /// Modify tasks that cannot start.
    pub tasks: Vec<String>,
    /// Versions that cannot become ready, as `key@version`.
    pub flows: Vec<String>,
}

/// Node of the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphNode {
    Task(TaskId),
    Flow(FlowId),
}

/// Point-in-time view of the unfinished part of a rank's graph.
///
/// Everything a deadlock is made of stays reachable while it lasts: pending
/// tasks keep their uses, flows keep their dependents and forwards. The
/// snapshot walks that structure so it can be inspected after a stall.
#[derive(Debug, Clone, Serialize)]
pub struct DependencySnapshot {
    pub rank: usize,
    pub tasks: Vec<TaskInfo>,
    pub flows: Vec<FlowInfo>,
    pub pending_fetches: Vec<PendingFetch>,
}

impl DependencySnapshot {
    /// Collects every live task of the rank and every flow reachable from
    /// them or from `roots`.
    pub(crate) fn capture(shared: &RankShared, roots: Vec<Arc<Flow>>) -> Self {
        let live = shared.scheduler.live_tasks();
        let tasks: Vec<TaskInfo> = live.iter().map(|task| task.inspect()).collect();

        let mut stack: Vec<Arc<Flow>> = roots;
        stack.extend(live.iter().flat_map(|task| task.flows()));

        let mut seen = HashSet::new();
        let mut flows = Vec::new();

        while let Some(flow) = stack.pop() {
            if !seen.insert(flow.id) {
                continue;
            }
            stack.extend(flow.successors());
            flows.push(flow.inspect());
        }

        flows.sort_by_key(|flow| flow.id);

        Self {
            rank: shared.rank,
            tasks,
            flows,
            pending_fetches: shared.coordinator.unmatched_fetches(),
        }
    }

    /// Builds the dependency graph. An edge `a -> b` means `b` waits on `a`.
    pub fn graph(&self) -> DiGraph<GraphNode, ()> {
        let mut graph = DiGraph::new();
        let mut index: HashMap<GraphNode, NodeIndex> = HashMap::new();

        let mut node = |graph: &mut DiGraph<GraphNode, ()>, key: GraphNode| {
            *index.entry(key).or_insert_with(|| graph.add_node(key))
        };

        for flow in &self.flows {
            let source = node(&mut graph, GraphNode::Flow(flow.id));
            for task in flow.waiting_tasks.iter().chain(&flow.consumers) {
                let target = node(&mut graph, GraphNode::Task(*task));
                graph.add_edge(source, target, ());
            }
            for successor in flow.forwards.iter().chain(&flow.drained_forwards).chain(&flow.fetches) {
                let target = node(&mut graph, GraphNode::Flow(*successor));
                graph.add_edge(source, target, ());
            }
        }

        for task in &self.tasks {
            let source = node(&mut graph, GraphNode::Task(task.id));
            for usage in task.uses.iter().filter(|u| u.scheduling == Permission::Modify) {
                let target = node(&mut graph, GraphNode::Flow(usage.output));
                graph.add_edge(source, target, ());
            }
        }

        graph
    }

    /// Returns the nodes of one dependency cycle, if the graph has any.
    pub fn find_cycle(&self) -> Option<Vec<GraphNode>> {
        let graph = self.graph();

        tarjan_scc(&graph)
            .into_iter()
            .find(|component| {
                component.len() > 1 || graph.contains_edge(component[0], component[0])
            })
            .map(|component| component.into_iter().map(|index| graph[index]).collect())
    }

    /// Flows that are ready but whose modify dependents wait for readers.
    pub fn blocked_consumers(&self) -> Vec<BlockedConsumer> {
        let names: HashMap<TaskId, &str> = self
            .tasks
            .iter()
            .map(|task| (task.id, task.name.as_str()))
            .collect();
        let versions: HashMap<FlowId, String> = self
            .flows
            .iter()
            .map(|flow| (flow.id, format!("{}@{}", flow.key, flow.version)))
            .collect();

        self.flows
            .iter()
            .filter(|flow| {
                flow.ready
                    && flow.readers > 0
                    && !(flow.consumers.is_empty() && flow.drained_forwards.is_empty())
            })
            .map(|flow| BlockedConsumer {
                flow: flow.id,
                key: flow.key.clone(),
                version: flow.version.clone(),
                readers: flow.readers,
                tasks: flow
                    .consumers
                    .iter()
                    .map(|id| names.get(id).map_or_else(|| id.to_string(), |name| name.to_string()))
                    .collect(),
                flows: flow
                    .drained_forwards
                    .iter()
                    .map(|id| versions.get(id).cloned().unwrap_or_else(|| id.to_string()))
                    .collect(),
            })
            .collect()
    }

    /// Human readable description of why work is not progressing.
    pub fn summary(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(
            f,
            "rank {}: {} unfinished task(s), {} flow(s) in view",
            self.rank,
            self.tasks.len(),
            self.flows.len()
        );

        for task in &self.tasks {
            let _ = writeln!(
                f,
                "  task '{}' ({}) is {:?} with {} unsatisfied input(s)",
                task.name, task.id, task.state, task.outstanding
            );
        }

        for blocked in self.blocked_consumers() {
            let waiting: Vec<String> = blocked
                .tasks
                .iter()
                .map(|name| format!("'{name}'"))
                .chain(blocked.flows.iter().map(|version| format!("version {version}")))
                .collect();

            let _ = writeln!(
                f,
                "  {}@{} is ready but {} reader(s) still hold it, blocking {}",
                blocked.key,
                blocked.version,
                blocked.readers,
                waiting.join(", ")
            );
        }

        for fetch in &self.pending_fetches {
            let _ = writeln!(
                f,
                "  fetch of {}@{} by {} reader(s) has no matching publication",
                fetch.key, fetch.version, fetch.fetchers
            );
        }

        if let Some(cycle) = self.find_cycle() {
            let _ = writeln!(f, "  dependency cycle through {} node(s)", cycle.len());
        }

        f
    }

    /// Renders the graph as a Mermaid diagram, tasks as boxes and flows as
    /// circles.
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for task in &self.tasks {
            let _ = writeln!(
                f,
                "    {}[\"{}\"]",
                task.id,
                task.name.replace('"', "\\\"")
            );
        }

        for flow in &self.flows {
            let mark = if flow.ready { "ready" } else { "pending" };
            let _ = writeln!(f, "    {}((\"{}@{}\\n{mark}\"))", flow.id, flow.key, flow.version);
        }

        let graph = self.graph();
        for edge in graph.raw_edges() {
            let label = |node: GraphNode| match node {
                GraphNode::Task(id) => id.to_string(),
                GraphNode::Flow(id) => id.to_string(),
            };
            let _ = writeln!(
                f,
                "    {} --> {}",
                label(graph[edge.source()]),
                label(graph[edge.target()])
            );
        }

        f
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
