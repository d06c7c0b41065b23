use std::cell::{Cell, OnceCell};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter, Write};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::Utf8PathBuf;
use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::core::{Identity, KeyMaterial};
use crate::engine::{Task, TaskName, TaskState};
use crate::error::GraphError;

static NEXT_GRAPH: AtomicU64 = AtomicU64::new(0);

/// Distinguishes graph instances, so that handles cannot cross graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GraphId(u64);

/// Handle to a task inside the graph that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskRef {
    graph: GraphId,
    index: NodeIndex,
}

impl TaskRef {
    pub fn graph(&self) -> GraphId {
        self.graph
    }
}

impl Display for TaskRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "task #{} of graph #{}", self.index.index(), self.graph.0)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Status {
    state: Cell<TaskState>,
    errors: Cell<u32>,
}

impl Status {
    pub(crate) fn state(&self) -> TaskState {
        self.state.get()
    }

    pub(crate) fn errors(&self) -> u32 {
        self.errors.get()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.set(state);
    }

    pub(crate) fn finish(&self, errors: u32) {
        self.state.set(TaskState::Done);
        self.errors.set(errors);
    }

    fn reset(&self) {
        self.state.set(TaskState::Waiting);
        self.errors.set(0);
    }
}

pub(crate) enum Body {
    Task(Box<dyn Task>),
    Graph(Rc<Graph>),
}

pub(crate) struct Node {
    body: Body,
    status: Status,
    identity: OnceCell<Option<Identity>>,
}

impl Node {
    fn status(&self) -> &Status {
        match &self.body {
            Body::Task(_) => &self.status,
            Body::Graph(graph) => &graph.status,
        }
    }

    fn name(&self) -> TaskName {
        match &self.body {
            Body::Task(task) => task.name(),
            Body::Graph(graph) => graph.name.clone(),
        }
    }

    fn identity(&self) -> Option<Identity> {
        self.identity
            .get_or_init(|| match &self.body {
                Body::Task(task) => task.key().map(|key| key.identity()),
                Body::Graph(graph) => Some(graph.identity()),
            })
            .clone()
    }
}

/// A composite task owning a DAG of tasks and nested graphs.
///
/// Edges point from a dependency to its dependent. `inputs` always holds the
/// tasks without dependencies, which is where scheduling starts.
pub struct Graph {
    id: GraphId,
    name: TaskName,
    dag: DiGraph<Node, ()>,
    inputs: BTreeSet<NodeIndex>,
    outputs: Vec<NodeIndex>,
    status: Status,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_kind("graph", name)
    }

    pub fn with_kind(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: GraphId(NEXT_GRAPH.fetch_add(1, Ordering::Relaxed)),
            name: TaskName::new(kind, name),
            dag: DiGraph::new(),
            inputs: BTreeSet::new(),
            outputs: Vec::new(),
            status: Status::default(),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn name(&self) -> &TaskName {
        &self.name
    }

    pub fn identity(&self) -> Identity {
        KeyMaterial::new(self.name.kind.as_str())
            .field("name", self.name.name.as_str())
            .identity()
    }

    pub fn len(&self) -> usize {
        self.dag.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.dag.node_count() == 0
    }

    pub fn add_task(&mut self, task: impl Task + 'static) -> TaskRef {
        self.add_boxed(Box::new(task))
    }

    pub fn add_boxed(&mut self, task: Box<dyn Task>) -> TaskRef {
        self.add_node(Body::Task(task))
    }

    /// Nests `graph` as a single node of this one.
    pub fn add_graph(&mut self, graph: Graph) -> TaskRef {
        self.add_node(Body::Graph(Rc::new(graph)))
    }

    fn add_node(&mut self, body: Body) -> TaskRef {
        let index = self.dag.add_node(Node {
            body,
            status: Status::default(),
            identity: OnceCell::new(),
        });
        self.inputs.insert(index);
        self.task_ref(index)
    }

    fn task_ref(&self, index: NodeIndex) -> TaskRef {
        TaskRef {
            graph: self.id,
            index,
        }
    }

    fn index_of(&self, task: TaskRef) -> Result<NodeIndex, GraphError> {
        if task.graph != self.id || self.dag.node_weight(task.index).is_none() {
            return Err(GraphError::ForeignTask {
                graph: self.name.clone(),
            });
        }
        Ok(task.index)
    }

    /// Makes `task` wait for `dependency`.
    ///
    /// Both tasks must belong to this graph, and the new edge must not close
    /// a cycle. Adding an existing edge again is a no-op.
    pub fn add_dependency(&mut self, task: TaskRef, dependency: TaskRef) -> Result<(), GraphError> {
        let index = self.index_of(task)?;
        let task_name = self.dag[index].name();

        if dependency.graph != self.id {
            return Err(GraphError::CrossGraph {
                task: task_name,
                dependency,
            });
        }
        let dep_index = self.index_of(dependency)?;

        if dep_index == index {
            return Err(GraphError::SelfDependency { task: task_name });
        }
        if has_path_connecting(&self.dag, index, dep_index, None) {
            return Err(GraphError::Cycle {
                task: task_name,
                dependency: self.dag[dep_index].name(),
            });
        }

        self.dag.update_edge(dep_index, index, ());
        self.inputs.remove(&index);
        Ok(())
    }

    pub fn add_dependencies(
        &mut self,
        task: TaskRef,
        dependencies: impl IntoIterator<Item = TaskRef>,
    ) -> Result<(), GraphError> {
        for dependency in dependencies {
            self.add_dependency(task, dependency)?;
        }
        Ok(())
    }

    /// Designates `task` as one of the graph's terminal tasks.
    pub fn add_output(&mut self, task: TaskRef) -> Result<(), GraphError> {
        let index = self.index_of(task)?;
        if !self.outputs.contains(&index) {
            self.outputs.push(index);
        }
        Ok(())
    }

    pub fn inputs(&self) -> Vec<TaskRef> {
        self.inputs.iter().map(|&ix| self.task_ref(ix)).collect()
    }

    pub fn outputs(&self) -> Vec<TaskRef> {
        self.outputs.iter().map(|&ix| self.task_ref(ix)).collect()
    }

    pub fn tasks(&self) -> impl Iterator<Item = TaskRef> + '_ {
        self.dag.node_indices().map(|ix| self.task_ref(ix))
    }

    pub fn dependencies(&self, task: TaskRef) -> Vec<TaskRef> {
        self.neighbors(task, Direction::Incoming)
    }

    pub fn dependents(&self, task: TaskRef) -> Vec<TaskRef> {
        self.neighbors(task, Direction::Outgoing)
    }

    fn neighbors(&self, task: TaskRef, direction: Direction) -> Vec<TaskRef> {
        let Ok(index) = self.index_of(task) else {
            return Vec::new();
        };
        let mut found: Vec<_> = self
            .dag
            .neighbors_directed(index, direction)
            .map(|ix| self.task_ref(ix))
            .collect();
        found.sort();
        found
    }

    /// Looks up a direct child by its display name.
    pub fn find(&self, name: &str) -> Option<TaskRef> {
        self.dag
            .node_indices()
            .find(|&ix| self.dag[ix].name().name == name)
            .map(|ix| self.task_ref(ix))
    }

    pub fn name_of(&self, task: TaskRef) -> Option<TaskName> {
        let index = self.index_of(task).ok()?;
        Some(self.dag[index].name())
    }

    pub fn state(&self, task: TaskRef) -> Option<TaskState> {
        let index = self.index_of(task).ok()?;
        Some(self.dag[index].status().state())
    }

    pub fn error_count(&self, task: TaskRef) -> Option<u32> {
        let index = self.index_of(task).ok()?;
        Some(self.dag[index].status().errors())
    }

    /// State of the graph itself, as a task of its parent or as a root.
    pub fn own_state(&self) -> TaskState {
        self.status.state()
    }

    pub fn own_error_count(&self) -> u32 {
        self.status.errors()
    }

    pub fn identity_of(&self, task: TaskRef) -> Option<Identity> {
        let index = self.index_of(task).ok()?;
        self.dag[index].identity()
    }

    pub fn task(&self, task: TaskRef) -> Option<&dyn Task> {
        let index = self.index_of(task).ok()?;
        match &self.dag[index].body {
            Body::Task(task) => Some(task.as_ref()),
            Body::Graph(_) => None,
        }
    }

    pub fn subgraph(&self, task: TaskRef) -> Option<&Rc<Graph>> {
        let index = self.index_of(task).ok()?;
        match &self.dag[index].body {
            Body::Graph(graph) => Some(graph),
            Body::Task(_) => None,
        }
    }

    /// Names of every task, optionally descending into nested graphs.
    pub fn all_tasks(&self, deep: bool) -> Vec<TaskName> {
        let mut names = Vec::new();
        for node in self.dag.node_weights() {
            match &node.body {
                Body::Graph(graph) if deep => names.extend(graph.all_tasks(true)),
                _ => names.push(node.name()),
            }
        }
        names
    }

    /// Number of leaf tasks, nested graphs included.
    pub(crate) fn leaf_count(&self) -> usize {
        self.dag
            .node_weights()
            .map(|node| match &node.body {
                Body::Task(_) => 1,
                Body::Graph(graph) => graph.leaf_count(),
            })
            .sum()
    }

    /// Leaf tasks currently in `state`, nested graphs included.
    pub(crate) fn leaves_in(&self, state: TaskState) -> Vec<TaskName> {
        let mut names = Vec::new();
        for node in self.dag.node_weights() {
            match &node.body {
                Body::Graph(graph) => names.extend(graph.leaves_in(state)),
                Body::Task(task) if node.status.state() == state => names.push(task.name()),
                Body::Task(_) => {}
            }
        }
        names
    }

    /// Errors of finished leaf tasks, nested graphs included.
    pub(crate) fn leaf_errors(&self) -> u32 {
        self.dag
            .node_weights()
            .map(|node| match &node.body {
                Body::Task(_) if node.status.state() == TaskState::Done => node.status.errors(),
                Body::Task(_) => 0,
                Body::Graph(graph) => graph.leaf_errors(),
            })
            .sum()
    }

    /// Every declared output file, nested graphs included.
    pub fn output_files(&self) -> Vec<Utf8PathBuf> {
        let mut files = Vec::new();
        for node in self.dag.node_weights() {
            match &node.body {
                Body::Task(task) => files.extend(task.files().outputs),
                Body::Graph(graph) => files.extend(graph.output_files()),
            }
        }
        files
    }

    /// Returns `task` and everything depending on it, transitively, to
    /// `Waiting`.
    pub fn reset(&self, task: TaskRef) -> Result<(), GraphError> {
        let mut stack = vec![self.index_of(task)?];
        let mut seen = BTreeSet::new();

        while let Some(index) = stack.pop() {
            if !seen.insert(index) {
                continue;
            }
            let node = &self.dag[index];
            node.status.reset();
            if let Body::Graph(graph) = &node.body {
                graph.reset_all();
            }
            stack.extend(self.dag.neighbors_directed(index, Direction::Outgoing));
        }
        Ok(())
    }

    pub fn reset_all(&self) {
        self.status.reset();
        for node in self.dag.node_weights() {
            node.status.reset();
            if let Body::Graph(graph) = &node.body {
                graph.reset_all();
            }
        }
    }

    /// Indented dump of the graph and its nested graphs.
    pub fn description(&self) -> String {
        let mut out = String::new();
        self.describe(&mut out, 0);
        out
    }

    fn describe(&self, out: &mut String, depth: usize) {
        let _ = writeln!(out, "{:indent$}+ {}", "", self.name, indent = depth * 2);
        for index in self.dag.node_indices() {
            match &self.dag[index].body {
                Body::Graph(graph) => graph.describe(out, depth + 1),
                Body::Task(task) => {
                    let indent = depth * 2 + 2;
                    let _ = writeln!(out, "{:indent$}- {}", "", task.name());
                }
            }
        }
    }

    pub(crate) fn status(&self) -> &Status {
        &self.status
    }

    pub(crate) fn node_status(&self, index: NodeIndex) -> &Status {
        self.dag[index].status()
    }

    pub(crate) fn node_name(&self, index: NodeIndex) -> TaskName {
        self.dag[index].name()
    }

    pub(crate) fn node_identity(&self, index: NodeIndex) -> Option<Identity> {
        self.dag[index].identity()
    }

    pub(crate) fn input_indices(&self) -> Vec<NodeIndex> {
        self.inputs.iter().copied().collect()
    }

    pub(crate) fn dependents_of(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.dag.neighbors_directed(index, Direction::Outgoing).collect()
    }

    pub(crate) fn dependency_count(&self, index: NodeIndex) -> usize {
        self.dag.neighbors_directed(index, Direction::Incoming).count()
    }

    pub(crate) fn edges(&self) -> impl Iterator<Item = (NodeIndex, NodeIndex)> + '_ {
        self.dag
            .edge_indices()
            .filter_map(|edge| self.dag.edge_endpoints(edge))
    }

    pub(crate) fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.dag.node_indices()
    }

    /// Position of `task` in the graph, stable for the graph's lifetime.
    pub(crate) fn index(&self, task: TaskRef) -> usize {
        task.index.index()
    }
}

/// What the runner executes: the root graph or one node of some graph.
#[derive(Clone)]
pub(crate) enum Unit {
    Root(Rc<Graph>),
    Node { owner: Rc<Graph>, index: NodeIndex },
}

impl Unit {
    pub(crate) fn status(&self) -> &Status {
        match self {
            Unit::Root(graph) => &graph.status,
            Unit::Node { owner, index } => owner.node_status(*index),
        }
    }

    pub(crate) fn name(&self) -> TaskName {
        match self {
            Unit::Root(graph) => graph.name.clone(),
            Unit::Node { owner, index } => owner.node_name(*index),
        }
    }

    pub(crate) fn identity(&self) -> Option<Identity> {
        match self {
            Unit::Root(graph) => Some(graph.identity()),
            Unit::Node { owner, index } => owner.node_identity(*index),
        }
    }

    pub(crate) fn task_ref(&self) -> Option<TaskRef> {
        match self {
            Unit::Root(_) => None,
            Unit::Node { owner, index } => Some(owner.task_ref(*index)),
        }
    }

    pub(crate) fn subgraph(&self) -> Option<Rc<Graph>> {
        match self {
            Unit::Root(graph) => Some(Rc::clone(graph)),
            Unit::Node { owner, index } => match &owner.dag[*index].body {
                Body::Graph(graph) => Some(Rc::clone(graph)),
                Body::Task(_) => None,
            },
        }
    }

    pub(crate) fn task(&self) -> Option<&dyn Task> {
        match self {
            Unit::Root(_) => None,
            Unit::Node { owner, index } => match &owner.dag[*index].body {
                Body::Task(task) => Some(task.as_ref()),
                Body::Graph(_) => None,
            },
        }
    }
}
