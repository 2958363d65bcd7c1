//! Flow definitions.
//!
//! A flow is an immutable named DAG of nodes. Ordinary nodes carry an
//! async handler; branch nodes additionally carry a selector that picks
//! the live out-edges from the node's output; loop nodes carry a
//! splitter that turns their input into a collection, with a designated
//! body node executed once per item. Definitions are validated (unique
//! ids, known edge endpoints, acyclic) when sealed and never mutated
//! afterwards.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::errors::{EngineError, Result};
use crate::model::Request;

mod export;

pub use export::{FlowDescriptor, NodeDescriptor};

/// Context handed to a node handler alongside its input.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub flow_name: String,
    pub request_id: String,
    pub node_id: String,
    /// Iteration index when the node runs as a loop-body instance.
    pub iteration: Option<usize>,
    pub header: HashMap<String, Vec<String>>,
    pub query: HashMap<String, Vec<String>>,
}

impl NodeContext {
    pub fn for_request(request: &Request, node_id: &str, iteration: Option<usize>) -> Self {
        Self {
            flow_name: request.flow_name.clone(),
            request_id: request.request_id.clone(),
            node_id: node_id.to_string(),
            iteration,
            header: request.header.clone(),
            query: request.query.clone(),
        }
    }
}

/// User computation attached to a node.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn run(&self, ctx: &NodeContext, input: Bytes) -> anyhow::Result<Bytes>;
}

/// Picks the live successors of a branch node from its output.
pub trait BranchSelector: Send + Sync {
    fn select(&self, output: &[u8]) -> Vec<String>;
}

/// Splits a loop node's input into the per-iteration items.
pub trait LoopSplitter: Send + Sync {
    fn split(&self, input: &[u8]) -> anyhow::Result<Vec<Bytes>>;
}

struct FnNodeHandler<F>(F);

#[async_trait]
impl<F, Fut> NodeHandler for FnNodeHandler<F>
where
    F: Fn(NodeContext, Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Bytes>> + Send,
{
    async fn run(&self, ctx: &NodeContext, input: Bytes) -> anyhow::Result<Bytes> {
        (self.0)(ctx.clone(), input).await
    }
}

/// Wraps an async closure as a [`NodeHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn NodeHandler>
where
    F: Fn(NodeContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
{
    Arc::new(FnNodeHandler(f))
}

struct FnBranchSelector<F>(F);

impl<F> BranchSelector for FnBranchSelector<F>
where
    F: Fn(&[u8]) -> Vec<String> + Send + Sync,
{
    fn select(&self, output: &[u8]) -> Vec<String> {
        (self.0)(output)
    }
}

/// Wraps a closure as a [`BranchSelector`].
pub fn selector_fn<F>(f: F) -> Arc<dyn BranchSelector>
where
    F: Fn(&[u8]) -> Vec<String> + Send + Sync + 'static,
{
    Arc::new(FnBranchSelector(f))
}

struct FnLoopSplitter<F>(F);

impl<F> LoopSplitter for FnLoopSplitter<F>
where
    F: Fn(&[u8]) -> anyhow::Result<Vec<Bytes>> + Send + Sync,
{
    fn split(&self, input: &[u8]) -> anyhow::Result<Vec<Bytes>> {
        (self.0)(input)
    }
}

/// Wraps a closure as a [`LoopSplitter`].
pub fn splitter_fn<F>(f: F) -> Arc<dyn LoopSplitter>
where
    F: Fn(&[u8]) -> anyhow::Result<Vec<Bytes>> + Send + Sync + 'static,
{
    Arc::new(FnLoopSplitter(f))
}

/// What a node does beyond running its handler.
#[derive(Clone)]
pub enum NodeKind {
    Task,
    Branch { selector: Arc<dyn BranchSelector> },
    Loop {
        splitter: Arc<dyn LoopSplitter>,
        body: String,
    },
}

impl NodeKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeKind::Task => "task",
            NodeKind::Branch { .. } => "branch",
            NodeKind::Loop { .. } => "loop",
        }
    }
}

#[derive(Clone)]
pub struct NodeSpec {
    pub id: String,
    pub kind: NodeKind,
    /// Absent for loop nodes, whose work is the split itself.
    pub handler: Option<Arc<dyn NodeHandler>>,
}

/// A validated, immutable flow definition.
pub struct FlowDefinition {
    name: String,
    nodes: BTreeMap<String, NodeSpec>,
    edges: Vec<(String, String)>,
    parents: BTreeMap<String, Vec<String>>,
    children: BTreeMap<String, Vec<String>>,
}

impl std::fmt::Debug for FlowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowDefinition")
            .field("name", &self.name)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("edges", &self.edges)
            .finish()
    }
}

impl FlowDefinition {
    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder {
            name: name.into(),
            nodes: BTreeMap::new(),
            edges: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self, id: &str) -> Result<&NodeSpec> {
        self.nodes
            .get(id)
            .ok_or_else(|| EngineError::Internal(format!("unknown node {id} in flow {}", self.name)))
    }

    /// Node ids in lexicographic order; also the scheduler's tiebreak
    /// order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn parents(&self, id: &str) -> &[String] {
        self.parents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn children(&self, id: &str) -> &[String] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn indegree(&self, id: &str) -> usize {
        self.parents(id).len()
    }

    /// Nodes with no incoming edges.
    pub fn roots(&self) -> Vec<&str> {
        self.nodes
            .keys()
            .filter(|id| self.indegree(id) == 0)
            .map(String::as_str)
            .collect()
    }

    /// True when `id` is the body of some loop node.
    pub fn loop_owner(&self, id: &str) -> Option<&str> {
        self.nodes.values().find_map(|spec| match &spec.kind {
            NodeKind::Loop { body, .. } if body == id => Some(spec.id.as_str()),
            _ => None,
        })
    }

    /// JSON-serializable topology descriptor.
    pub fn export(&self) -> FlowDescriptor {
        FlowDescriptor {
            name: self.name.clone(),
            nodes: self
                .nodes
                .values()
                .map(|spec| NodeDescriptor {
                    id: spec.id.clone(),
                    kind: spec.kind.kind_name().to_string(),
                    body: match &spec.kind {
                        NodeKind::Loop { body, .. } => Some(body.clone()),
                        _ => None,
                    },
                })
                .collect(),
            edges: self.edges.clone(),
        }
    }
}

pub struct FlowBuilder {
    name: String,
    nodes: BTreeMap<String, NodeSpec>,
    edges: Vec<(String, String)>,
}

impl FlowBuilder {
    fn insert(&mut self, spec: NodeSpec) -> Result<()> {
        if spec.id.is_empty() || spec.id.contains('#') {
            // '#' is reserved for loop-iteration instance ids.
            return Err(EngineError::InvalidFlow(format!(
                "invalid node id {:?} in flow {}",
                spec.id, self.name
            )));
        }
        if self.nodes.contains_key(&spec.id) {
            return Err(EngineError::InvalidFlow(format!(
                "node {} defined twice in flow {}",
                spec.id, self.name
            )));
        }
        self.nodes.insert(spec.id.clone(), spec);
        Ok(())
    }

    /// Adds an ordinary node.
    pub fn node(mut self, id: impl Into<String>, handler: Arc<dyn NodeHandler>) -> Result<Self> {
        self.insert(NodeSpec {
            id: id.into(),
            kind: NodeKind::Task,
            handler: Some(handler),
        })?;
        Ok(self)
    }

    /// Adds a branch node: the handler's output is fed to the selector,
    /// which names the live successors.
    pub fn branch(
        mut self,
        id: impl Into<String>,
        handler: Arc<dyn NodeHandler>,
        selector: Arc<dyn BranchSelector>,
    ) -> Result<Self> {
        self.insert(NodeSpec {
            id: id.into(),
            kind: NodeKind::Branch { selector },
            handler: Some(handler),
        })?;
        Ok(self)
    }

    /// Adds a loop node iterating `body` (declared separately with
    /// [`FlowBuilder::node`]) once per item produced by the splitter.
    /// The edge from the loop node to its body is implied.
    pub fn for_each(
        mut self,
        id: impl Into<String>,
        splitter: Arc<dyn LoopSplitter>,
        body: impl Into<String>,
    ) -> Result<Self> {
        let id = id.into();
        let body = body.into();
        self.edges.push((id.clone(), body.clone()));
        self.insert(NodeSpec {
            id,
            kind: NodeKind::Loop { splitter, body },
            handler: None,
        })?;
        Ok(self)
    }

    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Validates and seals the definition.
    pub fn build(self) -> Result<FlowDefinition> {
        let Self { name, nodes, edges } = self;
        if let Some((from, to)) = edges
            .iter()
            .find(|(from, to)| !nodes.contains_key(from) || !nodes.contains_key(to))
        {
            return Err(EngineError::InvalidFlow(format!(
                "edge {from} -> {to} references an undefined node in flow {name}"
            )));
        }

        let mut parents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (from, to) in &edges {
            if parents.get(to).is_some_and(|p| p.contains(from)) {
                return Err(EngineError::InvalidFlow(format!(
                    "duplicate edge {from} -> {to} in flow {name}"
                )));
            }
            parents.entry(to.clone()).or_default().push(from.clone());
            children.entry(from.clone()).or_default().push(to.clone());
        }
        for list in parents.values_mut().chain(children.values_mut()) {
            list.sort();
        }

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
        for id in nodes.keys() {
            indices.insert(id.as_str(), graph.add_node(id.as_str()));
        }
        for (from, to) in &edges {
            graph.add_edge(indices[from.as_str()], indices[to.as_str()], ());
        }
        if is_cyclic_directed(&graph) {
            return Err(EngineError::InvalidFlow(format!("flow {name} contains a cycle")));
        }

        for spec in nodes.values() {
            if let NodeKind::Loop { body, .. } = &spec.kind {
                if !nodes.contains_key(body) {
                    return Err(EngineError::InvalidFlow(format!(
                        "loop {} names undefined body {body} in flow {name}",
                        spec.id
                    )));
                }
                let body_parents = parents.get(body).map(Vec::len).unwrap_or(0);
                if body_parents != 1 {
                    return Err(EngineError::InvalidFlow(format!(
                        "loop body {body} must have the loop as its only parent in flow {name}"
                    )));
                }
                if children.get(&spec.id).map(Vec::len).unwrap_or(0) != 1 {
                    return Err(EngineError::InvalidFlow(format!(
                        "loop {} must have exactly its body as successor in flow {name}",
                        spec.id
                    )));
                }
            }
        }

        Ok(FlowDefinition {
            name,
            nodes,
            edges,
            parents,
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn NodeHandler> {
        handler_fn(|_ctx, input| async move { Ok(input) })
    }

    #[test]
    fn builds_a_serial_flow() {
        let flow = FlowDefinition::builder("serial")
            .node("a", noop())
            .unwrap()
            .node("b", noop())
            .unwrap()
            .node("c", noop())
            .unwrap()
            .edge("a", "b")
            .edge("b", "c")
            .build()
            .unwrap();

        assert_eq!(flow.roots(), vec!["a"]);
        assert_eq!(flow.children("a"), ["b"]);
        assert_eq!(flow.parents("c"), ["b"]);
        assert_eq!(flow.indegree("a"), 0);
        assert_eq!(flow.node_count(), 3);
    }

    #[test]
    fn rejects_cycles() {
        let err = FlowDefinition::builder("cyclic")
            .node("a", noop())
            .unwrap()
            .node("b", noop())
            .unwrap()
            .edge("a", "b")
            .edge("b", "a")
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidFlow(_)));
    }

    #[test]
    fn rejects_unknown_edge_endpoints() {
        let err = FlowDefinition::builder("dangling")
            .node("a", noop())
            .unwrap()
            .edge("a", "ghost")
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidFlow(_)));
    }

    #[test]
    fn rejects_duplicate_nodes() {
        let err = FlowDefinition::builder("dup")
            .node("a", noop())
            .unwrap()
            .node("a", noop());
        assert!(err.is_err());
    }

    #[test]
    fn loop_body_ownership_is_discoverable() {
        let splitter = splitter_fn(|_input| Ok(vec![Bytes::from_static(b"1")]));
        let flow = FlowDefinition::builder("looped")
            .node("x", noop())
            .unwrap()
            .node("t", noop())
            .unwrap()
            .for_each("l", splitter, "x")
            .unwrap()
            .edge("x", "t")
            .build()
            .unwrap();

        assert_eq!(flow.loop_owner("x"), Some("l"));
        assert_eq!(flow.loop_owner("t"), None);
        assert_eq!(flow.children("l"), ["x"]);
    }

    #[test]
    fn loop_body_cannot_have_extra_parents() {
        let splitter = splitter_fn(|_input| Ok(Vec::new()));
        let err = FlowDefinition::builder("bad-loop")
            .node("x", noop())
            .unwrap()
            .node("other", noop())
            .unwrap()
            .for_each("l", splitter, "x")
            .unwrap()
            .edge("other", "x")
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidFlow(_)));
    }
}
