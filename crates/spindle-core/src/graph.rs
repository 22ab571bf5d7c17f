//! Operator/tensor graph for the lowering pipeline.
//!
//! The graph is directed:
//! - **Nodes** (`Node`) are operators (e.g., Add, MatMul, Loop)
//! - **Tensors** (`Tensor`) are the values flowing between them, stored in a
//!   side-table addressed by stable [`TensorId`]s
//!
//! petgraph edges carry no data; they exist solely so topological ordering
//! follows producer/consumer structure. Operator input *order* always comes
//! from the node's own input list, never from edge traversal order.
//!
//! Passes mutate the graph eagerly and re-resolve nodes and tensors by ID
//! after every mutation; IDs stay valid across removals.

use crate::ops::{Attribute, OpKind};
use crate::types::{ElemType, Shape, TensorRole, TensorValue};
use crate::{Error, Result};
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::Topo;

use std::collections::HashMap;

/// Type alias for operator node identifiers (backed by petgraph NodeIndex).
pub type OpId = NodeIndex;

/// Unique identifier for a tensor in the graph.
///
/// This is an index into the graph's tensor side-table. Unlike node IDs
/// (which use petgraph's stable NodeIndex), tensor IDs are simple usize
/// indices that remain valid across graph mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(pub usize);

impl TensorId {
    /// Create a new tensor ID.
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    /// Get the underlying index.
    pub fn index(&self) -> usize {
        self.0
    }
}

// ──────────────────────────────── Graph ────────────────────────────────

/// Operator/tensor graph.
///
/// Nodes are operators; tensors live in a side-table. Removing an operator
/// cleans its producer/consumer entries first, so no tensor is ever left
/// pointing at a dead node. Tensors themselves are never deleted; entries
/// whose producers and consumers are all gone simply become unreachable.
#[derive(Debug, Clone)]
pub struct Graph {
    /// The graph structure (nodes only, no edge data).
    graph: StableGraph<Node, ()>,

    /// Tensor metadata side-table.
    tensors: Vec<Tensor>,

    /// Lookup table: tensor name -> tensor ID.
    tensor_by_name: HashMap<String, TensorId>,

    /// Lookup table: tensor ID -> producing node ID.
    producer: HashMap<TensorId, OpId>,

    /// Lookup table: tensor ID -> consuming node IDs.
    consumers: HashMap<TensorId, Vec<OpId>>,

    /// Graph input tensor IDs.
    pub inputs: Vec<TensorId>,

    /// Graph output tensor IDs.
    pub outputs: Vec<TensorId>,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: StableGraph::new(),
            tensors: Vec::new(),
            tensor_by_name: HashMap::new(),
            producer: HashMap::new(),
            consumers: HashMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    // ── Node access ──

    /// Get an immutable reference to a node.
    pub fn node(&self, id: OpId) -> Result<&Node> {
        self.graph
            .node_weight(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Node {:?} not found", id)))
    }

    /// Get a mutable reference to a node.
    pub fn node_mut(&mut self, id: OpId) -> Result<&mut Node> {
        self.graph
            .node_weight_mut(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Node {:?} not found", id)))
    }

    /// Check whether a node is still live.
    pub fn contains_node(&self, id: OpId) -> bool {
        self.graph.node_weight(id).is_some()
    }

    /// Iterate over all nodes in the graph.
    pub fn nodes(&self) -> impl Iterator<Item = (OpId, &Node)> {
        self.graph
            .node_indices()
            .filter_map(|id| self.graph.node_weight(id).map(|node| (id, node)))
    }

    /// Get the number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    // ── Tensor access ──

    /// Get the number of tensors in the graph.
    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// Get an immutable reference to a tensor.
    pub fn tensor(&self, id: TensorId) -> Result<&Tensor> {
        self.tensors
            .get(id.index())
            .ok_or_else(|| Error::InvalidGraph(format!("Tensor {:?} not found", id)))
    }

    /// Get a mutable reference to a tensor.
    pub fn tensor_mut(&mut self, id: TensorId) -> Result<&mut Tensor> {
        self.tensors
            .get_mut(id.index())
            .ok_or_else(|| Error::InvalidGraph(format!("Tensor {:?} not found", id)))
    }

    /// Look up a tensor by name.
    pub fn tensor_by_name(&self, name: &str) -> Option<TensorId> {
        self.tensor_by_name.get(name).copied()
    }

    /// Get the node that produces a tensor, if any.
    pub fn producer(&self, id: TensorId) -> Option<OpId> {
        self.producer.get(&id).copied()
    }

    /// Get the nodes that consume a tensor.
    pub fn consumers(&self, id: TensorId) -> Vec<OpId> {
        self.consumers.get(&id).cloned().unwrap_or_default()
    }

    // ── Graph mutation ──

    /// Add a tensor to the graph and return its ID.
    pub fn add_tensor(&mut self, tensor: Tensor) -> TensorId {
        let id = TensorId::new(self.tensors.len());
        self.tensor_by_name.insert(tensor.name.clone(), id);
        self.tensors.push(tensor);
        id
    }

    /// Add a new operator node to the graph and return its ID.
    ///
    /// Updates the producer/consumer lookup tables and adds petgraph edges
    /// for topological ordering. Consumers of the node's outputs may already
    /// be present (a replaced producer); ordering edges to them are added
    /// here too.
    pub fn add_op(&mut self, mut node: Node) -> OpId {
        let placeholder = Node::new(OpKind::Identity);
        let node_id = self.graph.add_node(placeholder);
        node.node_index = node_id;

        // Register producer/consumer relationships
        for &output_id in &node.outputs {
            self.producer.insert(output_id, node_id);
        }

        for &input_id in &node.inputs {
            self.consumers.entry(input_id).or_default().push(node_id);

            // Add petgraph edge for topological ordering
            if let Some(&producer_id) = self.producer.get(&input_id) {
                if producer_id != node_id {
                    self.graph.add_edge(producer_id, node_id, ());
                }
            }
        }

        // Pre-existing consumers of this node's outputs need ordering edges
        // from the new producer.
        for &output_id in &node.outputs {
            if let Some(consumer_ids) = self.consumers.get(&output_id) {
                for &consumer_id in consumer_ids {
                    if consumer_id != node_id {
                        self.graph.add_edge(node_id, consumer_id, ());
                    }
                }
            }
        }

        // Replace the placeholder with the real node
        *self.graph.node_weight_mut(node_id).unwrap() = node;

        node_id
    }

    /// Remove an operator node from the graph.
    ///
    /// Producer/consumer entries are removed before the node itself, so the
    /// tables never reference a dead node. With `StableGraph`, other node
    /// indices remain valid.
    pub fn remove_op(&mut self, id: OpId) -> Result<()> {
        let node = self.node(id)?.clone();

        // Remove from producer lookup
        for &output_id in &node.outputs {
            if self.producer.get(&output_id) == Some(&id) {
                self.producer.remove(&output_id);
            }
        }

        // Remove from consumer lookup
        for &input_id in &node.inputs {
            if let Some(consumer_ids) = self.consumers.get_mut(&input_id) {
                consumer_ids.retain(|&c| c != id);
            }
        }

        // Remove node from graph (automatically removes petgraph edges)
        self.graph.remove_node(id);

        Ok(())
    }

    /// Add an explicit ordering edge between two live nodes.
    ///
    /// For dependencies that flow through no listed input: a `Loop` body
    /// resolves outer tensors by name at execution time, so the Loop node
    /// must still sort after the producers of everything it captures.
    pub fn add_dependency(&mut self, from: OpId, to: OpId) -> Result<()> {
        self.node(from)?;
        self.node(to)?;
        if from != to {
            self.graph.add_edge(from, to, ());
        }
        Ok(())
    }

    // ── Graph queries ──

    /// Get the topological order of nodes in the graph.
    ///
    /// Returns nodes in an order such that all inputs to a node are produced
    /// before the node itself.
    pub fn topological_order(&self) -> Vec<OpId> {
        let mut topo = Topo::new(&self.graph);
        let mut order = Vec::new();

        while let Some(id) = topo.next(&self.graph) {
            if self.graph.node_weight(id).is_some() {
                order.push(id);
            }
        }

        order
    }

    /// Find a node by its name.
    pub fn find_node_by_name(&self, name: &str) -> Result<OpId> {
        for (node_id, node) in self.nodes() {
            if node.name == name {
                return Ok(node_id);
            }
        }

        Err(Error::InvalidGraph(format!("Node '{}' not found", name)))
    }

    /// Check structural coherence of the graph.
    ///
    /// Verifies that every node's tensor references exist, that the
    /// producer/consumer tables agree with the node lists, and that every
    /// `Loop` node carries a body with the fixed three-input/two-output
    /// signature. Bodies are validated recursively.
    pub fn validate(&self) -> Result<()> {
        for (node_id, node) in self.nodes() {
            for &input_id in &node.inputs {
                self.tensor(input_id)?;
                let consumer_ids = self.consumers(input_id);
                if !consumer_ids.contains(&node_id) {
                    return Err(Error::InvalidGraph(format!(
                        "node '{}' missing from consumer table of tensor {:?}",
                        node.name, input_id
                    )));
                }
            }
            for &output_id in &node.outputs {
                self.tensor(output_id)?;
                if self.producer(output_id) != Some(node_id) {
                    return Err(Error::InvalidGraph(format!(
                        "producer table disagrees for output {:?} of node '{}'",
                        output_id, node.name
                    )));
                }
            }

            if node.kind == OpKind::Loop {
                let body = node.body.as_deref().ok_or_else(|| {
                    Error::InvalidGraph(format!("Loop node '{}' has no body", node.name))
                })?;
                if node.inputs.len() != 3 || node.outputs.len() != 1 {
                    return Err(Error::InvalidGraph(format!(
                        "Loop node '{}' must have 3 inputs and 1 output, got {}/{}",
                        node.name,
                        node.inputs.len(),
                        node.outputs.len()
                    )));
                }
                if body.inputs.len() != 3 || body.outputs.len() != 2 {
                    return Err(Error::InvalidGraph(format!(
                        "Loop body of '{}' must declare 3 inputs and 2 outputs, got {}/{}",
                        node.name,
                        body.inputs.len(),
                        body.outputs.len()
                    )));
                }
                body.validate()?;
            }
        }

        for &id in self.inputs.iter().chain(self.outputs.iter()) {
            self.tensor(id)?;
        }

        Ok(())
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

// ──────────────────────────────── Node ─────────────────────────────────

/// A node in the graph — an operator transforming tensors.
#[derive(Debug, Clone)]
pub struct Node {
    /// Node name (diagnostics only, may be empty).
    pub name: String,

    /// Operator type tag.
    pub kind: OpKind,

    /// Operator attributes (e.g., axes, perm, keepdims).
    pub attributes: HashMap<String, Attribute>,

    /// Input tensor IDs, in operator argument order.
    pub inputs: Vec<TensorId>,

    /// Output tensor IDs.
    pub outputs: Vec<TensorId>,

    /// Nested body sub-graph (`Loop` only).
    pub body: Option<Box<Graph>>,

    /// The graph node index (for efficient graph traversal).
    pub node_index: OpId,
}

impl Node {
    /// Create a new operator node.
    pub fn new(kind: OpKind) -> Self {
        Self {
            name: String::new(),
            kind,
            attributes: HashMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            body: None,
            node_index: NodeIndex::default(),
        }
    }

    /// Create a named operator node.
    pub fn named(kind: OpKind, name: impl Into<String>) -> Self {
        let mut node = Self::new(kind);
        node.name = name.into();
        node
    }

    /// Add an input tensor.
    pub fn add_input(&mut self, tensor_id: TensorId) {
        self.inputs.push(tensor_id);
    }

    /// Add an output tensor.
    pub fn add_output(&mut self, tensor_id: TensorId) {
        self.outputs.push(tensor_id);
    }

    /// Set an attribute.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: Attribute) {
        self.attributes.insert(key.into(), value);
    }

    /// Get a raw attribute.
    pub fn get_attribute(&self, key: &str) -> Option<&Attribute> {
        self.attributes.get(key)
    }

    /// Get a typed attribute value.
    pub fn attr<T>(&self, name: &str) -> Result<T>
    where
        T: TryFrom<Attribute, Error = Error>,
    {
        let value = self
            .attributes
            .get(name)
            .ok_or_else(|| Error::Attribute(format!("missing attribute '{}'", name)))?;

        T::try_from(value.clone())
    }

    /// Check if an attribute exists.
    pub fn has_attr(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }
}

// ──────────────────────────────── Tensor ───────────────────────────────

/// A tensor in the graph.
///
/// `role` decides how passes may consume the tensor; `value` is present for
/// constants and initializers, and for the auxiliary constants the lowering
/// pass mints.
#[derive(Debug, Clone)]
pub struct Tensor {
    /// Tensor name (unique within one graph, diagnostics and capture lookup).
    pub name: String,

    /// Element type.
    pub dtype: ElemType,

    /// Shape (static or unknown).
    pub shape: Shape,

    /// Role within the graph.
    pub role: TensorRole,

    /// Compile-time value, if any.
    pub value: Option<TensorValue>,
}

impl Tensor {
    /// Create a new intermediate tensor with no compile-time value.
    pub fn new(name: impl Into<String>, dtype: ElemType, shape: Shape) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            role: TensorRole::Intermediate,
            value: None,
        }
    }

    /// Create a tensor with an explicit role.
    pub fn with_role(
        name: impl Into<String>,
        dtype: ElemType,
        shape: Shape,
        role: TensorRole,
    ) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            role,
            value: None,
        }
    }

    /// Create a constant tensor; shape and dtype come from the value.
    pub fn constant(name: impl Into<String>, value: TensorValue) -> Self {
        Self {
            name: name.into(),
            dtype: value.dtype,
            shape: Shape::Static(value.shape.clone()),
            role: TensorRole::Constant,
            value: Some(value),
        }
    }

    /// Create an initializer tensor; shape and dtype come from the value.
    pub fn initializer(name: impl Into<String>, value: TensorValue) -> Self {
        let mut tensor = Self::constant(name, value);
        tensor.role = TensorRole::Initializer;
        tensor
    }

    /// Create an index-auxiliary constant (strides, axes, bounds).
    pub fn index_aux(name: impl Into<String>, value: TensorValue) -> Self {
        let mut tensor = Self::constant(name, value);
        tensor.role = TensorRole::IndexAux;
        tensor
    }

    /// Check if this tensor carries a compile-time value.
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// Check if the tensor's shape is fully static.
    pub fn has_static_shape(&self) -> bool {
        self.shape.is_static()
    }
}
