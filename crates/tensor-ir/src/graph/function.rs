//! Function: an append-only arena of nodes with per-node use-lists.

use std::collections::{BTreeSet, HashSet};
use std::fmt::{self, Write as _};

use super::infer::infer_results;
use super::node::{Node, NodeId, NodeKind, NodeValue, Value};
use super::storage::{unique_name, StorageRef, StorageTable};
use crate::error::{Error, Result};
use crate::tensor::TensorType;

/// Named computation graph. Nodes only reference lower arena indices, so arena
/// order is always a valid topological order.
#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    nodes: Vec<Node>,
    node_names: HashSet<String>,
}

impl Function {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            node_names: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> impl DoubleEndedIterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(|idx| NodeId(idx as u32))
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|node| node.name == name)
            .map(|idx| NodeId(idx as u32))
    }

    /// Number of nodes whose kind satisfies `predicate`.
    pub fn count_nodes(&self, predicate: impl Fn(&NodeKind) -> bool) -> usize {
        self.nodes.iter().filter(|node| predicate(&node.kind)).count()
    }

    /// Every storage slot the function reads or writes, in ascending order.
    pub fn storage_refs(&self) -> BTreeSet<StorageRef> {
        let mut refs = BTreeSet::new();
        for node in &self.nodes {
            refs.extend(node.inputs.iter().filter_map(|value| value.as_storage()));
            if let NodeKind::Save { destination } = node.kind {
                refs.insert(destination);
            }
        }
        refs
    }

    /// Number of uses of `storage` in this function; a Save destination counts as a use.
    pub fn storage_uses(&self, storage: StorageRef) -> usize {
        self.nodes
            .iter()
            .map(|node| {
                let reads = node
                    .inputs
                    .iter()
                    .filter(|value| **value == Value::Storage(storage))
                    .count();
                let writes = usize::from(
                    matches!(node.kind, NodeKind::Save { destination } if destination == storage),
                );
                reads + writes
            })
            .sum()
    }

    /// Static type of an operand.
    pub fn value_type(&self, storage: &StorageTable, value: Value) -> Result<TensorType> {
        match value {
            Value::Storage(storage_ref) => storage.ty(storage_ref).cloned(),
            Value::Node(NodeValue { node, result }) => self
                .node(node)
                .and_then(|producer| producer.results.get(result as usize))
                .cloned()
                .ok_or_else(|| Error::Verification {
                    function: self.name.clone(),
                    node: format!("{value}"),
                    reason: "value is not defined in this function".to_string(),
                }),
        }
    }

    /// Appends a node after inferring its result types and wiring use-lists.
    pub(crate) fn add_node(
        &mut self,
        storage: &StorageTable,
        name: &str,
        kind: NodeKind,
        inputs: Vec<Value>,
    ) -> Result<NodeId> {
        let operand_types = inputs
            .iter()
            .map(|value| self.value_type(storage, *value))
            .collect::<Result<Vec<_>>>()?;
        if matches!(kind, NodeKind::Sgd(_)) && inputs.get(1).and_then(|v| v.as_storage()).is_none()
        {
            return Err(Error::ShapeMismatch {
                op: kind.name().to_string(),
                detail: "weight operand must be a variable or placeholder".to_string(),
            });
        }
        let results = infer_results(&kind, &operand_types, storage)?;

        let id = NodeId(self.nodes.len() as u32);
        for value in &inputs {
            if let Value::Node(NodeValue { node, .. }) = value {
                self.nodes[node.index()].users.push(id);
            }
        }
        let name = unique_name(&mut self.node_names, name);
        self.nodes.push(Node {
            name,
            kind,
            inputs,
            results,
            users: Vec::new(),
        });
        Ok(id)
    }

    /// Removes every node that does not transitively feed a Save or Sgd node.
    ///
    /// Survivors keep their relative order; operands and use-lists are remapped.
    /// Returns the number of removed nodes.
    pub fn eliminate_dead_nodes(&mut self) -> usize {
        let mut live = vec![false; self.nodes.len()];
        for idx in (0..self.nodes.len()).rev() {
            if self.nodes[idx].kind.is_sink() {
                live[idx] = true;
            }
            if !live[idx] {
                continue;
            }
            for value in &self.nodes[idx].inputs {
                if let Value::Node(NodeValue { node, .. }) = value {
                    live[node.index()] = true;
                }
            }
        }

        let removed = live.iter().filter(|alive| !**alive).count();
        if removed == 0 {
            return 0;
        }

        let mut remap = vec![None; self.nodes.len()];
        let mut kept = Vec::with_capacity(self.nodes.len() - removed);
        for (idx, node) in std::mem::take(&mut self.nodes).into_iter().enumerate() {
            if live[idx] {
                remap[idx] = Some(NodeId(kept.len() as u32));
                kept.push(node);
            } else {
                self.node_names.remove(&node.name);
            }
        }
        for node in &mut kept {
            node.users.clear();
            for value in &mut node.inputs {
                if let Value::Node(NodeValue { node: producer, .. }) = value {
                    // Live nodes only reference live producers.
                    if let Some(new_id) = remap[producer.index()] {
                        *producer = new_id;
                    }
                }
            }
        }
        for idx in 0..kept.len() {
            let consumer = NodeId(idx as u32);
            let producers: Vec<NodeId> = kept[idx]
                .inputs
                .iter()
                .filter_map(|value| value.as_node().map(|v| v.node))
                .collect();
            for producer in producers {
                kept[producer.index()].users.push(consumer);
            }
        }
        self.nodes = kept;
        removed
    }

    /// Structural checks; see [`verify_function`](super::verify::verify_function).
    pub fn verify(&self, storage: &StorageTable) -> Result<()> {
        super::verify::verify_function(self, storage)
    }

    /// Graphviz rendering of the data-flow graph.
    pub fn to_dot(&self, storage: &StorageTable) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", self.name);
        for storage_ref in self.storage_refs() {
            let label = storage.name(storage_ref).unwrap_or("?");
            let _ = writeln!(
                out,
                "  \"{storage_ref}\" [shape=box, label=\"{label}\"];"
            );
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            let _ = writeln!(
                out,
                "  n{idx} [label=\"{}\\n{}\"];",
                node.name,
                node.kind.name()
            );
            for value in &node.inputs {
                match value {
                    Value::Node(NodeValue { node: producer, .. }) => {
                        let _ = writeln!(out, "  n{} -> n{idx};", producer.0);
                    }
                    Value::Storage(storage_ref) => {
                        let _ = writeln!(out, "  \"{storage_ref}\" -> n{idx};");
                    }
                }
            }
            if let NodeKind::Save { destination } = node.kind {
                let _ = writeln!(out, "  n{idx} -> \"{destination}\";");
            }
        }
        out.push_str("}\n");
        out
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "func @{} {{", self.name)?;
        for (idx, node) in self.nodes.iter().enumerate() {
            let operands = node
                .inputs
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            let results = node
                .results
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, "  ")?;
            if !node.results.is_empty() {
                write!(f, "%{idx} = ")?;
            }
            write!(f, "{} \"{}\"({operands})", node.kind.name(), node.name)?;
            match &node.kind {
                NodeKind::Save { destination } => write!(f, " -> {destination}")?,
                _ if !results.is_empty() => write!(f, " : {results}")?,
                _ => {}
            }
            writeln!(f)?;
        }
        writeln!(f, "}}")
    }
}
