//! Structural verification of a [`Function`] against its module's storage.

use super::function::Function;
use super::infer::infer_results;
use super::node::{Node, NodeId, NodeKind, NodeValue, Value};
use super::storage::StorageTable;
use crate::error::{Error, Result};

/// Checks that a function is well formed:
///
/// * operands are defined earlier in the arena and storage handles resolve,
/// * recorded result types match what the operands imply,
/// * use-lists agree with the operand edges,
/// * Save destinations and Sgd weights are typed like the values they receive,
/// * no non-sink node is left without users.
pub fn verify_function(function: &Function, storage: &StorageTable) -> Result<()> {
    let nodes = function.nodes();
    let mut expected_users: Vec<Vec<NodeId>> = vec![Vec::new(); nodes.len()];

    for (idx, node) in nodes.iter().enumerate() {
        let id = NodeId(idx as u32);
        let fail = |reason: String| Error::Verification {
            function: function.name().to_string(),
            node: node.name().to_string(),
            reason,
        };

        if node.inputs().len() != node.kind().arity() {
            return Err(fail(format!(
                "{} expects {} operands, found {}",
                node.kind().name(),
                node.kind().arity(),
                node.inputs().len()
            )));
        }

        let mut operand_types = Vec::with_capacity(node.inputs().len());
        for value in node.inputs() {
            match *value {
                Value::Node(NodeValue { node: producer, result }) => {
                    if producer >= id {
                        return Err(fail(format!("operand {value} is not defined before use")));
                    }
                    let ty = nodes[producer.index()]
                        .results()
                        .get(result as usize)
                        .ok_or_else(|| fail(format!("operand {value} names a missing result")))?;
                    operand_types.push(ty.clone());
                    expected_users[producer.index()].push(id);
                }
                Value::Storage(storage_ref) => {
                    let ty = storage
                        .ty(storage_ref)
                        .map_err(|_| fail(format!("storage {storage_ref} does not resolve")))?;
                    operand_types.push(ty.clone());
                }
            }
        }

        if let NodeKind::Sgd(_) = node.kind() {
            if node.input(1).and_then(Value::as_storage).is_none() {
                return Err(fail("Sgd weight must be a variable or placeholder".to_string()));
            }
        }
        if let NodeKind::Save { destination } = node.kind() {
            if !storage.contains(*destination) {
                return Err(fail(format!("destination {destination} does not resolve")));
            }
        }

        let inferred = infer_results(node.kind(), &operand_types, storage)
            .map_err(|err| fail(format!("operand types are invalid: {err}")))?;
        if inferred != node.results() {
            return Err(fail(format!(
                "recorded result types {:?} differ from inferred {:?}",
                display_types(node),
                inferred.iter().map(ToString::to_string).collect::<Vec<_>>()
            )));
        }
    }

    for (idx, node) in nodes.iter().enumerate() {
        let mut recorded = node.users().to_vec();
        let mut expected = std::mem::take(&mut expected_users[idx]);
        recorded.sort();
        expected.sort();
        if recorded != expected {
            return Err(Error::Verification {
                function: function.name().to_string(),
                node: node.name().to_string(),
                reason: format!("use-list {recorded:?} does not match operand edges {expected:?}"),
            });
        }
        if !node.kind().is_sink() && node.users().is_empty() {
            return Err(Error::Verification {
                function: function.name().to_string(),
                node: node.name().to_string(),
                reason: "node has no users".to_string(),
            });
        }
    }
    Ok(())
}

fn display_types(node: &Node) -> Vec<String> {
    node.results().iter().map(ToString::to_string).collect()
}
