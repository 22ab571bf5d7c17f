//! Compact textual graph dumps for logs and debugging.

use crate::graph::Graph;
use crate::types::Shape;
use std::fmt::Write;

/// Render a graph one line per operator, in topological order.
///
/// Nested Loop bodies are indented under their node.
pub fn dump(graph: &Graph) -> String {
    let mut out = String::new();
    dump_into(graph, 0, &mut out);
    out
}

fn dump_into(graph: &Graph, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    for id in graph.topological_order() {
        let Ok(node) = graph.node(id) else { continue };
        let inputs = tensor_list(graph, &node.inputs);
        let outputs = tensor_list(graph, &node.outputs);
        let _ = writeln!(
            out,
            "{indent}{} [{:?}] ({inputs}) -> ({outputs})",
            if node.name.is_empty() { "_" } else { &node.name },
            node.kind,
        );
        if let Some(body) = &node.body {
            dump_into(body, depth + 1, out);
        }
    }
}

fn tensor_list(graph: &Graph, ids: &[crate::graph::TensorId]) -> String {
    let mut parts = Vec::with_capacity(ids.len());
    for &id in ids {
        match graph.tensor(id) {
            Ok(tensor) => {
                let shape = match &tensor.shape {
                    Shape::Static(dims) => format!("{:?}", dims),
                    Shape::Unknown => "?".to_string(),
                };
                parts.push(format!("{}{}", tensor.name, shape));
            }
            Err(_) => parts.push(format!("<{:?}>", id)),
        }
    }
    parts.join(", ")
}
