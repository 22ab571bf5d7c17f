//! Chain collection and segmentation.
//!
//! A chain is a maximal producer-to-consumer run of lowerable operators
//! discovered by walking backward from a seed. Chains are disjoint: once an
//! operator is claimed it never joins another chain. Segmentation then cuts
//! each chain into units a single loop can compute.

use spindle_core::{Graph, Node, OpId, OpKind, TensorRole};

use std::collections::{HashMap, HashSet};

use crate::{LowerOptions, LowerReport, Result};

/// A maximal run of fusable operators, in producer-to-consumer order.
#[derive(Debug)]
pub(crate) struct Chain {
    pub ops: Vec<OpId>,
}

/// A slice of a chain that one loop build covers, in execution order.
#[derive(Debug, Clone)]
pub(crate) struct Segment {
    pub ops: Vec<OpId>,
}

/// Operator kinds the scalar recipes can express.
pub(crate) fn lowerable_kind(kind: OpKind) -> bool {
    kind.is_elementwise()
        || kind.is_reduction()
        || matches!(kind, OpKind::MatMul | OpKind::Transpose | OpKind::Range)
}

/// Whether an operator may join a chain at all.
///
/// Minted index plumbing (results with Index or IndexAux roles) stays out,
/// as do multi-output operators and anything already carrying a body.
fn eligible(graph: &Graph, node: &Node) -> Result<bool> {
    if !lowerable_kind(node.kind) || node.body.is_some() || node.outputs.len() != 1 {
        return Ok(false);
    }
    let out = graph.tensor(node.outputs[0])?;
    Ok(!matches!(out.role, TensorRole::Index | TensorRole::IndexAux))
}

/// Collect maximal disjoint chains from the graph.
///
/// Seeds are visited in reverse topological order so every chain starts at
/// its most-downstream member. From a seed, an explicit worklist walks
/// backward through inputs; the walk stops at non-intermediate tensors, at
/// tensors with more than one consumer, at claimed or ineligible producers,
/// and never expands through the inputs of a `Range` (they configure the
/// sequence rather than flow through it).
#[tracing::instrument(skip_all, fields(num_ops = graph.node_count()))]
pub(crate) fn collect_chains(graph: &Graph) -> Result<Vec<Chain>> {
    let order = graph.topological_order();
    let position: HashMap<OpId, usize> = order
        .iter()
        .enumerate()
        .map(|(index, &id)| (id, index))
        .collect();

    let mut claimed: HashSet<OpId> = HashSet::new();
    let mut chains = Vec::new();

    for &seed in order.iter().rev() {
        if claimed.contains(&seed) {
            continue;
        }
        if !eligible(graph, graph.node(seed)?)? {
            continue;
        }

        let mut members = Vec::new();
        let mut visited: HashSet<OpId> = HashSet::new();
        let mut worklist = vec![seed];
        visited.insert(seed);

        while let Some(op_id) = worklist.pop() {
            members.push(op_id);
            let node = graph.node(op_id)?;
            if node.kind == OpKind::Range {
                continue;
            }
            for &input_id in &node.inputs {
                let tensor = graph.tensor(input_id)?;
                if tensor.role != TensorRole::Intermediate {
                    continue;
                }
                if graph.consumers(input_id).len() != 1 {
                    continue;
                }
                let Some(producer_id) = graph.producer(input_id) else {
                    continue;
                };
                if claimed.contains(&producer_id) || visited.contains(&producer_id) {
                    continue;
                }
                if !eligible(graph, graph.node(producer_id)?)? {
                    continue;
                }
                visited.insert(producer_id);
                worklist.push(producer_id);
            }
        }

        members.sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));
        claimed.extend(members.iter().copied());
        tracing::debug!(seed = %graph.node(seed)?.name, len = members.len(), "collected chain");
        chains.push(Chain { ops: members });
    }

    Ok(chains)
}

/// Cut a chain into loop-sized segments.
///
/// Reductions always stand alone. A `MatMul` always opens a new segment so
/// its epilogue can be gated on the final accumulation step. Multi-operator
/// stretches whose outer operands cannot broadcast to the stretch output
/// fall apart into singletons. With fusion disabled every member is its own
/// segment.
pub(crate) fn segment_chain(
    graph: &Graph,
    chain: &Chain,
    options: &LowerOptions,
    report: &mut LowerReport,
) -> Result<Vec<Segment>> {
    if !options.fusion {
        return Ok(chain
            .ops
            .iter()
            .map(|&id| Segment { ops: vec![id] })
            .collect());
    }

    let mut raw: Vec<Segment> = Vec::new();
    let mut current: Vec<OpId> = Vec::new();
    for &op_id in &chain.ops {
        let kind = graph.node(op_id)?.kind;
        if kind.is_reduction() {
            if !current.is_empty() {
                raw.push(Segment {
                    ops: std::mem::take(&mut current),
                });
            }
            raw.push(Segment { ops: vec![op_id] });
        } else if kind == OpKind::MatMul && !current.is_empty() {
            raw.push(Segment {
                ops: std::mem::take(&mut current),
            });
            current.push(op_id);
        } else {
            current.push(op_id);
        }
    }
    if !current.is_empty() {
        raw.push(Segment { ops: current });
    }

    let mut segments = Vec::new();
    for segment in raw {
        if segment.ops.len() > 1 && !is_broadcast_safe(graph, &segment)? {
            tracing::debug!(
                len = segment.ops.len(),
                "stretch is not broadcast-safe; lowering members separately"
            );
            report.segments_demoted += 1;
            segments.extend(segment.ops.iter().map(|&id| Segment { ops: vec![id] }));
        } else {
            segments.push(segment);
        }
    }
    Ok(segments)
}

/// Check that every outer operand of the segment's elementwise members can
/// broadcast to the segment's output shape.
///
/// Only elementwise members have broadcast semantics; anchor operands
/// (`MatMul` factors, `Transpose` input, `Range` bounds) are resolved by
/// exact index arithmetic instead. One-element operands always pass, since
/// they resolve to a direct scalar read.
pub(crate) fn is_broadcast_safe(graph: &Graph, segment: &Segment) -> Result<bool> {
    let Some(&last) = segment.ops.last() else {
        return Ok(false);
    };
    let out_id = *graph
        .node(last)?
        .outputs
        .first()
        .ok_or_else(|| crate::Error::Structural("segment tail has no output".to_string()))?;
    let Some(out_dims) = graph.tensor(out_id)?.shape.as_static() else {
        return Ok(false);
    };
    let out_dims = out_dims.to_vec();

    let inside: HashSet<OpId> = segment.ops.iter().copied().collect();
    for &op_id in &segment.ops {
        let node = graph.node(op_id)?;
        if !node.kind.is_elementwise() {
            continue;
        }
        for &input_id in &node.inputs {
            if let Some(producer_id) = graph.producer(input_id) {
                if inside.contains(&producer_id) {
                    continue;
                }
            }
            let tensor = graph.tensor(input_id)?;
            let Some(dims) = tensor.shape.as_static() else {
                return Ok(false);
            };
            if dims.iter().product::<usize>() == 1 {
                continue;
            }
            if !spindle_core::broadcast::is_broadcastable_to(dims, &out_dims) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::{ElemType, Node, Shape, Tensor, TensorId};

    fn add_value_tensor(graph: &mut Graph, name: &str, dims: &[usize]) -> TensorId {
        graph.add_tensor(Tensor::new(
            name,
            ElemType::F32,
            Shape::Static(dims.to_vec()),
        ))
    }

    fn add_input_tensor(graph: &mut Graph, name: &str, dims: &[usize]) -> TensorId {
        graph.add_tensor(Tensor::with_role(
            name,
            ElemType::F32,
            Shape::Static(dims.to_vec()),
            TensorRole::Input,
        ))
    }

    fn add_node(graph: &mut Graph, kind: OpKind, name: &str, inputs: &[TensorId], output: TensorId) -> OpId {
        let mut node = Node::named(kind, name);
        for &input in inputs {
            node.add_input(input);
        }
        node.add_output(output);
        graph.add_op(node)
    }

    /// a -> Add -> Mul -> Relu -> out, all single-consumer.
    fn linear_three_op_graph() -> Graph {
        let mut graph = Graph::new();
        let a = add_input_tensor(&mut graph, "a", &[4]);
        let b = add_input_tensor(&mut graph, "b", &[4]);
        let t0 = add_value_tensor(&mut graph, "t0", &[4]);
        let t1 = add_value_tensor(&mut graph, "t1", &[4]);
        let out = add_value_tensor(&mut graph, "out", &[4]);
        graph.tensor_mut(out).unwrap().role = TensorRole::Output;
        add_node(&mut graph, OpKind::Add, "add0", &[a, b], t0);
        add_node(&mut graph, OpKind::Mul, "mul0", &[t0, b], t1);
        add_node(&mut graph, OpKind::Relu, "relu0", &[t1], out);
        graph.inputs = vec![a, b];
        graph.outputs = vec![out];
        graph
    }

    #[test]
    fn test_linear_run_collects_into_one_chain() {
        let graph = linear_three_op_graph();
        let chains = collect_chains(&graph).unwrap();
        assert_eq!(chains.len(), 1);
        let names: Vec<&str> = chains[0]
            .ops
            .iter()
            .map(|&id| graph.node(id).unwrap().name.as_str())
            .collect();
        assert_eq!(names, vec!["add0", "mul0", "relu0"]);
    }

    #[test]
    fn test_multi_consumer_tensor_splits_chains() {
        let mut graph = Graph::new();
        let a = add_input_tensor(&mut graph, "a", &[4]);
        let b = add_input_tensor(&mut graph, "b", &[4]);
        let shared = add_value_tensor(&mut graph, "shared", &[4]);
        let y = add_value_tensor(&mut graph, "y", &[4]);
        let z = add_value_tensor(&mut graph, "z", &[4]);
        add_node(&mut graph, OpKind::Add, "add0", &[a, b], shared);
        add_node(&mut graph, OpKind::Mul, "mul0", &[shared, b], y);
        add_node(&mut graph, OpKind::Relu, "relu0", &[shared], z);
        graph.inputs = vec![a, b];
        graph.outputs = vec![y, z];

        let chains = collect_chains(&graph).unwrap();
        assert_eq!(chains.len(), 3);
        assert!(chains.iter().all(|c| c.ops.len() == 1));
    }

    #[test]
    fn test_reduction_stands_alone() {
        let mut graph = Graph::new();
        let a = add_input_tensor(&mut graph, "a", &[2, 3]);
        let b = add_input_tensor(&mut graph, "b", &[2, 3]);
        let t0 = add_value_tensor(&mut graph, "t0", &[2, 3]);
        let t1 = add_value_tensor(&mut graph, "t1", &[2]);
        let out = add_value_tensor(&mut graph, "out", &[2]);
        add_node(&mut graph, OpKind::Add, "add0", &[a, b], t0);
        let reduce = add_node(&mut graph, OpKind::ReduceSum, "sum0", &[t0], t1);
        graph
            .node_mut(reduce)
            .unwrap()
            .set_attribute("axes", spindle_core::Attribute::Ints(vec![1]));
        add_node(&mut graph, OpKind::Relu, "relu0", &[t1], out);
        graph.inputs = vec![a, b];
        graph.outputs = vec![out];

        let chains = collect_chains(&graph).unwrap();
        assert_eq!(chains.len(), 1);
        let segments = segment_chain(
            &graph,
            &chains[0],
            &LowerOptions::default(),
            &mut LowerReport::default(),
        )
        .unwrap();
        let lens: Vec<usize> = segments.iter().map(|s| s.ops.len()).collect();
        assert_eq!(lens, vec![1, 1, 1]);
        assert_eq!(
            graph.node(segments[1].ops[0]).unwrap().kind,
            OpKind::ReduceSum
        );
    }

    #[test]
    fn test_matmul_opens_its_own_segment() {
        let mut graph = Graph::new();
        let a = add_input_tensor(&mut graph, "a", &[2, 2]);
        let b = add_input_tensor(&mut graph, "b", &[2, 2]);
        let t0 = add_value_tensor(&mut graph, "t0", &[2, 2]);
        let t1 = add_value_tensor(&mut graph, "t1", &[2, 2]);
        let out = add_value_tensor(&mut graph, "out", &[2, 2]);
        add_node(&mut graph, OpKind::Relu, "relu0", &[a], t0);
        add_node(&mut graph, OpKind::MatMul, "matmul0", &[t0, b], t1);
        add_node(&mut graph, OpKind::Sigmoid, "sigmoid0", &[t1], out);
        graph.inputs = vec![a, b];
        graph.outputs = vec![out];

        let chains = collect_chains(&graph).unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].ops.len(), 3);
        let segments = segment_chain(
            &graph,
            &chains[0],
            &LowerOptions::default(),
            &mut LowerReport::default(),
        )
        .unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(graph.node(segments[0].ops[0]).unwrap().kind, OpKind::Relu);
        assert_eq!(graph.node(segments[1].ops[0]).unwrap().kind, OpKind::MatMul);
        assert_eq!(segments[1].ops.len(), 2);
    }

    #[test]
    fn test_fusion_disabled_yields_singletons() {
        let graph = linear_three_op_graph();
        let chains = collect_chains(&graph).unwrap();
        let options = LowerOptions { fusion: false };
        let segments = segment_chain(
            &graph,
            &chains[0],
            &options,
            &mut LowerReport::default(),
        )
        .unwrap();
        assert_eq!(segments.len(), 3);
        assert!(segments.iter().all(|s| s.ops.len() == 1));
    }

    #[test]
    fn test_unsafe_stretch_demotes_to_singletons() {
        let mut graph = Graph::new();
        let a = add_input_tensor(&mut graph, "a", &[2, 3]);
        let b = add_input_tensor(&mut graph, "b", &[2, 4]);
        let t0 = add_value_tensor(&mut graph, "t0", &[2, 3]);
        let out = add_value_tensor(&mut graph, "out", &[2, 3]);
        add_node(&mut graph, OpKind::Relu, "relu0", &[a], t0);
        // b cannot broadcast to the stretch output [2, 3].
        add_node(&mut graph, OpKind::Add, "add0", &[t0, b], out);
        graph.inputs = vec![a, b];
        graph.outputs = vec![out];

        let chains = collect_chains(&graph).unwrap();
        assert_eq!(chains.len(), 1);
        let mut report = LowerReport::default();
        let segments =
            segment_chain(&graph, &chains[0], &LowerOptions::default(), &mut report).unwrap();
        assert_eq!(segments.len(), 2);
        assert!(segments.iter().all(|s| s.ops.len() == 1));
        assert_eq!(report.segments_demoted, 1);
    }

    #[test]
    fn test_range_inputs_are_not_crossed() {
        let mut graph = Graph::new();
        let start0 = add_value_tensor(&mut graph, "start0", &[]);
        let start = add_value_tensor(&mut graph, "start", &[]);
        let limit = graph.add_tensor(Tensor::constant(
            "limit",
            spindle_core::TensorValue::scalar_f32(8.0),
        ));
        let delta = graph.add_tensor(Tensor::constant(
            "delta",
            spindle_core::TensorValue::scalar_f32(2.0),
        ));
        let one = graph.add_tensor(Tensor::constant(
            "one",
            spindle_core::TensorValue::scalar_f32(1.0),
        ));
        let out = add_value_tensor(&mut graph, "out", &[4]);
        // start is itself produced by a lowerable operator, but Range bounds
        // configure the sequence and must stay outside the chain.
        add_node(&mut graph, OpKind::Add, "add0", &[start0, one], start);
        add_node(&mut graph, OpKind::Range, "range0", &[start, limit, delta], out);
        graph.outputs = vec![out];

        let chains = collect_chains(&graph).unwrap();
        let range_chain = chains
            .iter()
            .find(|c| {
                c.ops
                    .iter()
                    .any(|&id| graph.node(id).unwrap().kind == OpKind::Range)
            })
            .unwrap();
        assert_eq!(range_chain.ops.len(), 1);
    }
}
