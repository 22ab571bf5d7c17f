//! Loop builders, one per segment family.
//!
//! The driver probes [`BUILDERS`] in order and the first builder whose
//! `can_handle` accepts the segment constructs the loop. Order matters:
//! the specific builders (generative, matmul, reduce, transpose) must win
//! over the elementwise default.

mod default;
mod generative;
mod matmul;
mod reduce;
mod transpose;

pub(crate) use default::DefaultBuilder;
pub(crate) use generative::GenerativeBuilder;
pub(crate) use matmul::MatMulBuilder;
pub(crate) use reduce::ReduceBuilder;
pub(crate) use transpose::TransposeBuilder;

use spindle_core::{ElemType, Graph, Node, Tensor, TensorData, TensorId, TensorValue};

use crate::chain::Segment;
use crate::context::{BuildResult, NameGen};
use crate::{Error, Result};

/// One strategy for turning a segment into a loop.
pub(crate) trait LoopBuilder {
    /// Builder name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Cheap acceptance test. Must not mutate anything; a refusal sends the
    /// segment to the next builder or back to the driver for demotion.
    fn can_handle(&self, graph: &Graph, segment: &Segment) -> bool;

    /// Construct the loop body and outer plumbing for the segment.
    fn build(&self, graph: &mut Graph, segment: &Segment, names: &mut NameGen)
        -> Result<BuildResult>;
}

/// Dispatch order. The default builder comes last as the catch-all for
/// plain elementwise segments.
pub(crate) static BUILDERS: [&(dyn LoopBuilder + Sync); 5] = [
    &GenerativeBuilder,
    &MatMulBuilder,
    &ReduceBuilder,
    &TransposeBuilder,
    &DefaultBuilder,
];

/// Clone the segment's nodes in execution order.
pub(crate) fn segment_nodes(graph: &Graph, segment: &Segment) -> Result<Vec<Node>> {
    segment
        .ops
        .iter()
        .map(|&id| Ok(graph.node(id)?.clone()))
        .collect()
}

/// The segment's final output tensor.
pub(crate) fn segment_output(graph: &Graph, segment: &Segment) -> Result<(TensorId, Tensor)> {
    let &last = segment
        .ops
        .last()
        .ok_or_else(|| Error::Structural("segment is empty".to_string()))?;
    let node = graph.node(last)?;
    let &out_id = node
        .outputs
        .first()
        .ok_or_else(|| Error::Structural(format!("operator '{}' has no output", node.name)))?;
    Ok((out_id, graph.tensor(out_id)?.clone()))
}

/// Static dims of the segment's final output, when known.
pub(crate) fn static_output_dims(graph: &Graph, segment: &Segment) -> Option<Vec<usize>> {
    let &last = segment.ops.last()?;
    let node = graph.node(last).ok()?;
    let &out_id = node.outputs.first()?;
    graph
        .tensor(out_id)
        .ok()?
        .shape
        .as_static()
        .map(<[usize]>::to_vec)
}

/// Element types the scalar recipes cover.
pub(crate) fn lowerable_elem(elem: ElemType) -> bool {
    matches!(elem, ElemType::F32 | ElemType::I64 | ElemType::I32)
}

/// A flat tensor filled with one value.
pub(crate) fn splat(elem: ElemType, len: usize, value: f64) -> Result<TensorValue> {
    let data = match elem {
        ElemType::F32 => TensorData::F32(vec![value as f32; len]),
        ElemType::I64 => TensorData::I64(vec![value as i64; len]),
        ElemType::I32 => TensorData::I32(vec![value as i32; len]),
        other => {
            return Err(Error::Unsupported(format!(
                "cannot lower {:?} arithmetic",
                other
            )))
        }
    };
    Ok(TensorValue::new(data, vec![len], elem))
}

/// Mint the three outer loop operands: trip count (int64 scalar), a true
/// condition, and the initial carry.
pub(crate) fn outer_scaffolding(
    graph: &mut Graph,
    names: &mut NameGen,
    trip: usize,
    init: TensorValue,
) -> (TensorId, TensorId, TensorId) {
    let trip_count = graph.add_tensor(Tensor::index_aux(
        names.fresh("trip"),
        TensorValue::scalar_i64(trip as i64),
    ));
    let condition = graph.add_tensor(Tensor::index_aux(
        names.fresh("keep_going"),
        TensorValue::scalar_bool(true),
    ));
    let init_carry = graph.add_tensor(Tensor::index_aux(names.fresh("carry_init"), init));
    (trip_count, condition, init_carry)
}
