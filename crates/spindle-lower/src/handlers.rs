//! Scalar recipes for fused members and reduction accumulators.
//!
//! Each eligible elementwise operator has a one-scalar-per-step recipe: its
//! operands resolve to body scalars and the operator itself is re-emitted on
//! them. Reductions instead combine the previous carry element with the
//! incoming value.

use spindle_core::{ElemType, Graph, Node, OpKind, Shape, TensorId, TensorRole, TensorValue};

use std::collections::HashMap;

use crate::context::{LoopContext, NameGen};
use crate::indexing::{emit, emit_const, resolve_operand, ImportMap};
use crate::{Error, Result};

/// Emit a scalar node with the context's element type.
fn scalar_op(
    body: &mut Graph,
    names: &mut NameGen,
    kind: OpKind,
    inputs: &[TensorId],
    elem: ElemType,
) -> TensorId {
    emit(
        body,
        names,
        kind,
        kind.mnemonic(),
        inputs,
        elem,
        Shape::scalar(),
        TensorRole::Intermediate,
    )
}

/// Gate a freshly computed value on the final accumulation step.
///
/// While the accumulator is still partial the previous value is written
/// back unchanged; only the last step commits `fresh`.
fn maybe_gate(
    body: &mut Graph,
    names: &mut NameGen,
    ctx: &LoopContext,
    fresh: TensorId,
    passthrough: TensorId,
) -> TensorId {
    if !ctx.gate_by_step {
        return fresh;
    }
    let (Some(step), Some(last)) = (ctx.step_index, ctx.last_step) else {
        return fresh;
    };
    let mask = emit(
        body,
        names,
        OpKind::Equal,
        "is_last",
        &[step, last],
        ElemType::Bool,
        Shape::scalar(),
        TensorRole::Intermediate,
    );
    scalar_op(body, names, OpKind::Where, &[mask, fresh, passthrough], ctx.elem)
}

/// Lower one fused member into the body as scalar arithmetic.
///
/// Operands already produced inside the segment are picked up from
/// `produced`; everything else resolves through an import and a
/// single-element gather. The member's output scalar is recorded in
/// `produced` under its outer tensor ID.
#[allow(clippy::too_many_arguments)]
pub(crate) fn emit_member(
    graph: &Graph,
    body: &mut Graph,
    names: &mut NameGen,
    ctx: &LoopContext,
    imports: &mut ImportMap,
    produced: &mut HashMap<TensorId, TensorId>,
    out_coords: &[TensorId],
    out_shape: &[usize],
    node: &Node,
) -> Result<()> {
    let out_id = *node.outputs.first().ok_or_else(|| {
        Error::Structural(format!("operator '{}' has no output", node.name))
    })?;
    let elem = graph.tensor(out_id)?.dtype;

    let value = if node.kind.is_binary_arith() {
        if node.inputs.len() != 2 {
            return Err(Error::Structural(format!(
                "operator '{}' expects 2 inputs, has {}",
                node.name,
                node.inputs.len()
            )));
        }
        let carried_lhs = produced.get(&node.inputs[0]).copied();
        let carried_rhs = produced.get(&node.inputs[1]).copied();
        let lhs = resolve_operand(
            graph, body, names, ctx, imports, produced, out_coords, out_shape, node.inputs[0],
        )?;
        let rhs = resolve_operand(
            graph, body, names, ctx, imports, produced, out_coords, out_shape, node.inputs[1],
        )?;
        let fresh = scalar_op(body, names, node.kind, &[lhs, rhs], elem);
        // When gating, non-final steps keep writing the running value.
        let passthrough = carried_lhs.or(carried_rhs).unwrap_or(lhs);
        maybe_gate(body, names, ctx, fresh, passthrough)
    } else if node.kind.is_unary() {
        let &input = node.inputs.first().ok_or_else(|| {
            Error::Structural(format!("operator '{}' has no input", node.name))
        })?;
        let x = resolve_operand(
            graph, body, names, ctx, imports, produced, out_coords, out_shape, input,
        )?;
        let fresh = scalar_op(body, names, node.kind, &[x], elem);
        maybe_gate(body, names, ctx, fresh, x)
    } else {
        return Err(Error::Unsupported(format!(
            "no scalar recipe for operator {:?}",
            node.kind
        )));
    };

    produced.insert(out_id, value);
    Ok(())
}

/// Combine the previous carry element with the incoming value for one
/// reduction step.
///
/// `x` is the (already pre-scaled, for mean) input element; `prev` is the
/// carry element at the write position. Returns the value to write back.
pub(crate) fn emit_reduce_combine(
    body: &mut Graph,
    names: &mut NameGen,
    ctx: &LoopContext,
    kind: OpKind,
    prev: TensorId,
    x: TensorId,
) -> Result<TensorId> {
    let elem = ctx.elem;
    let combined = match kind {
        OpKind::ReduceSum => scalar_op(body, names, OpKind::Add, &[prev, x], elem),
        OpKind::ReduceMean => {
            debug_assert!(ctx.mean_scale.is_some(), "mean input must be pre-scaled");
            scalar_op(body, names, OpKind::Add, &[prev, x], elem)
        }
        OpKind::ReduceProd => scalar_op(body, names, OpKind::Mul, &[prev, x], elem),
        OpKind::ReduceMax => scalar_op(body, names, OpKind::Max, &[prev, x], elem),
        OpKind::ReduceMin => scalar_op(body, names, OpKind::Min, &[prev, x], elem),
        OpKind::ReduceSumSquare => {
            let sq = scalar_op(body, names, OpKind::Mul, &[x, x], elem);
            scalar_op(body, names, OpKind::Add, &[prev, sq], elem)
        }
        OpKind::ReduceL1 => {
            let mag = scalar_op(body, names, OpKind::Abs, &[x], elem);
            scalar_op(body, names, OpKind::Add, &[prev, mag], elem)
        }
        OpKind::ReduceL2 => {
            // Carry holds the running root; square it back before adding.
            let prev_sq = scalar_op(body, names, OpKind::Mul, &[prev, prev], elem);
            let x_sq = scalar_op(body, names, OpKind::Mul, &[x, x], elem);
            let sum = scalar_op(body, names, OpKind::Add, &[prev_sq, x_sq], elem);
            scalar_op(body, names, OpKind::Sqrt, &[sum], elem)
        }
        OpKind::ReduceLogSum => {
            let running = recover_running_sum(body, names, ctx, prev);
            let sum = scalar_op(body, names, OpKind::Add, &[running, x], elem);
            scalar_op(body, names, OpKind::Log, &[sum], elem)
        }
        OpKind::ReduceLogSumExp => {
            let running = recover_running_sum(body, names, ctx, prev);
            let exp_x = scalar_op(body, names, OpKind::Exp, &[x], elem);
            let sum = scalar_op(body, names, OpKind::Add, &[running, exp_x], elem);
            scalar_op(body, names, OpKind::Log, &[sum], elem)
        }
        other => {
            return Err(Error::Unsupported(format!(
                "no accumulator recipe for operator {:?}",
                other
            )))
        }
    };
    Ok(combined)
}

/// Undo the log on the carry to recover the running sum.
///
/// The carry starts at 0, which `Exp` would turn into a spurious 1, so a
/// zero carry is treated as the empty sum. A genuine running value of 0
/// (sum exactly 1) is indistinguishable from the empty state and resets
/// the sum; callers inherit that edge.
fn recover_running_sum(
    body: &mut Graph,
    names: &mut NameGen,
    ctx: &LoopContext,
    prev: TensorId,
) -> TensorId {
    let zero = emit_const(
        body,
        names,
        "zero",
        TensorValue::scalar_f32(0.0),
        TensorRole::IndexAux,
    );
    let is_empty = emit(
        body,
        names,
        OpKind::Equal,
        "is_empty",
        &[prev, zero],
        ElemType::Bool,
        Shape::scalar(),
        TensorRole::Intermediate,
    );
    let exp_prev = scalar_op(body, names, OpKind::Exp, &[prev], ctx.elem);
    scalar_op(body, names, OpKind::Where, &[is_empty, zero, exp_prev], ctx.elem)
}
