//! Builder for the reduction family.
//!
//! One iteration per *input* element: the counter decodes over the input
//! shape, and the same coordinates linearize (with reduced axes dropped)
//! into the output write position. The carry starts at the operation's
//! identity and each step folds one element in.
//!
//! Reductions are the one family where a missing static input shape is a
//! hard error rather than a skip: the iteration space cannot be derived
//! without it.

use spindle_core::index::{compute_strides, normalize_axes, reduce_output_shape};
use spindle_core::{ElemType, Graph, OpKind, Shape, TensorData, TensorRole, TensorValue};

use std::collections::HashMap;

use crate::builders::{lowerable_elem, outer_scaffolding, segment_output, LoopBuilder};
use crate::chain::Segment;
use crate::context::{BuildResult, LoopContext, NameGen};
use crate::handlers::emit_reduce_combine;
use crate::indexing::{
    decode_counter, emit, emit_const, gather_at_vec, linearize_with_strides, resolve_operand,
    ImportMap,
};
use crate::{Error, Result};

pub(crate) struct ReduceBuilder;

/// Whether the recurrence for `kind` needs float arithmetic.
fn needs_float(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::ReduceMean | OpKind::ReduceL2 | OpKind::ReduceLogSum | OpKind::ReduceLogSumExp
    )
}

/// Identity element the carry is seeded with.
fn identity_fill(kind: OpKind, elem: ElemType, len: usize) -> Result<TensorValue> {
    let data = match (kind, elem) {
        (OpKind::ReduceMax, ElemType::F32) => TensorData::F32(vec![f32::MIN; len]),
        (OpKind::ReduceMax, ElemType::I64) => TensorData::I64(vec![i64::MIN; len]),
        (OpKind::ReduceMax, ElemType::I32) => TensorData::I32(vec![i32::MIN; len]),
        (OpKind::ReduceMin, ElemType::F32) => TensorData::F32(vec![f32::MAX; len]),
        (OpKind::ReduceMin, ElemType::I64) => TensorData::I64(vec![i64::MAX; len]),
        (OpKind::ReduceMin, ElemType::I32) => TensorData::I32(vec![i32::MAX; len]),
        (OpKind::ReduceProd, ElemType::F32) => TensorData::F32(vec![1.0; len]),
        (OpKind::ReduceProd, ElemType::I64) => TensorData::I64(vec![1; len]),
        (OpKind::ReduceProd, ElemType::I32) => TensorData::I32(vec![1; len]),
        (_, ElemType::F32) => TensorData::F32(vec![0.0; len]),
        (_, ElemType::I64) => TensorData::I64(vec![0; len]),
        (_, ElemType::I32) => TensorData::I32(vec![0; len]),
        (_, other) => {
            return Err(Error::Unsupported(format!(
                "cannot lower {:?} reduction",
                other
            )))
        }
    };
    Ok(TensorValue::new(data, vec![len], elem))
}

impl LoopBuilder for ReduceBuilder {
    fn name(&self) -> &'static str {
        "reduce"
    }

    /// Accepts every reduction singleton with a supported element type.
    /// Shape checks are deliberately absent here; they happen in `build`
    /// where a missing shape is fatal.
    fn can_handle(&self, graph: &Graph, segment: &Segment) -> bool {
        let [op_id] = segment.ops.as_slice() else {
            return false;
        };
        let Ok(node) = graph.node(*op_id) else {
            return false;
        };
        if !node.kind.is_reduction() {
            return false;
        }
        let Some(&input_id) = node.inputs.first() else {
            return false;
        };
        let Ok(input) = graph.tensor(input_id) else {
            return false;
        };
        if needs_float(node.kind) {
            input.dtype == ElemType::F32
        } else {
            lowerable_elem(input.dtype)
        }
    }

    fn build(
        &self,
        graph: &mut Graph,
        segment: &Segment,
        names: &mut NameGen,
    ) -> Result<BuildResult> {
        let node = graph.node(segment.ops[0])?.clone();
        let kind = node.kind;
        let input_id = *node
            .inputs
            .first()
            .ok_or_else(|| Error::Structural(format!("'{}' has no input", node.name)))?;
        let input = graph.tensor(input_id)?;
        let in_dims = input
            .shape
            .as_static()
            .ok_or_else(|| {
                Error::MissingShape(format!(
                    "reduction '{}' requires a static input shape",
                    node.name
                ))
            })?
            .to_vec();
        let elem = input.dtype;
        let rank = in_dims.len();

        let axes_raw: Vec<i64> = if node.has_attr("axes") {
            node.attr("axes")?
        } else {
            (0..rank as i64).collect()
        };
        let axes = normalize_axes(&axes_raw, rank)?;
        let keepdims = node
            .attr::<i64>("keepdims")
            .map(|v| v != 0)
            .unwrap_or(true);
        let out_dims = reduce_output_shape(&in_dims, &axes, keepdims);
        let flat_out: usize = out_dims.iter().product();
        let trip: usize = in_dims.iter().product();
        let count = if flat_out == 0 { 0 } else { trip / flat_out };

        let (out_id, out) = segment_output(graph, segment)?;
        // The adopted output keeps whatever shape upstream inferred; fill it
        // in when it was left unknown.
        if out.shape.is_unknown() {
            graph.tensor_mut(out_id)?.shape = Shape::Static(out_dims.clone());
        }

        let (mut body, mut ctx) =
            LoopContext::begin(elem, flat_out, out_dims.clone(), false, false, names);
        let in_coords = decode_counter(&mut body, names, ctx.iter, &in_dims);

        // Reduced axes drop out of the write position.
        let out_strides = compute_strides(&out_dims);
        let mut terms = Vec::new();
        let mut kept = 0;
        for (axis, &coord) in in_coords.iter().enumerate() {
            if axes.contains(&axis) {
                continue;
            }
            let stride = if keepdims {
                out_strides[axis]
            } else {
                out_strides[kept]
            };
            terms.push((coord, stride));
            kept += 1;
        }
        let out_index = linearize_with_strides(&mut body, names, &terms);
        let write_index = emit(
            &mut body,
            names,
            OpKind::Unsqueeze,
            "write_idx",
            &[out_index, ctx.axis_zero],
            ElemType::I64,
            Shape::Static(vec![1]),
            TensorRole::Index,
        );
        let prev = gather_at_vec(&mut body, names, ctx.axis_zero, ctx.carry, write_index, elem);

        let mut imports = ImportMap::new();
        let produced = HashMap::new();
        let mut x = resolve_operand(
            graph,
            &mut body,
            names,
            &ctx,
            &mut imports,
            &produced,
            &in_coords,
            &in_dims,
            input_id,
        )?;

        if kind == OpKind::ReduceMean {
            let scale = emit_const(
                &mut body,
                names,
                "mean_scale",
                TensorValue::scalar_f32(1.0 / count as f32),
                TensorRole::IndexAux,
            );
            ctx.mean_scale = Some(scale);
            x = emit(
                &mut body,
                names,
                OpKind::Mul,
                "scaled",
                &[x, scale],
                elem,
                Shape::scalar(),
                TensorRole::Intermediate,
            );
        }

        let result = emit_reduce_combine(&mut body, names, &ctx, kind, prev, x)?;

        let init = identity_fill(kind, elem, flat_out)?;
        let (trip_count, condition, init_carry) = outer_scaffolding(graph, names, trip, init);

        Ok(BuildResult {
            body,
            ctx,
            result,
            write_index,
            outer_refs: imports.refs,
            outer_result: out_id,
            trip_count,
            condition,
            init_carry,
        })
    }
}
