//! Builder for 2-D `MatMul`, optionally fused with an elementwise epilogue.
//!
//! The iteration space is `[M, N, K]` with the contraction axis innermost.
//! Each step reads one element of each factor, multiplies, and accumulates
//! into the output position `(row, col)`. Epilogue members are gated on the
//! final contraction step so partial sums never leak through them.

use spindle_core::{Graph, OpKind, TensorRole, TensorValue};

use std::collections::HashMap;

use crate::builders::{
    lowerable_elem, outer_scaffolding, segment_nodes, segment_output, splat, LoopBuilder,
};
use crate::chain::{is_broadcast_safe, Segment};
use crate::context::{BuildResult, LoopContext, NameGen};
use crate::handlers::emit_member;
use crate::indexing::{
    decode_counter, emit_const, flatten_import, gather_at, gather_at_vec, import_tensor,
    linearize, ImportMap,
};
use crate::{Error, Result};

pub(crate) struct MatMulBuilder;

/// Rank-2 static dims of a tensor, when known.
fn rank2_dims(graph: &Graph, id: spindle_core::TensorId) -> Option<[usize; 2]> {
    let dims = graph.tensor(id).ok()?.shape.as_static()?;
    match dims {
        [rows, cols] => Some([*rows, *cols]),
        _ => None,
    }
}

impl LoopBuilder for MatMulBuilder {
    fn name(&self) -> &'static str {
        "matmul"
    }

    fn can_handle(&self, graph: &Graph, segment: &Segment) -> bool {
        let Ok(nodes) = segment_nodes(graph, segment) else {
            return false;
        };
        let Some((matmul, epilogue)) = nodes.split_first() else {
            return false;
        };
        if matmul.kind != OpKind::MatMul || matmul.inputs.len() != 2 {
            return false;
        }
        // A Transpose downstream of the accumulation cannot run one element
        // per step; the segment has to fall apart instead.
        if !epilogue.iter().all(|n| n.kind.is_elementwise()) {
            return false;
        }

        let Some([m, k]) = rank2_dims(graph, matmul.inputs[0]) else {
            return false;
        };
        let Some([k2, n]) = rank2_dims(graph, matmul.inputs[1]) else {
            return false;
        };
        if k != k2 {
            return false;
        }
        // An empty contraction never reaches the gated final step, so the
        // epilogue would never run; those members must lower separately.
        if k == 0 && !epilogue.is_empty() {
            return false;
        }

        let Ok((_, out)) = segment_output(graph, segment) else {
            return false;
        };
        // The epilogue must not grow the output beyond [M, N].
        if out.shape.as_static() != Some(&[m, n][..]) {
            return false;
        }
        lowerable_elem(out.dtype) && is_broadcast_safe(graph, segment).unwrap_or(false)
    }

    fn build(
        &self,
        graph: &mut Graph,
        segment: &Segment,
        names: &mut NameGen,
    ) -> Result<BuildResult> {
        let nodes = segment_nodes(graph, segment)?;
        let matmul = &nodes[0];
        let [m, k] = rank2_dims(graph, matmul.inputs[0])
            .ok_or_else(|| Error::MissingShape("matmul lhs is not static rank 2".to_string()))?;
        let [k2, n] = rank2_dims(graph, matmul.inputs[1])
            .ok_or_else(|| Error::MissingShape("matmul rhs is not static rank 2".to_string()))?;
        if k != k2 {
            return Err(Error::Structural(format!(
                "contraction mismatch: lhs K = {}, rhs K = {}",
                k, k2
            )));
        }

        let (out_id, out) = segment_output(graph, segment)?;
        let elem = out.dtype;
        let flat_out = m * n;
        let trip = m * n * k;
        let fused = nodes.len() > 1;

        let (mut body, mut ctx) =
            LoopContext::begin(elem, flat_out, vec![m, n], fused, false, names);
        let coords = decode_counter(&mut body, names, ctx.iter, &[m, n, k]);
        let (row, col, step) = (coords[0], coords[1], coords[2]);

        if fused {
            ctx.gate_by_step = true;
            ctx.step_index = Some(step);
            ctx.last_step = Some(emit_const(
                &mut body,
                names,
                "last_step",
                TensorValue::scalar_i64(k as i64 - 1),
                TensorRole::IndexAux,
            ));
        }

        let mut imports = ImportMap::new();
        let lhs = import_tensor(graph, &mut body, &mut imports, matmul.inputs[0])?;
        let lhs_flat = flatten_import(
            &mut body, names, &mut imports, matmul.inputs[0], lhs, m * k, elem,
        );
        let lhs_index = linearize(&mut body, names, &[row, step], &[m, k]);
        let lhs_elem = gather_at(&mut body, names, ctx.axis_zero, lhs_flat, lhs_index, elem);

        let rhs = import_tensor(graph, &mut body, &mut imports, matmul.inputs[1])?;
        let rhs_flat = flatten_import(
            &mut body, names, &mut imports, matmul.inputs[1], rhs, k * n, elem,
        );
        let rhs_index = linearize(&mut body, names, &[step, col], &[k, n]);
        let rhs_elem = gather_at(&mut body, names, ctx.axis_zero, rhs_flat, rhs_index, elem);

        let out_index = linearize(&mut body, names, &[row, col], &[m, n]);
        let write_index = crate::indexing::emit(
            &mut body,
            names,
            OpKind::Unsqueeze,
            "write_idx",
            &[out_index, ctx.axis_zero],
            spindle_core::ElemType::I64,
            spindle_core::Shape::Static(vec![1]),
            TensorRole::Index,
        );
        let prev = gather_at_vec(&mut body, names, ctx.axis_zero, ctx.carry, write_index, elem);

        let product = crate::indexing::emit(
            &mut body,
            names,
            OpKind::Mul,
            "prod",
            &[lhs_elem, rhs_elem],
            elem,
            spindle_core::Shape::scalar(),
            TensorRole::Intermediate,
        );
        let acc = crate::indexing::emit(
            &mut body,
            names,
            OpKind::Add,
            "acc",
            &[prev, product],
            elem,
            spindle_core::Shape::scalar(),
            TensorRole::Intermediate,
        );

        let mut produced = HashMap::new();
        produced.insert(matmul.outputs[0], acc);
        for node in &nodes[1..] {
            emit_member(
                graph,
                &mut body,
                names,
                &ctx,
                &mut imports,
                &mut produced,
                &coords[..2],
                &[m, n],
                node,
            )?;
        }

        let result = *produced.get(&out_id).ok_or_else(|| {
            Error::Structural("segment result was never produced".to_string())
        })?;

        let init = splat(elem, flat_out, 0.0)?;
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
