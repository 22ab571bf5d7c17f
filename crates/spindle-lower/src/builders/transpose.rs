//! Builder for `Transpose`, optionally fused with a following `Add`.
//!
//! The counter decodes to output coordinates; applying the permutation in
//! reverse yields the input coordinates, which linearize to the read
//! position. No gating is needed since every output element is written
//! exactly once.

use spindle_core::{Graph, OpKind};

use std::collections::HashMap;

use crate::builders::{
    lowerable_elem, outer_scaffolding, segment_nodes, segment_output, splat, LoopBuilder,
};
use crate::chain::{is_broadcast_safe, Segment};
use crate::context::{BuildResult, LoopContext, NameGen};
use crate::handlers::emit_member;
use crate::indexing::{
    decode_counter, flatten_import, gather_at, import_tensor, linearize, ImportMap,
};
use crate::{Error, Result};

pub(crate) struct TransposeBuilder;

/// Permutation for a transpose node: the `perm` attribute when present,
/// otherwise the reversed axes. Returns `None` when the attribute is not a
/// valid permutation of `0..rank`.
fn permutation(node: &spindle_core::Node, rank: usize) -> Option<Vec<usize>> {
    let perm: Vec<usize> = if node.has_attr("perm") {
        let raw: Vec<i64> = node.attr("perm").ok()?;
        raw.iter().map(|&axis| axis as usize).collect()
    } else {
        (0..rank).rev().collect()
    };
    if perm.len() != rank {
        return None;
    }
    let mut seen = vec![false; rank];
    for &axis in &perm {
        if axis >= rank || seen[axis] {
            return None;
        }
        seen[axis] = true;
    }
    Some(perm)
}

impl LoopBuilder for TransposeBuilder {
    fn name(&self) -> &'static str {
        "transpose"
    }

    fn can_handle(&self, graph: &Graph, segment: &Segment) -> bool {
        let Ok(nodes) = segment_nodes(graph, segment) else {
            return false;
        };
        let fits = match nodes.as_slice() {
            [first] => first.kind == OpKind::Transpose,
            [first, second] => first.kind == OpKind::Transpose && second.kind == OpKind::Add,
            _ => false,
        };
        if !fits {
            return false;
        }

        let transpose = &nodes[0];
        let Some(&input_id) = transpose.inputs.first() else {
            return false;
        };
        let Ok(input) = graph.tensor(input_id) else {
            return false;
        };
        let Some(in_dims) = input.shape.as_static() else {
            return false;
        };
        if permutation(transpose, in_dims.len()).is_none() {
            return false;
        }

        let Ok((_, out)) = segment_output(graph, segment) else {
            return false;
        };
        out.shape.is_static()
            && lowerable_elem(out.dtype)
            && is_broadcast_safe(graph, segment).unwrap_or(false)
    }

    fn build(
        &self,
        graph: &mut Graph,
        segment: &Segment,
        names: &mut NameGen,
    ) -> Result<BuildResult> {
        let nodes = segment_nodes(graph, segment)?;
        let transpose = &nodes[0];
        let input_id = *transpose
            .inputs
            .first()
            .ok_or_else(|| Error::Structural("transpose has no input".to_string()))?;
        let input = graph.tensor(input_id)?;
        let in_dims = input
            .shape
            .as_static()
            .ok_or_else(|| {
                Error::MissingShape(format!("input '{}' has no static shape", input.name))
            })?
            .to_vec();
        let elem = input.dtype;

        let perm = permutation(transpose, in_dims.len()).ok_or_else(|| {
            Error::Structural(format!("invalid perm on '{}'", transpose.name))
        })?;
        let out_dims: Vec<usize> = perm.iter().map(|&axis| in_dims[axis]).collect();
        let flat_len: usize = out_dims.iter().product();

        let (out_id, _) = segment_output(graph, segment)?;
        let fused = nodes.len() > 1;

        let (mut body, ctx) =
            LoopContext::begin(elem, flat_len, out_dims.clone(), fused, true, names);
        let out_coords = decode_counter(&mut body, names, ctx.iter, &out_dims);

        // Output axis i reads input axis perm[i].
        let mut in_coords = vec![spindle_core::TensorId::new(0); in_dims.len()];
        for (out_axis, &in_axis) in perm.iter().enumerate() {
            in_coords[in_axis] = out_coords[out_axis];
        }
        let read_index = linearize(&mut body, names, &in_coords, &in_dims);

        let mut imports = ImportMap::new();
        let source = import_tensor(graph, &mut body, &mut imports, input_id)?;
        let numel: usize = in_dims.iter().product();
        let flat = flatten_import(&mut body, names, &mut imports, input_id, source, numel, elem);
        let value = gather_at(&mut body, names, ctx.axis_zero, flat, read_index, elem);

        let mut produced = HashMap::new();
        produced.insert(transpose.outputs[0], value);
        for node in &nodes[1..] {
            emit_member(
                graph,
                &mut body,
                names,
                &ctx,
                &mut imports,
                &mut produced,
                &out_coords,
                &out_dims,
                node,
            )?;
        }

        let result = *produced.get(&out_id).ok_or_else(|| {
            Error::Structural("segment result was never produced".to_string())
        })?;
        let write_index = ctx
            .iter_vec
            .ok_or_else(|| Error::Structural("write index was not prepared".to_string()))?;

        let init = splat(elem, flat_len, 0.0)?;
        let (trip_count, condition, init_carry) =
            outer_scaffolding(graph, names, flat_len, init);

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
