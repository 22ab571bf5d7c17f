//! Catch-all builder for elementwise segments.
//!
//! One iteration per output element: the counter decodes to output
//! coordinates, every member runs as scalar arithmetic, and the final
//! scalar is written back at the counter position.

use spindle_core::Graph;

use std::collections::HashMap;

use crate::builders::{
    lowerable_elem, outer_scaffolding, segment_nodes, segment_output, splat, LoopBuilder,
};
use crate::chain::{is_broadcast_safe, Segment};
use crate::context::{BuildResult, LoopContext, NameGen};
use crate::handlers::emit_member;
use crate::indexing::{decode_counter, ImportMap};
use crate::{Error, Result};

pub(crate) struct DefaultBuilder;

impl LoopBuilder for DefaultBuilder {
    fn name(&self) -> &'static str {
        "default"
    }

    fn can_handle(&self, graph: &Graph, segment: &Segment) -> bool {
        let all_elementwise = segment
            .ops
            .iter()
            .all(|&id| graph.node(id).map(|n| n.kind.is_elementwise()).unwrap_or(false));
        if !all_elementwise {
            return false;
        }
        let Ok((_, out)) = segment_output(graph, segment) else {
            return false;
        };
        if !out.shape.is_static() || !lowerable_elem(out.dtype) {
            return false;
        }
        is_broadcast_safe(graph, segment).unwrap_or(false)
    }

    fn build(
        &self,
        graph: &mut Graph,
        segment: &Segment,
        names: &mut NameGen,
    ) -> Result<BuildResult> {
        let nodes = segment_nodes(graph, segment)?;
        let (out_id, out) = segment_output(graph, segment)?;
        let dims = out
            .shape
            .as_static()
            .ok_or_else(|| {
                Error::MissingShape(format!("output '{}' has no static shape", out.name))
            })?
            .to_vec();
        let flat_len: usize = dims.iter().product();
        let fused = nodes.len() > 1;

        let (mut body, ctx) =
            LoopContext::begin(out.dtype, flat_len, dims.clone(), fused, true, names);
        let out_coords = decode_counter(&mut body, names, ctx.iter, &dims);

        let mut imports = ImportMap::new();
        let mut produced = HashMap::new();
        for node in &nodes {
            emit_member(
                graph,
                &mut body,
                names,
                &ctx,
                &mut imports,
                &mut produced,
                &out_coords,
                &dims,
                node,
            )?;
        }

        let result = *produced.get(&out_id).ok_or_else(|| {
            Error::Structural(format!("segment result '{}' was never produced", out.name))
        })?;
        let write_index = ctx
            .iter_vec
            .ok_or_else(|| Error::Structural("write index was not prepared".to_string()))?;

        let init = splat(out.dtype, flat_len, 0.0)?;
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
