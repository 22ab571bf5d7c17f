//! Segment dispatch and Loop assembly.
//!
//! Segments are processed through an explicit queue so a refused
//! multi-operator segment can fall apart into singletons and re-enter at
//! the front, preserving execution order. Every accepted segment becomes
//! one `Loop` node; the graph is mutated eagerly and nodes are re-resolved
//! by ID, never by held references.

use spindle_core::{ElemType, Graph, Node, OpKind, Shape, TensorRole};

use std::collections::VecDeque;

use crate::builders::BUILDERS;
use crate::chain::{segment_chain, Chain, Segment};
use crate::context::{BuildResult, NameGen};
use crate::indexing::{emit, emit_with};
use crate::{Error, LowerOptions, LowerReport, Result};

/// Lower every segment of one chain.
pub(crate) fn lower_chain(
    graph: &mut Graph,
    chain: &Chain,
    options: &LowerOptions,
    names: &mut NameGen,
    report: &mut LowerReport,
) -> Result<()> {
    let segments = segment_chain(graph, chain, options, report)?;
    let mut queue: VecDeque<Segment> = segments.into();

    while let Some(segment) = queue.pop_front() {
        for &op_id in &segment.ops {
            if !graph.contains_node(op_id) {
                return Err(Error::Structural(
                    "segment references a removed operator".to_string(),
                ));
            }
        }

        let Some(builder) = BUILDERS
            .iter()
            .find(|builder| builder.can_handle(graph, &segment))
        else {
            if segment.ops.len() > 1 {
                tracing::debug!(
                    ops = segment.ops.len(),
                    "no builder accepts the segment; lowering members separately"
                );
                report.segments_demoted += 1;
                for &op_id in segment.ops.iter().rev() {
                    queue.push_front(Segment { ops: vec![op_id] });
                }
            } else {
                let node = graph.node(segment.ops[0])?;
                tracing::debug!(op = ?node.kind, name = %node.name, "left untouched");
                report.ops_skipped += 1;
            }
            continue;
        };

        let _span = tracing::debug_span!("build", builder = builder.name()).entered();
        let built = builder.build(graph, &segment, names)?;
        tracing::debug!(
            trip = ?graph.tensor(built.trip_count)?.value.as_ref().and_then(|v| v.first_i64()),
            fused = built.ctx.fused,
            outer_refs = built.outer_refs.len(),
            "loop body constructed"
        );
        let replaced = segment.ops.len();
        assemble_loop(graph, &segment, built, names)?;
        report.loops_built += 1;
        report.ops_replaced += replaced;
    }
    Ok(())
}

/// Seal the body, remove the replaced operators, and splice in the `Loop`.
///
/// The body gains its scatter tail (`Unsqueeze` the step value, write it at
/// the step position) and declares `[cond, carry]` as outputs, with the
/// condition passed through untouched. The Loop node adopts the segment's
/// final tensor, so downstream consumers never change.
fn assemble_loop(
    graph: &mut Graph,
    segment: &Segment,
    built: BuildResult,
    names: &mut NameGen,
) -> Result<()> {
    let BuildResult {
        mut body,
        ctx,
        result,
        write_index,
        outer_refs,
        outer_result,
        trip_count,
        condition,
        init_carry,
    } = built;

    let flat_len: usize = ctx.output_shape.iter().product();
    let update = emit(
        &mut body,
        names,
        OpKind::Unsqueeze,
        "update",
        &[result, ctx.axis_zero],
        ctx.elem,
        Shape::Static(vec![1]),
        TensorRole::Intermediate,
    );
    let carry_out = emit_with(
        &mut body,
        names,
        OpKind::ScatterElements,
        "carry_out",
        &[ctx.carry, write_index, update],
        ctx.elem,
        Shape::Static(vec![flat_len]),
        TensorRole::Intermediate,
        &[("axis", spindle_core::Attribute::Int(0))],
    );
    body.outputs = vec![ctx.cond_in, carry_out];

    for &op_id in &segment.ops {
        graph.remove_op(op_id)?;
    }

    let mut loop_node = Node::named(OpKind::Loop, names.fresh("loop"));
    loop_node.add_input(trip_count);
    loop_node.add_input(condition);
    loop_node.add_input(init_carry);
    loop_node.add_output(outer_result);
    loop_node.body = Some(Box::new(body));
    let loop_id = graph.add_op(loop_node);

    // Captured outer tensors reach the body by name, not through the loop's
    // input list; their producers still have to run first.
    for &outer_id in outer_refs.keys() {
        if let Some(producer_id) = graph.producer(outer_id) {
            graph.add_dependency(producer_id, loop_id)?;
        }
    }

    debug_assert_eq!(graph.tensor(trip_count)?.dtype, ElemType::I64);
    tracing::debug!(
        loop_node = %graph.node(loop_id)?.name,
        output = %graph.tensor(outer_result)?.name,
        "loop spliced in"
    );
    Ok(())
}
