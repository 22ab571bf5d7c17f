//! Builder for `Range`, optionally fused with an elementwise epilogue.
//!
//! The sequence value is pure arithmetic on the counter
//! (`start + iter * delta`), so the body reads no source tensor at all.
//! The trip count is computed in the outer graph from the range bounds:
//! `Cast(Max(Ceil((limit - start) / delta), 0))`, and the initial carry is
//! built by `ConstantOfShape` over the unsqueezed trip count.

use spindle_core::{Attribute, ElemType, Graph, OpKind, Shape, Tensor, TensorId, TensorRole, TensorValue};

use std::collections::HashMap;

use crate::builders::{lowerable_elem, segment_nodes, segment_output, splat, LoopBuilder};
use crate::chain::{is_broadcast_safe, Segment};
use crate::context::{BuildResult, LoopContext, NameGen};
use crate::handlers::emit_member;
use crate::indexing::{emit, emit_const, emit_with, resolve_operand, ImportMap};
use crate::{Error, Result};

pub(crate) struct GenerativeBuilder;

/// A range bound usable by the outer trip chain: static shape, one element.
fn is_scalar_like(graph: &Graph, id: TensorId) -> bool {
    graph
        .tensor(id)
        .ok()
        .and_then(|t| t.shape.numel())
        .map(|n| n == 1)
        .unwrap_or(false)
}

fn is_zero_value(value: &TensorValue) -> bool {
    match &value.data {
        spindle_core::TensorData::F32(v) => v.first() == Some(&0.0),
        spindle_core::TensorData::I64(v) => v.first() == Some(&0),
        spindle_core::TensorData::I32(v) => v.first() == Some(&0),
        _ => false,
    }
}

/// Reduce a one-element tensor to rank 0 in the outer graph.
fn outer_scalar(graph: &mut Graph, names: &mut NameGen, id: TensorId) -> Result<TensorId> {
    let tensor = graph.tensor(id)?;
    if tensor.shape.ndim() == Some(0) {
        return Ok(id);
    }
    let dtype = tensor.dtype;
    Ok(emit(
        graph,
        names,
        OpKind::Squeeze,
        "bound",
        &[id],
        dtype,
        Shape::scalar(),
        TensorRole::Index,
    ))
}

impl LoopBuilder for GenerativeBuilder {
    fn name(&self) -> &'static str {
        "generative"
    }

    fn can_handle(&self, graph: &Graph, segment: &Segment) -> bool {
        let Ok(nodes) = segment_nodes(graph, segment) else {
            return false;
        };
        let Some((range, epilogue)) = nodes.split_first() else {
            return false;
        };
        if range.kind != OpKind::Range || range.inputs.len() != 3 {
            return false;
        }
        if !epilogue.iter().all(|n| n.kind.is_elementwise()) {
            return false;
        }
        if !range.inputs.iter().all(|&id| is_scalar_like(graph, id)) {
            return false;
        }
        // A zero delta would divide by zero in the trip chain.
        if let Ok(delta) = graph.tensor(range.inputs[2]) {
            if delta.value.as_ref().map(is_zero_value).unwrap_or(false) {
                return false;
            }
        }

        let Ok(range_out) = graph.tensor(range.outputs[0]) else {
            return false;
        };
        let Some(range_dims) = range_out.shape.as_static() else {
            return false;
        };
        let Ok((_, out)) = segment_output(graph, segment) else {
            return false;
        };
        // The epilogue must keep the sequence's own 1-D shape; growth would
        // decouple the counter from the sequence position.
        if out.shape.as_static() != Some(range_dims) || range_dims.len() != 1 {
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
        let range = &nodes[0];
        let (start_id, limit_id, delta_id) = match range.inputs.as_slice() {
            &[start, limit, delta] => (start, limit, delta),
            _ => {
                return Err(Error::Structural(format!(
                    "'{}' expects 3 inputs, has {}",
                    range.name,
                    range.inputs.len()
                )))
            }
        };

        let (out_id, out) = segment_output(graph, segment)?;
        let elem = out.dtype;
        let dims = out
            .shape
            .as_static()
            .ok_or_else(|| {
                Error::MissingShape(format!("output '{}' has no static shape", out.name))
            })?
            .to_vec();
        let flat_len: usize = dims.iter().product();
        let fused = nodes.len() > 1;

        // Trip count, derived in the outer graph from the bounds.
        let start_s = outer_scalar(graph, names, start_id)?;
        let limit_s = outer_scalar(graph, names, limit_id)?;
        let delta_s = outer_scalar(graph, names, delta_id)?;
        let span = emit(
            graph,
            names,
            OpKind::Sub,
            "span",
            &[limit_s, start_s],
            elem,
            Shape::scalar(),
            TensorRole::Index,
        );
        let (span_f, delta_f) = if elem == ElemType::F32 {
            (span, delta_s)
        } else {
            let to_f32 = Attribute::Int(ElemType::F32.onnx_code());
            let span_f = emit_with(
                graph,
                names,
                OpKind::Cast,
                "span_f",
                &[span],
                ElemType::F32,
                Shape::scalar(),
                TensorRole::Index,
                &[("to", to_f32.clone())],
            );
            let delta_f = emit_with(
                graph,
                names,
                OpKind::Cast,
                "delta_f",
                &[delta_s],
                ElemType::F32,
                Shape::scalar(),
                TensorRole::Index,
                &[("to", to_f32)],
            );
            (span_f, delta_f)
        };
        let ratio = emit(
            graph,
            names,
            OpKind::Div,
            "steps_frac",
            &[span_f, delta_f],
            ElemType::F32,
            Shape::scalar(),
            TensorRole::Index,
        );
        let ceiled = emit(
            graph,
            names,
            OpKind::Ceil,
            "steps_ceil",
            &[ratio],
            ElemType::F32,
            Shape::scalar(),
            TensorRole::Index,
        );
        let zero = emit_const(
            graph,
            names,
            "zero",
            TensorValue::scalar_f32(0.0),
            TensorRole::IndexAux,
        );
        let clamped = emit(
            graph,
            names,
            OpKind::Max,
            "steps",
            &[ceiled, zero],
            ElemType::F32,
            Shape::scalar(),
            TensorRole::Index,
        );
        let trip_count = emit_with(
            graph,
            names,
            OpKind::Cast,
            "trip",
            &[clamped],
            ElemType::I64,
            Shape::scalar(),
            TensorRole::Index,
            &[("to", Attribute::Int(ElemType::I64.onnx_code()))],
        );

        // Initial carry sized by the trip count itself.
        let axes_zero = emit_const(
            graph,
            names,
            "axes0",
            TensorValue::i64s(vec![0]),
            TensorRole::IndexAux,
        );
        let trip_vec = emit(
            graph,
            names,
            OpKind::Unsqueeze,
            "trip_vec",
            &[trip_count, axes_zero],
            ElemType::I64,
            Shape::Static(vec![1]),
            TensorRole::Index,
        );
        let fill = Attribute::Tensor(splat(elem, 1, 0.0)?);
        let init_carry = emit_with(
            graph,
            names,
            OpKind::ConstantOfShape,
            "carry_init",
            &[trip_vec],
            elem,
            Shape::Static(vec![flat_len]),
            TensorRole::Index,
            &[("value", fill)],
        );
        let condition = graph.add_tensor(Tensor::index_aux(
            names.fresh("keep_going"),
            TensorValue::scalar_bool(true),
        ));

        // Body: the value is start + iter * delta.
        let (mut body, ctx) = LoopContext::begin(elem, flat_len, dims, fused, true, names);
        let mut imports = ImportMap::new();
        let mut produced = HashMap::new();
        let start_b = resolve_operand(
            graph, &mut body, names, &ctx, &mut imports, &produced, &[], &[], start_id,
        )?;
        let delta_b = resolve_operand(
            graph, &mut body, names, &ctx, &mut imports, &produced, &[], &[], delta_id,
        )?;
        let iter_elem = if elem == ElemType::I64 {
            ctx.iter
        } else {
            emit_with(
                &mut body,
                names,
                OpKind::Cast,
                "iter_elem",
                &[ctx.iter],
                elem,
                Shape::scalar(),
                TensorRole::Index,
                &[("to", Attribute::Int(elem.onnx_code()))],
            )
        };
        let stepped = emit(
            &mut body,
            names,
            OpKind::Mul,
            "stepped",
            &[iter_elem, delta_b],
            elem,
            Shape::scalar(),
            TensorRole::Intermediate,
        );
        let value = emit(
            &mut body,
            names,
            OpKind::Add,
            "value",
            &[start_b, stepped],
            elem,
            Shape::scalar(),
            TensorRole::Intermediate,
        );
        produced.insert(range.outputs[0], value);

        let out_coords = [ctx.iter];
        for node in &nodes[1..] {
            emit_member(
                graph,
                &mut body,
                names,
                &ctx,
                &mut imports,
                &mut produced,
                &out_coords,
                &[flat_len],
                node,
            )?;
        }

        let result = *produced.get(&out_id).ok_or_else(|| {
            Error::Structural("segment result was never produced".to_string())
        })?;
        let write_index = ctx
            .iter_vec
            .ok_or_else(|| Error::Structural("write index was not prepared".to_string()))?;

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
