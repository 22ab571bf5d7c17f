//! Emission helpers for loop bodies.
//!
//! All positions inside a body are scalar int64 tensors derived from the
//! iteration counter by successive division and modulo against row-major
//! strides. Reads from multi-element tensors go through a flatten, a
//! single-element Gather, and a squeeze back to scalar.

use spindle_core::index::compute_strides;
use spindle_core::{
    Attribute, ElemType, Graph, Node, OpKind, Shape, Tensor, TensorId, TensorRole, TensorValue,
};

use std::collections::HashMap;

use crate::context::{LoopContext, NameGen};
use crate::{Error, Result};

/// Add one node with a single fresh output tensor to `body`.
pub(crate) fn emit(
    body: &mut Graph,
    names: &mut NameGen,
    kind: OpKind,
    tag: &str,
    inputs: &[TensorId],
    dtype: ElemType,
    shape: Shape,
    role: TensorRole,
) -> TensorId {
    emit_with(body, names, kind, tag, inputs, dtype, shape, role, &[])
}

/// Like [`emit`], with node attributes.
#[allow(clippy::too_many_arguments)]
pub(crate) fn emit_with(
    body: &mut Graph,
    names: &mut NameGen,
    kind: OpKind,
    tag: &str,
    inputs: &[TensorId],
    dtype: ElemType,
    shape: Shape,
    role: TensorRole,
    attributes: &[(&str, Attribute)],
) -> TensorId {
    let name = names.fresh(tag);
    let out = body.add_tensor(Tensor::with_role(name.clone(), dtype, shape, role));
    let mut node = Node::named(kind, name);
    for &input in inputs {
        node.add_input(input);
    }
    node.add_output(out);
    for (key, value) in attributes {
        node.set_attribute(*key, value.clone());
    }
    body.add_op(node);
    out
}

/// Add a valued tensor (no producing node) to `body`.
pub(crate) fn emit_const(
    body: &mut Graph,
    names: &mut NameGen,
    tag: &str,
    value: TensorValue,
    role: TensorRole,
) -> TensorId {
    let name = names.fresh(tag);
    let mut tensor = Tensor::with_role(name, value.dtype, Shape::Static(value.shape.clone()), role);
    tensor.value = Some(value);
    body.add_tensor(tensor)
}

/// Scalar int64 stride constant.
fn stride_const(body: &mut Graph, names: &mut NameGen, stride: usize) -> TensorId {
    emit_const(
        body,
        names,
        "stride",
        TensorValue::scalar_i64(stride as i64),
        TensorRole::IndexAux,
    )
}

/// Decode a flat counter into one int64 coordinate per axis of `shape`.
///
/// Rank 0 decodes to no coordinates.
pub(crate) fn decode_counter(
    body: &mut Graph,
    names: &mut NameGen,
    counter: TensorId,
    shape: &[usize],
) -> Vec<TensorId> {
    let strides = compute_strides(shape);
    let mut coords = Vec::with_capacity(shape.len());
    let mut cursor = counter;
    for (axis, &stride) in strides.iter().enumerate() {
        let s = stride_const(body, names, stride);
        let coord = emit(
            body,
            names,
            OpKind::Div,
            "coord",
            &[cursor, s],
            ElemType::I64,
            Shape::scalar(),
            TensorRole::Index,
        );
        coords.push(coord);
        if axis + 1 < shape.len() {
            cursor = emit(
                body,
                names,
                OpKind::Mod,
                "rem",
                &[cursor, s],
                ElemType::I64,
                Shape::scalar(),
                TensorRole::Index,
            );
        }
    }
    coords
}

/// Recombine coordinates into a flat int64 index using explicit strides.
///
/// Zero coordinates (fewer than one term) yield a constant 0.
pub(crate) fn linearize_with_strides(
    body: &mut Graph,
    names: &mut NameGen,
    terms: &[(TensorId, usize)],
) -> TensorId {
    let mut acc: Option<TensorId> = None;
    for &(coord, stride) in terms {
        let s = stride_const(body, names, stride);
        let term = emit(
            body,
            names,
            OpKind::Mul,
            "term",
            &[coord, s],
            ElemType::I64,
            Shape::scalar(),
            TensorRole::Index,
        );
        acc = Some(match acc {
            None => term,
            Some(prev) => emit(
                body,
                names,
                OpKind::Add,
                "index",
                &[prev, term],
                ElemType::I64,
                Shape::scalar(),
                TensorRole::Index,
            ),
        });
    }
    acc.unwrap_or_else(|| {
        emit_const(
            body,
            names,
            "index",
            TensorValue::scalar_i64(0),
            TensorRole::IndexAux,
        )
    })
}

/// Recombine one coordinate per axis of `shape` into a flat index.
pub(crate) fn linearize(
    body: &mut Graph,
    names: &mut NameGen,
    coords: &[TensorId],
    shape: &[usize],
) -> TensorId {
    debug_assert_eq!(coords.len(), shape.len());
    let strides = compute_strides(shape);
    let terms: Vec<(TensorId, usize)> = coords.iter().copied().zip(strides).collect();
    linearize_with_strides(body, names, &terms)
}

/// Flat index into `operand_shape` for the element that broadcasts to the
/// output position described by `out_coords` over `out_shape`.
///
/// Shapes are right-aligned; size-1 operand axes clamp to coordinate 0 and
/// contribute no term.
pub(crate) fn broadcast_index(
    body: &mut Graph,
    names: &mut NameGen,
    out_coords: &[TensorId],
    out_shape: &[usize],
    operand_shape: &[usize],
) -> TensorId {
    debug_assert!(operand_shape.len() <= out_shape.len());
    let offset = out_shape.len() - operand_shape.len();
    let strides = compute_strides(operand_shape);
    let terms: Vec<(TensorId, usize)> = operand_shape
        .iter()
        .enumerate()
        .filter(|&(_, &dim)| dim != 1)
        .map(|(axis, _)| (out_coords[offset + axis], strides[axis]))
        .collect();
    linearize_with_strides(body, names, &terms)
}

/// Read one element of a flattened 1-D tensor at a scalar index.
///
/// Emits `Unsqueeze(index) -> Gather(source, _, axis=0) -> Squeeze`.
pub(crate) fn gather_at(
    body: &mut Graph,
    names: &mut NameGen,
    axis_zero: TensorId,
    source_flat: TensorId,
    index: TensorId,
    elem: ElemType,
) -> TensorId {
    let index_vec = emit(
        body,
        names,
        OpKind::Unsqueeze,
        "idx_vec",
        &[index, axis_zero],
        ElemType::I64,
        Shape::Static(vec![1]),
        TensorRole::Index,
    );
    gather_at_vec(body, names, axis_zero, source_flat, index_vec, elem)
}

/// [`gather_at`] when the index is already a length-1 int64 vector.
pub(crate) fn gather_at_vec(
    body: &mut Graph,
    names: &mut NameGen,
    axis_zero: TensorId,
    source_flat: TensorId,
    index_vec: TensorId,
    elem: ElemType,
) -> TensorId {
    let picked = emit_with(
        body,
        names,
        OpKind::Gather,
        "pick",
        &[source_flat, index_vec],
        elem,
        Shape::Static(vec![1]),
        TensorRole::Intermediate,
        &[("axis", Attribute::Int(0))],
    );
    emit(
        body,
        names,
        OpKind::Squeeze,
        "elem",
        &[picked, axis_zero],
        elem,
        Shape::scalar(),
        TensorRole::Intermediate,
    )
}

/// Outer tensors pulled into a body, with their per-body scalar reads.
pub(crate) struct ImportMap {
    /// Outer ID -> body-side tensor (pre-gather).
    pub refs: HashMap<TensorId, TensorId>,
    /// Outer ID -> cached scalar read, keyed per segment input.
    scalars: HashMap<TensorId, TensorId>,
    /// Outer ID -> cached 1-D flattened view.
    flats: HashMap<TensorId, TensorId>,
}

impl ImportMap {
    pub(crate) fn new() -> Self {
        Self {
            refs: HashMap::new(),
            scalars: HashMap::new(),
            flats: HashMap::new(),
        }
    }
}

/// Make an outer tensor visible inside `body`.
///
/// Tensors with a value (constants, initializers, minted index scalars) are
/// copied in by value. Runtime tensors are declared under their outer name
/// and resolved from the enclosing scope at execution time.
pub(crate) fn import_tensor(
    graph: &Graph,
    body: &mut Graph,
    imports: &mut ImportMap,
    outer_id: TensorId,
) -> Result<TensorId> {
    if let Some(&body_id) = imports.refs.get(&outer_id) {
        return Ok(body_id);
    }
    let outer = graph.tensor(outer_id)?;
    let mut tensor = Tensor::with_role(
        outer.name.clone(),
        outer.dtype,
        outer.shape.clone(),
        outer.role,
    );
    tensor.value = outer.value.clone();
    let body_id = body.add_tensor(tensor);
    imports.refs.insert(outer_id, body_id);
    Ok(body_id)
}

/// Flatten an imported tensor to 1-D, caching the view per outer tensor.
pub(crate) fn flatten_import(
    body: &mut Graph,
    names: &mut NameGen,
    imports: &mut ImportMap,
    outer_id: TensorId,
    body_src: TensorId,
    numel: usize,
    elem: ElemType,
) -> TensorId {
    if let Some(&flat) = imports.flats.get(&outer_id) {
        return flat;
    }
    let target = emit_const(
        body,
        names,
        "flat_shape",
        TensorValue::i64s(vec![numel as i64]),
        TensorRole::IndexAux,
    );
    let flat = emit(
        body,
        names,
        OpKind::Reshape,
        "flat",
        &[body_src, target],
        elem,
        Shape::Static(vec![numel]),
        TensorRole::Intermediate,
    );
    imports.flats.insert(outer_id, flat);
    flat
}

/// Resolve an operand of a fused member to a body-side scalar.
///
/// In-segment intermediates come from `produced`. Scalars (one element)
/// import directly; anything larger is flattened and gathered at the
/// broadcast-clamped index for the current output position. Reads are
/// cached per segment input.
#[allow(clippy::too_many_arguments)]
pub(crate) fn resolve_operand(
    graph: &Graph,
    body: &mut Graph,
    names: &mut NameGen,
    ctx: &LoopContext,
    imports: &mut ImportMap,
    produced: &HashMap<TensorId, TensorId>,
    out_coords: &[TensorId],
    out_shape: &[usize],
    outer_id: TensorId,
) -> Result<TensorId> {
    if let Some(&scalar) = produced.get(&outer_id) {
        return Ok(scalar);
    }
    if let Some(&scalar) = imports.scalars.get(&outer_id) {
        return Ok(scalar);
    }

    let outer = graph.tensor(outer_id)?;
    let elem = outer.dtype;
    let Some(dims) = outer.shape.as_static().map(<[usize]>::to_vec) else {
        return Err(Error::MissingShape(format!(
            "operand '{}' has no static shape",
            outer.name
        )));
    };
    let numel: usize = dims.iter().product();
    let body_src = import_tensor(graph, body, imports, outer_id)?;

    let scalar = if numel == 1 {
        if dims.is_empty() {
            body_src
        } else {
            // Squeeze with no axes drops every size-1 axis.
            emit(
                body,
                names,
                OpKind::Squeeze,
                "elem",
                &[body_src],
                elem,
                Shape::scalar(),
                TensorRole::Intermediate,
            )
        }
    } else {
        let flat = flatten_import(body, names, imports, outer_id, body_src, numel, elem);
        if dims == out_shape {
            if let Some(iter_vec) = ctx.iter_vec {
                // Same layout as the output, so the counter is the index.
                let scalar = gather_at_vec(body, names, ctx.axis_zero, flat, iter_vec, elem);
                imports.scalars.insert(outer_id, scalar);
                return Ok(scalar);
            }
        }
        let index = broadcast_index(body, names, out_coords, out_shape, &dims);
        gather_at(body, names, ctx.axis_zero, flat, index, elem)
    };
    imports.scalars.insert(outer_id, scalar);
    Ok(scalar)
}
