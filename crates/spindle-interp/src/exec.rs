//! Node-by-node graph execution.

use spindle_core::broadcast::{broadcast_shape, broadcast_shapes, is_broadcastable_to};
use spindle_core::index::{compute_strides, normalize_axes, reduce_output_shape, unflatten_index};
use spindle_core::{
    ElemType, Graph, Node, OpKind, TensorData, TensorId, TensorValue,
};

use std::collections::HashMap;

use crate::{Error, Result};

// ──────────────────────────────── Driver ────────────────────────────────

/// Execute the graph and return one value per graph output.
///
/// `inputs` supplies values for the graph's runtime inputs; constants and
/// initializers come from the tensors themselves.
#[tracing::instrument(skip_all, fields(num_ops = graph.node_count()))]
pub fn run_graph(graph: &Graph, inputs: &[(TensorId, TensorValue)]) -> Result<Vec<TensorValue>> {
    let mut env: HashMap<TensorId, TensorValue> = HashMap::new();
    for (id, value) in inputs {
        env.insert(*id, value.clone());
    }

    exec_graph(graph, &mut env, None)?;

    let mut results = Vec::with_capacity(graph.outputs.len());
    for &id in &graph.outputs {
        materialize(graph, &mut env, None, id)?;
        let value = match env.get(&id).cloned() {
            Some(value) => value,
            None => return Err(Error::MissingValue(graph.tensor(id)?.name.clone())),
        };
        results.push(value);
    }
    Ok(results)
}

/// Values visible from an enclosing graph, resolved by tensor name.
struct Scope<'a> {
    graph: &'a Graph,
    env: &'a HashMap<TensorId, TensorValue>,
    parent: Option<&'a Scope<'a>>,
}

impl<'a> Scope<'a> {
    fn lookup(&self, name: &str) -> Option<&TensorValue> {
        if let Some(id) = self.graph.tensor_by_name(name) {
            if let Some(value) = self.env.get(&id) {
                return Some(value);
            }
        }
        self.parent.and_then(|parent| parent.lookup(name))
    }
}

fn exec_graph(
    graph: &Graph,
    env: &mut HashMap<TensorId, TensorValue>,
    outer: Option<&Scope<'_>>,
) -> Result<()> {
    for op_id in graph.topological_order() {
        let node = graph.node(op_id)?;
        for &input_id in &node.inputs {
            materialize(graph, env, outer, input_id)?;
        }
        tracing::trace!(op = ?node.kind, name = %node.name, "executing");
        let outputs = exec_node(graph, env, outer, node)?;
        if outputs.len() != node.outputs.len() {
            return Err(Error::Execution(format!(
                "'{}' produced {} values for {} outputs",
                node.name,
                outputs.len(),
                node.outputs.len()
            )));
        }
        for (&out_id, value) in node.outputs.iter().zip(outputs) {
            env.insert(out_id, value);
        }
    }
    Ok(())
}

/// Put a value for `id` into the environment, from the tensor's own value
/// or from an enclosing scope (matched by name).
fn materialize(
    graph: &Graph,
    env: &mut HashMap<TensorId, TensorValue>,
    outer: Option<&Scope<'_>>,
    id: TensorId,
) -> Result<()> {
    if env.contains_key(&id) {
        return Ok(());
    }
    let tensor = graph.tensor(id)?;
    if let Some(value) = &tensor.value {
        env.insert(id, value.clone());
        return Ok(());
    }
    if let Some(scope) = outer {
        if let Some(value) = scope.lookup(&tensor.name) {
            let value = value.clone();
            env.insert(id, value);
            return Ok(());
        }
    }
    Err(Error::MissingValue(tensor.name.clone()))
}

fn input<'e>(
    env: &'e HashMap<TensorId, TensorValue>,
    node: &Node,
    index: usize,
) -> Result<&'e TensorValue> {
    let id = node.inputs.get(index).ok_or_else(|| {
        Error::Execution(format!("'{}' is missing input {}", node.name, index))
    })?;
    env.get(id)
        .ok_or_else(|| Error::Execution(format!("input {} of '{}' has no value", index, node.name)))
}

fn exec_node(
    graph: &Graph,
    env: &HashMap<TensorId, TensorValue>,
    outer: Option<&Scope<'_>>,
    node: &Node,
) -> Result<Vec<TensorValue>> {
    let value = match node.kind {
        OpKind::Add
        | OpKind::Sub
        | OpKind::Mul
        | OpKind::Div
        | OpKind::Max
        | OpKind::Min
        | OpKind::Mod => op_binary(node.kind, input(env, node, 0)?, input(env, node, 1)?)?,

        OpKind::Neg
        | OpKind::Abs
        | OpKind::Sqrt
        | OpKind::Exp
        | OpKind::Log
        | OpKind::Ceil
        | OpKind::Floor
        | OpKind::Relu
        | OpKind::Sigmoid
        | OpKind::Tanh => op_unary(node.kind, input(env, node, 0)?)?,

        OpKind::Equal | OpKind::Greater | OpKind::Less => {
            op_compare(node.kind, input(env, node, 0)?, input(env, node, 1)?)?
        }
        OpKind::Where => op_where(
            input(env, node, 0)?,
            input(env, node, 1)?,
            input(env, node, 2)?,
        )?,

        OpKind::MatMul => op_matmul(input(env, node, 0)?, input(env, node, 1)?)?,
        OpKind::Transpose => op_transpose(node, input(env, node, 0)?)?,
        OpKind::Range => op_range(
            input(env, node, 0)?,
            input(env, node, 1)?,
            input(env, node, 2)?,
        )?,

        OpKind::ReduceSum
        | OpKind::ReduceMax
        | OpKind::ReduceMin
        | OpKind::ReduceProd
        | OpKind::ReduceMean
        | OpKind::ReduceSumSquare
        | OpKind::ReduceL1
        | OpKind::ReduceL2
        | OpKind::ReduceLogSum
        | OpKind::ReduceLogSumExp => op_reduce(node, input(env, node, 0)?)?,

        OpKind::Cast => {
            let code: i64 = node.attr("to")?;
            let target = ElemType::from_onnx_code(code)
                .ok_or_else(|| Error::Type(format!("unknown cast target code {}", code)))?;
            input(env, node, 0)?.cast(target)?
        }
        OpKind::Reshape => op_reshape(input(env, node, 0)?, input(env, node, 1)?)?,
        OpKind::Squeeze => {
            let axes = if node.inputs.len() > 1 {
                Some(int_list(input(env, node, 1)?)?)
            } else {
                None
            };
            op_squeeze(input(env, node, 0)?, axes.as_deref())?
        }
        OpKind::Unsqueeze => op_unsqueeze(input(env, node, 0)?, &int_list(input(env, node, 1)?)?)?,
        OpKind::Gather => {
            let axis = if node.has_attr("axis") { node.attr("axis")? } else { 0 };
            if axis != 0 {
                return Err(Error::Execution(format!(
                    "gather on axis {} is not supported",
                    axis
                )));
            }
            op_gather(input(env, node, 0)?, input(env, node, 1)?)?
        }
        OpKind::ScatterElements => {
            let axis = if node.has_attr("axis") { node.attr("axis")? } else { 0 };
            if axis != 0 {
                return Err(Error::Execution(format!(
                    "scatter on axis {} is not supported",
                    axis
                )));
            }
            op_scatter_elements(
                input(env, node, 0)?,
                input(env, node, 1)?,
                input(env, node, 2)?,
            )?
        }
        OpKind::Shape => {
            let dims = &input(env, node, 0)?.shape;
            TensorValue::i64s(dims.iter().map(|&d| d as i64).collect())
        }
        OpKind::Expand => op_expand(input(env, node, 0)?, &int_list(input(env, node, 1)?)?)?,
        OpKind::ConstantOfShape => {
            let dims = int_list(input(env, node, 0)?)?;
            let proto = if node.has_attr("value") {
                node.attr::<TensorValue>("value")?
            } else {
                TensorValue::scalar_f32(0.0)
            };
            op_constant_of_shape(&proto, &dims)?
        }
        OpKind::Identity => input(env, node, 0)?.clone(),

        OpKind::Loop => return op_loop(graph, env, outer, node),

        OpKind::Conv | OpKind::AveragePool => {
            return Err(Error::Execution(format!(
                "no reference kernel for {:?}",
                node.kind
            )))
        }
    };
    Ok(vec![value])
}

// ──────────────────────────────── Loop ──────────────────────────────────

fn op_loop(
    graph: &Graph,
    env: &HashMap<TensorId, TensorValue>,
    outer: Option<&Scope<'_>>,
    node: &Node,
) -> Result<Vec<TensorValue>> {
    let body = node
        .body
        .as_deref()
        .ok_or_else(|| Error::Execution(format!("Loop '{}' has no body", node.name)))?;
    if body.inputs.len() != 3 || body.outputs.len() != 2 {
        return Err(Error::Execution(format!(
            "Loop '{}' body must declare 3 inputs and 2 outputs",
            node.name
        )));
    }

    let trip = input(env, node, 0)?
        .first_i64()
        .ok_or_else(|| Error::Type("trip count must be an int64 scalar".to_string()))?;
    let mut cond = input(env, node, 1)?.clone();
    let mut carry = input(env, node, 2)?.clone();

    let scope = Scope {
        graph,
        env,
        parent: outer,
    };
    for step in 0..trip {
        let keep_going = cond
            .as_bool()
            .and_then(|b| b.first().copied())
            .ok_or_else(|| Error::Type("loop condition must be a bool scalar".to_string()))?;
        if !keep_going {
            break;
        }
        let mut body_env: HashMap<TensorId, TensorValue> = HashMap::new();
        body_env.insert(body.inputs[0], TensorValue::scalar_i64(step));
        body_env.insert(body.inputs[1], cond.clone());
        body_env.insert(body.inputs[2], carry.clone());
        exec_graph(body, &mut body_env, Some(&scope))?;
        cond = body_env
            .remove(&body.outputs[0])
            .ok_or_else(|| Error::Execution("loop body produced no condition".to_string()))?;
        carry = body_env
            .remove(&body.outputs[1])
            .ok_or_else(|| Error::Execution("loop body produced no carry".to_string()))?;
    }

    // The carry is flat; give it the declared logical shape when they agree.
    let declared = graph.tensor(node.outputs[0])?;
    let value = match declared.shape.as_static() {
        Some(dims) if dims.iter().product::<usize>() == carry.len() => {
            carry.reshape(dims.to_vec())
        }
        _ => carry,
    };
    Ok(vec![value])
}

// ───────────────────────────── Elementwise ──────────────────────────────

/// Flat source index for one broadcast output position.
struct BroadcastMap {
    src_shape: Vec<usize>,
    src_strides: Vec<usize>,
    out_shape: Vec<usize>,
    offset: usize,
}

impl BroadcastMap {
    fn new(src: &[usize], out: &[usize]) -> Self {
        // A source can outrank the output when its leading axes are all
        // size 1 (they collapse out of the broadcast shape); those axes
        // contribute nothing to the index, so drop them up front.
        let trimmed = src.len().saturating_sub(out.len());
        Self {
            src_shape: src[trimmed..].to_vec(),
            src_strides: compute_strides(src)[trimmed..].to_vec(),
            out_shape: out.to_vec(),
            offset: out.len() - (src.len() - trimmed),
        }
    }

    fn source_index(&self, flat: usize) -> usize {
        let coords = unflatten_index(flat, &self.out_shape);
        let mut index = 0;
        for (axis, (&dim, &stride)) in self
            .src_shape
            .iter()
            .zip(&self.src_strides)
            .enumerate()
        {
            let coord = if dim == 1 { 0 } else { coords[self.offset + axis] };
            index += coord * stride;
        }
        index
    }
}

fn f32_binary(op: OpKind, x: f32, y: f32) -> Result<f32> {
    Ok(match op {
        OpKind::Add => x + y,
        OpKind::Sub => x - y,
        OpKind::Mul => x * y,
        OpKind::Div => x / y,
        OpKind::Max => x.max(y),
        OpKind::Min => x.min(y),
        OpKind::Mod => x % y,
        other => return Err(Error::Execution(format!("{:?} is not binary", other))),
    })
}

fn i64_binary(op: OpKind, x: i64, y: i64) -> Result<i64> {
    Ok(match op {
        OpKind::Add => x.wrapping_add(y),
        OpKind::Sub => x.wrapping_sub(y),
        OpKind::Mul => x.wrapping_mul(y),
        OpKind::Div => x
            .checked_div(y)
            .ok_or_else(|| Error::Numeric("integer division by zero".to_string()))?,
        OpKind::Max => x.max(y),
        OpKind::Min => x.min(y),
        OpKind::Mod => x
            .checked_rem(y)
            .ok_or_else(|| Error::Numeric("integer modulo by zero".to_string()))?,
        other => return Err(Error::Execution(format!("{:?} is not binary", other))),
    })
}

fn op_binary(op: OpKind, lhs: &TensorValue, rhs: &TensorValue) -> Result<TensorValue> {
    let out_shape = broadcast_shape(&lhs.shape, &rhs.shape)?;
    let count: usize = out_shape.iter().product();
    let lhs_map = BroadcastMap::new(&lhs.shape, &out_shape);
    let rhs_map = BroadcastMap::new(&rhs.shape, &out_shape);

    match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => {
            let mut out = Vec::with_capacity(count);
            for flat in 0..count {
                let x = a[lhs_map.source_index(flat)];
                let y = b[rhs_map.source_index(flat)];
                out.push(f32_binary(op, x, y)?);
            }
            Ok(TensorValue::new(TensorData::F32(out), out_shape, ElemType::F32))
        }
        (TensorData::I64(a), TensorData::I64(b)) => {
            let mut out = Vec::with_capacity(count);
            for flat in 0..count {
                let x = a[lhs_map.source_index(flat)];
                let y = b[rhs_map.source_index(flat)];
                out.push(i64_binary(op, x, y)?);
            }
            Ok(TensorValue::new(TensorData::I64(out), out_shape, ElemType::I64))
        }
        (TensorData::I32(a), TensorData::I32(b)) => {
            let mut out = Vec::with_capacity(count);
            for flat in 0..count {
                let x = a[lhs_map.source_index(flat)] as i64;
                let y = b[rhs_map.source_index(flat)] as i64;
                out.push(i64_binary(op, x, y)? as i32);
            }
            Ok(TensorValue::new(TensorData::I32(out), out_shape, ElemType::I32))
        }
        _ => Err(Error::Type(format!(
            "mismatched operand types for {:?}: {:?} and {:?}",
            op,
            lhs.dtype,
            rhs.dtype
        ))),
    }
}

fn op_unary(op: OpKind, x: &TensorValue) -> Result<TensorValue> {
    match &x.data {
        TensorData::F32(values) => {
            let out: Vec<f32> = match op {
                OpKind::Neg => values.iter().map(|&v| -v).collect(),
                OpKind::Abs => values.iter().map(|&v| v.abs()).collect(),
                OpKind::Sqrt => values.iter().map(|&v| v.sqrt()).collect(),
                OpKind::Exp => values.iter().map(|&v| v.exp()).collect(),
                OpKind::Log => values.iter().map(|&v| v.ln()).collect(),
                OpKind::Ceil => values.iter().map(|&v| v.ceil()).collect(),
                OpKind::Floor => values.iter().map(|&v| v.floor()).collect(),
                OpKind::Relu => values.iter().map(|&v| v.max(0.0)).collect(),
                OpKind::Sigmoid => values.iter().map(|&v| 1.0 / (1.0 + (-v).exp())).collect(),
                OpKind::Tanh => values.iter().map(|&v| v.tanh()).collect(),
                other => return Err(Error::Execution(format!("{:?} is not unary", other))),
            };
            Ok(TensorValue::new(
                TensorData::F32(out),
                x.shape.clone(),
                ElemType::F32,
            ))
        }
        TensorData::I64(values) => {
            let out: Vec<i64> = match op {
                OpKind::Neg => values.iter().map(|&v| -v).collect(),
                OpKind::Abs => values.iter().map(|&v| v.abs()).collect(),
                OpKind::Relu => values.iter().map(|&v| v.max(0)).collect(),
                // Already integral.
                OpKind::Ceil | OpKind::Floor => values.clone(),
                other => {
                    return Err(Error::Type(format!("{:?} needs float input", other)))
                }
            };
            Ok(TensorValue::new(
                TensorData::I64(out),
                x.shape.clone(),
                ElemType::I64,
            ))
        }
        TensorData::I32(values) => {
            let out: Vec<i32> = match op {
                OpKind::Neg => values.iter().map(|&v| -v).collect(),
                OpKind::Abs => values.iter().map(|&v| v.abs()).collect(),
                OpKind::Relu => values.iter().map(|&v| v.max(0)).collect(),
                OpKind::Ceil | OpKind::Floor => values.clone(),
                other => {
                    return Err(Error::Type(format!("{:?} needs float input", other)))
                }
            };
            Ok(TensorValue::new(
                TensorData::I32(out),
                x.shape.clone(),
                ElemType::I32,
            ))
        }
        _ => Err(Error::Type(format!(
            "{:?} does not support {:?}",
            op, x.dtype
        ))),
    }
}

fn op_compare(op: OpKind, lhs: &TensorValue, rhs: &TensorValue) -> Result<TensorValue> {
    let out_shape = broadcast_shape(&lhs.shape, &rhs.shape)?;
    let count: usize = out_shape.iter().product();
    let lhs_map = BroadcastMap::new(&lhs.shape, &out_shape);
    let rhs_map = BroadcastMap::new(&rhs.shape, &out_shape);

    let compare_f32 = |x: f32, y: f32| match op {
        OpKind::Equal => x == y,
        OpKind::Greater => x > y,
        _ => x < y,
    };
    let compare_i64 = |x: i64, y: i64| match op {
        OpKind::Equal => x == y,
        OpKind::Greater => x > y,
        _ => x < y,
    };

    let out: Vec<bool> = match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => (0..count)
            .map(|flat| compare_f32(a[lhs_map.source_index(flat)], b[rhs_map.source_index(flat)]))
            .collect(),
        (TensorData::I64(a), TensorData::I64(b)) => (0..count)
            .map(|flat| compare_i64(a[lhs_map.source_index(flat)], b[rhs_map.source_index(flat)]))
            .collect(),
        (TensorData::I32(a), TensorData::I32(b)) => (0..count)
            .map(|flat| {
                compare_i64(
                    a[lhs_map.source_index(flat)] as i64,
                    b[rhs_map.source_index(flat)] as i64,
                )
            })
            .collect(),
        _ => {
            return Err(Error::Type(format!(
                "mismatched operand types for {:?}: {:?} and {:?}",
                op, lhs.dtype, rhs.dtype
            )))
        }
    };
    Ok(TensorValue::new(TensorData::Bool(out), out_shape, ElemType::Bool))
}

fn op_where(cond: &TensorValue, lhs: &TensorValue, rhs: &TensorValue) -> Result<TensorValue> {
    let Some(mask) = cond.as_bool() else {
        return Err(Error::Type("where condition must be bool".to_string()));
    };
    let out_shape = broadcast_shapes(&[&cond.shape, &lhs.shape, &rhs.shape])?;
    let count: usize = out_shape.iter().product();
    let cond_map = BroadcastMap::new(&cond.shape, &out_shape);
    let lhs_map = BroadcastMap::new(&lhs.shape, &out_shape);
    let rhs_map = BroadcastMap::new(&rhs.shape, &out_shape);

    let indices: Vec<usize> = (0..count)
        .map(|flat| {
            if mask[cond_map.source_index(flat)] {
                lhs_map.source_index(flat)
            } else {
                rhs_map.source_index(flat)
            }
        })
        .collect();
    let picks: Vec<(bool, usize)> = (0..count)
        .map(|flat| (mask[cond_map.source_index(flat)], indices[flat]))
        .collect();

    match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => {
            let out = picks
                .iter()
                .map(|&(from_lhs, index)| if from_lhs { a[index] } else { b[index] })
                .collect();
            Ok(TensorValue::new(TensorData::F32(out), out_shape, ElemType::F32))
        }
        (TensorData::I64(a), TensorData::I64(b)) => {
            let out = picks
                .iter()
                .map(|&(from_lhs, index)| if from_lhs { a[index] } else { b[index] })
                .collect();
            Ok(TensorValue::new(TensorData::I64(out), out_shape, ElemType::I64))
        }
        (TensorData::I32(a), TensorData::I32(b)) => {
            let out = picks
                .iter()
                .map(|&(from_lhs, index)| if from_lhs { a[index] } else { b[index] })
                .collect();
            Ok(TensorValue::new(TensorData::I32(out), out_shape, ElemType::I32))
        }
        _ => Err(Error::Type(format!(
            "where branches disagree: {:?} and {:?}",
            lhs.dtype, rhs.dtype
        ))),
    }
}

// ─────────────────────── Linear algebra and layout ──────────────────────

fn op_matmul(lhs: &TensorValue, rhs: &TensorValue) -> Result<TensorValue> {
    let (&[m, k], &[k2, n]) = (lhs.shape.as_slice(), rhs.shape.as_slice()) else {
        return Err(Error::Execution(format!(
            "matmul expects rank-2 operands, got {:?} and {:?}",
            lhs.shape, rhs.shape
        )));
    };
    if k != k2 {
        return Err(Error::Execution(format!(
            "matmul contraction mismatch: {:?} and {:?}",
            lhs.shape, rhs.shape
        )));
    }

    match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => {
            let mut out = vec![0.0f32; m * n];
            for row in 0..m {
                for col in 0..n {
                    let mut acc = 0.0f32;
                    for step in 0..k {
                        acc += a[row * k + step] * b[step * n + col];
                    }
                    out[row * n + col] = acc;
                }
            }
            Ok(TensorValue::new(TensorData::F32(out), vec![m, n], ElemType::F32))
        }
        (TensorData::I64(a), TensorData::I64(b)) => {
            let mut out = vec![0i64; m * n];
            for row in 0..m {
                for col in 0..n {
                    let mut acc = 0i64;
                    for step in 0..k {
                        acc += a[row * k + step] * b[step * n + col];
                    }
                    out[row * n + col] = acc;
                }
            }
            Ok(TensorValue::new(TensorData::I64(out), vec![m, n], ElemType::I64))
        }
        (TensorData::I32(a), TensorData::I32(b)) => {
            let mut out = vec![0i32; m * n];
            for row in 0..m {
                for col in 0..n {
                    let mut acc = 0i32;
                    for step in 0..k {
                        acc += a[row * k + step] * b[step * n + col];
                    }
                    out[row * n + col] = acc;
                }
            }
            Ok(TensorValue::new(TensorData::I32(out), vec![m, n], ElemType::I32))
        }
        _ => Err(Error::Type(format!(
            "matmul operand types disagree: {:?} and {:?}",
            lhs.dtype, rhs.dtype
        ))),
    }
}

/// Clone elements at the given flat positions, preserving the data variant.
fn take_indices(data: &TensorData, indices: &[usize]) -> TensorData {
    match data {
        TensorData::F32(v) => TensorData::F32(indices.iter().map(|&i| v[i]).collect()),
        TensorData::I64(v) => TensorData::I64(indices.iter().map(|&i| v[i]).collect()),
        TensorData::I32(v) => TensorData::I32(indices.iter().map(|&i| v[i]).collect()),
        TensorData::Bool(v) => TensorData::Bool(indices.iter().map(|&i| v[i]).collect()),
        TensorData::U8(v) => TensorData::U8(indices.iter().map(|&i| v[i]).collect()),
    }
}

fn op_transpose(node: &Node, x: &TensorValue) -> Result<TensorValue> {
    let rank = x.shape.len();
    let perm: Vec<usize> = if node.has_attr("perm") {
        let raw: Vec<i64> = node.attr("perm")?;
        normalize_axes(&raw, rank)?;
        raw.iter()
            .map(|&axis| if axis < 0 { (axis + rank as i64) as usize } else { axis as usize })
            .collect()
    } else {
        (0..rank).rev().collect()
    };
    if perm.len() != rank {
        return Err(Error::Execution(format!(
            "perm {:?} does not fit rank {}",
            perm, rank
        )));
    }

    let out_shape: Vec<usize> = perm.iter().map(|&axis| x.shape[axis]).collect();
    let in_strides = compute_strides(&x.shape);
    let count: usize = out_shape.iter().product();
    let indices: Vec<usize> = (0..count)
        .map(|flat| {
            let out_coords = unflatten_index(flat, &out_shape);
            perm.iter()
                .enumerate()
                .map(|(out_axis, &in_axis)| out_coords[out_axis] * in_strides[in_axis])
                .sum()
        })
        .collect();
    Ok(TensorValue::new(
        take_indices(&x.data, &indices),
        out_shape,
        x.dtype,
    ))
}

fn op_range(start: &TensorValue, limit: &TensorValue, delta: &TensorValue) -> Result<TensorValue> {
    match (&start.data, &limit.data, &delta.data) {
        (TensorData::F32(s), TensorData::F32(l), TensorData::F32(d)) => {
            let (start, limit, delta) = (s[0], l[0], d[0]);
            if delta == 0.0 {
                return Err(Error::Numeric("range delta must be nonzero".to_string()));
            }
            let count = (((limit - start) / delta).ceil().max(0.0)) as usize;
            let out: Vec<f32> = (0..count).map(|i| start + i as f32 * delta).collect();
            Ok(TensorValue::f32s(out))
        }
        (TensorData::I64(s), TensorData::I64(l), TensorData::I64(d)) => {
            let (start, limit, delta) = (s[0], l[0], d[0]);
            if delta == 0 {
                return Err(Error::Numeric("range delta must be nonzero".to_string()));
            }
            let count = (((limit - start) as f64 / delta as f64).ceil().max(0.0)) as usize;
            let out: Vec<i64> = (0..count).map(|i| start + i as i64 * delta).collect();
            Ok(TensorValue::i64s(out))
        }
        (TensorData::I32(s), TensorData::I32(l), TensorData::I32(d)) => {
            let (start, limit, delta) = (s[0], l[0], d[0]);
            if delta == 0 {
                return Err(Error::Numeric("range delta must be nonzero".to_string()));
            }
            let count = (((limit - start) as f64 / delta as f64).ceil().max(0.0)) as usize;
            let out: Vec<i32> = (0..count).map(|i| start + i as i32 * delta).collect();
            Ok(TensorValue::new(
                TensorData::I32(out),
                vec![count],
                ElemType::I32,
            ))
        }
        _ => Err(Error::Type(
            "range bounds must share one numeric type".to_string(),
        )),
    }
}

// ────────────────────────────── Reductions ──────────────────────────────

fn op_reduce(node: &Node, x: &TensorValue) -> Result<TensorValue> {
    let rank = x.shape.len();
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

    let out_shape = reduce_output_shape(&x.shape, &axes, keepdims);
    let flat_out: usize = out_shape.iter().product();
    let total: usize = x.shape.iter().product();
    let count = if flat_out == 0 { 0 } else { total / flat_out };
    let out_strides = compute_strides(&out_shape);

    // Input flat index -> output flat index, reduced axes dropped.
    let out_index_of = |flat: usize| -> usize {
        let coords = unflatten_index(flat, &x.shape);
        let mut index = 0;
        let mut kept = 0;
        for (axis, &coord) in coords.iter().enumerate() {
            if axes.contains(&axis) {
                continue;
            }
            let stride = if keepdims {
                out_strides[axis]
            } else {
                out_strides[kept]
            };
            index += coord * stride;
            kept += 1;
        }
        index
    };

    match &x.data {
        TensorData::F32(values) => {
            let mut acc = vec![init_f32(node.kind); flat_out];
            for (flat, &v) in values.iter().enumerate() {
                let slot = &mut acc[out_index_of(flat)];
                *slot = fold_f32(node.kind, *slot, v);
            }
            let out = finish_f32(node.kind, acc, count);
            Ok(TensorValue::new(TensorData::F32(out), out_shape, ElemType::F32))
        }
        TensorData::I64(values) => {
            let mut acc = vec![init_i64(node.kind)?; flat_out];
            for (flat, &v) in values.iter().enumerate() {
                let slot = &mut acc[out_index_of(flat)];
                *slot = fold_i64(node.kind, *slot, v)?;
            }
            Ok(TensorValue::new(TensorData::I64(acc), out_shape, ElemType::I64))
        }
        TensorData::I32(values) => {
            let mut acc = vec![init_i64(node.kind)? as i32; flat_out];
            for (flat, &v) in values.iter().enumerate() {
                let slot = &mut acc[out_index_of(flat)];
                *slot = fold_i64(node.kind, *slot as i64, v as i64)? as i32;
            }
            Ok(TensorValue::new(TensorData::I32(acc), out_shape, ElemType::I32))
        }
        _ => Err(Error::Type(format!(
            "{:?} does not support {:?}",
            node.kind, x.dtype
        ))),
    }
}

fn init_f32(kind: OpKind) -> f32 {
    match kind {
        OpKind::ReduceMax => f32::MIN,
        OpKind::ReduceMin => f32::MAX,
        OpKind::ReduceProd => 1.0,
        _ => 0.0,
    }
}

fn fold_f32(kind: OpKind, acc: f32, v: f32) -> f32 {
    match kind {
        OpKind::ReduceSum | OpKind::ReduceMean | OpKind::ReduceLogSum => acc + v,
        OpKind::ReduceProd => acc * v,
        OpKind::ReduceMax => acc.max(v),
        OpKind::ReduceMin => acc.min(v),
        OpKind::ReduceSumSquare | OpKind::ReduceL2 => acc + v * v,
        OpKind::ReduceL1 => acc + v.abs(),
        OpKind::ReduceLogSumExp => acc + v.exp(),
        _ => acc,
    }
}

fn finish_f32(kind: OpKind, acc: Vec<f32>, count: usize) -> Vec<f32> {
    match kind {
        OpKind::ReduceMean => acc.into_iter().map(|v| v / count as f32).collect(),
        OpKind::ReduceL2 => acc.into_iter().map(f32::sqrt).collect(),
        OpKind::ReduceLogSum | OpKind::ReduceLogSumExp => {
            acc.into_iter().map(f32::ln).collect()
        }
        _ => acc,
    }
}

fn init_i64(kind: OpKind) -> Result<i64> {
    Ok(match kind {
        OpKind::ReduceMax => i64::MIN,
        OpKind::ReduceMin => i64::MAX,
        OpKind::ReduceProd => 1,
        OpKind::ReduceSum | OpKind::ReduceSumSquare | OpKind::ReduceL1 => 0,
        other => return Err(Error::Type(format!("{:?} needs float input", other))),
    })
}

fn fold_i64(kind: OpKind, acc: i64, v: i64) -> Result<i64> {
    Ok(match kind {
        OpKind::ReduceSum => acc + v,
        OpKind::ReduceProd => acc * v,
        OpKind::ReduceMax => acc.max(v),
        OpKind::ReduceMin => acc.min(v),
        OpKind::ReduceSumSquare => acc + v * v,
        OpKind::ReduceL1 => acc + v.abs(),
        other => return Err(Error::Type(format!("{:?} needs float input", other))),
    })
}

// ──────────────────────── Shape and index plumbing ──────────────────────

fn int_list(value: &TensorValue) -> Result<Vec<i64>> {
    value
        .as_i64()
        .map(<[i64]>::to_vec)
        .ok_or_else(|| Error::Type("expected an int64 tensor".to_string()))
}

fn op_reshape(x: &TensorValue, spec: &TensorValue) -> Result<TensorValue> {
    let spec = int_list(spec)?;
    let total = x.len();

    let mut infer = None;
    let mut known: usize = 1;
    for (position, &dim) in spec.iter().enumerate() {
        if dim == -1 {
            if infer.is_some() {
                return Err(Error::Execution(
                    "reshape allows at most one inferred dimension".to_string(),
                ));
            }
            infer = Some(position);
        } else if dim < 0 {
            return Err(Error::Execution(format!("bad reshape dimension {}", dim)));
        } else {
            known *= dim as usize;
        }
    }

    let mut dims: Vec<usize> = spec
        .iter()
        .map(|&dim| if dim == -1 { 0 } else { dim as usize })
        .collect();
    if let Some(position) = infer {
        if known == 0 || total % known != 0 {
            return Err(Error::Execution(format!(
                "cannot infer reshape dimension for {} elements over {:?}",
                total, spec
            )));
        }
        dims[position] = total / known;
    }
    if dims.iter().product::<usize>() != total {
        return Err(Error::Execution(format!(
            "reshape to {:?} does not preserve {} elements",
            dims, total
        )));
    }
    Ok(x.reshape(dims))
}

fn op_squeeze(x: &TensorValue, axes: Option<&[i64]>) -> Result<TensorValue> {
    let dims = match axes {
        None => x.shape.iter().copied().filter(|&d| d != 1).collect(),
        Some(raw) => {
            let axes = normalize_axes(raw, x.shape.len())?;
            for &axis in &axes {
                if x.shape[axis] != 1 {
                    return Err(Error::Execution(format!(
                        "cannot squeeze axis {} of size {}",
                        axis, x.shape[axis]
                    )));
                }
            }
            x.shape
                .iter()
                .enumerate()
                .filter(|(axis, _)| !axes.contains(axis))
                .map(|(_, &d)| d)
                .collect()
        }
    };
    Ok(x.reshape(dims))
}

fn op_unsqueeze(x: &TensorValue, axes: &[i64]) -> Result<TensorValue> {
    let out_rank = x.shape.len() + axes.len();
    let mut positions = normalize_axes(axes, out_rank)?;
    positions.sort_unstable();

    let mut dims = x.shape.clone();
    for &position in &positions {
        if position > dims.len() {
            return Err(Error::Execution(format!(
                "unsqueeze axis {} out of range for rank {}",
                position, out_rank
            )));
        }
        dims.insert(position, 1);
    }
    Ok(x.reshape(dims))
}

fn op_gather(data: &TensorValue, indices: &TensorValue) -> Result<TensorValue> {
    let Some(index_values) = indices.as_i64() else {
        return Err(Error::Type("gather indices must be int64".to_string()));
    };
    if data.shape.is_empty() {
        return Err(Error::Execution("cannot gather from a scalar".to_string()));
    }
    let dim = data.shape[0];
    let row: usize = data.shape[1..].iter().product();

    let mut flat_positions = Vec::with_capacity(index_values.len() * row);
    for &index in index_values {
        let index = if index < 0 { index + dim as i64 } else { index };
        if index < 0 || index as usize >= dim {
            return Err(Error::Numeric(format!(
                "gather index {} out of bounds for dimension {}",
                index, dim
            )));
        }
        let base = index as usize * row;
        flat_positions.extend(base..base + row);
    }

    let mut out_shape = indices.shape.clone();
    out_shape.extend_from_slice(&data.shape[1..]);
    Ok(TensorValue::new(
        take_indices(&data.data, &flat_positions),
        out_shape,
        data.dtype,
    ))
}

/// Copy one element between matching data variants.
fn write_element(dst: &mut TensorData, at: usize, src: &TensorData, from: usize) -> Result<()> {
    match (dst, src) {
        (TensorData::F32(d), TensorData::F32(s)) => d[at] = s[from],
        (TensorData::I64(d), TensorData::I64(s)) => d[at] = s[from],
        (TensorData::I32(d), TensorData::I32(s)) => d[at] = s[from],
        (TensorData::Bool(d), TensorData::Bool(s)) => d[at] = s[from],
        (TensorData::U8(d), TensorData::U8(s)) => d[at] = s[from],
        _ => {
            return Err(Error::Type(
                "scatter updates must match the data type".to_string(),
            ))
        }
    }
    Ok(())
}

fn op_scatter_elements(
    data: &TensorValue,
    indices: &TensorValue,
    updates: &TensorValue,
) -> Result<TensorValue> {
    let Some(index_values) = indices.as_i64() else {
        return Err(Error::Type("scatter indices must be int64".to_string()));
    };
    if indices.shape != updates.shape {
        return Err(Error::Execution(format!(
            "scatter indices {:?} and updates {:?} must agree",
            indices.shape, updates.shape
        )));
    }
    if data.shape.len() != indices.shape.len() {
        return Err(Error::Execution(
            "scatter indices must match the data rank".to_string(),
        ));
    }

    let dim = *data
        .shape
        .first()
        .ok_or_else(|| Error::Execution("cannot scatter into a scalar".to_string()))?;
    let strides = compute_strides(&data.shape);

    let mut out = data.data.clone();
    for (flat, &index) in index_values.iter().enumerate() {
        let index = if index < 0 { index + dim as i64 } else { index };
        if index < 0 || index as usize >= dim {
            return Err(Error::Numeric(format!(
                "scatter index {} out of bounds for dimension {}",
                index, dim
            )));
        }
        let mut coords = unflatten_index(flat, &indices.shape);
        coords[0] = index as usize;
        let position: usize = coords.iter().zip(&strides).map(|(&c, &s)| c * s).sum();
        write_element(&mut out, position, &updates.data, flat)?;
    }
    Ok(TensorValue::new(out, data.shape.clone(), data.dtype))
}

fn op_expand(x: &TensorValue, target: &[i64]) -> Result<TensorValue> {
    let dims: Vec<usize> = target
        .iter()
        .map(|&d| {
            if d < 0 {
                Err(Error::Execution(format!("bad expand dimension {}", d)))
            } else {
                Ok(d as usize)
            }
        })
        .collect::<Result<_>>()?;
    if !is_broadcastable_to(&x.shape, &dims) {
        return Err(Error::Execution(format!(
            "cannot expand {:?} to {:?}",
            x.shape, dims
        )));
    }
    let map = BroadcastMap::new(&x.shape, &dims);
    let count: usize = dims.iter().product();
    let indices: Vec<usize> = (0..count).map(|flat| map.source_index(flat)).collect();
    Ok(TensorValue::new(
        take_indices(&x.data, &indices),
        dims,
        x.dtype,
    ))
}

fn op_constant_of_shape(proto: &TensorValue, dims: &[i64]) -> Result<TensorValue> {
    let shape: Vec<usize> = dims
        .iter()
        .map(|&d| {
            if d < 0 {
                Err(Error::Execution(format!("bad shape dimension {}", d)))
            } else {
                Ok(d as usize)
            }
        })
        .collect::<Result<_>>()?;
    let count: usize = shape.iter().product();

    let data = match &proto.data {
        TensorData::F32(v) => TensorData::F32(vec![
            *v.first()
                .ok_or_else(|| Error::Execution("empty fill value".to_string()))?;
            count
        ]),
        TensorData::I64(v) => TensorData::I64(vec![
            *v.first()
                .ok_or_else(|| Error::Execution("empty fill value".to_string()))?;
            count
        ]),
        TensorData::I32(v) => TensorData::I32(vec![
            *v.first()
                .ok_or_else(|| Error::Execution("empty fill value".to_string()))?;
            count
        ]),
        TensorData::Bool(v) => TensorData::Bool(vec![
            *v.first()
                .ok_or_else(|| Error::Execution("empty fill value".to_string()))?;
            count
        ]),
        TensorData::U8(v) => TensorData::U8(vec![
            *v.first()
                .ok_or_else(|| Error::Execution("empty fill value".to_string()))?;
            count
        ]),
    };
    Ok(TensorValue::new(data, shape, proto.dtype))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::{Node, Shape, Tensor, TensorRole};

    fn simple_graph_with(kind: OpKind, inputs: &[(&str, TensorValue)]) -> (Graph, Vec<TensorId>) {
        let mut graph = Graph::new();
        let mut ids = Vec::new();
        let mut node = Node::named(kind, "op0");
        for (name, value) in inputs {
            let id = graph.add_tensor(Tensor::with_role(
                *name,
                value.dtype,
                Shape::Static(value.shape.clone()),
                TensorRole::Input,
            ));
            node.add_input(id);
            ids.push(id);
        }
        let out = graph.add_tensor(Tensor::with_role(
            "out",
            ElemType::F32,
            Shape::Unknown,
            TensorRole::Output,
        ));
        node.add_output(out);
        graph.add_op(node);
        graph.inputs = ids.clone();
        graph.outputs = vec![out];
        (graph, ids)
    }

    #[test]
    fn test_add_broadcasts_rows() {
        let a = TensorValue::new(
            TensorData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            vec![2, 3],
            ElemType::F32,
        );
        let b = TensorValue::f32s(vec![10.0, 20.0, 30.0]);
        let (graph, ids) = simple_graph_with(OpKind::Add, &[("a", a.clone()), ("b", b.clone())]);
        let out = run_graph(&graph, &[(ids[0], a), (ids[1], b)]).unwrap();
        assert_eq!(out[0].shape, vec![2, 3]);
        assert_eq!(
            out[0].as_f32().unwrap(),
            &[11.0, 22.0, 33.0, 14.0, 25.0, 36.0]
        );
    }

    #[test]
    fn test_add_collapses_promoted_lead_axis() {
        // [1, 4] + [4]: the lead axis exists on one operand only, so it
        // drops out of the result shape.
        let a = TensorValue::new(
            TensorData::F32(vec![1.0, 2.0, 3.0, 4.0]),
            vec![1, 4],
            ElemType::F32,
        );
        let b = TensorValue::f32s(vec![10.0, 20.0, 30.0, 40.0]);
        let (graph, ids) = simple_graph_with(OpKind::Add, &[("a", a.clone()), ("b", b.clone())]);
        let out = run_graph(&graph, &[(ids[0], a), (ids[1], b)]).unwrap();
        assert_eq!(out[0].shape, vec![4]);
        assert_eq!(out[0].as_f32().unwrap(), &[11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn test_matmul_two_by_two() {
        let a = TensorValue::new(
            TensorData::F32(vec![1.0, 2.0, 3.0, 4.0]),
            vec![2, 2],
            ElemType::F32,
        );
        let b = TensorValue::new(
            TensorData::F32(vec![5.0, 6.0, 7.0, 8.0]),
            vec![2, 2],
            ElemType::F32,
        );
        let out = op_matmul(&a, &b).unwrap();
        assert_eq!(out.as_f32().unwrap(), &[19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_reduce_sum_over_columns() {
        let x = TensorValue::new(
            TensorData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            vec![2, 3],
            ElemType::F32,
        );
        let mut node = Node::named(OpKind::ReduceSum, "sum0");
        node.set_attribute("axes", spindle_core::Attribute::Ints(vec![1]));
        node.set_attribute("keepdims", spindle_core::Attribute::Int(0));
        let out = op_reduce(&node, &x).unwrap();
        assert_eq!(out.shape, vec![2]);
        assert_eq!(out.as_f32().unwrap(), &[6.0, 15.0]);
    }

    #[test]
    fn test_transpose_reverses_axes_by_default() {
        let x = TensorValue::new(
            TensorData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            vec![2, 3],
            ElemType::F32,
        );
        let node = Node::named(OpKind::Transpose, "t0");
        let out = op_transpose(&node, &x).unwrap();
        assert_eq!(out.shape, vec![3, 2]);
        assert_eq!(out.as_f32().unwrap(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_scatter_writes_one_element() {
        let data = TensorValue::f32s(vec![0.0, 0.0, 0.0, 0.0]);
        let indices = TensorValue::i64s(vec![2]);
        let updates = TensorValue::f32s(vec![7.0]);
        let out = op_scatter_elements(&data, &indices, &updates).unwrap();
        assert_eq!(out.as_f32().unwrap(), &[0.0, 0.0, 7.0, 0.0]);
    }

    #[test]
    fn test_integer_division_by_zero_faults() {
        let a = TensorValue::i64s(vec![1]);
        let b = TensorValue::i64s(vec![0]);
        let err = op_binary(OpKind::Div, &a, &b).unwrap_err();
        assert!(matches!(err, Error::Numeric(_)));
    }

    #[test]
    fn test_loop_counts_iterations() {
        // Body: carry_out = ScatterElements(carry, [iter], [iter as f32]),
        // writing the step number at the step position.
        let mut body = Graph::new();
        let iter = body.add_tensor(Tensor::with_role(
            "iter",
            ElemType::I64,
            Shape::scalar(),
            TensorRole::Input,
        ));
        let cond = body.add_tensor(Tensor::with_role(
            "cond",
            ElemType::Bool,
            Shape::scalar(),
            TensorRole::Input,
        ));
        let carry = body.add_tensor(Tensor::with_role(
            "carry",
            ElemType::F32,
            Shape::Static(vec![3]),
            TensorRole::Input,
        ));
        body.inputs = vec![iter, cond, carry];

        let axes = body.add_tensor(Tensor::index_aux("axes0", TensorValue::i64s(vec![0])));
        let idx = body.add_tensor(Tensor::new("idx", ElemType::I64, Shape::Static(vec![1])));
        let mut unsqueeze = Node::named(OpKind::Unsqueeze, "unsqueeze0");
        unsqueeze.add_input(iter);
        unsqueeze.add_input(axes);
        unsqueeze.add_output(idx);
        body.add_op(unsqueeze);

        let iter_f = body.add_tensor(Tensor::new("iter_f", ElemType::F32, Shape::scalar()));
        let mut cast = Node::named(OpKind::Cast, "cast0");
        cast.add_input(iter);
        cast.add_output(iter_f);
        cast.set_attribute("to", spindle_core::Attribute::Int(ElemType::F32.onnx_code()));
        body.add_op(cast);

        let upd = body.add_tensor(Tensor::new("upd", ElemType::F32, Shape::Static(vec![1])));
        let mut unsqueeze_val = Node::named(OpKind::Unsqueeze, "unsqueeze1");
        unsqueeze_val.add_input(iter_f);
        unsqueeze_val.add_input(axes);
        unsqueeze_val.add_output(upd);
        body.add_op(unsqueeze_val);

        let carry_out = body.add_tensor(Tensor::new(
            "carry_out",
            ElemType::F32,
            Shape::Static(vec![3]),
        ));
        let mut scatter = Node::named(OpKind::ScatterElements, "scatter0");
        scatter.add_input(carry);
        scatter.add_input(idx);
        scatter.add_input(upd);
        scatter.add_output(carry_out);
        scatter.set_attribute("axis", spindle_core::Attribute::Int(0));
        body.add_op(scatter);
        body.outputs = vec![cond, carry_out];

        let mut graph = Graph::new();
        let trip = graph.add_tensor(Tensor::index_aux("trip", TensorValue::scalar_i64(3)));
        let keep = graph.add_tensor(Tensor::index_aux(
            "keep_going",
            TensorValue::scalar_bool(true),
        ));
        let init = graph.add_tensor(Tensor::index_aux(
            "init",
            TensorValue::f32s(vec![0.0, 0.0, 0.0]),
        ));
        let out = graph.add_tensor(Tensor::with_role(
            "out",
            ElemType::F32,
            Shape::Static(vec![3]),
            TensorRole::Output,
        ));
        let mut loop_node = Node::named(OpKind::Loop, "loop0");
        loop_node.add_input(trip);
        loop_node.add_input(keep);
        loop_node.add_input(init);
        loop_node.add_output(out);
        loop_node.body = Some(Box::new(body));
        graph.add_op(loop_node);
        graph.outputs = vec![out];

        let results = run_graph(&graph, &[]).unwrap();
        assert_eq!(results[0].as_f32().unwrap(), &[0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_loop_body_captures_outer_tensor_by_name() {
        // Body reads "bias" which only the outer graph defines.
        let mut body = Graph::new();
        let iter = body.add_tensor(Tensor::with_role(
            "iter",
            ElemType::I64,
            Shape::scalar(),
            TensorRole::Input,
        ));
        let cond = body.add_tensor(Tensor::with_role(
            "cond",
            ElemType::Bool,
            Shape::scalar(),
            TensorRole::Input,
        ));
        let carry = body.add_tensor(Tensor::with_role(
            "carry",
            ElemType::F32,
            Shape::Static(vec![1]),
            TensorRole::Input,
        ));
        body.inputs = vec![iter, cond, carry];

        let bias = body.add_tensor(Tensor::with_role(
            "bias",
            ElemType::F32,
            Shape::Static(vec![1]),
            TensorRole::Input,
        ));
        let carry_out = body.add_tensor(Tensor::new(
            "carry_out",
            ElemType::F32,
            Shape::Static(vec![1]),
        ));
        let mut add = Node::named(OpKind::Add, "add0");
        add.add_input(carry);
        add.add_input(bias);
        add.add_output(carry_out);
        body.add_op(add);
        body.outputs = vec![cond, carry_out];

        let mut graph = Graph::new();
        let bias_outer = graph.add_tensor(Tensor::with_role(
            "bias",
            ElemType::F32,
            Shape::Static(vec![1]),
            TensorRole::Input,
        ));
        let trip = graph.add_tensor(Tensor::index_aux("trip", TensorValue::scalar_i64(4)));
        let keep = graph.add_tensor(Tensor::index_aux(
            "keep_going",
            TensorValue::scalar_bool(true),
        ));
        let init = graph.add_tensor(Tensor::index_aux("init", TensorValue::f32s(vec![0.0])));
        let out = graph.add_tensor(Tensor::with_role(
            "out",
            ElemType::F32,
            Shape::Static(vec![1]),
            TensorRole::Output,
        ));
        let mut loop_node = Node::named(OpKind::Loop, "loop0");
        loop_node.add_input(trip);
        loop_node.add_input(keep);
        loop_node.add_input(init);
        loop_node.add_output(out);
        loop_node.body = Some(Box::new(body));
        graph.add_op(loop_node);
        graph.inputs = vec![bias_outer];
        graph.outputs = vec![out];

        let results = run_graph(&graph, &[(bias_outer, TensorValue::f32s(vec![2.5]))]).unwrap();
        assert_eq!(results[0].as_f32().unwrap(), &[10.0]);
    }
}
