//! Shared graph builders and checks for lowering integration tests.
//!
//! Every test follows the same pattern: build a small operator graph, run it
//! through the reference interpreter, lower it, run it again, and compare
//! the outputs element for element.

#![allow(dead_code)]

use spindle_core::{
    Attribute, ElemType, Graph, Node, OpId, OpKind, Shape, Tensor, TensorData, TensorId,
    TensorRole, TensorValue,
};
use spindle_lower::{lower_graph, LowerOptions, LowerReport};

/// Install the test log subscriber; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Add a runtime graph-input tensor.
pub fn add_input(graph: &mut Graph, name: &str, dtype: ElemType, dims: &[usize]) -> TensorId {
    let id = graph.add_tensor(Tensor::with_role(
        name,
        dtype,
        Shape::Static(dims.to_vec()),
        TensorRole::Input,
    ));
    graph.inputs.push(id);
    id
}

/// Add an intermediate tensor with a static shape.
pub fn add_value(graph: &mut Graph, name: &str, dtype: ElemType, dims: &[usize]) -> TensorId {
    graph.add_tensor(Tensor::new(name, dtype, Shape::Static(dims.to_vec())))
}

/// Add a graph-output tensor with a static shape.
pub fn add_output(graph: &mut Graph, name: &str, dtype: ElemType, dims: &[usize]) -> TensorId {
    let id = graph.add_tensor(Tensor::with_role(
        name,
        dtype,
        Shape::Static(dims.to_vec()),
        TensorRole::Output,
    ));
    graph.outputs.push(id);
    id
}

/// Add an operator node wiring the given tensors.
pub fn add_op(
    graph: &mut Graph,
    kind: OpKind,
    name: &str,
    inputs: &[TensorId],
    output: TensorId,
) -> OpId {
    add_op_with(graph, kind, name, inputs, output, &[])
}

/// [`add_op`] with node attributes.
pub fn add_op_with(
    graph: &mut Graph,
    kind: OpKind,
    name: &str,
    inputs: &[TensorId],
    output: TensorId,
    attributes: &[(&str, Attribute)],
) -> OpId {
    let mut node = Node::named(kind, name);
    for &input in inputs {
        node.add_input(input);
    }
    node.add_output(output);
    for (key, value) in attributes {
        node.set_attribute(*key, value.clone());
    }
    graph.add_op(node)
}

/// An f32 tensor value with an explicit shape.
pub fn f32_tensor(values: &[f32], dims: &[usize]) -> TensorValue {
    TensorValue::new(TensorData::F32(values.to_vec()), dims.to_vec(), ElemType::F32)
}

/// Assert element-wise approximate equality of two f32 slices.
pub fn assert_vec_approx_eq(actual: &[f32], expected: &[f32], epsilon: f32) {
    assert_eq!(actual.len(), expected.len(), "lengths differ");
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        let diff = (a - e).abs();
        assert!(
            diff <= epsilon,
            "element {} differs: {} vs {} (diff {})",
            i,
            a,
            e,
            diff
        );
    }
}

/// Compare two tensor values, approximately for floats and exactly for the
/// integer and bool types.
pub fn assert_value_approx_eq(actual: &TensorValue, expected: &TensorValue, epsilon: f32) {
    assert_eq!(actual.shape, expected.shape, "shapes differ");
    match (&actual.data, &expected.data) {
        (TensorData::F32(a), TensorData::F32(e)) => assert_vec_approx_eq(a, e, epsilon),
        (a, e) => assert_eq!(a, e, "values differ"),
    }
}

/// Run the graph as-is, lower it, run it again, and assert the outputs
/// match. Returns the lowering report for structural assertions.
pub fn check_lowered_equivalence(
    graph: &mut Graph,
    feeds: &[(TensorId, TensorValue)],
    options: &LowerOptions,
    epsilon: f32,
) -> LowerReport {
    init_tracing();

    let reference = spindle_interp::run_graph(graph, feeds).expect("reference run failed");
    let report = lower_graph(graph, options).expect("lowering failed");
    graph.validate().expect("lowered graph is inconsistent");
    let lowered = spindle_interp::run_graph(graph, feeds).expect("lowered run failed");

    assert_eq!(reference.len(), lowered.len());
    for (reference, lowered) in reference.iter().zip(lowered.iter()) {
        assert_value_approx_eq(lowered, reference, epsilon);
    }
    report
}

/// Count the `Loop` nodes currently in the graph.
pub fn count_loops(graph: &Graph) -> usize {
    graph
        .nodes()
        .filter(|(_, node)| node.kind == OpKind::Loop)
        .count()
}
