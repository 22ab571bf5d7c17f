//! End-to-end tests for MatMul lowering: bare accumulation, gated
//! epilogues, and the layout guard that splits MatMul from Transpose.

mod common;

use common::*;
use spindle_core::{ElemType, Graph, OpKind, TensorValue};
use spindle_lower::LowerOptions;

#[test]
fn test_matmul_two_by_two() {
    let mut graph = Graph::new();
    let a = add_input(&mut graph, "a", ElemType::F32, &[2, 2]);
    let b = add_input(&mut graph, "b", ElemType::F32, &[2, 2]);
    let out = add_output(&mut graph, "out", ElemType::F32, &[2, 2]);
    add_op(&mut graph, OpKind::MatMul, "matmul0", &[a, b], out);

    let feeds = [
        (a, f32_tensor(&[1.0, 2.0, 3.0, 4.0], &[2, 2])),
        (b, f32_tensor(&[5.0, 6.0, 7.0, 8.0], &[2, 2])),
    ];
    let report = check_lowered_equivalence(&mut graph, &feeds, &LowerOptions::default(), 1e-5);
    assert_eq!(report.loops_built, 1);

    let results = spindle_interp::run_graph(&graph, &feeds).unwrap();
    assert_eq!(results[0].as_f32().unwrap(), &[19.0, 22.0, 43.0, 50.0]);
}

#[test]
fn test_rectangular_matmul() {
    // [2, 3] x [3, 4]: trip count 24, one multiply-accumulate per step.
    let mut graph = Graph::new();
    let a = add_input(&mut graph, "a", ElemType::F32, &[2, 3]);
    let b = add_input(&mut graph, "b", ElemType::F32, &[3, 4]);
    let out = add_output(&mut graph, "out", ElemType::F32, &[2, 4]);
    add_op(&mut graph, OpKind::MatMul, "matmul0", &[a, b], out);

    let feeds = [
        (a, f32_tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])),
        (
            b,
            f32_tensor(
                &[
                    1.0, 0.0, 0.0, 1.0, //
                    0.0, 1.0, 0.0, 1.0, //
                    0.0, 0.0, 1.0, 1.0,
                ],
                &[3, 4],
            ),
        ),
    ];
    check_lowered_equivalence(&mut graph, &feeds, &LowerOptions::default(), 1e-5);

    let results = spindle_interp::run_graph(&graph, &feeds).unwrap();
    assert_eq!(
        results[0].as_f32().unwrap(),
        &[1.0, 2.0, 3.0, 6.0, 4.0, 5.0, 6.0, 15.0]
    );
}

#[test]
fn test_matmul_with_bias_epilogue_is_gated() {
    // The fused Add must apply exactly once per output element, on the
    // final contraction step; partial sums never leak through it.
    let mut graph = Graph::new();
    let a = add_input(&mut graph, "a", ElemType::F32, &[2, 2]);
    let b = add_input(&mut graph, "b", ElemType::F32, &[2, 2]);
    let bias = add_input(&mut graph, "bias", ElemType::F32, &[2]);
    let t0 = add_value(&mut graph, "t0", ElemType::F32, &[2, 2]);
    let out = add_output(&mut graph, "out", ElemType::F32, &[2, 2]);
    add_op(&mut graph, OpKind::MatMul, "matmul0", &[a, b], t0);
    add_op(&mut graph, OpKind::Add, "bias_add0", &[t0, bias], out);

    let feeds = [
        (a, f32_tensor(&[1.0, 2.0, 3.0, 4.0], &[2, 2])),
        (b, f32_tensor(&[5.0, 6.0, 7.0, 8.0], &[2, 2])),
        (bias, TensorValue::f32s(vec![100.0, 200.0])),
    ];
    let report = check_lowered_equivalence(&mut graph, &feeds, &LowerOptions::default(), 1e-5);

    // One loop covers both operators.
    assert_eq!(report.loops_built, 1);
    assert_eq!(report.ops_replaced, 2);

    let results = spindle_interp::run_graph(&graph, &feeds).unwrap();
    assert_eq!(results[0].as_f32().unwrap(), &[119.0, 222.0, 143.0, 250.0]);
}

#[test]
fn test_matmul_with_activation_epilogue() {
    // Relu of a partial sum differs from Relu of the total, so a correct
    // result proves the gate works for unary members too.
    let mut graph = Graph::new();
    let a = add_input(&mut graph, "a", ElemType::F32, &[2, 2]);
    let b = add_input(&mut graph, "b", ElemType::F32, &[2, 2]);
    let t0 = add_value(&mut graph, "t0", ElemType::F32, &[2, 2]);
    let out = add_output(&mut graph, "out", ElemType::F32, &[2, 2]);
    add_op(&mut graph, OpKind::MatMul, "matmul0", &[a, b], t0);
    add_op(&mut graph, OpKind::Relu, "relu0", &[t0], out);

    let feeds = [
        // Row products mix signs so partial sums cross zero.
        (a, f32_tensor(&[1.0, -2.0, -3.0, 4.0], &[2, 2])),
        (b, f32_tensor(&[5.0, -6.0, 7.0, 8.0], &[2, 2])),
    ];
    let report = check_lowered_equivalence(&mut graph, &feeds, &LowerOptions::default(), 1e-5);
    assert_eq!(report.loops_built, 1);
    assert_eq!(report.ops_replaced, 2);
}

#[test]
fn test_transpose_after_matmul_lowers_separately() {
    // A layout change downstream of the accumulation cannot share the
    // coalesced pass; the segment falls apart into two loops.
    let mut graph = Graph::new();
    let a = add_input(&mut graph, "a", ElemType::F32, &[2, 3]);
    let b = add_input(&mut graph, "b", ElemType::F32, &[3, 2]);
    let t0 = add_value(&mut graph, "t0", ElemType::F32, &[2, 2]);
    let out = add_output(&mut graph, "out", ElemType::F32, &[2, 2]);
    add_op(&mut graph, OpKind::MatMul, "matmul0", &[a, b], t0);
    add_op(&mut graph, OpKind::Transpose, "transpose0", &[t0], out);

    let feeds = [
        (a, f32_tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])),
        (b, f32_tensor(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0], &[3, 2])),
    ];
    let report = check_lowered_equivalence(&mut graph, &feeds, &LowerOptions::default(), 1e-5);

    assert_eq!(report.loops_built, 2);
    assert_eq!(report.segments_demoted, 1);
    assert_eq!(count_loops(&graph), 2);
}
