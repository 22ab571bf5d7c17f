//! Per-build state threaded through loop-body construction.

use spindle_core::{ElemType, Graph, Shape, Tensor, TensorId, TensorRole, TensorValue};

use std::collections::HashMap;

/// Monotonic name source for tensors and nodes minted by one lowering run.
///
/// Names are diagnostics only; identity is always the ID. The counter is
/// shared across the whole run so repeated lowering of one graph never
/// reuses a name.
pub(crate) struct NameGen {
    next: usize,
}

impl NameGen {
    pub(crate) fn new() -> Self {
        Self { next: 0 }
    }

    /// Mint a fresh `{tag}_{n}` name.
    pub(crate) fn fresh(&mut self, tag: &str) -> String {
        let n = self.next;
        self.next += 1;
        format!("{tag}_{n}")
    }
}

/// State for one loop-body build.
///
/// Created by [`LoopContext::begin`] together with the body graph carrying
/// the canonical three inputs. Lives for exactly one segment build.
pub(crate) struct LoopContext {
    /// Flat iteration counter, int64 scalar (first body input).
    pub iter: TensorId,

    /// Loop condition passthrough, bool scalar (second body input).
    pub cond_in: TensorId,

    /// Carried accumulator, `elem[flat_len]` (third body input).
    pub carry: TensorId,

    /// Cached `Unsqueeze(iter)` as a length-1 vector, for builders whose
    /// write position is the counter itself.
    pub iter_vec: Option<TensorId>,

    /// Shared `[0]` axes constant for squeeze/unsqueeze steps.
    pub axis_zero: TensorId,

    /// Static output shape chosen for this build.
    pub output_shape: Vec<usize>,

    /// Element type of the carried value.
    pub elem: ElemType,

    /// True when the segment fuses more than one operator.
    pub fused: bool,

    /// Gate elementwise writes on the final accumulation step.
    pub gate_by_step: bool,

    /// Decoded accumulation-step index (int64 scalar), when gating.
    pub step_index: Option<TensorId>,

    /// Last accumulation step constant (int64 scalar), when gating.
    pub last_step: Option<TensorId>,

    /// Precomputed reciprocal-of-count scalar for mean reduction.
    pub mean_scale: Option<TensorId>,
}

impl LoopContext {
    /// Create a body graph with the canonical inputs
    /// `(iter: int64 scalar, cond: bool scalar, carry: elem[flat_len])`, a
    /// shared `[0]` axes constant, and optionally the cached unsqueezed
    /// counter.
    pub(crate) fn begin(
        elem: ElemType,
        flat_len: usize,
        output_shape: Vec<usize>,
        fused: bool,
        with_iter_vec: bool,
        names: &mut NameGen,
    ) -> (Graph, LoopContext) {
        let mut body = Graph::new();

        let iter = body.add_tensor(Tensor::with_role(
            names.fresh("iter"),
            ElemType::I64,
            Shape::scalar(),
            TensorRole::Input,
        ));
        let cond_in = body.add_tensor(Tensor::with_role(
            names.fresh("cond_in"),
            ElemType::Bool,
            Shape::scalar(),
            TensorRole::Input,
        ));
        let carry = body.add_tensor(Tensor::with_role(
            names.fresh("carry"),
            elem,
            Shape::Static(vec![flat_len]),
            TensorRole::Input,
        ));
        body.inputs = vec![iter, cond_in, carry];

        let axis_zero = body.add_tensor(Tensor::index_aux(
            names.fresh("axes0"),
            TensorValue::i64s(vec![0]),
        ));

        let mut ctx = LoopContext {
            iter,
            cond_in,
            carry,
            iter_vec: None,
            axis_zero,
            output_shape,
            elem,
            fused,
            gate_by_step: false,
            step_index: None,
            last_step: None,
            mean_scale: None,
        };

        if with_iter_vec {
            let iter_vec = crate::indexing::emit(
                &mut body,
                names,
                spindle_core::OpKind::Unsqueeze,
                "iter_vec",
                &[iter, axis_zero],
                ElemType::I64,
                Shape::Static(vec![1]),
                TensorRole::Index,
            );
            ctx.iter_vec = Some(iter_vec);
        }

        (body, ctx)
    }
}

/// Everything a builder hands back for final Loop assembly.
pub(crate) struct BuildResult {
    /// The constructed loop body.
    pub body: Graph,

    /// Context used during the build; carries element type and output shape.
    pub ctx: LoopContext,

    /// Per-iteration value to write (scalar, in the body).
    pub result: TensorId,

    /// Per-iteration write position (int64 `[1]`, in the body).
    pub write_index: TensorId,

    /// Outer tensors consumed by the body (outer ID -> body ID).
    pub outer_refs: HashMap<TensorId, TensorId>,

    /// The segment's final outer tensor; the Loop node adopts it as output.
    pub outer_result: TensorId,

    /// Outer trip-count tensor (int64 scalar).
    pub trip_count: TensorId,

    /// Outer condition tensor (bool scalar, constant true).
    pub condition: TensorId,

    /// Outer initial-carry tensor, pre-filled with the operation's identity.
    pub init_carry: TensorId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::OpKind;

    #[test]
    fn test_name_gen_is_monotonic() {
        let mut names = NameGen::new();
        assert_eq!(names.fresh("iter"), "iter_0");
        assert_eq!(names.fresh("iter"), "iter_1");
        assert_eq!(names.fresh("carry"), "carry_2");
    }

    #[test]
    fn test_begin_declares_canonical_inputs() {
        let mut names = NameGen::new();
        let (body, ctx) = LoopContext::begin(ElemType::F32, 6, vec![2, 3], true, true, &mut names);

        assert_eq!(body.inputs, vec![ctx.iter, ctx.cond_in, ctx.carry]);
        assert_eq!(body.tensor(ctx.iter).unwrap().dtype, ElemType::I64);
        assert_eq!(body.tensor(ctx.cond_in).unwrap().dtype, ElemType::Bool);
        assert_eq!(
            body.tensor(ctx.carry).unwrap().shape,
            Shape::Static(vec![6])
        );

        let iter_vec = ctx.iter_vec.expect("iter_vec requested");
        let producer = body.producer(iter_vec).expect("unsqueeze node");
        assert_eq!(body.node(producer).unwrap().kind, OpKind::Unsqueeze);
    }

    #[test]
    fn test_begin_without_iter_vec() {
        let mut names = NameGen::new();
        let (body, ctx) = LoopContext::begin(ElemType::F32, 4, vec![4], false, false, &mut names);
        assert!(ctx.iter_vec.is_none());
        assert_eq!(body.node_count(), 0);
    }
}
