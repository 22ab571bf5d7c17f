//! Closed operator vocabulary and node attributes.
//!
//! Every operator the graph can hold is a variant of [`OpKind`]; passes
//! dispatch by exhaustive pattern matching rather than by string tag.
//! The set is the primitive vocabulary left after upstream canonicalization:
//! scalar-capable arithmetic, the reduction family, layout and indexing
//! plumbing, and the `Loop` construct the lowering pass emits.

use crate::types::TensorValue;
use crate::{Error, Result};

/// Operator type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    // Binary arithmetic
    Add,
    Sub,
    Mul,
    Div,
    /// Elementwise maximum of two operands.
    Max,
    /// Elementwise minimum of two operands.
    Min,
    /// Integer remainder.
    Mod,

    // Unary
    Neg,
    Abs,
    Sqrt,
    Exp,
    Log,
    Ceil,
    Floor,
    Relu,
    Sigmoid,
    Tanh,

    // Comparison / selection
    Equal,
    Greater,
    Less,
    Where,

    // Linear algebra, layout, generation
    MatMul,
    Transpose,
    Range,

    // Reduction family
    ReduceSum,
    ReduceMax,
    ReduceMin,
    ReduceProd,
    ReduceMean,
    ReduceSumSquare,
    ReduceL1,
    ReduceL2,
    ReduceLogSum,
    ReduceLogSumExp,

    // Windowed operators, never lowered
    Conv,
    AveragePool,

    // Structural plumbing
    Cast,
    Reshape,
    Squeeze,
    Unsqueeze,
    Gather,
    ScatterElements,
    Shape,
    Expand,
    ConstantOfShape,
    Identity,

    // Control flow
    Loop,
}

impl OpKind {
    /// Check if this is one of the ten reduction operators.
    pub fn is_reduction(&self) -> bool {
        matches!(
            self,
            OpKind::ReduceSum
                | OpKind::ReduceMax
                | OpKind::ReduceMin
                | OpKind::ReduceProd
                | OpKind::ReduceMean
                | OpKind::ReduceSumSquare
                | OpKind::ReduceL1
                | OpKind::ReduceL2
                | OpKind::ReduceLogSum
                | OpKind::ReduceLogSumExp
        )
    }

    /// Check if this is a two-operand arithmetic operator.
    pub fn is_binary_arith(&self) -> bool {
        matches!(self, OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div)
    }

    /// Check if this is a one-operand elementwise operator.
    pub fn is_unary(&self) -> bool {
        matches!(
            self,
            OpKind::Neg
                | OpKind::Abs
                | OpKind::Sqrt
                | OpKind::Exp
                | OpKind::Log
                | OpKind::Ceil
                | OpKind::Floor
                | OpKind::Relu
                | OpKind::Sigmoid
                | OpKind::Tanh
        )
    }

    /// Check if this operator is elementwise (unary or binary arithmetic).
    pub fn is_elementwise(&self) -> bool {
        self.is_binary_arith() || self.is_unary()
    }

    /// Short lowercase tag, used when minting tensor and node names.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::Max => "max",
            OpKind::Min => "min",
            OpKind::Mod => "mod",
            OpKind::Neg => "neg",
            OpKind::Abs => "abs",
            OpKind::Sqrt => "sqrt",
            OpKind::Exp => "exp",
            OpKind::Log => "log",
            OpKind::Ceil => "ceil",
            OpKind::Floor => "floor",
            OpKind::Relu => "relu",
            OpKind::Sigmoid => "sigmoid",
            OpKind::Tanh => "tanh",
            OpKind::Equal => "equal",
            OpKind::Greater => "greater",
            OpKind::Less => "less",
            OpKind::Where => "where",
            OpKind::MatMul => "matmul",
            OpKind::Transpose => "transpose",
            OpKind::Range => "range",
            OpKind::ReduceSum => "reduce_sum",
            OpKind::ReduceMax => "reduce_max",
            OpKind::ReduceMin => "reduce_min",
            OpKind::ReduceProd => "reduce_prod",
            OpKind::ReduceMean => "reduce_mean",
            OpKind::ReduceSumSquare => "reduce_sum_square",
            OpKind::ReduceL1 => "reduce_l1",
            OpKind::ReduceL2 => "reduce_l2",
            OpKind::ReduceLogSum => "reduce_log_sum",
            OpKind::ReduceLogSumExp => "reduce_log_sum_exp",
            OpKind::Conv => "conv",
            OpKind::AveragePool => "average_pool",
            OpKind::Cast => "cast",
            OpKind::Reshape => "reshape",
            OpKind::Squeeze => "squeeze",
            OpKind::Unsqueeze => "unsqueeze",
            OpKind::Gather => "gather",
            OpKind::ScatterElements => "scatter",
            OpKind::Shape => "shape",
            OpKind::Expand => "expand",
            OpKind::ConstantOfShape => "constant_of_shape",
            OpKind::Identity => "identity",
            OpKind::Loop => "loop",
        }
    }
}

/// Attribute value types.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Float(f32),
    Int(i64),
    String(String),
    Tensor(TensorValue),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
}

impl TryFrom<Attribute> for f32 {
    type Error = Error;

    fn try_from(value: Attribute) -> Result<Self> {
        match value {
            Attribute::Float(v) => Ok(v),
            other => Err(Error::Attribute(format!("expected Float, got {:?}", other))),
        }
    }
}

impl TryFrom<Attribute> for i64 {
    type Error = Error;

    fn try_from(value: Attribute) -> Result<Self> {
        match value {
            Attribute::Int(v) => Ok(v),
            other => Err(Error::Attribute(format!("expected Int, got {:?}", other))),
        }
    }
}

impl TryFrom<Attribute> for String {
    type Error = Error;

    fn try_from(value: Attribute) -> Result<Self> {
        match value {
            Attribute::String(v) => Ok(v),
            other => Err(Error::Attribute(format!(
                "expected String, got {:?}",
                other
            ))),
        }
    }
}

impl TryFrom<Attribute> for Vec<i64> {
    type Error = Error;

    fn try_from(value: Attribute) -> Result<Self> {
        match value {
            Attribute::Ints(v) => Ok(v),
            other => Err(Error::Attribute(format!("expected Ints, got {:?}", other))),
        }
    }
}

impl TryFrom<Attribute> for Vec<f32> {
    type Error = Error;

    fn try_from(value: Attribute) -> Result<Self> {
        match value {
            Attribute::Floats(v) => Ok(v),
            other => Err(Error::Attribute(format!(
                "expected Floats, got {:?}",
                other
            ))),
        }
    }
}

impl TryFrom<Attribute> for TensorValue {
    type Error = Error;

    fn try_from(value: Attribute) -> Result<Self> {
        match value {
            Attribute::Tensor(v) => Ok(v),
            other => Err(Error::Attribute(format!(
                "expected Tensor, got {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduction_family() {
        assert!(OpKind::ReduceSum.is_reduction());
        assert!(OpKind::ReduceLogSumExp.is_reduction());
        assert!(!OpKind::Add.is_reduction());
        assert!(!OpKind::MatMul.is_reduction());
    }

    #[test]
    fn test_elementwise_classes() {
        assert!(OpKind::Add.is_binary_arith());
        assert!(OpKind::Tanh.is_unary());
        assert!(OpKind::Div.is_elementwise());
        assert!(!OpKind::Transpose.is_elementwise());
        assert!(!OpKind::Max.is_binary_arith());
    }

    #[test]
    fn test_attribute_conversions() {
        let v: i64 = Attribute::Int(3).try_into().unwrap();
        assert_eq!(v, 3);

        let v: Vec<i64> = Attribute::Ints(vec![1, 0]).try_into().unwrap();
        assert_eq!(v, vec![1, 0]);

        let err: Result<f32> = Attribute::Int(3).try_into();
        assert!(err.is_err());
    }
}
