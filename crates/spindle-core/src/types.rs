//! Core types for tensor shapes, element types, roles, and values.

use crate::{Error, Result};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
    F32,
    I64,
    I32,
    Bool,
    U8,
}

impl ElemType {
    /// Size of one element in bytes.
    pub fn size_of(&self) -> usize {
        match self {
            ElemType::F32 | ElemType::I32 => 4,
            ElemType::I64 => 8,
            ElemType::Bool | ElemType::U8 => 1,
        }
    }

    /// Check if this is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, ElemType::F32)
    }

    /// ONNX TensorProto data-type code for this element type.
    ///
    /// Used as the payload of `Cast`'s `to` attribute.
    pub fn onnx_code(&self) -> i64 {
        match self {
            ElemType::F32 => 1,
            ElemType::U8 => 2,
            ElemType::I32 => 6,
            ElemType::I64 => 7,
            ElemType::Bool => 9,
        }
    }

    /// Inverse of [`ElemType::onnx_code`].
    pub fn from_onnx_code(code: i64) -> Option<ElemType> {
        match code {
            1 => Some(ElemType::F32),
            2 => Some(ElemType::U8),
            6 => Some(ElemType::I32),
            7 => Some(ElemType::I64),
            9 => Some(ElemType::Bool),
            _ => None,
        }
    }
}

/// Tensor shape: either fully static or not yet known.
///
/// Unknown shapes are allowed to flow through the graph; lowering leaves
/// operators with unknown shapes untouched rather than failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    /// All dimensions are known at compile time.
    Static(Vec<usize>),

    /// Shape has not been inferred.
    Unknown,
}

impl Shape {
    /// Shape of a rank-0 scalar.
    pub fn scalar() -> Self {
        Shape::Static(Vec::new())
    }

    /// Check if the shape is fully static.
    pub fn is_static(&self) -> bool {
        matches!(self, Shape::Static(_))
    }

    /// Check if the shape is unknown.
    pub fn is_unknown(&self) -> bool {
        matches!(self, Shape::Unknown)
    }

    /// Get static dimensions if available.
    pub fn as_static(&self) -> Option<&[usize]> {
        match self {
            Shape::Static(dims) => Some(dims),
            Shape::Unknown => None,
        }
    }

    /// Number of dimensions, if known.
    pub fn ndim(&self) -> Option<usize> {
        match self {
            Shape::Static(dims) => Some(dims.len()),
            Shape::Unknown => None,
        }
    }

    /// Total number of elements, if the shape is static.
    pub fn numel(&self) -> Option<usize> {
        match self {
            Shape::Static(dims) => Some(dims.iter().product()),
            Shape::Unknown => None,
        }
    }
}

/// Role of a tensor within a graph.
///
/// The role decides how the lowering pass may consume the tensor: chain
/// growth stops at everything except `Intermediate`, and `Index`/`IndexAux`
/// mark tensors minted by the lowering itself for loop-body index
/// arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorRole {
    /// Graph input; value arrives at runtime.
    Input,

    /// Graph output.
    Output,

    /// Weight baked into the model.
    Initializer,

    /// Produced and consumed inside the graph.
    Intermediate,

    /// Compile-time constant value.
    Constant,

    /// Per-axis index produced by loop-body index decoding.
    Index,

    /// Auxiliary constant for index arithmetic (strides, axes, bounds).
    IndexAux,
}

/// Raw tensor data, tagged by element type.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I64(Vec<i64>),
    I32(Vec<i32>),
    Bool(Vec<bool>),
    U8(Vec<u8>),
}

impl TensorData {
    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::Bool(v) => v.len(),
            TensorData::U8(v) => v.len(),
        }
    }

    /// Check if the data is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Try to get as f32 slice.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Try to get as i64 slice.
    pub fn as_i64(&self) -> Option<&[i64]> {
        match self {
            TensorData::I64(v) => Some(v),
            _ => None,
        }
    }

    /// Try to get as i32 slice.
    pub fn as_i32(&self) -> Option<&[i32]> {
        match self {
            TensorData::I32(v) => Some(v),
            _ => None,
        }
    }

    /// Try to get as bool slice.
    pub fn as_bool(&self) -> Option<&[bool]> {
        match self {
            TensorData::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Try to get as u8 slice.
    pub fn as_u8(&self) -> Option<&[u8]> {
        match self {
            TensorData::U8(v) => Some(v),
            _ => None,
        }
    }

    /// Element type of this data.
    pub fn elem_type(&self) -> ElemType {
        match self {
            TensorData::F32(_) => ElemType::F32,
            TensorData::I64(_) => ElemType::I64,
            TensorData::I32(_) => ElemType::I32,
            TensorData::Bool(_) => ElemType::Bool,
            TensorData::U8(_) => ElemType::U8,
        }
    }
}

/// A tensor value known at compile time.
///
/// Bundles data, shape, and element type. The lowering pass mints many of
/// these (trip counts, strides, identity-filled carries); the interpreter
/// passes them around as runtime values.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorValue {
    /// The raw tensor data.
    pub data: TensorData,

    /// The shape of the tensor (dimensions).
    pub shape: Vec<usize>,

    /// The element type of the tensor.
    pub dtype: ElemType,
}

impl TensorValue {
    /// Create a new tensor value with data, shape, and element type.
    ///
    /// # Panics
    ///
    /// Panics if the data length doesn't match the shape product, or the
    /// data tag doesn't match the declared element type.
    pub fn new(data: TensorData, shape: Vec<usize>, dtype: ElemType) -> Self {
        let expected_len: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_len,
            "Data length {} doesn't match shape {:?} (product = {})",
            data.len(),
            shape,
            expected_len
        );
        assert_eq!(
            data.elem_type(),
            dtype,
            "Data type {:?} doesn't match declared dtype {:?}",
            data.elem_type(),
            dtype
        );
        Self { data, shape, dtype }
    }

    /// Create a rank-0 scalar value.
    pub fn scalar(data: TensorData) -> Self {
        let dtype = data.elem_type();
        Self::new(data, Vec::new(), dtype)
    }

    /// Rank-0 i64 scalar.
    pub fn scalar_i64(value: i64) -> Self {
        Self::scalar(TensorData::I64(vec![value]))
    }

    /// Rank-0 f32 scalar.
    pub fn scalar_f32(value: f32) -> Self {
        Self::scalar(TensorData::F32(vec![value]))
    }

    /// Rank-0 bool scalar.
    pub fn scalar_bool(value: bool) -> Self {
        Self::scalar(TensorData::Bool(vec![value]))
    }

    /// 1-D i64 vector.
    pub fn i64s(values: Vec<i64>) -> Self {
        let shape = vec![values.len()];
        Self::new(TensorData::I64(values), shape, ElemType::I64)
    }

    /// 1-D f32 vector.
    pub fn f32s(values: Vec<f32>) -> Self {
        let shape = vec![values.len()];
        Self::new(TensorData::F32(values), shape, ElemType::F32)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the value is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Try to get as f32 slice.
    pub fn as_f32(&self) -> Option<&[f32]> {
        self.data.as_f32()
    }

    /// Try to get as i64 slice.
    pub fn as_i64(&self) -> Option<&[i64]> {
        self.data.as_i64()
    }

    /// Try to get as i32 slice.
    pub fn as_i32(&self) -> Option<&[i32]> {
        self.data.as_i32()
    }

    /// Try to get as bool slice.
    pub fn as_bool(&self) -> Option<&[bool]> {
        self.data.as_bool()
    }

    /// Try to get as u8 slice.
    pub fn as_u8(&self) -> Option<&[u8]> {
        self.data.as_u8()
    }

    /// Create a new value with a different shape (data unchanged).
    ///
    /// # Panics
    ///
    /// Panics if the new shape product doesn't match the data length.
    pub fn reshape(&self, new_shape: Vec<usize>) -> Self {
        Self::new(self.data.clone(), new_shape, self.dtype)
    }

    /// Cast this value to a different element type.
    pub fn cast(&self, target: ElemType) -> Result<TensorValue> {
        if self.dtype == target {
            return Ok(self.clone());
        }

        let new_data = match (&self.data, target) {
            (TensorData::I64(v), ElemType::I32) => {
                TensorData::I32(v.iter().map(|&x| x as i32).collect())
            }
            (TensorData::I64(v), ElemType::F32) => {
                TensorData::F32(v.iter().map(|&x| x as f32).collect())
            }
            (TensorData::I32(v), ElemType::I64) => {
                TensorData::I64(v.iter().map(|&x| x as i64).collect())
            }
            (TensorData::I32(v), ElemType::F32) => {
                TensorData::F32(v.iter().map(|&x| x as f32).collect())
            }
            (TensorData::F32(v), ElemType::I32) => {
                TensorData::I32(v.iter().map(|&x| x as i32).collect())
            }
            (TensorData::F32(v), ElemType::I64) => {
                TensorData::I64(v.iter().map(|&x| x as i64).collect())
            }
            (TensorData::Bool(v), ElemType::I64) => {
                TensorData::I64(v.iter().map(|&x| x as i64).collect())
            }
            (TensorData::Bool(v), ElemType::F32) => {
                TensorData::F32(v.iter().map(|&x| x as i64 as f32).collect())
            }
            _ => {
                return Err(Error::Type(format!(
                    "Cast from {:?} to {:?} not supported",
                    self.dtype, target
                )));
            }
        };

        Ok(TensorValue::new(new_data, self.shape.clone(), target))
    }

    /// Read element 0 as an i64, if the value is integer-typed.
    pub fn first_i64(&self) -> Option<i64> {
        match &self.data {
            TensorData::I64(v) => v.first().copied(),
            TensorData::I32(v) => v.first().map(|&x| x as i64),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_value_cast() {
        let i64_val = TensorValue::i64s(vec![1, 2, 3]);
        let i32_val = i64_val.cast(ElemType::I32).unwrap();
        assert_eq!(i32_val.as_i32(), Some(&[1, 2, 3][..]));
        assert_eq!(i32_val.shape, vec![3]);

        let f32_val = i32_val.cast(ElemType::F32).unwrap();
        assert_eq!(f32_val.as_f32(), Some(&[1.0, 2.0, 3.0][..]));
        assert_eq!(f32_val.shape, vec![3]);
    }

    #[test]
    fn test_tensor_value_reshape() {
        let value = TensorValue::new(
            TensorData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            vec![2, 3],
            ElemType::F32,
        );
        assert_eq!(value.shape, vec![2, 3]);

        let reshaped = value.reshape(vec![3, 2]);
        assert_eq!(reshaped.shape, vec![3, 2]);
        assert_eq!(reshaped.as_f32(), Some(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0][..]));
    }

    #[test]
    #[should_panic(expected = "doesn't match shape")]
    fn test_tensor_value_new_validates_shape() {
        // 6 elements but shape product is 8
        TensorValue::new(
            TensorData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            vec![2, 4],
            ElemType::F32,
        );
    }

    #[test]
    fn test_scalar_constructors() {
        let s = TensorValue::scalar_i64(7);
        assert_eq!(s.shape, Vec::<usize>::new());
        assert_eq!(s.as_i64(), Some(&[7][..]));
        assert_eq!(s.first_i64(), Some(7));

        let v = TensorValue::i64s(vec![0, 1]);
        assert_eq!(v.shape, vec![2]);
    }

    #[test]
    fn test_shape_queries() {
        let s = Shape::Static(vec![2, 3, 4]);
        assert!(s.is_static());
        assert_eq!(s.ndim(), Some(3));
        assert_eq!(s.numel(), Some(24));

        let u = Shape::Unknown;
        assert!(!u.is_static());
        assert!(u.is_unknown());
        assert_eq!(u.ndim(), None);
        assert_eq!(u.numel(), None);

        assert_eq!(Shape::scalar().numel(), Some(1));
    }

    #[test]
    fn test_elem_type_codes() {
        for ty in [
            ElemType::F32,
            ElemType::U8,
            ElemType::I32,
            ElemType::I64,
            ElemType::Bool,
        ] {
            assert_eq!(ElemType::from_onnx_code(ty.onnx_code()), Some(ty));
        }
        assert_eq!(ElemType::from_onnx_code(42), None);
    }
}
