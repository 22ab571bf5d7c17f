//! Row-major index arithmetic shared by the lowering pass and the
//! reference interpreter.

use crate::{Error, Result};

/// Compute row-major strides for a shape.
///
/// The last axis has stride 1; each earlier axis strides over the product
/// of the dimensions after it. A rank-0 shape yields an empty stride list.
pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let ndim = shape.len();
    let mut strides = vec![1usize; ndim];
    if ndim >= 2 {
        for i in (0..ndim - 1).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
    }
    strides
}

/// Linearize per-axis coordinates into a flat row-major index.
pub fn flatten_index(coords: &[usize], strides: &[usize]) -> usize {
    coords
        .iter()
        .zip(strides.iter())
        .map(|(&c, &s)| c * s)
        .sum()
}

/// Decode a flat row-major index into per-axis coordinates,
/// most-significant axis first.
pub fn unflatten_index(flat: usize, shape: &[usize]) -> Vec<usize> {
    let strides = compute_strides(shape);
    let mut coords = Vec::with_capacity(shape.len());
    let mut rest = flat;
    for &stride in &strides {
        coords.push(rest / stride);
        rest %= stride;
    }
    coords
}

/// Normalize possibly-negative axis indices against a rank.
///
/// Returns axes in the given order; duplicates are rejected.
pub fn normalize_axes(axes: &[i64], rank: usize) -> Result<Vec<usize>> {
    let mut result = Vec::with_capacity(axes.len());
    for &axis in axes {
        let normalized = if axis < 0 { axis + rank as i64 } else { axis };
        if normalized < 0 || normalized >= rank as i64 {
            return Err(Error::Shape(format!(
                "axis {} out of range for rank {}",
                axis, rank
            )));
        }
        let normalized = normalized as usize;
        if result.contains(&normalized) {
            return Err(Error::Shape(format!("duplicate axis {}", axis)));
        }
        result.push(normalized);
    }
    Ok(result)
}

/// Output shape of a reduction over `axes`.
///
/// Reduced dimensions are dropped when `keepdims` is false and pinned to 1
/// when it is true.
pub fn reduce_output_shape(shape: &[usize], axes: &[usize], keepdims: bool) -> Vec<usize> {
    let mut result = Vec::with_capacity(shape.len());
    for (i, &dim) in shape.iter().enumerate() {
        if axes.contains(&i) {
            if keepdims {
                result.push(1);
            }
        } else {
            result.push(dim);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_strides() {
        assert_eq!(compute_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(compute_strides(&[5]), vec![1]);
        assert_eq!(compute_strides(&[]), Vec::<usize>::new());
        assert_eq!(compute_strides(&[1, 1, 7]), vec![7, 7, 1]);
    }

    #[test]
    fn test_unflatten_most_significant_first() {
        assert_eq!(unflatten_index(0, &[2, 3]), vec![0, 0]);
        assert_eq!(unflatten_index(4, &[2, 3]), vec![1, 1]);
        assert_eq!(unflatten_index(5, &[2, 3]), vec![1, 2]);
    }

    #[test]
    fn test_flatten_unflatten_bijection() {
        let shapes: [&[usize]; 4] = [&[2, 3], &[4], &[2, 3, 4], &[1, 5, 1, 2]];
        for shape in shapes {
            let strides = compute_strides(shape);
            let numel: usize = shape.iter().product();
            for n in 0..numel {
                let coords = unflatten_index(n, shape);
                for (c, d) in coords.iter().zip(shape.iter()) {
                    assert!(c < d);
                }
                assert_eq!(flatten_index(&coords, &strides), n);
            }
        }
    }

    #[test]
    fn test_normalize_axes() {
        assert_eq!(normalize_axes(&[0, 2], 3).unwrap(), vec![0, 2]);
        assert_eq!(normalize_axes(&[-1], 3).unwrap(), vec![2]);
        assert!(normalize_axes(&[3], 3).is_err());
        assert!(normalize_axes(&[0, 0], 3).is_err());
    }

    #[test]
    fn test_reduce_output_shape() {
        assert_eq!(reduce_output_shape(&[2, 3], &[1], false), vec![2]);
        assert_eq!(reduce_output_shape(&[2, 3], &[1], true), vec![2, 1]);
        assert_eq!(
            reduce_output_shape(&[2, 3], &[0, 1], false),
            Vec::<usize>::new()
        );
        assert_eq!(reduce_output_shape(&[2, 3, 4], &[0, 2], true), vec![1, 3, 1]);
    }
}
