//! Broadcasting shape rules.

use crate::{Error, Result};

/// Compute the broadcast output shape from two input shapes.
///
/// Shapes align from the rightmost dimension; aligned dimensions match if
/// they are equal or one of them is 1. On axes where the shorter shape has
/// no dimension at all, a size-1 dimension of the longer shape collapses
/// away instead of surviving into the result, so the output never carries
/// leading 1s that exist on only one operand.
///
/// # Example
///
/// ```text
/// broadcast_shape(&[2, 3, 4], &[3, 4])    -> [2, 3, 4]
/// broadcast_shape(&[2, 3, 4], &[2, 1, 4]) -> [2, 3, 4]
/// broadcast_shape(&[1, 4], &[4])          -> [4]
/// broadcast_shape(&[8, 1, 6, 1], &[7, 1, 5]) -> [8, 7, 6, 5]
/// ```
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let max_rank = a.len().max(b.len());
    let promoted = max_rank - a.len().min(b.len());
    let mut result = Vec::with_capacity(max_rank);

    for i in 0..max_rank {
        let da = if i < max_rank - a.len() {
            1
        } else {
            a[i - (max_rank - a.len())]
        };
        let db = if i < max_rank - b.len() {
            1
        } else {
            b[i - (max_rank - b.len())]
        };

        if i < promoted && da == 1 && db == 1 {
            // The shorter shape has no axis here and the longer one is 1.
            continue;
        }

        if da == db {
            result.push(da);
        } else if da == 1 {
            result.push(db);
        } else if db == 1 {
            result.push(da);
        } else {
            return Err(Error::Shape(format!(
                "Cannot broadcast shapes {:?} and {:?} at dimension {i}",
                a, b
            )));
        }
    }

    Ok(result)
}

/// Broadcast union over any number of static shapes.
///
/// Folds [`broadcast_shape`] across the slice; an empty slice yields the
/// scalar shape `[]`.
pub fn broadcast_shapes(shapes: &[&[usize]]) -> Result<Vec<usize>> {
    // Fold from the first shape, not from a scalar seed: against `[]` every
    // axis of the first shape would count as promoted and its 1s would
    // collapse prematurely.
    let Some((first, rest)) = shapes.split_first() else {
        return Ok(Vec::new());
    };
    let mut result = first.to_vec();
    for shape in rest {
        result = broadcast_shape(&result, shape)?;
    }
    Ok(result)
}

/// Check whether `from` broadcasts to exactly `to` (right-aligned,
/// size-1-or-equal), without changing `to`.
pub fn is_broadcastable_to(from: &[usize], to: &[usize]) -> bool {
    if from.len() > to.len() {
        return false;
    }
    let offset = to.len() - from.len();
    from.iter()
        .enumerate()
        .all(|(i, &d)| d == 1 || d == to[offset + i])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_same_shape() {
        assert_eq!(
            broadcast_shape(&[2, 3, 4], &[2, 3, 4]).unwrap(),
            vec![2, 3, 4]
        );
    }

    #[test]
    fn test_broadcast_missing_dims() {
        assert_eq!(broadcast_shape(&[2, 3], &[3]).unwrap(), vec![2, 3]);
        assert_eq!(broadcast_shape(&[1, 4], &[4]).unwrap(), vec![4]);
    }

    #[test]
    fn test_promoted_ones_collapse() {
        // Leading 1s on the longer shape vanish where the shorter shape has
        // no axis; 1s present on both operands stay.
        assert_eq!(broadcast_shape(&[1, 1, 4], &[4]).unwrap(), vec![4]);
        assert_eq!(broadcast_shape(&[4], &[1, 4]).unwrap(), vec![4]);
        assert_eq!(broadcast_shape(&[1, 4], &[1, 4]).unwrap(), vec![1, 4]);
        assert_eq!(broadcast_shape(&[1, 2, 3], &[3]).unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_broadcast_ones() {
        assert_eq!(
            broadcast_shape(&[2, 3, 4], &[2, 1, 4]).unwrap(),
            vec![2, 3, 4]
        );
    }

    #[test]
    fn test_broadcast_complex() {
        assert_eq!(
            broadcast_shape(&[8, 1, 6, 1], &[7, 1, 5]).unwrap(),
            vec![8, 7, 6, 5]
        );
    }

    #[test]
    fn test_broadcast_incompatible() {
        let result = broadcast_shape(&[2, 3], &[2, 4]);
        assert!(result.is_err());
    }

    #[test]
    fn test_broadcast_scalar() {
        assert_eq!(broadcast_shape(&[], &[3, 4]).unwrap(), vec![3, 4]);
        assert_eq!(broadcast_shape(&[5, 6], &[]).unwrap(), vec![5, 6]);
    }

    #[test]
    fn test_broadcast_union() {
        assert_eq!(
            broadcast_shapes(&[&[2, 1], &[1, 3], &[3]]).unwrap(),
            vec![2, 3]
        );
        assert_eq!(broadcast_shapes(&[]).unwrap(), Vec::<usize>::new());
        assert!(broadcast_shapes(&[&[2, 3], &[2, 4]]).is_err());
    }

    #[test]
    fn test_is_broadcastable_to() {
        assert!(is_broadcastable_to(&[3], &[2, 3]));
        assert!(is_broadcastable_to(&[1, 3], &[2, 3]));
        assert!(is_broadcastable_to(&[], &[2, 3]));
        assert!(!is_broadcastable_to(&[2], &[2, 3]));
        assert!(!is_broadcastable_to(&[2, 3, 4], &[3, 4]));
    }
}
