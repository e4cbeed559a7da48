#![forbid(unsafe_code)]

/// Failures of shape arithmetic shared by every golden kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    NegativeDim(isize),
    AmbiguousInferredDim,
    SizeOverflow,
    NotBroadcastable { left: Vec<usize>, right: Vec<usize> },
    ElementCountMismatch { source: usize, target: usize },
    AxisOutOfRange { axis: isize, rank: usize },
    RankMismatch { expected: usize, actual: usize },
    ViewOutOfBounds { required: usize, available: usize },
}

impl ShapeError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NegativeDim(_) => "shape_negative_dim",
            Self::AmbiguousInferredDim => "shape_ambiguous_inferred_dim",
            Self::SizeOverflow => "shape_size_overflow",
            Self::NotBroadcastable { .. } => "shape_not_broadcastable",
            Self::ElementCountMismatch { .. } => "shape_element_count_mismatch",
            Self::AxisOutOfRange { .. } => "shape_axis_out_of_range",
            Self::RankMismatch { .. } => "shape_rank_mismatch",
            Self::ViewOutOfBounds { .. } => "shape_view_out_of_bounds",
        }
    }

    /// Out-of-range axis/index failures surface as index errors in reports;
    /// everything else is a domain error.
    #[must_use]
    pub fn is_index_error(&self) -> bool {
        matches!(self, Self::AxisOutOfRange { .. })
    }
}

impl std::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NegativeDim(dim) => write!(f, "dimension {dim} is negative"),
            Self::AmbiguousInferredDim => write!(f, "reshape target may infer at most one dim"),
            Self::SizeOverflow => write!(f, "element count does not fit in usize"),
            Self::NotBroadcastable { left, right } => {
                write!(f, "shapes {left:?} and {right:?} are not broadcastable")
            }
            Self::ElementCountMismatch { source, target } => {
                write!(f, "cannot reshape {source} elements into {target}")
            }
            Self::AxisOutOfRange { axis, rank } => {
                write!(f, "axis {axis} is out of range for rank {rank}")
            }
            Self::RankMismatch { expected, actual } => {
                write!(f, "rank mismatch expected={expected} actual={actual}")
            }
            Self::ViewOutOfBounds {
                required,
                available,
            } => write!(
                f,
                "strided view needs {required} elements but storage holds {available}"
            ),
        }
    }
}

impl std::error::Error for ShapeError {}

#[must_use]
pub fn broadcast_compatible(left: &[usize], right: &[usize]) -> bool {
    broadcast_shape(left, right).is_ok()
}

/// Aligns trailing dims; a dim of 1 stretches to match the other side.
pub fn broadcast_shape(left: &[usize], right: &[usize]) -> Result<Vec<usize>, ShapeError> {
    let rank = left.len().max(right.len());
    let dim_at = |shape: &[usize], back: usize| {
        shape.len().checked_sub(back + 1).map_or(1, |i| shape[i])
    };
    let mut merged = vec![0usize; rank];
    for back in 0..rank {
        let (a, b) = (dim_at(left, back), dim_at(right, back));
        merged[rank - 1 - back] = if a == b || b == 1 {
            a
        } else if a == 1 {
            b
        } else {
            return Err(ShapeError::NotBroadcastable {
                left: left.to_vec(),
                right: right.to_vec(),
            });
        };
    }
    Ok(merged)
}

pub fn broadcast_all(shapes: &[&[usize]]) -> Result<Vec<usize>, ShapeError> {
    let mut merged = Vec::new();
    for shape in shapes {
        merged = broadcast_shape(&merged, shape)?;
    }
    Ok(merged)
}

pub fn element_count(shape: &[usize]) -> Result<usize, ShapeError> {
    let mut count = 1usize;
    for &dim in shape {
        count = count.checked_mul(dim).ok_or(ShapeError::SizeOverflow)?;
    }
    Ok(count)
}

/// Turns a reshape target holding at most one `-1` into concrete dims for
/// `source_count` elements.
pub fn resolve_reshape_target(
    target: &[isize],
    source_count: usize,
) -> Result<Vec<usize>, ShapeError> {
    let mut inferred: Option<usize> = None;
    let mut dims = Vec::with_capacity(target.len());
    for (pos, &dim) in target.iter().enumerate() {
        if dim == -1 {
            if inferred.is_some() {
                return Err(ShapeError::AmbiguousInferredDim);
            }
            inferred = Some(pos);
            dims.push(1);
        } else {
            dims.push(usize::try_from(dim).map_err(|_| ShapeError::NegativeDim(dim))?);
        }
    }

    let fixed = element_count(&dims)?;
    let mismatch = ShapeError::ElementCountMismatch {
        source: source_count,
        target: fixed,
    };
    match inferred {
        Some(pos) if fixed != 0 && source_count % fixed == 0 => dims[pos] = source_count / fixed,
        Some(_) => return Err(mismatch),
        None if fixed != source_count => return Err(mismatch),
        None => {}
    }
    Ok(dims)
}

/// Row-major element strides.
#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1].saturating_mul(shape[i + 1]);
    }
    strides
}

/// Resolves a possibly negative axis against `ndim` dimensions.
pub fn normalize_axis(axis: isize, ndim: usize) -> Result<usize, ShapeError> {
    let nd = ndim as i128;
    let ax = axis as i128;
    let resolved = if ax < 0 { ax + nd } else { ax };
    if resolved < 0 || resolved >= nd {
        return Err(ShapeError::AxisOutOfRange { axis, rank: ndim });
    }
    Ok(resolved as usize)
}

/// Resolves an insertion position for a new axis, valid in `[-(ndim+1), ndim]`.
pub fn normalize_insert_axis(axis: isize, ndim: usize) -> Result<usize, ShapeError> {
    normalize_axis(axis, ndim + 1)
}

#[must_use]
pub fn unravel_index(mut flat: usize, shape: &[usize]) -> Vec<usize> {
    let mut index = vec![0usize; shape.len()];
    for (slot, &dim) in index.iter_mut().zip(shape).rev() {
        if dim == 0 {
            continue;
        }
        *slot = flat % dim;
        flat /= dim;
    }
    index
}

#[must_use]
pub fn ravel_index(index: &[usize], strides: &[usize]) -> usize {
    index.iter().zip(strides).map(|(&i, &s)| i * s).sum()
}

pub fn permute_shape(shape: &[usize], perm: &[usize]) -> Result<Vec<usize>, ShapeError> {
    if perm.len() != shape.len() {
        return Err(ShapeError::RankMismatch {
            expected: shape.len(),
            actual: perm.len(),
        });
    }
    let mut seen = vec![false; shape.len()];
    let mut out = Vec::with_capacity(shape.len());
    for &axis in perm {
        if axis >= shape.len() || seen[axis] {
            return Err(ShapeError::AxisOutOfRange {
                axis: axis as isize,
                rank: shape.len(),
            });
        }
        seen[axis] = true;
        out.push(shape[axis]);
    }
    Ok(out)
}

/// An explicit size/stride/offset window over flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewLayout {
    pub shape: Vec<usize>,
    pub strides: Vec<usize>,
    pub offset: usize,
}

impl ViewLayout {
    pub fn new(shape: Vec<usize>, strides: Vec<usize>, offset: usize) -> Result<Self, ShapeError> {
        if shape.len() != strides.len() {
            return Err(ShapeError::RankMismatch {
                expected: shape.len(),
                actual: strides.len(),
            });
        }
        Ok(Self {
            shape,
            strides,
            offset,
        })
    }

    #[must_use]
    pub fn contiguous(shape: Vec<usize>) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Number of storage elements the view touches, counted from index zero.
    /// An empty view needs nothing.
    pub fn required_storage(&self) -> Result<usize, ShapeError> {
        if element_count(&self.shape)? == 0 {
            return Ok(0);
        }
        let mut last = self.offset;
        for (&dim, &stride) in self.shape.iter().zip(&self.strides) {
            let span = (dim - 1).checked_mul(stride).ok_or(ShapeError::SizeOverflow)?;
            last = last.checked_add(span).ok_or(ShapeError::SizeOverflow)?;
        }
        last.checked_add(1).ok_or(ShapeError::SizeOverflow)
    }

    pub fn check_fits(&self, available: usize) -> Result<(), ShapeError> {
        let required = self.required_storage()?;
        if required > available {
            return Err(ShapeError::ViewOutOfBounds {
                required,
                available,
            });
        }
        Ok(())
    }

    /// Storage index of every element of the view, in row-major view order.
    pub fn linear_indices(&self) -> Result<Vec<usize>, ShapeError> {
        let count = element_count(&self.shape)?;
        let mut out = Vec::with_capacity(count);
        for flat in 0..count {
            let index = unravel_index(flat, &self.shape);
            out.push(self.offset + ravel_index(&index, &self.strides));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ShapeError, ViewLayout, broadcast_all, broadcast_compatible, broadcast_shape,
        contiguous_strides, element_count, normalize_axis, normalize_insert_axis, permute_shape,
        resolve_reshape_target, unravel_index,
    };

    #[test]
    fn broadcast_shape_aligns_trailing_dims() {
        let merged = broadcast_shape(&[16, 1, 4], &[8, 1]).expect("compatible");
        assert_eq!(merged, vec![16, 8, 4]);
        assert_eq!(broadcast_shape(&[], &[3]).expect("scalar"), vec![3]);
    }

    #[test]
    fn mismatched_dims_do_not_broadcast() {
        let err = broadcast_shape(&[2, 3], &[4, 3]).expect_err("2 vs 4");
        assert_eq!(err.reason_code(), "shape_not_broadcastable");
        assert!(!broadcast_compatible(&[2, 3], &[4, 3]));
    }

    #[test]
    fn broadcast_all_folds_left_to_right() {
        let shapes: [&[usize]; 3] = [&[4, 1], &[1, 6], &[2, 4, 6]];
        assert_eq!(broadcast_all(&shapes).expect("compatible"), vec![2, 4, 6]);
    }

    #[test]
    fn row_major_strides() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(contiguous_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn reshape_target_infers_one_dim() {
        assert_eq!(resolve_reshape_target(&[3, -1], 12).expect("infer"), vec![3, 4]);
        assert_eq!(resolve_reshape_target(&[2, 6], 12).expect("exact"), vec![2, 6]);
        assert!(matches!(
            resolve_reshape_target(&[-1, 2, -1], 12),
            Err(ShapeError::AmbiguousInferredDim)
        ));
        assert!(matches!(
            resolve_reshape_target(&[5, -1], 12),
            Err(ShapeError::ElementCountMismatch { source: 12, target: 5 })
        ));
        assert!(matches!(
            resolve_reshape_target(&[-2], 4),
            Err(ShapeError::NegativeDim(-2))
        ));
    }

    #[test]
    fn negative_axes_resolve_from_the_end() {
        assert_eq!(normalize_axis(-1, 2).expect("axis"), 1);
        assert_eq!(normalize_axis(-2, 2).expect("axis"), 0);
        let err = normalize_axis(2, 2).expect_err("out of range");
        assert!(err.is_index_error());
        assert_eq!(normalize_insert_axis(1, 1).expect("insert"), 1);
        assert!(normalize_insert_axis(2, 1).is_err());
    }

    #[test]
    fn unravel_walks_row_major() {
        assert_eq!(unravel_index(5, &[2, 3]), vec![1, 2]);
        assert_eq!(element_count(&[2, 0, 3]).expect("count"), 0);
    }

    #[test]
    fn permute_rejects_repeated_axes() {
        assert_eq!(
            permute_shape(&[4, 8, 16], &[0, 2, 1]).expect("perm"),
            vec![4, 16, 8]
        );
        assert!(permute_shape(&[4, 8], &[0, 0]).is_err());
    }

    #[test]
    fn view_storage_bound() {
        let view = ViewLayout::new(vec![4, 8, 16], vec![128, 16, 1], 0).expect("view");
        assert_eq!(view.required_storage().expect("storage"), 512);
        view.check_fits(4 * 8 * 16).expect("fits exactly");
        let err = view.check_fits(4 * 8 * 15).expect_err("too small");
        assert!(matches!(err, ShapeError::ViewOutOfBounds { .. }));
    }
}
