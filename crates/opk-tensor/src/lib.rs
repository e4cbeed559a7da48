#![forbid(unsafe_code)]

use opk_dtype::{DType, promote};
use opk_ndarray::{
    ShapeError, broadcast_shape, contiguous_strides, element_count, resolve_reshape_target,
    normalize_axis, normalize_insert_axis, permute_shape, ravel_index, unravel_index,
};

pub const TENSOR_REASON_CODES: [&str; 6] = [
    "tensor_shape_contract_violation",
    "tensor_invalid_input_length",
    "tensor_index_out_of_range",
    "tensor_empty_input",
    "tensor_concat_mismatch",
    "tensor_split_mismatch",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
    Less,
    Greater,
    Equal,
    LogicalAnd,
    LogicalOr,
}

impl BinaryOp {
    #[must_use]
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Self::Add => lhs + rhs,
            Self::Sub => lhs - rhs,
            Self::Mul => lhs * rhs,
            Self::Div => lhs / rhs,
            Self::Maximum => {
                if lhs.is_nan() || rhs.is_nan() {
                    f64::NAN
                } else {
                    lhs.max(rhs)
                }
            }
            Self::Minimum => {
                if lhs.is_nan() || rhs.is_nan() {
                    f64::NAN
                } else {
                    lhs.min(rhs)
                }
            }
            Self::Less => flag(lhs < rhs),
            Self::Greater => flag(lhs > rhs),
            Self::Equal => flag(lhs == rhs),
            Self::LogicalAnd => flag(lhs != 0.0 && rhs != 0.0),
            Self::LogicalOr => flag(lhs != 0.0 || rhs != 0.0),
        }
    }

    #[must_use]
    pub const fn is_predicate(self) -> bool {
        matches!(
            self,
            Self::Less | Self::Greater | Self::Equal | Self::LogicalAnd | Self::LogicalOr
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Rsqrt,
    Square,
    Sin,
    Cos,
    Tanh,
    Sigmoid,
    Relu,
    LogicalNot,
}

impl UnaryOp {
    #[must_use]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Neg => -x,
            Self::Abs => x.abs(),
            Self::Exp => x.exp(),
            Self::Log => x.ln(),
            Self::Sqrt => x.sqrt(),
            Self::Rsqrt => 1.0 / x.sqrt(),
            Self::Square => x * x,
            Self::Sin => x.sin(),
            Self::Cos => x.cos(),
            Self::Tanh => x.tanh(),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Relu => {
                if x.is_nan() {
                    f64::NAN
                } else {
                    x.max(0.0)
                }
            }
            Self::LogicalNot => flag(x == 0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Prod,
    Max,
    Min,
    Mean,
}

impl ReduceOp {
    const fn identity(self) -> f64 {
        match self {
            Self::Sum | Self::Mean => 0.0,
            Self::Prod => 1.0,
            Self::Max => f64::NEG_INFINITY,
            Self::Min => f64::INFINITY,
        }
    }

    fn fold(self, acc: f64, value: f64) -> f64 {
        match self {
            Self::Sum | Self::Mean => acc + value,
            Self::Prod => acc * value,
            Self::Max => BinaryOp::Maximum.apply(acc, value),
            Self::Min => BinaryOp::Minimum.apply(acc, value),
        }
    }
}

fn flag(cond: bool) -> f64 {
    if cond { 1.0 } else { 0.0 }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorError {
    Shape(ShapeError),
    InvalidInputLength {
        expected: usize,
        actual: usize,
    },
    IndexOutOfRange {
        axis: usize,
        index: i64,
        len: usize,
    },
    EmptyInput(&'static str),
    ConcatMismatch {
        axis: usize,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    SplitMismatch {
        axis_len: usize,
        requested: usize,
    },
}

impl std::fmt::Display for TensorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shape(err) => write!(f, "shape error: {err}"),
            Self::InvalidInputLength { expected, actual } => {
                write!(f, "invalid input length expected={expected} actual={actual}")
            }
            Self::IndexOutOfRange { axis, index, len } => {
                write!(f, "index {index} out of range for axis {axis} with size {len}")
            }
            Self::EmptyInput(what) => write!(f, "{what} must not be empty"),
            Self::ConcatMismatch { axis, lhs, rhs } => write!(
                f,
                "cannot join {lhs:?} and {rhs:?}: sizes differ outside axis {axis}"
            ),
            Self::SplitMismatch {
                axis_len,
                requested,
            } => write!(
                f,
                "split sizes sum to {requested} but axis has {axis_len} elements"
            ),
        }
    }
}

impl std::error::Error for TensorError {}

impl From<ShapeError> for TensorError {
    fn from(err: ShapeError) -> Self {
        Self::Shape(err)
    }
}

impl TensorError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Shape(_) => "tensor_shape_contract_violation",
            Self::InvalidInputLength { .. } => "tensor_invalid_input_length",
            Self::IndexOutOfRange { .. } => "tensor_index_out_of_range",
            Self::EmptyInput(_) => "tensor_empty_input",
            Self::ConcatMismatch { .. } => "tensor_concat_mismatch",
            Self::SplitMismatch { .. } => "tensor_split_mismatch",
        }
    }

    /// Out-of-range axes and indices; reported as index errors.
    #[must_use]
    pub fn is_index_error(&self) -> bool {
        match self {
            Self::Shape(err) => err.is_index_error(),
            Self::IndexOutOfRange { .. } => true,
            _ => false,
        }
    }
}

/// Splits `shape` around `axis` into (outer, axis length, inner) extents.
#[must_use]
pub fn axis_extents(shape: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = shape[..axis].iter().product::<usize>();
    let inner = shape[axis + 1..].iter().product::<usize>();
    (outer, shape[axis], inner)
}

/// Dense row-major tensor. Values are held as f64 whatever the dtype; the
/// dtype records what the accelerator stores and drives rounding on cast.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    values: Vec<f64>,
    dtype: DType,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, values: Vec<f64>, dtype: DType) -> Result<Self, TensorError> {
        let expected = element_count(&shape)?;
        if values.len() != expected {
            return Err(TensorError::InvalidInputLength {
                expected,
                actual: values.len(),
            });
        }
        Ok(Self {
            shape,
            values,
            dtype,
        })
    }

    #[must_use]
    pub fn scalar(value: f64, dtype: DType) -> Self {
        Self {
            shape: Vec::new(),
            values: vec![value],
            dtype,
        }
    }

    #[must_use]
    pub fn from_vec(values: Vec<f64>, dtype: DType) -> Self {
        Self {
            shape: vec![values.len()],
            values,
            dtype,
        }
    }

    pub fn full(shape: Vec<usize>, value: f64, dtype: DType) -> Result<Self, TensorError> {
        let count = element_count(&shape)?;
        Ok(Self {
            shape,
            values: vec![value; count],
            dtype,
        })
    }

    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Result<Self, TensorError> {
        Self::full(shape, 0.0, dtype)
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    #[must_use]
    pub fn into_values(self) -> Vec<f64> {
        self.values
    }

    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn strides(&self) -> Vec<usize> {
        contiguous_strides(&self.shape)
    }

    /// Element at a multi-index, `None` when out of bounds.
    #[must_use]
    pub fn get(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.shape.len() || index.iter().zip(&self.shape).any(|(i, d)| i >= d) {
            return None;
        }
        self.values
            .get(ravel_index(index, &self.strides()))
            .copied()
    }

    /// Relabels the dtype without touching values.
    #[must_use]
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Converts to `dtype`, rounding every value to what it can store.
    #[must_use]
    pub fn cast(&self, dtype: DType) -> Self {
        Self {
            shape: self.shape.clone(),
            values: self.values.iter().map(|&v| dtype.store(v)).collect(),
            dtype,
        }
    }

    #[must_use]
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            shape: self.shape.clone(),
            values: self.values.iter().map(|&v| f(v)).collect(),
            dtype: self.dtype,
        }
    }

    #[must_use]
    pub fn elementwise_unary(&self, op: UnaryOp) -> Self {
        let dtype = if matches!(op, UnaryOp::LogicalNot) {
            DType::Bool
        } else {
            self.dtype
        };
        Self {
            shape: self.shape.clone(),
            values: self.values.iter().map(|&v| op.apply(v)).collect(),
            dtype,
        }
    }

    pub fn elementwise_binary(&self, rhs: &Self, op: BinaryOp) -> Result<Self, TensorError> {
        let out_shape = broadcast_shape(&self.shape, &rhs.shape)?;
        let out_dtype = if op.is_predicate() {
            DType::Bool
        } else {
            promote(self.dtype, rhs.dtype)
        };

        if self.shape == rhs.shape {
            let values = self
                .values
                .iter()
                .zip(&rhs.values)
                .map(|(&l, &r)| op.apply(l, r))
                .collect();
            return Ok(Self {
                shape: out_shape,
                values,
                dtype: out_dtype,
            });
        }

        let lhs_index = broadcast_source_indices(&self.shape, &out_shape)?;
        let rhs_index = broadcast_source_indices(&rhs.shape, &out_shape)?;
        let values = lhs_index
            .iter()
            .zip(&rhs_index)
            .map(|(&l, &r)| op.apply(self.values[l], rhs.values[r]))
            .collect();
        Ok(Self {
            shape: out_shape,
            values,
            dtype: out_dtype,
        })
    }

    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Self, TensorError> {
        let merged = broadcast_shape(&self.shape, shape)?;
        if merged != shape {
            return Err(ShapeError::NotBroadcastable {
                left: self.shape.clone(),
                right: shape.to_vec(),
            }
            .into());
        }
        let index = broadcast_source_indices(&self.shape, shape)?;
        Ok(Self {
            shape: shape.to_vec(),
            values: index.into_iter().map(|i| self.values[i]).collect(),
            dtype: self.dtype,
        })
    }

    pub fn reduce(
        &self,
        op: ReduceOp,
        axis: Option<isize>,
        keepdims: bool,
    ) -> Result<Self, TensorError> {
        let Some(axis) = axis else {
            let mut acc = self
                .values
                .iter()
                .fold(op.identity(), |acc, &v| op.fold(acc, v));
            if op == ReduceOp::Mean {
                acc /= self.values.len() as f64;
            }
            let shape = if keepdims {
                vec![1; self.shape.len()]
            } else {
                Vec::new()
            };
            return Ok(Self {
                shape,
                values: vec![acc],
                dtype: self.dtype,
            });
        };

        let axis = normalize_axis(axis, self.shape.len())?;
        let (outer, len, inner) = axis_extents(&self.shape, axis);
        let mut out_values = Vec::with_capacity(outer * inner);
        for o in 0..outer {
            let base = o * len * inner;
            for i in 0..inner {
                let mut acc = op.identity();
                for k in 0..len {
                    acc = op.fold(acc, self.values[base + k * inner + i]);
                }
                if op == ReduceOp::Mean {
                    acc /= len as f64;
                }
                out_values.push(acc);
            }
        }

        let shape = self
            .shape
            .iter()
            .enumerate()
            .filter_map(|(idx, &dim)| {
                if idx == axis {
                    keepdims.then_some(1)
                } else {
                    Some(dim)
                }
            })
            .collect();
        Ok(Self {
            shape,
            values: out_values,
            dtype: self.dtype,
        })
    }

    pub fn reshape(&self, shape: &[isize]) -> Result<Self, TensorError> {
        let shape = resolve_reshape_target(shape, self.values.len())?;
        Ok(Self {
            shape,
            values: self.values.clone(),
            dtype: self.dtype,
        })
    }

    pub fn reshape_exact(&self, shape: &[usize]) -> Result<Self, TensorError> {
        Self::new(shape.to_vec(), self.values.clone(), self.dtype)
    }

    pub fn permute(&self, perm: &[usize]) -> Result<Self, TensorError> {
        let out_shape = permute_shape(&self.shape, perm)?;
        let src_strides = self.strides();
        let mut values = Vec::with_capacity(self.values.len());
        for flat in 0..self.values.len() {
            let out_index = unravel_index(flat, &out_shape);
            let src: usize = out_index
                .iter()
                .zip(perm)
                .map(|(&i, &axis)| i * src_strides[axis])
                .sum();
            values.push(self.values[src]);
        }
        Ok(Self {
            shape: out_shape,
            values,
            dtype: self.dtype,
        })
    }

    pub fn transpose(&self, a: isize, b: isize) -> Result<Self, TensorError> {
        let ndim = self.shape.len();
        let a = normalize_axis(a, ndim)?;
        let b = normalize_axis(b, ndim)?;
        let mut perm: Vec<usize> = (0..ndim).collect();
        perm.swap(a, b);
        self.permute(&perm)
    }

    /// Joins tensors along an existing axis.
    pub fn concat(tensors: &[&Self], axis: isize) -> Result<Self, TensorError> {
        let first = tensors
            .first()
            .ok_or(TensorError::EmptyInput("concat input list"))?;
        let axis = normalize_axis(axis, first.shape.len())?;
        let mut out_shape = first.shape.clone();
        out_shape[axis] = 0;
        for t in tensors {
            let compatible = t.shape.len() == first.shape.len()
                && t.shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(idx, (a, b))| idx == axis || a == b);
            if !compatible {
                return Err(TensorError::ConcatMismatch {
                    axis,
                    lhs: first.shape.clone(),
                    rhs: t.shape.clone(),
                });
            }
            out_shape[axis] += t.shape[axis];
        }

        let (outer, _, inner) = axis_extents(&first.shape, axis);
        let dtype = tensors
            .iter()
            .skip(1)
            .fold(first.dtype, |acc, t| promote(acc, t.dtype));
        let mut values = Vec::with_capacity(element_count(&out_shape)?);
        for o in 0..outer {
            for t in tensors {
                let chunk = t.shape[axis] * inner;
                values.extend_from_slice(&t.values[o * chunk..(o + 1) * chunk]);
            }
        }
        Ok(Self {
            shape: out_shape,
            values,
            dtype,
        })
    }

    /// Joins equally shaped tensors along a new axis.
    pub fn stack(tensors: &[&Self], axis: isize) -> Result<Self, TensorError> {
        let first = tensors
            .first()
            .ok_or(TensorError::EmptyInput("stack input list"))?;
        let axis = normalize_insert_axis(axis, first.shape.len())?;
        let mut expanded = Vec::with_capacity(tensors.len());
        for t in tensors {
            if t.shape != first.shape {
                return Err(TensorError::ConcatMismatch {
                    axis,
                    lhs: first.shape.clone(),
                    rhs: t.shape.clone(),
                });
            }
            let mut shape = t.shape.clone();
            shape.insert(axis, 1);
            expanded.push(Self {
                shape,
                values: t.values.clone(),
                dtype: t.dtype,
            });
        }
        let refs: Vec<&Self> = expanded.iter().collect();
        Self::concat(&refs, axis as isize)
    }

    /// Contiguous sub-range `[start, start + len)` along `axis`.
    pub fn narrow(&self, axis: isize, start: usize, len: usize) -> Result<Self, TensorError> {
        let axis = normalize_axis(axis, self.shape.len())?;
        let (outer, axis_len, inner) = axis_extents(&self.shape, axis);
        if start + len > axis_len {
            return Err(TensorError::IndexOutOfRange {
                axis,
                index: (start + len) as i64 - 1,
                len: axis_len,
            });
        }
        let mut values = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = o * axis_len * inner + start * inner;
            values.extend_from_slice(&self.values[base..base + len * inner]);
        }
        let mut shape = self.shape.clone();
        shape[axis] = len;
        Ok(Self {
            shape,
            values,
            dtype: self.dtype,
        })
    }

    pub fn index_select(&self, axis: isize, indices: &[i64]) -> Result<Self, TensorError> {
        let axis = normalize_axis(axis, self.shape.len())?;
        let (outer, axis_len, inner) = axis_extents(&self.shape, axis);
        let resolved = indices
            .iter()
            .map(|&index| {
                usize::try_from(index)
                    .ok()
                    .filter(|&i| i < axis_len)
                    .ok_or(TensorError::IndexOutOfRange {
                        axis,
                        index,
                        len: axis_len,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut values = Vec::with_capacity(outer * resolved.len() * inner);
        for o in 0..outer {
            for &i in &resolved {
                let base = (o * axis_len + i) * inner;
                values.extend_from_slice(&self.values[base..base + inner]);
            }
        }
        let mut shape = self.shape.clone();
        shape[axis] = resolved.len();
        Ok(Self {
            shape,
            values,
            dtype: self.dtype,
        })
    }

    pub fn split(&self, axis: isize, sizes: &[usize]) -> Result<Vec<Self>, TensorError> {
        let resolved = normalize_axis(axis, self.shape.len())?;
        let requested: usize = sizes.iter().sum();
        if requested != self.shape[resolved] {
            return Err(TensorError::SplitMismatch {
                axis_len: self.shape[resolved],
                requested,
            });
        }
        let mut start = 0;
        let mut parts = Vec::with_capacity(sizes.len());
        for &size in sizes {
            parts.push(self.narrow(resolved as isize, start, size)?);
            start += size;
        }
        Ok(parts)
    }

    /// Repeats the tensor `multiples[i]` times along each dimension.
    pub fn tile(&self, multiples: &[usize]) -> Result<Self, TensorError> {
        if multiples.len() != self.shape.len() {
            return Err(ShapeError::RankMismatch {
                expected: self.shape.len(),
                actual: multiples.len(),
            }
            .into());
        }
        let out_shape: Vec<usize> = self
            .shape
            .iter()
            .zip(multiples)
            .map(|(&d, &m)| d * m)
            .collect();
        let count = element_count(&out_shape)?;
        let src_strides = self.strides();
        let mut values = Vec::with_capacity(count);
        for flat in 0..count {
            let out_index = unravel_index(flat, &out_shape);
            let src: usize = out_index
                .iter()
                .zip(&self.shape)
                .zip(&src_strides)
                .map(|((&i, &d), &s)| (i % d) * s)
                .sum();
            values.push(self.values[src]);
        }
        Ok(Self {
            shape: out_shape,
            values,
            dtype: self.dtype,
        })
    }

    pub fn cumsum(&self, axis: isize, exclusive: bool, reverse: bool) -> Result<Self, TensorError> {
        let axis = normalize_axis(axis, self.shape.len())?;
        let (outer, len, inner) = axis_extents(&self.shape, axis);
        let mut values = vec![0.0; self.values.len()];
        for o in 0..outer {
            for i in 0..inner {
                let mut acc = 0.0;
                for step in 0..len {
                    let k = if reverse { len - 1 - step } else { step };
                    let at = (o * len + k) * inner + i;
                    if exclusive {
                        values[at] = acc;
                        acc += self.values[at];
                    } else {
                        acc += self.values[at];
                        values[at] = acc;
                    }
                }
            }
        }
        Ok(Self {
            shape: self.shape.clone(),
            values,
            dtype: self.dtype,
        })
    }

    pub fn softmax(&self, axis: isize) -> Result<Self, TensorError> {
        self.normalize_along(axis, false)
    }

    pub fn log_softmax(&self, axis: isize) -> Result<Self, TensorError> {
        self.normalize_along(axis, true)
    }

    fn normalize_along(&self, axis: isize, log: bool) -> Result<Self, TensorError> {
        let axis = normalize_axis(axis, self.shape.len())?;
        let (outer, len, inner) = axis_extents(&self.shape, axis);
        let mut values = vec![0.0; self.values.len()];
        for o in 0..outer {
            for i in 0..inner {
                let at = |k: usize| (o * len + k) * inner + i;
                let max = (0..len)
                    .map(|k| self.values[at(k)])
                    .fold(f64::NEG_INFINITY, f64::max);
                let denom: f64 = (0..len).map(|k| (self.values[at(k)] - max).exp()).sum();
                for k in 0..len {
                    let shifted = self.values[at(k)] - max;
                    values[at(k)] = if log {
                        shifted - denom.ln()
                    } else {
                        shifted.exp() / denom
                    };
                }
            }
        }
        Ok(Self {
            shape: self.shape.clone(),
            values,
            dtype: self.dtype,
        })
    }
}

/// Flat source index for every output element when `src_shape` is
/// broadcast against `out_shape`. Walks the output as an odometer and
/// adjusts the source position incrementally.
pub fn broadcast_source_indices(
    src_shape: &[usize],
    out_shape: &[usize],
) -> Result<Vec<usize>, TensorError> {
    let out_count = element_count(out_shape)?;
    if src_shape.len() > out_shape.len() {
        return Err(ShapeError::RankMismatch {
            expected: out_shape.len(),
            actual: src_shape.len(),
        }
        .into());
    }
    let src_strides = contiguous_strides(src_shape);
    let offset = out_shape.len() - src_shape.len();
    let mut steps = vec![0usize; out_shape.len()];
    for (axis, (&dim, &stride)) in src_shape.iter().zip(&src_strides).enumerate() {
        steps[axis + offset] = if dim == 1 { 0 } else { stride };
    }

    let mut out_multi = vec![0usize; out_shape.len()];
    let mut src_flat = 0usize;
    let mut index = Vec::with_capacity(out_count);
    for flat in 0..out_count {
        index.push(src_flat);
        if flat + 1 == out_count {
            break;
        }
        for axis in (0..out_shape.len()).rev() {
            out_multi[axis] += 1;
            src_flat += steps[axis];
            if out_multi[axis] < out_shape[axis] {
                break;
            }
            out_multi[axis] = 0;
            src_flat -= steps[axis] * out_shape[axis];
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::{BinaryOp, ReduceOp, Tensor, TensorError, UnaryOp};
    use opk_dtype::DType;

    fn t(shape: &[usize], values: &[f64]) -> Tensor {
        Tensor::new(shape.to_vec(), values.to_vec(), DType::F32).expect("tensor")
    }

    #[test]
    fn new_rejects_wrong_length() {
        let err = Tensor::new(vec![2, 2], vec![1.0], DType::F32).expect_err("short");
        assert!(matches!(err, TensorError::InvalidInputLength { expected: 4, actual: 1 }));
    }

    #[test]
    fn row_vector_broadcasts_across_batch() {
        let batch = t(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let bias = t(&[2], &[0.5, -1.0]);
        let out = batch.elementwise_binary(&bias, BinaryOp::Add).expect("add");
        assert_eq!(out.shape(), &[3, 2]);
        assert_eq!(out.values(), &[1.5, 1.0, 3.5, 3.0, 5.5, 5.0]);
    }

    #[test]
    fn column_broadcast_uses_outer_axis() {
        let lhs = t(&[2, 1], &[1.0, 2.0]);
        let rhs = t(&[1, 3], &[10.0, 20.0, 30.0]);
        let out = lhs.elementwise_binary(&rhs, BinaryOp::Mul).expect("mul");
        assert_eq!(out.values(), &[10.0, 20.0, 30.0, 20.0, 40.0, 60.0]);
    }

    #[test]
    fn predicates_produce_bool() {
        let lhs = t(&[3], &[1.0, 2.0, 3.0]);
        let rhs = t(&[3], &[2.0, 2.0, 2.0]);
        let out = lhs.elementwise_binary(&rhs, BinaryOp::Less).expect("less");
        assert_eq!(out.dtype(), DType::Bool);
        assert_eq!(out.values(), &[1.0, 0.0, 0.0]);
        let not = out.elementwise_unary(UnaryOp::LogicalNot);
        assert_eq!(not.values(), &[0.0, 1.0, 1.0]);
    }

    #[test]
    fn reduce_over_axis_and_all() {
        let x = t(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let all = x.reduce(ReduceOp::Sum, None, false).expect("sum");
        assert_eq!(all.values(), &[10.0]);
        let rows = x.reduce(ReduceOp::Max, Some(1), false).expect("max");
        assert_eq!(rows.shape(), &[2]);
        assert_eq!(rows.values(), &[2.0, 4.0]);
        let cols = x.reduce(ReduceOp::Mean, Some(0), true).expect("mean");
        assert_eq!(cols.shape(), &[1, 2]);
        assert_eq!(cols.values(), &[2.0, 3.0]);
    }

    #[test]
    fn concat_joins_along_axis() {
        let a = t(&[2, 3], &[0.0; 6]);
        let b = t(&[2, 4], &[1.0; 8]);
        let out = Tensor::concat(&[&a, &b], -1).expect("concat");
        assert_eq!(out.shape(), &[2, 7]);
        assert_eq!(&out.values()[..7], &[0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
        let err = Tensor::concat(&[&a, &b], 0).expect_err("mismatch");
        assert!(matches!(err, TensorError::ConcatMismatch { .. }));
    }

    #[test]
    fn stack_inserts_leading_axis() {
        let a = t(&[2], &[1.0, 2.0]);
        let b = t(&[2], &[3.0, 4.0]);
        let out = Tensor::stack(&[&a, &b], 0).expect("stack");
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.values(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn permute_and_transpose() {
        let x = t(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = x.transpose(0, 1).expect("transpose");
        assert_eq!(out.shape(), &[3, 2]);
        assert_eq!(out.values(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn narrow_and_index_select() {
        let x = t(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mid = x.narrow(0, 1, 2).expect("narrow");
        assert_eq!(mid.values(), &[3.0, 4.0, 5.0, 6.0]);
        let picked = x.index_select(0, &[2, 0]).expect("select");
        assert_eq!(picked.values(), &[5.0, 6.0, 1.0, 2.0]);
        let err = x.index_select(0, &[3]).expect_err("oob");
        assert!(err.is_index_error());
    }

    #[test]
    fn tile_repeats_each_dimension() {
        let x = t(&[3], &[1.0, 2.0, 3.0]);
        let out = x.tile(&[2]).expect("tile");
        assert_eq!(out.values(), &[1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
        let m = t(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(m.tile(&[2, 3]).expect("tile").shape(), &[4, 6]);
        assert!(m.tile(&[2]).is_err());
    }

    #[test]
    fn cumsum_variants() {
        let x = t(&[3], &[1.0, 2.0, 3.0]);
        assert_eq!(x.cumsum(0, false, false).expect("c").values(), &[1.0, 3.0, 6.0]);
        assert_eq!(x.cumsum(0, true, false).expect("c").values(), &[0.0, 1.0, 3.0]);
        assert_eq!(x.cumsum(0, false, true).expect("c").values(), &[6.0, 5.0, 3.0]);
        let m = t(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(m.cumsum(1, false, false).expect("c").values(), &[1.0, 3.0, 3.0, 7.0]);
        assert_eq!(m.cumsum(0, false, false).expect("c").values(), &[1.0, 2.0, 4.0, 6.0]);
        assert!(m.cumsum(2, false, false).expect_err("axis").is_index_error());
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = t(&[2, 3], &[1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        let s = x.softmax(-1).expect("softmax");
        let first: f64 = s.values()[..3].iter().sum();
        assert!((first - 1.0).abs() < 1e-12);
        assert!((s.values()[3] - 1.0 / 3.0).abs() < 1e-12);
        let ls = x.log_softmax(-1).expect("log_softmax");
        assert!((ls.values()[3].exp() - s.values()[3]).abs() < 1e-12);
    }

    #[test]
    fn cast_rounds_to_target_storage() {
        let x = t(&[2], &[0.1, 300.0]);
        let half = x.cast(DType::F16);
        assert_eq!(half.dtype(), DType::F16);
        assert_eq!(half.values()[0], 0.099_975_585_937_5);
        let int8 = x.cast(DType::I8);
        assert_eq!(int8.values(), &[0.0, 127.0]);
    }

    proptest::proptest! {
        #[test]
        fn double_transpose_is_identity(rows in 1usize..5, cols in 1usize..5) {
            let values: Vec<f64> = (0..rows * cols).map(|v| v as f64).collect();
            let x = Tensor::new(vec![rows, cols], values, DType::F64).expect("matrix");
            let back = x.transpose(0, 1).expect("t").transpose(-1, -2).expect("tt");
            proptest::prop_assert_eq!(back, x);
        }

        #[test]
        fn broadcast_rows_sum_to_scaled_row(reps in 1usize..6, width in 1usize..6) {
            let row: Vec<f64> = (0..width).map(|v| v as f64 - 2.0).collect();
            let x = Tensor::new(vec![1, width], row.clone(), DType::F64).expect("row");
            let tiled = x.broadcast_to(&[reps, width]).expect("broadcast");
            let summed = tiled.reduce(ReduceOp::Sum, Some(0), false).expect("sum");
            let expected: Vec<f64> = row.iter().map(|v| v * reps as f64).collect();
            proptest::prop_assert_eq!(summed.values(), expected.as_slice());
        }
    }
}
