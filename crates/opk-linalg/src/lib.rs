#![forbid(unsafe_code)]

use core::fmt;

use opk_dtype::promote;
use opk_ndarray::broadcast_shape;
use opk_tensor::{Tensor, TensorError};

pub const LINALG_REASON_CODES: [&str; 4] = [
    "linalg_shape_contract_violation",
    "linalg_inner_dimension_mismatch",
    "linalg_batch_mismatch",
    "linalg_tensor_error",
];

#[derive(Debug, Clone, PartialEq)]
pub enum LinAlgError {
    ShapeContractViolation(&'static str),
    InnerDimensionMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    BatchMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    Tensor(TensorError),
}

impl LinAlgError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ShapeContractViolation(_) => "linalg_shape_contract_violation",
            Self::InnerDimensionMismatch { .. } => "linalg_inner_dimension_mismatch",
            Self::BatchMismatch { .. } => "linalg_batch_mismatch",
            Self::Tensor(_) => "linalg_tensor_error",
        }
    }
}

impl fmt::Display for LinAlgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeContractViolation(msg) => write!(f, "{msg}"),
            Self::InnerDimensionMismatch { lhs, rhs } => write!(
                f,
                "size of contracted dimension differs: lhs={lhs:?} rhs={rhs:?}"
            ),
            Self::BatchMismatch { lhs, rhs } => {
                write!(f, "batch dims {lhs:?} and {rhs:?} do not broadcast")
            }
            Self::Tensor(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for LinAlgError {}

impl From<TensorError> for LinAlgError {
    fn from(err: TensorError) -> Self {
        Self::Tensor(err)
    }
}

/// Trailing `(rows, cols)` of a matrix or batch of matrices.
pub fn validate_matrix_shape(shape: &[usize]) -> Result<(usize, usize), LinAlgError> {
    if shape.len() < 2 {
        return Err(LinAlgError::ShapeContractViolation(
            "matmul operands must be at least 2D",
        ));
    }
    Ok((shape[shape.len() - 2], shape[shape.len() - 1]))
}

/// Batched product `op(a) @ op(b)` where `op` optionally swaps the last two
/// axes. Leading batch dimensions broadcast; a 2-D operand is shared across
/// every batch of the other.
pub fn matmul(
    a: &Tensor,
    b: &Tensor,
    transpose_a: bool,
    transpose_b: bool,
) -> Result<Tensor, LinAlgError> {
    let (a_rows, a_cols) = validate_matrix_shape(a.shape())?;
    let (b_rows, b_cols) = validate_matrix_shape(b.shape())?;
    let (m, k) = if transpose_a {
        (a_cols, a_rows)
    } else {
        (a_rows, a_cols)
    };
    let (k2, n) = if transpose_b {
        (b_cols, b_rows)
    } else {
        (b_rows, b_cols)
    };
    if k != k2 {
        return Err(LinAlgError::InnerDimensionMismatch {
            lhs: a.shape().to_vec(),
            rhs: b.shape().to_vec(),
        });
    }

    let a_batch = &a.shape()[..a.ndim() - 2];
    let b_batch = &b.shape()[..b.ndim() - 2];
    let batch = broadcast_shape(a_batch, b_batch).map_err(|_| LinAlgError::BatchMismatch {
        lhs: a_batch.to_vec(),
        rhs: b_batch.to_vec(),
    })?;
    let lanes: usize = batch.iter().product();
    let a_lane = lane_map(a_batch, &batch)?;
    let b_lane = lane_map(b_batch, &batch)?;

    let av = a.values();
    let bv = b.values();
    let mut out = Vec::with_capacity(lanes * m * n);
    for lane in 0..lanes {
        let a_base = a_lane[lane] * a_rows * a_cols;
        let b_base = b_lane[lane] * b_rows * b_cols;
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0;
                for p in 0..k {
                    let lhs = if transpose_a {
                        av[a_base + p * a_cols + i]
                    } else {
                        av[a_base + i * a_cols + p]
                    };
                    let rhs = if transpose_b {
                        bv[b_base + j * b_cols + p]
                    } else {
                        bv[b_base + p * b_cols + j]
                    };
                    acc += lhs * rhs;
                }
                out.push(acc);
            }
        }
    }

    let mut shape = batch;
    shape.push(m);
    shape.push(n);
    Ok(Tensor::new(shape, out, promote(a.dtype(), b.dtype()))?)
}

/// `x @ op(w) + bias`, with the bias broadcast over the trailing axis.
pub fn linear(
    x: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    transpose_a: bool,
    transpose_b: bool,
) -> Result<Tensor, LinAlgError> {
    let product = matmul(x, weight, transpose_a, transpose_b)?;
    match bias {
        Some(bias) => Ok(product.elementwise_binary(bias, opk_tensor::BinaryOp::Add)?),
        None => Ok(product),
    }
}

fn lane_map(src_batch: &[usize], out_batch: &[usize]) -> Result<Vec<usize>, LinAlgError> {
    Ok(opk_tensor::broadcast_source_indices(src_batch, out_batch)?)
}

#[cfg(test)]
mod tests {
    use super::{LinAlgError, linear, matmul, validate_matrix_shape};
    use opk_dtype::DType;
    use opk_tensor::Tensor;

    fn m(shape: &[usize], values: &[f64]) -> Tensor {
        Tensor::new(shape.to_vec(), values.to_vec(), DType::F16).expect("tensor")
    }

    #[test]
    fn plain_product() {
        let a = m(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let b = m(&[2, 2], &[5.0, 6.0, 7.0, 8.0]);
        let out = matmul(&a, &b, false, false).expect("matmul");
        assert_eq!(out.values(), &[19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn transposed_rhs() {
        let a = m(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let b = m(&[2, 2], &[5.0, 6.0, 7.0, 8.0]);
        let out = matmul(&a, &b, false, true).expect("matmul");
        assert_eq!(out.values(), &[17.0, 23.0, 39.0, 53.0]);
    }

    #[test]
    fn transposed_lhs_matches_explicit_transpose() {
        let a = m(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = m(&[3, 1], &[1.0, 1.0, 1.0]);
        let out = matmul(&a, &b, true, false).expect("matmul");
        assert_eq!(out.shape(), &[2, 1]);
        assert_eq!(out.values(), &[9.0, 12.0]);
    }

    #[test]
    fn shared_weight_across_batches() {
        let a = m(&[2, 1, 2], &[1.0, 0.0, 0.0, 1.0]);
        let w = m(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let out = matmul(&a, &w, false, false).expect("matmul");
        assert_eq!(out.shape(), &[2, 1, 2]);
        assert_eq!(out.values(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn inner_mismatch_mentions_size() {
        let a = m(&[2, 3], &[0.0; 6]);
        let b = m(&[2, 2], &[0.0; 4]);
        let err = matmul(&a, &b, false, false).expect_err("mismatch");
        assert!(matches!(err, LinAlgError::InnerDimensionMismatch { .. }));
        assert!(err.to_string().contains("size of"));
    }

    #[test]
    fn linear_adds_bias() {
        let x = m(&[1, 2], &[1.0, 1.0]);
        let w = m(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let bias = m(&[2], &[0.5, -0.5]);
        let out = linear(&x, &w, Some(&bias), false, true).expect("linear");
        assert_eq!(out.values(), &[3.5, 6.5]);
    }

    #[test]
    fn rank_one_rejected() {
        assert!(validate_matrix_shape(&[3]).is_err());
        assert_eq!(validate_matrix_shape(&[4, 2, 3]).expect("shape"), (2, 3));
    }
}
