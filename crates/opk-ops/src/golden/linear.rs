//! Matrix-unit kernels. Products accumulate in f64 and are written back in
//! the half precision the cube units emit.

use opk_linalg::matmul as product;
use opk_runtime::HardwareBackend;
use opk_tensor::{BinaryOp, Tensor};

use super::{half_output, input, to_usize};
use crate::error::GoldenError;
use crate::param::OpParam;

pub const PARALLEL_TYPES: [(&str, i64); 4] = [
    ("LINEAR_ALL_REDUCE", 0),
    ("LINEAR_REDUCE_SCATTER", 1),
    ("ALL_GATHER_LINEAR", 2),
    ("PURE_LINEAR", 3),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelType {
    AllReduce,
    ReduceScatter,
    AllGatherLinear,
    PureLinear,
}

impl ParallelType {
    /// `hccl` only implements the all-reduce flavour; `lcoc` honours `type`.
    pub fn from_param(param: &OpParam) -> Result<Self, GoldenError> {
        let backend = param.string("backend")?;
        match backend.to_ascii_lowercase().as_str() {
            "hccl" => Ok(Self::AllReduce),
            "lcoc" => match param.code_or("type", &PARALLEL_TYPES, 0)? {
                0 => Ok(Self::AllReduce),
                1 => Ok(Self::ReduceScatter),
                2 => Ok(Self::AllGatherLinear),
                3 => Ok(Self::PureLinear),
                other => Err(GoldenError::unsupported("type", other)),
            },
            _ => Err(GoldenError::unsupported("backend", backend)),
        }
    }
}

fn transposes(param: &OpParam) -> Result<(bool, bool), GoldenError> {
    Ok((
        param.bool_or("transposeA", false)?,
        param.bool_or("transposeB", false)?,
    ))
}

pub fn matmul(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let (ta, tb) = transposes(param)?;
    let a = input(inputs, 0)?;
    let out = product(a, input(inputs, 1)?, ta, tb)?;
    Ok(vec![out.cast(half_output(a.dtype()))])
}

pub fn linear(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let (ta, tb) = transposes(param)?;
    let x = input(inputs, 0)?;
    let bias = if param.bool_or("hasBias", false)? {
        Some(input(inputs, 2)?)
    } else {
        None
    };
    let out = opk_linalg::linear(x, input(inputs, 1)?, bias, ta, tb)?;
    Ok(vec![out.cast(half_output(x.dtype()))])
}

/// Int8 sparse linear over a densified weight: `(x @ w + bias) * deqScale`.
/// The compression index input, when present, is not consulted.
pub fn linear_sparse(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    if inputs.len() < 4 {
        return Err(GoldenError::domain(format!(
            "linear_sparse needs x, weight, bias and deqScale, got {} inputs",
            inputs.len()
        )));
    }
    let (ta, tb) = transposes(param)?;
    let acc = opk_linalg::linear(&inputs[0], &inputs[1], Some(&inputs[2]), ta, tb)?;
    let scaled = acc.elementwise_binary(&inputs[3], BinaryOp::Mul)?;
    Ok(vec![scaled.cast(opk_dtype::DType::F16)])
}

/// Tensor-parallel linear. `inputs` hold every rank's `[x, weight]` (plus a
/// residual when `hasResidual`) in rank order; the result is the output seen
/// by `rank`.
pub fn linear_parallel(
    param: &OpParam,
    backend: &dyn HardwareBackend,
    inputs: &[Tensor],
) -> Result<Vec<Tensor>, GoldenError> {
    if !backend.is_910b() {
        return Err(GoldenError::domain(format!(
            "linear_parallel is not available on {}",
            backend.soc_version().as_str()
        )));
    }
    let kind = ParallelType::from_param(param)?;
    let rank = to_usize(param.i64("rank")?, "rank")?;
    let rank_size = to_usize(param.i64("rankSize")?, "rankSize")?;
    if rank >= rank_size {
        return Err(GoldenError::index(format!(
            "rank {rank} outside rankSize {rank_size}"
        )));
    }
    let has_residual = param.bool_or("hasResidual", false)?;
    let trans_weight = param.bool_or("transWeight", true)?;
    let group = if has_residual { 3 } else { 2 };
    if inputs.len() != rank_size * group {
        return Err(GoldenError::domain(format!(
            "linear_parallel expects {} inputs for {rank_size} ranks, got {}",
            rank_size * group,
            inputs.len()
        )));
    }
    let x = |r: usize| &inputs[r * group];
    let w = |r: usize| &inputs[r * group + 1];
    let residual = has_residual.then(|| &inputs[rank * group + 2]);
    let dtype = half_output(x(rank).dtype());

    let out = match kind {
        ParallelType::AllReduce => {
            let mut acc = product(x(0), w(0), false, trans_weight)?;
            for r in 1..rank_size {
                acc = acc.elementwise_binary(&product(x(r), w(r), false, trans_weight)?, BinaryOp::Add)?;
            }
            add_residual(acc, residual)?
        }
        ParallelType::ReduceScatter => {
            let mut acc = product(x(0), w(0), false, trans_weight)?;
            for r in 1..rank_size {
                acc = acc.elementwise_binary(&product(x(r), w(r), false, trans_weight)?, BinaryOp::Add)?;
            }
            let n = acc.shape().last().copied().unwrap_or(1);
            let rows = acc.numel() / n.max(1);
            if rows % rank_size != 0 {
                return Err(GoldenError::domain(format!(
                    "{rows} rows cannot be scattered over {rank_size} ranks"
                )));
            }
            let chunk = rows / rank_size;
            acc.reshape_exact(&[rows, n])?.narrow(0, rank * chunk, chunk)?
        }
        ParallelType::AllGatherLinear => {
            let parts: Vec<&Tensor> = (0..rank_size).map(x).collect();
            let gathered = Tensor::concat(&parts, 0)?;
            product(&gathered, w(rank), false, trans_weight)?
        }
        ParallelType::PureLinear => {
            add_residual(product(x(rank), w(rank), false, trans_weight)?, residual)?
        }
    };
    Ok(vec![out.cast(dtype)])
}

fn add_residual(acc: Tensor, residual: Option<&Tensor>) -> Result<Tensor, GoldenError> {
    match residual {
        Some(res) => Ok(acc.elementwise_binary(res, BinaryOp::Add)?),
        None => Ok(acc),
    }
}

#[cfg(test)]
mod tests {
    use super::{ParallelType, linear, linear_parallel, linear_sparse, matmul};
    use crate::golden::testing::{b310, b910, p, ramp, t};
    use opk_dtype::DType;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn matmul_honours_transpose_flags() {
        let a = t(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let b = t(&[2, 2], &[5.0, 6.0, 7.0, 8.0]);
        let plain = matmul(&p(json!({"transposeA": false, "transposeB": false})), &[a.clone(), b.clone()])
            .expect("square");
        assert_eq!(plain[0].values(), &[19.0, 22.0, 43.0, 50.0]);
        assert_eq!(plain[0].dtype(), DType::F16);

        let tb = matmul(&p(json!({"transposeA": false, "transposeB": true})), &[a, b]).expect("square");
        assert_eq!(tb[0].values(), &[17.0, 23.0, 39.0, 53.0]);
    }

    #[test]
    fn matmul_inner_mismatch_is_a_domain_error() {
        let err = matmul(
            &p(json!({"transposeA": false, "transposeB": false})),
            &[ramp(&[2, 3]), ramp(&[2, 3])],
        )
        .expect_err("k differs");
        assert_eq!(err.kind(), "DomainError");
    }

    #[test]
    fn bf16_inputs_keep_bf16_output() {
        let a = t(&[1, 1], &[2.0]).with_dtype(DType::BF16);
        let out = matmul(&p(json!({"transposeA": false, "transposeB": false})), &[a.clone(), a])
            .expect("scalar product");
        assert_eq!(out[0].dtype(), DType::BF16);
        assert_eq!(out[0].values(), &[4.0]);
    }

    #[test]
    fn linear_adds_bias_only_when_requested() {
        let x = t(&[1, 2], &[1.0, 2.0]);
        let w = t(&[2, 2], &[1.0, 0.0, 0.0, 1.0]);
        let bias = t(&[2], &[10.0, 20.0]);
        let with = linear(
            &p(json!({"transposeA": false, "transposeB": false, "hasBias": true})),
            &[x.clone(), w.clone(), bias],
        )
        .expect("bias supplied");
        assert_eq!(with[0].values(), &[11.0, 22.0]);

        let without = linear(
            &p(json!({"transposeA": false, "transposeB": false, "hasBias": false})),
            &[x.clone(), w.clone()],
        )
        .expect("no bias");
        assert_eq!(without[0].values(), &[1.0, 2.0]);

        let err = linear(
            &p(json!({"transposeA": false, "transposeB": false, "hasBias": true})),
            &[x, w],
        )
        .expect_err("bias missing");
        assert_eq!(err.kind(), "DomainError");
    }

    #[test]
    fn linear_sparse_scales_accumulator() {
        let x = t(&[1, 2], &[1.0, 2.0]).with_dtype(DType::I8);
        let w = t(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).with_dtype(DType::I8);
        let bias = t(&[2], &[1.0, 1.0]).with_dtype(DType::I32);
        let scale = t(&[2], &[0.5, 0.25]);
        let out = linear_sparse(
            &p(json!({"transposeA": false, "transposeB": false})),
            &[x.clone(), w.clone(), bias, scale],
        )
        .expect("four inputs");
        assert_eq!(out[0].values(), &[4.0, 2.75]);
        assert_eq!(out[0].dtype(), DType::F16);

        assert!(linear_sparse(&p(json!({"transposeA": false, "transposeB": false})), &[x, w]).is_err());
    }

    #[test]
    fn parallel_type_follows_backend() {
        assert_eq!(
            ParallelType::from_param(&p(json!({"backend": "hccl", "type": 2}))).expect("hccl"),
            ParallelType::AllReduce
        );
        assert_eq!(
            ParallelType::from_param(&p(json!({"backend": "lcoc", "type": "PURE_LINEAR"}))).expect("lcoc"),
            ParallelType::PureLinear
        );
        let err = ParallelType::from_param(&p(json!({"backend": "mpi"}))).expect_err("unknown backend");
        assert_eq!(err.kind(), "UnsupportedParam");
    }

    fn ranks() -> Vec<opk_tensor::Tensor> {
        // Two ranks, x (2,1) and weight (1,1) stored transposed.
        vec![
            t(&[2, 1], &[1.0, 2.0]),
            t(&[1, 1], &[3.0]),
            t(&[2, 1], &[4.0, 5.0]),
            t(&[1, 1], &[10.0]),
        ]
    }

    #[test]
    fn parallel_all_reduce_sums_rank_products() {
        let param = p(json!({"backend": "hccl", "rank": 0, "rankSize": 2}));
        let out = linear_parallel(&param, &b910(), &ranks()).expect("910b");
        assert_eq!(out[0].values(), &[43.0, 56.0]);
    }

    #[test]
    fn parallel_scatter_and_gather_pick_rank_slices() {
        let scatter = p(json!({"backend": "lcoc", "type": 1, "rank": 1, "rankSize": 2}));
        let out = linear_parallel(&scatter, &b910(), &ranks()).expect("rows divide");
        assert_eq!(out[0].shape(), &[1, 1]);
        assert_eq!(out[0].values(), &[56.0]);

        let gather = p(json!({"backend": "lcoc", "type": 2, "rank": 1, "rankSize": 2}));
        let out = linear_parallel(&gather, &b910(), &ranks()).expect("gather");
        assert_eq!(out[0].values(), &[10.0, 20.0, 40.0, 50.0]);

        let pure = p(json!({"backend": "lcoc", "type": 3, "rank": 0, "rankSize": 2}));
        let out = linear_parallel(&pure, &b910(), &ranks()).expect("pure");
        assert_eq!(out[0].values(), &[3.0, 6.0]);
    }

    #[test]
    fn parallel_rejects_bad_topologies() {
        let param = p(json!({"backend": "hccl", "rank": 0, "rankSize": 2}));
        assert_eq!(
            linear_parallel(&param, &b310(), &ranks()).expect_err("310p").kind(),
            "DomainError"
        );
        let beyond = p(json!({"backend": "hccl", "rank": 2, "rankSize": 2}));
        assert_eq!(
            linear_parallel(&beyond, &b910(), &ranks()).expect_err("rank too big").kind(),
            "IndexError"
        );
        let short = ranks()[..3].to_vec();
        assert_eq!(
            linear_parallel(&param, &b910(), &short).expect_err("missing weight").kind(),
            "DomainError"
        );
    }

    proptest! {
        #[test]
        fn transposed_rhs_matches_materialized_transpose(m in 1usize..4, k in 1usize..4, n in 1usize..4) {
            let a = ramp(&[m, k]);
            let b = ramp(&[k, n]);
            let bt = b.transpose(0, 1).expect("2d");
            let plain = matmul(&p(json!({"transposeA": false, "transposeB": false})), &[a.clone(), b])
                .expect("plain");
            let flagged = matmul(&p(json!({"transposeA": false, "transposeB": true})), &[a, bt])
                .expect("flagged");
            prop_assert_eq!(plain[0].shape(), flagged[0].shape());
            prop_assert_eq!(plain[0].values(), flagged[0].values());
        }
    }
}
