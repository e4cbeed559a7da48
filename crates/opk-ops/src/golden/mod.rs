//! Golden reference kernels, one module per operator family.
//!
//! Every kernel is a pure function of the parameters and the ordered input
//! tensors. Precondition violations surface as [`GoldenError`] so callers can
//! report them as "golden computation failed" rather than as mismatches.

pub mod attention;
pub mod cache;
pub mod collective;
pub mod elementwise;
pub mod linear;
pub mod norm;
pub mod sampling;
pub mod sequence;
pub mod shape;
pub mod transdata;

use opk_dtype::DType;
use opk_runtime::HardwareBackend;
use opk_tensor::Tensor;

use crate::error::GoldenError;
use crate::param::OpParam;
use crate::registry::OpKind;

/// Computes the reference outputs of `kind` for one invocation.
pub fn golden_calc(
    kind: OpKind,
    param: &OpParam,
    backend: &dyn HardwareBackend,
    inputs: &[Tensor],
) -> Result<Vec<Tensor>, GoldenError> {
    match kind {
        OpKind::Activation => elementwise::activation(param, inputs),
        OpKind::Elewise => elementwise::elewise(param, inputs),
        OpKind::AllGather => collective::all_gather(inputs),
        OpKind::AllReduce => collective::all_reduce(param, inputs),
        OpKind::Broadcast => collective::broadcast(param, inputs),
        OpKind::AsStrided => shape::as_strided(param, inputs),
        OpKind::Concat => shape::concat(param, inputs),
        OpKind::Cumsum => shape::cumsum(param, inputs),
        OpKind::Fill => shape::fill(param, inputs),
        OpKind::Gather => shape::gather(param, inputs),
        OpKind::IndexAdd => shape::index_add(param, inputs),
        OpKind::Nonzero => shape::nonzero(inputs),
        OpKind::Onehot => shape::onehot(param, inputs),
        OpKind::Reduce => shape::reduce(param, inputs),
        OpKind::Repeat => shape::repeat(param, inputs),
        OpKind::Slice => shape::slice(param, inputs),
        OpKind::Split => shape::split(param, inputs),
        OpKind::FastSoftMax => norm::fast_softmax(param, inputs),
        OpKind::FastSoftMaxGrad => norm::fast_softmax_grad(param, inputs),
        OpKind::LayerNorm => norm::layer_norm(param, inputs),
        OpKind::RmsNorm => norm::rms_norm(param, inputs),
        OpKind::Linear => linear::linear(param, inputs),
        OpKind::MatMul => linear::matmul(param, inputs),
        OpKind::LinearSparse => linear::linear_sparse(param, inputs),
        OpKind::LinearParallel => linear::linear_parallel(param, backend, inputs),
        OpKind::GenAttentionMask => attention::gen_attention_mask(param, inputs),
        OpKind::PagedAttention => attention::paged_attention(param, backend, inputs),
        OpKind::Rope => attention::rope(param, inputs),
        OpKind::RopeGrad => attention::rope_grad(param, inputs),
        OpKind::KvCache => cache::kv_cache(inputs),
        OpKind::ReshapeAndCache => cache::reshape_and_cache(param, backend, inputs),
        OpKind::Gating => sequence::gating(param, inputs),
        OpKind::Pad => sequence::pad(inputs),
        OpKind::Unpad => sequence::unpad(inputs),
        OpKind::Multinomial => sampling::multinomial(param, inputs),
        OpKind::Transdata => transdata::transdata(param, inputs),
    }
}

pub(crate) fn input(inputs: &[Tensor], index: usize) -> Result<&Tensor, GoldenError> {
    inputs.get(index).ok_or_else(|| {
        GoldenError::domain(format!(
            "expected input {index} but only {} were supplied",
            inputs.len()
        ))
    })
}

pub(crate) fn to_usize(value: i64, what: &str) -> Result<usize, GoldenError> {
    usize::try_from(value)
        .map_err(|_| GoldenError::domain(format!("{what} must be non-negative, got {value}")))
}

pub(crate) fn usize_list(values: &[i64], what: &str) -> Result<Vec<usize>, GoldenError> {
    values.iter().map(|&v| to_usize(v, what)).collect()
}

/// Index-valued tensor contents as integers.
pub(crate) fn index_values(tensor: &Tensor) -> Vec<i64> {
    tensor.values().iter().map(|&v| v as i64).collect()
}

/// Precision the accelerator's matrix units write results in.
pub(crate) const fn half_output(dtype: DType) -> DType {
    match dtype {
        DType::BF16 => DType::BF16,
        _ => DType::F16,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use opk_dtype::DType;
    use opk_runtime::{HostBackend, SocVersion};
    use opk_tensor::Tensor;
    use serde_json::Value;

    use crate::param::OpParam;

    pub(crate) fn t(shape: &[usize], values: &[f64]) -> Tensor {
        Tensor::new(shape.to_vec(), values.to_vec(), DType::F32).expect("fixture tensor")
    }

    pub(crate) fn ti(shape: &[usize], values: &[f64]) -> Tensor {
        Tensor::new(shape.to_vec(), values.to_vec(), DType::I64).expect("fixture tensor")
    }

    pub(crate) fn p(value: Value) -> OpParam {
        OpParam::from_value(value)
    }

    pub(crate) fn ramp(shape: &[usize]) -> Tensor {
        let count = shape.iter().product::<usize>();
        t(shape, &(0..count).map(|v| v as f64).collect::<Vec<_>>())
    }

    pub(crate) fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len(), "length differs");
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!((a - e).abs() <= 1e-4, "index {i}: {a} vs {e}");
        }
    }

    pub(crate) fn b910() -> HostBackend {
        HostBackend::new(SocVersion::Ascend910B)
    }

    pub(crate) fn b310() -> HostBackend {
        HostBackend::new(SocVersion::Ascend310P)
    }
}
