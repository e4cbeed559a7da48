use opk_dtype::DType;
use opk_ndarray::normalize_axis;
use opk_tensor::{BinaryOp, Tensor};

use super::{input, to_usize, usize_list};
use crate::error::GoldenError;
use crate::param::OpParam;

pub const DEFAULT_EPSILON: f64 = 1e-5;

pub const LAYER_NORM_TYPES: [(&str, i64); 5] = [
    ("LAYER_NORM_UNDEFINED", 0),
    ("LAYER_NORM_NORM", 1),
    ("LAYER_NORM_PRENORM", 2),
    ("LAYER_NORM_POSTNORM", 3),
    ("LAYER_NORM_MAX", 4),
];

pub const RMS_NORM_TYPES: [(&str, i64); 5] = [
    ("RMS_NORM_UNDEFINED", 0),
    ("RMS_NORM_NORM", 1),
    ("RMS_NORM_PRENORM", 2),
    ("RMS_NORM_POSTNORM", 3),
    ("RMS_NORM_MAX", 4),
];

pub const QUANT_TYPES: [(&str, i64); 6] = [
    ("QUANT_UNDEFINED", 0),
    ("QUANT_INT4", 1),
    ("QUANT_INT8", 2),
    ("QUANT_INT16", 3),
    ("QUANT_FLOAT8", 4),
    ("QUANT_FLOAT16", 5),
];

/// Shared by layer and RMS norm: which sub-parameter block applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormLayout {
    Norm,
    PreNorm,
    PostNorm,
}

impl NormLayout {
    pub fn from_param(param: &OpParam, names: &[(&str, i64)]) -> Result<Self, GoldenError> {
        match param.code("layerType", names)? {
            1 => Ok(Self::Norm),
            2 => Ok(Self::PreNorm),
            3 => Ok(Self::PostNorm),
            other => Err(GoldenError::unsupported("layerType", other)),
        }
    }

    #[must_use]
    pub const fn section(self) -> &'static str {
        match self {
            Self::Norm => "normParam",
            Self::PreNorm => "preNormParam",
            Self::PostNorm => "postNormParam",
        }
    }
}

/// Splits `x` into rows of `width` trailing elements, checking that the
/// per-channel parameter `what` matches.
fn rows_of(x: &Tensor, param_len: usize, what: &str) -> Result<usize, GoldenError> {
    if param_len == 0 || x.numel() % param_len != 0 {
        return Err(GoldenError::domain(format!(
            "{what} with {param_len} elements does not tile input {:?}",
            x.shape()
        )));
    }
    Ok(param_len)
}

fn add_same(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, GoldenError> {
    if lhs.shape() != rhs.shape() {
        return Err(GoldenError::domain(format!(
            "residual shape {:?} does not match input {:?}",
            rhs.shape(),
            lhs.shape()
        )));
    }
    let dtype = lhs.dtype();
    Ok(lhs.elementwise_binary(rhs, BinaryOp::Add)?.cast(dtype))
}

fn layer_norm_rows(
    x: &Tensor,
    gamma: &Tensor,
    beta: &Tensor,
    begin_axis: Option<usize>,
    eps: f64,
) -> Result<Tensor, GoldenError> {
    let width = match begin_axis {
        Some(axis) => x.shape()[axis..].iter().product(),
        None => gamma.numel(),
    };
    let width = rows_of(x, width, "layer norm width")?;
    if gamma.numel() != width || beta.numel() != width {
        return Err(GoldenError::domain(format!(
            "gamma ({}) and beta ({}) must both hold {width} elements",
            gamma.numel(),
            beta.numel()
        )));
    }
    let mut values = Vec::with_capacity(x.numel());
    for row in x.values().chunks(width) {
        let mean = row.iter().sum::<f64>() / width as f64;
        let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / width as f64;
        let inv = 1.0 / (var + eps).sqrt();
        values.extend(
            row.iter()
                .zip(gamma.values().iter().zip(beta.values()))
                .map(|(v, (g, b))| (v - mean) * inv * g + b),
        );
    }
    Ok(Tensor::new(x.shape().to_vec(), values, x.dtype())?.cast(x.dtype()))
}

/// Layer normalization over the trailing axes starting at `beginNormAxis`
/// (default: the trailing `gamma` extent).
///
/// Inputs are `[x, gamma, beta]` for plain norm and `[x, residual, gamma,
/// beta]` for the pre/post variants.
pub fn layer_norm(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let layout = NormLayout::from_param(param, &LAYER_NORM_TYPES)?;
    let section = param.nested(layout.section());
    let eps = section.f64_or("epsilon", DEFAULT_EPSILON)?;
    let x = input(inputs, 0)?;
    let begin_axis = if section.contains("beginNormAxis") {
        Some(normalize_axis(section.i64("beginNormAxis")? as isize, x.ndim())?)
    } else {
        None
    };
    match layout {
        NormLayout::Norm => Ok(vec![layer_norm_rows(
            x,
            input(inputs, 1)?,
            input(inputs, 2)?,
            begin_axis,
            eps,
        )?]),
        NormLayout::PreNorm => {
            let sum = add_same(x, input(inputs, 1)?)?;
            let y = layer_norm_rows(&sum, input(inputs, 2)?, input(inputs, 3)?, begin_axis, eps)?;
            Ok(vec![y, sum])
        }
        NormLayout::PostNorm => {
            let zoom = section.f64_or("zoomScaleValue", 1.0)?;
            let residual = input(inputs, 1)?.map(|v| v * zoom);
            let sum = add_same(x, &residual)?;
            Ok(vec![layer_norm_rows(
                &sum,
                input(inputs, 2)?,
                input(inputs, 3)?,
                begin_axis,
                eps,
            )?])
        }
    }
}

fn rms_rows(x: &Tensor, gamma: &Tensor, eps: f64) -> Result<Tensor, GoldenError> {
    let width = rows_of(x, gamma.numel(), "gamma")?;
    let mut values = Vec::with_capacity(x.numel());
    for row in x.values().chunks(width) {
        let mean_sq = row.iter().map(|v| v * v).sum::<f64>() / width as f64;
        let inv = 1.0 / (mean_sq + eps).sqrt();
        values.extend(row.iter().zip(gamma.values()).map(|(v, g)| v * inv * g));
    }
    Ok(Tensor::new(x.shape().to_vec(), values, x.dtype())?.cast(x.dtype()))
}

/// `(y + beta) / scale + offset`, rounded and saturated to int8.
fn quantize_int8(
    y: &Tensor,
    beta: &Tensor,
    scale: &Tensor,
    offset: &Tensor,
) -> Result<Tensor, GoldenError> {
    let shifted = y
        .clone()
        .with_dtype(DType::F32)
        .elementwise_binary(beta, BinaryOp::Add)?
        .elementwise_binary(scale, BinaryOp::Div)?
        .elementwise_binary(offset, BinaryOp::Add)?;
    Ok(shifted.map(|v| DType::I8.quantize(v)).with_dtype(DType::I8))
}

/// RMS normalization `x / sqrt(mean(x^2) + eps) * gamma`.
///
/// Inputs: `[x, gamma]` (norm) or `[x, residual, gamma]` (pre/post norm),
/// followed by `[beta, scale, offset]` when the section's `quantType` is
/// QUANT_INT8.
pub fn rms_norm(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let layout = NormLayout::from_param(param, &RMS_NORM_TYPES)?;
    let section = param.nested(layout.section());
    let eps = section.f64_or("epsilon", DEFAULT_EPSILON)?;
    let quant = section.code_or("quantType", &QUANT_TYPES, 0)?;
    let x = input(inputs, 0)?;

    let (normed_input, gamma_at, residual_sum) = match layout {
        NormLayout::Norm => (x.clone(), 1, None),
        NormLayout::PreNorm | NormLayout::PostNorm => {
            let sum = add_same(x, input(inputs, 1)?)?;
            (sum.clone(), 2, Some(sum))
        }
    };
    let y = rms_rows(&normed_input, input(inputs, gamma_at)?, eps)?;
    let y = match quant {
        0 => y,
        2 => quantize_int8(
            &y,
            input(inputs, gamma_at + 1)?,
            input(inputs, gamma_at + 2)?,
            input(inputs, gamma_at + 3)?,
        )?,
        5 => y.cast(DType::F16),
        other => return Err(GoldenError::unsupported("quantType", other)),
    };
    match (layout, residual_sum) {
        (NormLayout::PreNorm, Some(sum)) => Ok(vec![y, sum]),
        _ => Ok(vec![y]),
    }
}

/// Row lengths of the packed attention-score buffer: each sequence of
/// length `s` contributes `head_num * s` rows of `s` elements.
fn packed_rows(seq_lens: &[usize], head_num: usize) -> Vec<usize> {
    seq_lens
        .iter()
        .flat_map(|&s| std::iter::repeat_n(s, head_num * s))
        .collect()
}

fn check_packed(rows: &[usize], numel: usize) -> Result<(), GoldenError> {
    let total: usize = rows.iter().sum();
    if total != numel {
        return Err(GoldenError::domain(format!(
            "size of packed input ({numel}) differs from qSeqLen/headNum layout ({total})"
        )));
    }
    Ok(())
}

/// Row-wise softmax over `headNum x s x s` blocks packed back to back.
pub fn fast_softmax(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let x = input(inputs, 0)?;
    let seq_lens = usize_list(&param.i64_list("qSeqLen")?, "qSeqLen")?;
    let head_num = to_usize(param.i64("headNum")?, "headNum")?;
    let rows = packed_rows(&seq_lens, head_num);
    check_packed(&rows, x.numel())?;

    let mut values = Vec::with_capacity(x.numel());
    let mut at = 0;
    for len in rows {
        let row = &x.values()[at..at + len];
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let denom: f64 = row.iter().map(|v| (v - max).exp()).sum();
        values.extend(row.iter().map(|v| (v - max).exp() / denom));
        at += len;
    }
    Ok(vec![
        Tensor::new(x.shape().to_vec(), values, x.dtype())?.cast(x.dtype()),
    ])
}

/// Softmax backward `dx = y * (dy - sum_row(dy * y))` over the packed rows
/// when `qSeqLen` is given, else over the last axis.
pub fn fast_softmax_grad(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let y = input(inputs, 0)?;
    let dy = input(inputs, 1)?;
    if y.shape() != dy.shape() {
        return Err(GoldenError::domain(format!(
            "softmax output {:?} and gradient {:?} differ",
            y.shape(),
            dy.shape()
        )));
    }
    let rows = if param.contains("qSeqLen") {
        let seq_lens = usize_list(&param.i64_list("qSeqLen")?, "qSeqLen")?;
        let head_num = to_usize(param.i64_or("headNum", 1)?, "headNum")?;
        let rows = packed_rows(&seq_lens, head_num);
        check_packed(&rows, y.numel())?;
        rows
    } else {
        let width = y.shape().last().copied().unwrap_or(1).max(1);
        vec![width; y.numel() / width]
    };

    let mut values = Vec::with_capacity(y.numel());
    let mut at = 0;
    for len in rows {
        let ys = &y.values()[at..at + len];
        let gs = &dy.values()[at..at + len];
        let dot: f64 = ys.iter().zip(gs).map(|(a, b)| a * b).sum();
        values.extend(ys.iter().zip(gs).map(|(y, g)| y * (g - dot)));
        at += len;
    }
    Ok(vec![
        Tensor::new(y.shape().to_vec(), values, y.dtype())?.cast(y.dtype()),
    ])
}

#[cfg(test)]
mod tests {
    use super::{NormLayout, RMS_NORM_TYPES, fast_softmax, fast_softmax_grad, layer_norm, rms_norm};
    use crate::golden::testing::{assert_close, p, t};
    use opk_dtype::DType;
    use serde_json::json;

    #[test]
    fn layer_norm_plain_and_prenorm() {
        let x = t(&[2, 2], &[1.0, 3.0, 2.0, 4.0]);
        let gamma = t(&[2], &[1.0, 1.0]);
        let beta = t(&[2], &[0.0, 0.5]);
        let out = layer_norm(
            &p(json!({"layerType": 1, "normParam": {"epsilon": 0.0}})),
            &[x.clone(), gamma.clone(), beta.clone()],
        )
        .expect("norm");
        assert_close(out[0].values(), &[-1.0, 1.5, -1.0, 1.5]);

        let pre = layer_norm(
            &p(json!({"layerType": 2, "preNormParam": {"epsilon": 0.0}})),
            &[x.clone(), t(&[2, 2], &[1.0, 1.0, 0.0, 2.0]), gamma, beta],
        )
        .expect("prenorm");
        assert_eq!(pre.len(), 2);
        assert_eq!(pre[1].values(), &[2.0, 4.0, 2.0, 6.0]);
        assert_close(pre[0].values(), &[-1.0, 1.5, -1.0, 1.5]);
    }

    #[test]
    fn layer_norm_rejects_undefined_type() {
        let err = layer_norm(&p(json!({"layerType": 0})), &[]).expect_err("undefined");
        assert_eq!(err.reason_code(), "golden_unsupported_param");
    }

    #[test]
    fn rms_norm_with_int8_quant() {
        let x = t(&[1, 2], &[3.0, 4.0]);
        let gamma = t(&[2], &[1.0, 1.0]);
        let plain = rms_norm(
            &p(json!({"layerType": 1, "normParam": {"epsilon": 0.0}})),
            &[x.clone(), gamma.clone()],
        )
        .expect("plain");
        let rms = (12.5f64).sqrt();
        assert_close(plain[0].values(), &[3.0 / rms, 4.0 / rms]);

        let quant = rms_norm(
            &p(json!({"layerType": "RMS_NORM_NORM", "normParam": {"quantType": 2, "epsilon": 0.0}})),
            &[x, gamma, t(&[2], &[0.0, 0.0]), t(&[1], &[0.01]), t(&[1], &[0.0])],
        )
        .expect("quantized");
        assert_eq!(quant[0].dtype(), DType::I8);
        assert_eq!(quant[0].values(), &[85.0, 113.0]);
    }

    #[test]
    fn rms_prenorm_returns_residual_sum() {
        let out = rms_norm(
            &p(json!({"layerType": 2})),
            &[t(&[1, 2], &[1.0, 1.0]), t(&[1, 2], &[0.0, 0.0]), t(&[2], &[2.0, 2.0])],
        )
        .expect("prenorm");
        assert_eq!(out.len(), 2);
        assert_close(out[0].values(), &[2.0, 2.0]);
        assert_eq!(out[1].values(), &[1.0, 1.0]);
    }

    #[test]
    fn norm_section_follows_layer_type() {
        let layout = NormLayout::from_param(&p(json!({"layerType": 3})), &RMS_NORM_TYPES)
            .expect("postnorm");
        assert_eq!(layout.section(), "postNormParam");
    }

    #[test]
    fn fast_softmax_size_mismatch_is_domain_error() {
        for (seq, heads, x) in [
            (vec![2, 2], 1, t(&[1, 2], &[1.0, 2.0])),
            (vec![3, 3], 1, t(&[1, 3], &[1.0, 2.0, 3.0])),
            (vec![2, 2], 2, t(&[2, 2], &[1.0, 2.0, 3.0, 4.0])),
        ] {
            let err = fast_softmax(&p(json!({"qSeqLen": seq, "headNum": heads})), &[x])
                .expect_err("packed size mismatch");
            assert_eq!(err.kind(), "DomainError");
        }
    }

    #[test]
    fn fast_softmax_rows() {
        let out = fast_softmax(
            &p(json!({"qSeqLen": [1, 2], "headNum": 1})),
            &[t(&[5], &[7.0, 0.0, 0.0, 1.0, 1.0])],
        )
        .expect("1 + 4 elements");
        assert_close(out[0].values(), &[1.0, 0.5, 0.5, 0.5, 0.5]);
    }

    #[test]
    fn softmax_grad_on_last_axis() {
        let y = t(&[1, 2], &[0.5, 0.5]);
        let dy = t(&[1, 2], &[1.0, 0.0]);
        let out = fast_softmax_grad(&p(json!({})), &[y, dy]).expect("grad");
        assert_close(out[0].values(), &[0.25, -0.25]);
    }
}
