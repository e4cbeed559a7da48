use opk_dtype::DType;
use opk_ndarray::normalize_axis;
use opk_tensor::{BinaryOp, Tensor, UnaryOp};

use super::input;
use crate::error::GoldenError;
use crate::param::OpParam;

pub const ACTIVATION_TYPES: [(&str, i64); 9] = [
    ("ACTIVATION_UNDEFINED", 0),
    ("ACTIVATION_RELU", 1),
    ("ACTIVATION_GELU", 2),
    ("ACTIVATION_FAST_GELU", 3),
    ("ACTIVATION_SWISH", 4),
    ("ACTIVATION_LOG", 5),
    ("ACTIVATION_SWIGLU_FORWARD", 6),
    ("ACTIVATION_SWIGLU_BACKWARD", 7),
    ("ACTIVATION_MAX", 8),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationType {
    Relu,
    Gelu,
    FastGelu,
    Swish,
    Log,
    SwigluForward,
    SwigluBackward,
}

impl ActivationType {
    pub fn from_param(param: &OpParam) -> Result<Self, GoldenError> {
        match param.code("activationType", &ACTIVATION_TYPES)? {
            1 => Ok(Self::Relu),
            2 => Ok(Self::Gelu),
            3 => Ok(Self::FastGelu),
            4 => Ok(Self::Swish),
            5 => Ok(Self::Log),
            6 => Ok(Self::SwigluForward),
            7 => Ok(Self::SwigluBackward),
            other => Err(GoldenError::unsupported("activationType", other)),
        }
    }
}

pub const ELEWISE_TYPES: [(&str, i64); 21] = [
    ("ELEWISE_UNDEFINED", 0),
    ("ELEWISE_CAST", 1),
    ("ELEWISE_MULS", 2),
    ("ELEWISE_COS", 3),
    ("ELEWISE_SIN", 4),
    ("ELEWISE_NEG", 5),
    ("ELEWISE_QUANT", 6),
    ("ELEWISE_LOGICAL_NOT", 7),
    ("ELEWISE_ADD", 8),
    ("ELEWISE_MUL", 9),
    ("ELEWISE_REALDIV", 10),
    ("ELEWISE_LOGICAL_AND", 11),
    ("ELEWISE_LOGICAL_OR", 12),
    ("ELEWISE_LESS", 13),
    ("ELEWISE_GREATER", 14),
    ("ELEWISE_SUB", 15),
    ("ELEWISE_EQUAL", 16),
    ("ELEWISE_QUANT_PER_CHANNEL", 17),
    ("ELEWISE_DEQUANT_PER_CHANNEL", 18),
    ("ELEWISE_DYNAMIC_QUANT", 19),
    ("ELEWISE_TANH", 20),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElewiseType {
    Cast,
    Muls,
    Cos,
    Sin,
    Neg,
    Quant,
    LogicalNot,
    Add,
    Mul,
    RealDiv,
    LogicalAnd,
    LogicalOr,
    Less,
    Greater,
    Sub,
    Equal,
    QuantPerChannel,
    DequantPerChannel,
    DynamicQuant,
    Tanh,
}

impl ElewiseType {
    pub fn from_param(param: &OpParam) -> Result<Self, GoldenError> {
        use ElewiseType::*;

        let kind = match param.code("elewiseType", &ELEWISE_TYPES)? {
            1 => Cast,
            2 => Muls,
            3 => Cos,
            4 => Sin,
            5 => Neg,
            6 => Quant,
            7 => LogicalNot,
            8 => Add,
            9 => Mul,
            10 => RealDiv,
            11 => LogicalAnd,
            12 => LogicalOr,
            13 => Less,
            14 => Greater,
            15 => Sub,
            16 => Equal,
            17 => QuantPerChannel,
            18 => DequantPerChannel,
            19 => DynamicQuant,
            20 => Tanh,
            other => return Err(GoldenError::unsupported("elewiseType", other)),
        };
        Ok(kind)
    }

    /// Keys a particular element-wise kind reads beyond `elewiseType`.
    #[must_use]
    pub const fn extra_params(self) -> &'static [&'static str] {
        match self {
            Self::Cast => &["outTensorType"],
            Self::Muls => &["varAttr"],
            _ => &[],
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn silu(x: f64) -> f64 {
    x * sigmoid(x)
}

fn silu_grad(x: f64) -> f64 {
    let s = sigmoid(x);
    s * (1.0 + x * (1.0 - s))
}

/// Tanh-approximated GELU.
fn gelu(x: f64) -> f64 {
    let c = (2.0 / std::f64::consts::PI).sqrt();
    0.5 * x * (1.0 + (c * (x + 0.044_715 * x * x * x)).tanh())
}

fn halves(x: &Tensor, dim: i64) -> Result<(Tensor, Tensor, usize), GoldenError> {
    let axis = normalize_axis(dim as isize, x.ndim())?;
    let len = x.shape()[axis];
    if len % 2 != 0 {
        return Err(GoldenError::domain(format!(
            "swiglu needs an even split axis, got size {len}"
        )));
    }
    let mut parts = x.split(axis as isize, &[len / 2, len / 2])?;
    let b = parts.pop();
    let a = parts.pop();
    match (a, b) {
        (Some(a), Some(b)) => Ok((a, b, axis)),
        _ => Err(GoldenError::domain("swiglu split produced no halves")),
    }
}

fn zip_map(lhs: &Tensor, rhs: &Tensor, f: impl Fn(f64, f64) -> f64) -> Result<Tensor, GoldenError> {
    if lhs.shape() != rhs.shape() {
        return Err(GoldenError::domain(format!(
            "shape {:?} does not match {:?}",
            lhs.shape(),
            rhs.shape()
        )));
    }
    let values = lhs
        .values()
        .iter()
        .zip(rhs.values())
        .map(|(&l, &r)| f(l, r))
        .collect();
    Ok(Tensor::new(lhs.shape().to_vec(), values, lhs.dtype())?)
}

pub fn activation(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let kind = ActivationType::from_param(param)?;
    let out = match kind {
        ActivationType::Relu => input(inputs, 0)?.elementwise_unary(UnaryOp::Relu),
        ActivationType::Gelu => input(inputs, 0)?.map(gelu),
        ActivationType::FastGelu => input(inputs, 0)?.map(|x| x * sigmoid(1.702 * x)),
        ActivationType::Swish => {
            let scale = param.f64_or("scale", 1.0)?;
            input(inputs, 0)?.map(|x| x * sigmoid(scale * x))
        }
        ActivationType::Log => input(inputs, 0)?.elementwise_unary(UnaryOp::Log),
        ActivationType::SwigluForward => {
            let (a, b, _) = halves(input(inputs, 0)?, param.i64_or("dim", -1)?)?;
            zip_map(&a, &b, |a, b| silu(a) * b)?
        }
        ActivationType::SwigluBackward => {
            let dy = input(inputs, 0)?;
            let x = input(inputs, 1)?;
            let (a, b, axis) = halves(x, param.i64_or("dim", -1)?)?;
            let grad_a = zip_map(&zip_map(dy, &a, |g, a| g * silu_grad(a))?, &b, |g, b| g * b)?;
            let grad_b = zip_map(dy, &a, |g, a| g * silu(a))?;
            Tensor::concat(&[&grad_a, &grad_b], axis as isize)?.with_dtype(x.dtype())
        }
    };
    let dtype = out.dtype();
    Ok(vec![out.cast(dtype)])
}

/// Resolves `outTensorType` given as an ACL dtype code or a dtype name.
fn cast_target(param: &OpParam) -> Result<DType, GoldenError> {
    let resolved = match param.get("outTensorType") {
        Some(serde_json::Value::String(name)) => DType::parse(name),
        Some(_) => DType::from_acl_code(param.i64("outTensorType")?),
        None => None,
    };
    resolved.ok_or_else(|| {
        GoldenError::unsupported(
            "outTensorType",
            param
                .get("outTensorType")
                .map_or_else(String::new, ToString::to_string),
        )
    })
}

fn binary(inputs: &[Tensor], op: BinaryOp) -> Result<Tensor, GoldenError> {
    let out = input(inputs, 0)?.elementwise_binary(input(inputs, 1)?, op)?;
    if op.is_predicate() {
        return Ok(out.with_dtype(DType::I8));
    }
    let dtype = out.dtype();
    Ok(out.cast(dtype))
}

/// Symmetric per-row int8 quantization: `scale = max|x| / 127` over the
/// last axis; an all-zero row keeps scale 0 and quantizes to zeros.
fn dynamic_quant(x: &Tensor) -> Result<Vec<Tensor>, GoldenError> {
    let width = x.shape().last().copied().unwrap_or(1).max(1);
    let rows = x.numel() / width;
    let mut quantized = Vec::with_capacity(x.numel());
    let mut scales = Vec::with_capacity(rows);
    for row in x.values().chunks(width) {
        let peak = row.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        let scale = peak / 127.0;
        scales.push(scale);
        quantized.extend(row.iter().map(|&v| {
            if scale == 0.0 {
                0.0
            } else {
                DType::I8.quantize(v / scale)
            }
        }));
    }
    let row_shape = if x.ndim() == 0 {
        vec![1]
    } else {
        x.shape()[..x.ndim() - 1].to_vec()
    };
    Ok(vec![
        Tensor::new(x.shape().to_vec(), quantized, DType::I8)?,
        Tensor::new(row_shape, scales, DType::F32)?.cast(DType::F32),
    ])
}

pub fn elewise(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let kind = ElewiseType::from_param(param)?;
    let unary = |op: UnaryOp| -> Result<Tensor, GoldenError> {
        let x = input(inputs, 0)?;
        Ok(x.elementwise_unary(op).cast(x.dtype()))
    };
    let out = match kind {
        ElewiseType::Cast => input(inputs, 0)?.cast(cast_target(param)?),
        ElewiseType::Muls => {
            let factor = param.f64("varAttr")?;
            let x = input(inputs, 0)?;
            x.map(|v| v * factor).cast(x.dtype())
        }
        ElewiseType::Cos => unary(UnaryOp::Cos)?,
        ElewiseType::Sin => unary(UnaryOp::Sin)?,
        ElewiseType::Neg => unary(UnaryOp::Neg)?,
        ElewiseType::Tanh => unary(UnaryOp::Tanh)?,
        ElewiseType::LogicalNot => input(inputs, 0)?.elementwise_unary(UnaryOp::LogicalNot),
        ElewiseType::Quant => {
            let quant = param.nested("quantParam");
            let scale = quant.f64_or("inputScale", 1.0)?;
            let offset = quant.f64_or("inputOffset", 0.0)?;
            input(inputs, 0)?
                .map(|v| DType::I8.quantize(v / scale + offset))
                .with_dtype(DType::I8)
        }
        ElewiseType::Add => binary(inputs, BinaryOp::Add)?,
        ElewiseType::Sub => binary(inputs, BinaryOp::Sub)?,
        ElewiseType::Mul => binary(inputs, BinaryOp::Mul)?,
        ElewiseType::RealDiv => binary(inputs, BinaryOp::Div)?,
        ElewiseType::LogicalAnd => binary(inputs, BinaryOp::LogicalAnd)?,
        ElewiseType::LogicalOr => binary(inputs, BinaryOp::LogicalOr)?,
        ElewiseType::Less => binary(inputs, BinaryOp::Less)?,
        ElewiseType::Greater => binary(inputs, BinaryOp::Greater)?,
        ElewiseType::Equal => binary(inputs, BinaryOp::Equal)?,
        ElewiseType::QuantPerChannel => {
            let scaled = input(inputs, 0)?.elementwise_binary(input(inputs, 1)?, BinaryOp::Div)?;
            scaled
                .elementwise_binary(input(inputs, 2)?, BinaryOp::Add)?
                .map(|v| DType::I8.quantize(v))
                .with_dtype(DType::I8)
        }
        ElewiseType::DequantPerChannel => input(inputs, 0)?
            .clone()
            .with_dtype(DType::F32)
            .elementwise_binary(input(inputs, 2)?, BinaryOp::Sub)?
            .elementwise_binary(input(inputs, 1)?, BinaryOp::Mul)?
            .cast(DType::F16),
        ElewiseType::DynamicQuant => return dynamic_quant(input(inputs, 0)?),
    };
    Ok(vec![out])
}
