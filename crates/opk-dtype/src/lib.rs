#![forbid(unsafe_code)]

use half::{bf16, f16};

/// Element dtypes that appear in captured operator tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    Bool,
    I8,
    U8,
    I16,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I8 => "int8",
            Self::U8 => "uint8",
            Self::I16 => "int16",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::F16 => "float16",
            Self::BF16 => "bfloat16",
            Self::F32 => "float32",
            Self::F64 => "float64",
        }
    }

    #[must_use]
    pub const fn item_size(self) -> usize {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::F16 | Self::BF16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    /// Accepts canonical names, short forms, `torch.` prefixed names, GE
    /// `DT_*` names and little-endian npy descriptors.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let trimmed = name.trim();
        let bare = trimmed.strip_prefix("torch.").unwrap_or(trimmed);
        match bare {
            "bool" | "b1" | "|b1" | "DT_BOOL" => Some(Self::Bool),
            "int8" | "i8" | "i1" | "|i1" | "DT_INT8" => Some(Self::I8),
            "uint8" | "u8" | "u1" | "|u1" | "DT_UINT8" => Some(Self::U8),
            "int16" | "i16" | "<i2" | "DT_INT16" => Some(Self::I16),
            "int32" | "i32" | "int" | "<i4" | "DT_INT32" => Some(Self::I32),
            "int64" | "i64" | "long" | "<i8" | "DT_INT64" => Some(Self::I64),
            "float16" | "f16" | "half" | "<f2" | "DT_FLOAT16" => Some(Self::F16),
            "bfloat16" | "bf16" | "DT_BF16" | "DT_BFLOAT16" => Some(Self::BF16),
            "float32" | "f32" | "float" | "<f4" | "DT_FLOAT" => Some(Self::F32),
            "float64" | "f64" | "double" | "<f8" | "DT_DOUBLE" => Some(Self::F64),
            _ => None,
        }
    }

    /// ACL runtime dtype codes, as carried by `outTensorType` style params.
    #[must_use]
    pub const fn from_acl_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::F32),
            1 => Some(Self::F16),
            2 => Some(Self::I8),
            3 => Some(Self::I32),
            4 => Some(Self::U8),
            6 => Some(Self::I16),
            9 => Some(Self::I64),
            11 => Some(Self::F64),
            12 => Some(Self::Bool),
            27 => Some(Self::BF16),
            _ => None,
        }
    }

    /// Returns `true` for signed or unsigned integer types (not Bool).
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            Self::I8 | Self::U8 | Self::I16 | Self::I32 | Self::I64
        )
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::BF16 | Self::F32 | Self::F64)
    }

    /// Bool and integer outputs are compared exactly.
    #[must_use]
    pub const fn is_exact(self) -> bool {
        !self.is_float()
    }

    /// Half-width floats the accelerator computes in natively.
    #[must_use]
    pub const fn is_half(self) -> bool {
        matches!(self, Self::F16 | Self::BF16)
    }

    /// Rounds an f64 working value to what this dtype can store.
    ///
    /// Floats round to nearest; integers truncate toward zero and saturate,
    /// NaN maps to zero; Bool maps any non-zero value to one.
    #[must_use]
    pub fn store(self, value: f64) -> f64 {
        match self {
            Self::F64 => value,
            Self::F32 => f64::from(value as f32),
            Self::F16 => f16::from_f64(value).to_f64(),
            Self::BF16 => bf16::from_f64(value).to_f64(),
            Self::Bool => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            integer => saturate(integer, value.trunc()),
        }
    }

    /// Quantization rounding: ties to even, then saturate into range.
    #[must_use]
    pub fn quantize(self, value: f64) -> f64 {
        if self.is_float() {
            return self.store(value);
        }
        saturate(self, value.round_ties_even())
    }

    /// Machine epsilon for float dtypes.
    #[must_use]
    pub const fn epsilon(self) -> Option<f64> {
        match self {
            Self::F16 => Some(0.000_976_562_5),
            Self::BF16 => Some(0.007_812_5),
            Self::F32 => Some(f32::EPSILON as f64),
            Self::F64 => Some(f64::EPSILON),
            _ => None,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// `(min, max)` of an integer dtype; `None` for floats.
#[must_use]
pub const fn iinfo(dtype: DType) -> Option<(i64, i64)> {
    match dtype {
        DType::Bool => Some((0, 1)),
        DType::I8 => Some((i8::MIN as i64, i8::MAX as i64)),
        DType::U8 => Some((0, u8::MAX as i64)),
        DType::I16 => Some((i16::MIN as i64, i16::MAX as i64)),
        DType::I32 => Some((i32::MIN as i64, i32::MAX as i64)),
        DType::I64 => Some((i64::MIN, i64::MAX)),
        _ => None,
    }
}

fn saturate(dtype: DType, value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    match iinfo(dtype) {
        Some((lo, hi)) => value.clamp(lo as f64, hi as f64),
        None => value,
    }
}

/// Result dtype of a binary element-wise operation.
///
/// Bool is the identity; any float wins over any integer; two floats pick the
/// wider, with float16 + bfloat16 meeting at float32; two integers pick the
/// wider, with uint8 mixed with a signed type widening to at least int16.
#[must_use]
pub const fn promote(lhs: DType, rhs: DType) -> DType {
    use DType::*;

    match (lhs, rhs) {
        (Bool, x) | (x, Bool) => x,

        (F16, BF16) | (BF16, F16) => F32,
        (F64, _) | (_, F64) => F64,
        (F32, _) | (_, F32) => F32,
        (BF16, _) | (_, BF16) => BF16,
        (F16, _) | (_, F16) => F16,

        (I64, _) | (_, I64) => I64,
        (I32, _) | (_, I32) => I32,
        (I16, _) | (_, I16) => I16,
        (U8, I8) | (I8, U8) => I16,
        (U8, U8) => U8,
        (I8, I8) => I8,
    }
}
