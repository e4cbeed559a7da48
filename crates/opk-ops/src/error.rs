use opk_linalg::LinAlgError;
use opk_random::RandomError;
use opk_tensor::TensorError;

pub const GOLDEN_REASON_CODES: [&str; 7] = [
    "golden_index_out_of_range",
    "golden_domain_error",
    "golden_unsupported_param",
    "golden_invalid_param",
    "golden_tensor_error",
    "golden_linalg_error",
    "golden_random_error",
];

/// Why a golden computation could not produce a reference result.
#[derive(Debug, Clone, PartialEq)]
pub enum GoldenError {
    IndexError(String),
    DomainError(String),
    UnsupportedParam { key: String, value: String },
    InvalidParam { key: String, reason: String },
    Tensor(TensorError),
    LinAlg(LinAlgError),
    Random(RandomError),
}

impl GoldenError {
    pub(crate) fn index(msg: impl Into<String>) -> Self {
        Self::IndexError(msg.into())
    }

    pub(crate) fn domain(msg: impl Into<String>) -> Self {
        Self::DomainError(msg.into())
    }

    pub(crate) fn unsupported(key: &str, value: impl ToString) -> Self {
        Self::UnsupportedParam {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::IndexError(_) => "golden_index_out_of_range",
            Self::DomainError(_) => "golden_domain_error",
            Self::UnsupportedParam { .. } => "golden_unsupported_param",
            Self::InvalidParam { .. } => "golden_invalid_param",
            Self::Tensor(_) => "golden_tensor_error",
            Self::LinAlg(_) => "golden_linalg_error",
            Self::Random(_) => "golden_random_error",
        }
    }

    /// Exception kind preserved in reports: `"IndexError"` for anything that
    /// indexed outside a tensor, `"DomainError"` for undefined numeric input.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IndexError(_) => "IndexError",
            Self::DomainError(_) | Self::Random(_) => "DomainError",
            Self::UnsupportedParam { .. } => "UnsupportedParam",
            Self::InvalidParam { .. } => "InvalidParam",
            Self::Tensor(err) | Self::LinAlg(LinAlgError::Tensor(err)) => {
                if err.is_index_error() {
                    "IndexError"
                } else {
                    "DomainError"
                }
            }
            Self::LinAlg(_) => "DomainError",
        }
    }
}

impl std::fmt::Display for GoldenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IndexError(msg) | Self::DomainError(msg) => write!(f, "{msg}"),
            Self::UnsupportedParam { key, value } => {
                write!(f, "unsupported value {value} for param '{key}'")
            }
            Self::InvalidParam { key, reason } => write!(f, "param '{key}' {reason}"),
            Self::Tensor(err) => write!(f, "{err}"),
            Self::LinAlg(err) => write!(f, "{err}"),
            Self::Random(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for GoldenError {}

impl From<TensorError> for GoldenError {
    fn from(err: TensorError) -> Self {
        Self::Tensor(err)
    }
}

impl From<opk_ndarray::ShapeError> for GoldenError {
    fn from(err: opk_ndarray::ShapeError) -> Self {
        Self::Tensor(TensorError::Shape(err))
    }
}

impl From<LinAlgError> for GoldenError {
    fn from(err: LinAlgError) -> Self {
        Self::LinAlg(err)
    }
}

impl From<RandomError> for GoldenError {
    fn from(err: RandomError) -> Self {
        Self::Random(err)
    }
}
