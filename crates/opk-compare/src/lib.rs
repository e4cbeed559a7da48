#![forbid(unsafe_code)]

pub mod metrics;

use opk_dtype::DType;
use opk_tensor::Tensor;
use serde::{Deserialize, Serialize};

pub use metrics::{MetricFn, MetricRegistry, MetricRegistryError};

pub const DEFAULT_ATOL: f64 = 1e-4;

/// Absolute tolerance per floating dtype. Integer and bool outputs are
/// always compared exactly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToleranceConfig {
    pub float16: f64,
    pub bfloat16: f64,
    pub float32: f64,
    pub float64: f64,
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self::uniform(DEFAULT_ATOL)
    }
}

impl ToleranceConfig {
    #[must_use]
    pub const fn uniform(atol: f64) -> Self {
        Self {
            float16: atol,
            bfloat16: atol,
            float32: atol,
            float64: atol,
        }
    }

    /// `None` means exact comparison.
    #[must_use]
    pub const fn atol_for(&self, dtype: DType) -> Option<f64> {
        match dtype {
            DType::F16 => Some(self.float16),
            DType::BF16 => Some(self.bfloat16),
            DType::F32 => Some(self.float32),
            DType::F64 => Some(self.float64),
            _ => None,
        }
    }

    /// Human-readable name of the rule applied to `dtype`.
    #[must_use]
    pub fn precision_standard(&self, dtype: DType) -> String {
        match self.atol_for(dtype) {
            Some(atol) => format!("abs_error<={atol}"),
            None => "exact".to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, atol) in [
            ("float16", self.float16),
            ("bfloat16", self.bfloat16),
            ("float32", self.float32),
            ("float64", self.float64),
        ] {
            if !atol.is_finite() || atol < 0.0 {
                return Err(format!(
                    "tolerance for {name} must be finite and >= 0, got {atol}"
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComparisonFailure {
    ShapeMismatch {
        golden: Vec<usize>,
        actual: Vec<usize>,
    },
    ElementCountMismatch {
        golden: usize,
        actual: usize,
    },
}

impl std::fmt::Display for ComparisonFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeMismatch { golden, actual } => {
                write!(f, "shape mismatch golden={golden:?} actual={actual:?}")
            }
            Self::ElementCountMismatch { golden, actual } => write!(
                f,
                "size of golden ({golden}) and actual ({actual}) differ"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mismatch {
    pub index: usize,
    pub golden: f64,
    pub actual: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonVerdict {
    pub passed: bool,
    pub max_abs_deviation: f64,
    pub max_rel_deviation: f64,
    pub mismatch_count: usize,
    pub element_count: usize,
    /// Fraction of elements within tolerance, in `[0, 1]`.
    pub pass_rate: f64,
    pub precision_standard: String,
    pub failure: Option<ComparisonFailure>,
    pub first_mismatch: Option<Mismatch>,
}

impl ComparisonVerdict {
    fn structural(failure: ComparisonFailure, precision_standard: String) -> Self {
        Self {
            passed: false,
            max_abs_deviation: f64::INFINITY,
            max_rel_deviation: f64::INFINITY,
            mismatch_count: 0,
            element_count: 0,
            pass_rate: 0.0,
            precision_standard,
            failure: Some(failure),
            first_mismatch: None,
        }
    }

    /// One-line description suitable for a report `fail_reason`.
    #[must_use]
    pub fn describe(&self) -> String {
        if let Some(failure) = &self.failure {
            return failure.to_string();
        }
        match &self.first_mismatch {
            Some(m) => format!(
                "{} of {} elements exceed {}; first at index {}: golden={} actual={}",
                self.mismatch_count,
                self.element_count,
                self.precision_standard,
                m.index,
                m.golden,
                m.actual
            ),
            None => "all elements within tolerance".to_string(),
        }
    }
}

fn element_equivalent(golden: f64, actual: f64, atol: Option<f64>) -> bool {
    if golden.is_nan() || actual.is_nan() {
        return golden.is_nan() && actual.is_nan();
    }
    if golden == actual {
        return true;
    }
    match atol {
        Some(atol) => (golden - actual).abs() <= atol,
        None => false,
    }
}

/// Compares an actual output against its golden. The golden's dtype picks
/// the rule: floats within the per-dtype absolute tolerance, everything
/// else exactly. NaN matches only NaN at the same position.
#[must_use]
pub fn compare_tensors(
    golden: &Tensor,
    actual: &Tensor,
    tolerances: &ToleranceConfig,
) -> ComparisonVerdict {
    let atol = tolerances.atol_for(golden.dtype());
    let precision_standard = tolerances.precision_standard(golden.dtype());

    if golden.numel() != actual.numel() {
        return ComparisonVerdict::structural(
            ComparisonFailure::ElementCountMismatch {
                golden: golden.numel(),
                actual: actual.numel(),
            },
            precision_standard,
        );
    }
    if golden.shape() != actual.shape() {
        return ComparisonVerdict::structural(
            ComparisonFailure::ShapeMismatch {
                golden: golden.shape().to_vec(),
                actual: actual.shape().to_vec(),
            },
            precision_standard,
        );
    }

    let mut max_abs = 0.0_f64;
    let mut max_rel = 0.0_f64;
    let mut mismatch_count = 0usize;
    let mut first_mismatch = None;

    for (index, (&g, &a)) in golden.values().iter().zip(actual.values()).enumerate() {
        if !element_equivalent(g, a, atol) {
            mismatch_count += 1;
            if first_mismatch.is_none() {
                first_mismatch = Some(Mismatch {
                    index,
                    golden: g,
                    actual: a,
                });
            }
        }
        if g.is_nan() || a.is_nan() || g == a {
            continue;
        }
        let abs_err = (g - a).abs();
        max_abs = max_abs.max(abs_err);
        if g != 0.0 {
            max_rel = max_rel.max(abs_err / g.abs());
        }
    }

    let element_count = golden.numel();
    let pass_rate = if element_count == 0 {
        1.0
    } else {
        (element_count - mismatch_count) as f64 / element_count as f64
    };

    ComparisonVerdict {
        passed: mismatch_count == 0,
        max_abs_deviation: max_abs,
        max_rel_deviation: max_rel,
        mismatch_count,
        element_count,
        pass_rate,
        precision_standard,
        failure: None,
        first_mismatch,
    }
}
