//! The lifecycle shared by every operator kind: validate the parameters,
//! compute the golden outputs, compare them against the accelerator's.

use std::sync::Arc;

use opk_compare::{ComparisonVerdict, ToleranceConfig, compare_tensors};
use opk_runtime::HardwareBackend;
use opk_tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::GoldenError;
use crate::golden::{self, elementwise, linear, norm};
use crate::param::OpParam;
use crate::registry::OpKind;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    /// Required keys absent from the parameters.
    pub missing: Vec<String>,
    /// Keys present but holding a value the golden library cannot honour.
    pub invalid: Vec<String>,
}

impl ValidationOutcome {
    #[must_use]
    pub fn describe(&self) -> String {
        match (self.missing.is_empty(), self.invalid.is_empty()) {
            (true, true) => "parameters valid".to_string(),
            (false, true) => format!("missing param: {}", self.missing.join(", ")),
            (true, false) => format!("invalid param: {}", self.invalid.join(", ")),
            (false, false) => format!(
                "missing param: {}; invalid param: {}",
                self.missing.join(", "),
                self.invalid.join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteError {
    Golden(GoldenError),
    /// `computed` is false when the count was rejected before any golden ran.
    OutputCount {
        golden: usize,
        actual: usize,
        computed: bool,
    },
}

impl ExecuteError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Golden(err) => err.reason_code(),
            Self::OutputCount { .. } => "execute_output_count_mismatch",
        }
    }
}

impl std::fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Golden(err) => write!(f, "{} when calc golden: {err}", err.kind()),
            Self::OutputCount { golden, actual, .. } => write!(
                f,
                "size of golden outputs ({golden}) and actual outputs ({actual}) differ"
            ),
        }
    }
}

impl std::error::Error for ExecuteError {}

impl From<GoldenError> for ExecuteError {
    fn from(err: GoldenError) -> Self {
        Self::Golden(err)
    }
}

/// Golden outputs plus one verdict per compared tensor.
#[derive(Debug, Clone)]
pub struct Execution {
    pub golden: Vec<Tensor>,
    pub verdicts: Vec<ComparisonVerdict>,
}

impl Execution {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.verdicts.iter().all(|v| v.passed)
    }
}

/// One operator invocation awaiting validation.
#[derive(Clone)]
pub struct Operator {
    kind: OpKind,
    param: OpParam,
    backend: Arc<dyn HardwareBackend>,
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator")
            .field("kind", &self.kind)
            .field("param", &self.param)
            .field("soc", &self.backend.soc_version())
            .finish()
    }
}

impl Operator {
    /// Keeps only the params `kind` declares, so neither validation nor the
    /// golden can observe anything else in the record.
    #[must_use]
    pub fn new(kind: OpKind, param: OpParam, backend: Arc<dyn HardwareBackend>) -> Self {
        Self {
            kind,
            param: param.retained(|key| kind.declares(key)),
            backend,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> OpKind {
        self.kind
    }

    #[must_use]
    pub fn param(&self) -> &OpParam {
        &self.param
    }

    /// Checks required keys first; enum codes and cross-key constraints are
    /// only inspected once every required key is present.
    #[must_use]
    pub fn validate(&self) -> ValidationOutcome {
        let missing: Vec<String> = self
            .param
            .missing(self.kind.required_params())
            .into_iter()
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return ValidationOutcome {
                valid: false,
                missing,
                invalid: Vec::new(),
            };
        }
        let mut outcome = ValidationOutcome::default();
        self.check_values(&mut outcome);
        outcome.valid = outcome.missing.is_empty() && outcome.invalid.is_empty();
        outcome
    }

    fn check_values(&self, outcome: &mut ValidationOutcome) {
        let param = &self.param;
        match self.kind {
            OpKind::Activation => {
                reject(outcome, "activationType", elementwise::ActivationType::from_param(param));
            }
            OpKind::Elewise => match elementwise::ElewiseType::from_param(param) {
                Ok(kind) => outcome.missing.extend(
                    param
                        .missing(kind.extra_params())
                        .into_iter()
                        .map(str::to_string),
                ),
                Err(_) => outcome.invalid.push("elewiseType".to_string()),
            },
            OpKind::LayerNorm => {
                reject(outcome, "layerType", norm::NormLayout::from_param(param, &norm::LAYER_NORM_TYPES));
            }
            OpKind::RmsNorm => {
                reject(outcome, "layerType", norm::NormLayout::from_param(param, &norm::RMS_NORM_TYPES));
            }
            OpKind::LinearParallel => {
                reject(outcome, "backend", linear::ParallelType::from_param(param));
                if !self.backend.is_910b() {
                    outcome.invalid.push("soc_version".to_string());
                }
            }
            OpKind::Fill => {
                if !param.contains("value") {
                    outcome.missing.push("value".to_string());
                } else if param.f64_list("value").map_or(true, |v| v.is_empty()) {
                    outcome.invalid.push("value".to_string());
                }
                let masked = param.bool_or("withMask", false).unwrap_or(false);
                if !masked && !param.contains("outDim") {
                    outcome.missing.push("outDim".to_string());
                }
            }
            _ => {}
        }
    }

    /// Consumes the operator, yielding a handle that can compute goldens only
    /// when validation passed.
    pub fn into_validated(self) -> Result<ValidatedOperator, ValidationOutcome> {
        let outcome = self.validate();
        if outcome.valid {
            Ok(ValidatedOperator { op: self })
        } else {
            Err(outcome)
        }
    }
}

/// An operator whose parameters passed [`Operator::validate`].
#[derive(Debug, Clone)]
pub struct ValidatedOperator {
    op: Operator,
}

impl ValidatedOperator {
    #[must_use]
    pub const fn kind(&self) -> OpKind {
        self.op.kind
    }

    pub fn golden_calc(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
        golden::golden_calc(self.op.kind, &self.op.param, self.op.backend.as_ref(), inputs)
    }

    /// Computes goldens and compares them position by position with `actual`.
    pub fn execute(
        &self,
        inputs: &[Tensor],
        actual: &[Tensor],
        tolerances: &ToleranceConfig,
    ) -> Result<Execution, ExecuteError> {
        let golden = self.golden_calc(inputs)?;
        compare_all(golden, actual, tolerances)
    }

    /// For cache writers: the goldens are the mutated buffers, compared with
    /// the actual buffers captured at [`OpKind::inplace_indices`].
    pub fn execute_inplace(
        &self,
        inputs: &[Tensor],
        mutated: &[Tensor],
        tolerances: &ToleranceConfig,
    ) -> Result<Execution, ExecuteError> {
        let indices = self.op.kind.inplace_indices();
        if mutated.len() != indices.len() {
            return Err(ExecuteError::OutputCount {
                golden: indices.len(),
                actual: mutated.len(),
                computed: false,
            });
        }
        let golden = self.golden_calc(inputs)?;
        compare_all(golden, mutated, tolerances)
    }
}

fn reject<T>(outcome: &mut ValidationOutcome, key: &str, result: Result<T, GoldenError>) {
    if result.is_err() {
        outcome.invalid.push(key.to_string());
    }
}

fn compare_all(
    golden: Vec<Tensor>,
    actual: &[Tensor],
    tolerances: &ToleranceConfig,
) -> Result<Execution, ExecuteError> {
    if golden.len() != actual.len() {
        return Err(ExecuteError::OutputCount {
            golden: golden.len(),
            actual: actual.len(),
            computed: true,
        });
    }
    let verdicts = golden
        .iter()
        .zip(actual)
        .map(|(g, a)| compare_tensors(g, a, tolerances))
        .collect();
    Ok(Execution { golden, verdicts })
}
