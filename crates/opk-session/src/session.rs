//! Drives a verification run: intake, per-case lifecycle, worker pool and
//! the final report and case log writes.

use std::path::PathBuf;
use std::sync::Arc;

use opk_compare::MetricRegistry;
use opk_ops::{ExecuteError, Execution, OpKind, Operator, ValidationOutcome};
use opk_runtime::{
    CaseLedger, CaseState, ConfigError, HardwareBackend, HostBackend, PrecisionMode, RunMode,
};
use opk_tensor::Tensor;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::caselog::{CaseLogEntry, append_case_log};
use crate::config::SessionConfig;
use crate::filter::CaseFilter;
use crate::graph::{self, GraphCase};
use crate::record::{Manifest, Record};
use crate::report::{
    CaseOutcome, ExecutedInformation, MetricColumns, TensorRow, VerificationReport,
};

pub const MISSING_RANK_REASON: &str = "missing rank/pid for collective operator";

#[derive(Debug, Clone)]
enum PendingCase {
    Known { kind: OpKind, record: Record },
    Unsupported {
        op_id: String,
        op_name: String,
        reason: String,
    },
}

/// Where a run's artifacts landed.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutput {
    pub report: VerificationReport,
    pub report_path: Option<PathBuf>,
}

pub struct Session {
    config: SessionConfig,
    backend: Arc<dyn HardwareBackend>,
    filter: CaseFilter,
    metrics: MetricRegistry,
    cases: Vec<PendingCase>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("soc", &self.backend.soc_version())
            .field("cases", &self.cases.len())
            .finish()
    }
}

impl Session {
    /// Validates `config` and binds a host backend for its soc version.
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        let backend = Arc::new(HostBackend::new(config.soc_version));
        Self::with_backend(config, backend)
    }

    pub fn with_backend(
        config: SessionConfig,
        backend: Arc<dyn HardwareBackend>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            filter: CaseFilter::new(&config.operation_ids, &config.operation_names),
            metrics: MetricRegistry::with_builtins(),
            config,
            backend,
            cases: Vec::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Queues a record. Returns `false` when its operator is not registered
    /// or the id/name filter excludes it.
    pub fn add_case(&mut self, record: Record) -> bool {
        let Some(kind) = OpKind::from_name(&record.op_name) else {
            warn!(op_id = %record.op_id, op_name = %record.op_name, "operator not registered, case dropped");
            return false;
        };
        if !self.filter.admits(&record.op_id, &record.op_name) {
            debug!(op_id = %record.op_id, op_name = %record.op_name, "case filtered out");
            return false;
        }
        self.cases.push(PendingCase::Known { kind, record });
        true
    }

    /// Queues a case that will be reported `UNSUPPORTED` without running.
    pub fn add_unsupported(&mut self, op_id: String, op_name: String, reason: String) -> bool {
        if !self.filter.admits(&op_id, &op_name) {
            return false;
        }
        self.cases.push(PendingCase::Unsupported {
            op_id,
            op_name,
            reason,
        });
        true
    }

    /// Reads the manifest, or walks the graph dump in autofuse mode.
    /// Returns how many cases were queued.
    pub fn load_cases(&mut self) -> Result<usize, String> {
        let before = self.cases.len();
        match self.config.mode {
            RunMode::Single => {
                let manifest = Manifest::load(&self.config.input)?;
                info!(cases = manifest.cases.len(), path = %self.config.input.display(), "manifest loaded");
                for record in manifest.cases {
                    self.add_case(record);
                }
            }
            RunMode::Autofuse => {
                let graph_path = self
                    .config
                    .graph_path
                    .clone()
                    .ok_or_else(|| ConfigError::MissingGraphPath.to_string())?;
                let model = graph::load_graph(&graph_path)?;
                for (graph_index, name) in graph::graph_names(&model).iter().enumerate() {
                    let mut infos = graph::collect_op_infos(&model, name);
                    graph::bind_dump_files(&self.config.input, &mut infos)?;
                    debug!(graph = %name, ops = infos.len(), "graph ops collected");
                    for case in graph::derive_cases(graph_index, &infos) {
                        match case {
                            GraphCase::Supported(record) => {
                                self.add_case(record);
                            }
                            GraphCase::Unsupported {
                                op_id,
                                op_name,
                                reason,
                            } => {
                                self.add_unsupported(op_id, op_name, reason);
                            }
                        }
                    }
                }
            }
        }
        Ok(self.cases.len() - before)
    }

    /// Verifies every queued case. Results keep queue order whether or not
    /// the worker pool ran.
    #[must_use]
    pub fn execute_cases(&self) -> VerificationReport {
        info!(cases = self.cases.len(), workers = self.config.num_workers, "verifying cases");
        let outcomes: Vec<CaseOutcome> = if self.config.parallel() {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.num_workers)
                .build()
            {
                Ok(pool) => pool.install(|| self.cases.par_iter().map(|c| self.verify(c)).collect()),
                Err(err) => {
                    warn!(%err, "worker pool unavailable, verifying sequentially");
                    self.cases.iter().map(|c| self.verify(c)).collect()
                }
            }
        } else {
            self.cases.iter().map(|c| self.verify(c)).collect()
        };
        VerificationReport::new(outcomes)
    }

    /// Loads, verifies and writes the report and case log.
    pub fn run(mut self) -> Result<SessionOutput, String> {
        self.load_cases()?;
        let report = self.execute_cases();
        if let Some(path) = &self.config.case_log_path {
            let entries: Vec<CaseLogEntry> =
                report.cases.iter().map(CaseLogEntry::from_outcome).collect();
            append_case_log(path, &entries)?;
        }
        let report_path = report.write(&self.config.output_dir)?;
        let summary = report.summary();
        match &report_path {
            Some(path) => info!(
                total = summary.total,
                passed = summary.passed,
                failed = summary.failed,
                skipped = summary.skipped,
                path = %path.display(),
                "report written"
            ),
            None => warn!("no cases were verified, no report written"),
        }
        Ok(SessionOutput {
            report,
            report_path,
        })
    }

    fn verify(&self, case: &PendingCase) -> CaseOutcome {
        match case {
            PendingCase::Known { kind, record } => self.verify_record(*kind, record),
            PendingCase::Unsupported {
                op_id,
                op_name,
                reason,
            } => {
                let mut ledger = CaseLedger::new();
                step(&mut ledger, CaseState::Skipped, reason);
                CaseOutcome {
                    op_id: op_id.clone(),
                    op_name: op_name.clone(),
                    op_param: String::new(),
                    tensor_path: String::new(),
                    fingerprint: String::new(),
                    information: ExecutedInformation::Unsupported,
                    fail_reason: reason.clone(),
                    reason_code: Some("op_unsupported".to_string()),
                    validation: None,
                    verdicts: Vec::new(),
                    tensors: Vec::new(),
                    ledger,
                }
            }
        }
    }

    fn verify_record(&self, kind: OpKind, record: &Record) -> CaseOutcome {
        let mut outcome = CaseOutcome {
            op_id: record.op_id.clone(),
            op_name: record.op_name.clone(),
            op_param: record.op_param.compact(),
            tensor_path: record.tensor_path_display(),
            fingerprint: record.fingerprint(),
            information: ExecutedInformation::Skipped,
            fail_reason: String::new(),
            reason_code: None,
            validation: None,
            verdicts: Vec::new(),
            tensors: Vec::new(),
            ledger: CaseLedger::new(),
        };

        if kind.is_collective() && record.rank.is_none() && record.pid.is_none() {
            return skip(outcome, MISSING_RANK_REASON, "collective_missing_rank");
        }

        let op = Operator::new(kind, record.op_param.clone(), Arc::clone(&self.backend));
        let validated = match op.into_validated() {
            Ok(validated) => validated,
            Err(validation) => {
                let code = if validation.missing.is_empty() {
                    "validation_invalid_param"
                } else {
                    "validation_missing_param"
                };
                let reason = validation.describe();
                outcome.validation = Some(validation);
                return skip(outcome, &reason, code);
            }
        };
        outcome.validation = Some(ValidationOutcome {
            valid: true,
            ..ValidationOutcome::default()
        });
        step(&mut outcome.ledger, CaseState::Validated, "parameters valid");

        let (inputs, actual) = match record
            .load_inputs()
            .and_then(|inputs| Ok((inputs, record.load_outputs()?)))
        {
            Ok(loaded) => loaded,
            Err(reason) => return fail(outcome, reason, "tensor_load_failed"),
        };
        let inputs = apply_precision_mode(self.config.precision_mode, inputs);

        let Some(actual) = actual else {
            return match validated.golden_calc(&inputs) {
                Ok(golden) => {
                    step(&mut outcome.ledger, CaseState::Computed, format!("{} golden outputs", golden.len()));
                    step(&mut outcome.ledger, CaseState::Reported, "no actual outputs");
                    outcome.information = ExecutedInformation::NoActualOutput;
                    outcome
                }
                Err(err) => {
                    let err = ExecuteError::from(err);
                    fail(outcome, err.to_string(), err.reason_code())
                }
            };
        };

        let executed = if kind.inplace_indices().is_empty() {
            validated.execute(&inputs, &actual, &self.config.tolerances)
        } else {
            validated.execute_inplace(&inputs, &actual, &self.config.tolerances)
        };
        match executed {
            Ok(execution) => self.record_execution(outcome, &execution, &actual),
            Err(err @ ExecuteError::Golden(_)) => fail(outcome, err.to_string(), err.reason_code()),
            Err(err @ ExecuteError::OutputCount { computed, .. }) => {
                if computed {
                    step(&mut outcome.ledger, CaseState::Computed, "golden outputs computed");
                }
                fail(outcome, err.to_string(), err.reason_code())
            }
        }
    }

    fn record_execution(
        &self,
        mut outcome: CaseOutcome,
        execution: &Execution,
        actual: &[Tensor],
    ) -> CaseOutcome {
        step(&mut outcome.ledger, CaseState::Computed, format!("{} golden outputs", execution.golden.len()));
        step(&mut outcome.ledger, CaseState::Compared, format!("{} tensors compared", execution.verdicts.len()));
        outcome.tensors = execution
            .verdicts
            .iter()
            .zip(execution.golden.iter().zip(actual))
            .enumerate()
            .map(|(index, (verdict, (golden, actual)))| {
                let metrics = MetricColumns::measure(
                    golden,
                    actual,
                    verdict,
                    self.config.tolerances.atol_for(golden.dtype()),
                    &self.config.precision_metrics,
                    &self.metrics,
                );
                TensorRow::from_verdict(index, verdict, metrics)
            })
            .collect();
        outcome.verdicts.clone_from(&execution.verdicts);

        let first_failure = execution
            .verdicts
            .iter()
            .enumerate()
            .find(|(_, verdict)| !verdict.passed);
        match first_failure {
            None => {
                step(&mut outcome.ledger, CaseState::Reported, "all outputs within tolerance");
                outcome.information = ExecutedInformation::Pass;
                debug!(op_id = %outcome.op_id, op_name = %outcome.op_name, "case passed");
                outcome
            }
            Some((index, verdict)) => {
                let reason = format!("out tensor {index}: {}", verdict.describe());
                fail(outcome, reason, "comparison_mismatch")
            }
        }
    }
}

fn step(ledger: &mut CaseLedger, state: CaseState, note: impl Into<String>) {
    if let Err(err) = ledger.advance(state, note) {
        warn!(%err, "case ledger rejected transition");
    }
}

fn skip(mut outcome: CaseOutcome, reason: &str, code: &str) -> CaseOutcome {
    step(&mut outcome.ledger, CaseState::Skipped, reason);
    debug!(op_id = %outcome.op_id, op_name = %outcome.op_name, reason, "case skipped");
    outcome.information = ExecutedInformation::Skipped;
    outcome.fail_reason = reason.to_string();
    outcome.reason_code = Some(code.to_string());
    outcome
}

fn fail(mut outcome: CaseOutcome, reason: String, code: &str) -> CaseOutcome {
    step(&mut outcome.ledger, CaseState::Failed, reason.as_str());
    step(&mut outcome.ledger, CaseState::Reported, "failure recorded");
    warn!(op_id = %outcome.op_id, op_name = %outcome.op_name, %reason, "case failed");
    outcome.information = ExecutedInformation::Failed;
    outcome.fail_reason = reason;
    outcome.reason_code = Some(code.to_string());
    outcome
}

/// Converts float inputs to the forced precision; integers keep their dtype.
fn apply_precision_mode(mode: PrecisionMode, inputs: Vec<Tensor>) -> Vec<Tensor> {
    if mode == PrecisionMode::Keep {
        return inputs;
    }
    inputs
        .into_iter()
        .map(|tensor| {
            let target = mode.target_dtype(tensor.dtype());
            if target == tensor.dtype() {
                tensor
            } else {
                tensor.cast(target)
            }
        })
        .collect()
}
