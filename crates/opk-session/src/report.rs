//! The session's only user-visible failure surface: one CSV row per compared
//! output tensor plus a JSON sidecar holding every case in full.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use opk_compare::{ComparisonVerdict, MetricRegistry};
use opk_ops::ValidationOutcome;
use opk_runtime::CaseLedger;
use opk_tensor::Tensor;
use serde::{Deserialize, Serialize};

pub const CSV_HEADER: [&str; 14] = [
    "op_id",
    "op_name",
    "op_param",
    "tensor_path",
    "out_tensor_id",
    "precision_standard",
    "excuted_information",
    "rel_precision_rate(%)",
    "max_rel_error",
    "abs_pass_rate(%)",
    "max_abs_error",
    "cosine_similarity",
    "kl_divergence",
    "fail_reason",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutedInformation {
    Pass,
    Failed,
    Skipped,
    NoActualOutput,
    Unsupported,
}

impl ExecutedInformation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::NoActualOutput => "NO_ACTUAL_OUTPUT",
            Self::Unsupported => "UNSUPPORTED",
        }
    }
}

impl std::fmt::Display for ExecutedInformation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested metrics that land in a fixed column rather than `extra`.
const FIXED_COLUMN_METRICS: [&str; 4] = ["abs", "rel", "cos_sim", "kl"];

/// Precision columns of one tensor row; `None` is written as `NaN`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricColumns {
    pub rel_precision_rate: Option<f64>,
    pub max_rel_error: Option<f64>,
    pub abs_pass_rate: Option<f64>,
    pub max_abs_error: Option<f64>,
    pub cosine_similarity: Option<f64>,
    pub kl_divergence: Option<f64>,
    /// Every other requested metric, keyed by its registry name. Each name
    /// becomes a trailing CSV column.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, f64>,
}

impl MetricColumns {
    /// The absolute columns always come from the verdict; the others only
    /// when their metric was requested. Requested metrics without a fixed
    /// column go to `extra`. Structural failures leave every column empty.
    #[must_use]
    pub fn measure(
        golden: &Tensor,
        actual: &Tensor,
        verdict: &ComparisonVerdict,
        atol: Option<f64>,
        requested: &[String],
        registry: &MetricRegistry,
    ) -> Self {
        if verdict.failure.is_some() {
            return Self::default();
        }
        let wants = |name: &str| requested.iter().any(|m| m == name);
        let (g, a) = (golden.values(), actual.values());
        let mut columns = Self {
            abs_pass_rate: Some(verdict.pass_rate * 100.0),
            max_abs_error: Some(verdict.max_abs_deviation),
            ..Self::default()
        };
        if wants("rel") {
            columns.rel_precision_rate = Some(relative_pass_rate(g, a, atol.unwrap_or(0.0)) * 100.0);
            columns.max_rel_error = registry.evaluate("rel", g, a);
        }
        if wants("cos_sim") {
            columns.cosine_similarity = registry.evaluate("cos_sim", g, a);
        }
        if wants("kl") {
            columns.kl_divergence = registry.evaluate("kl", g, a);
        }
        for name in requested {
            if FIXED_COLUMN_METRICS.contains(&name.as_str()) {
                continue;
            }
            if let Some(value) = registry.evaluate(name, g, a) {
                columns.extra.insert(name.clone(), value);
            }
        }
        columns
    }
}

/// Share of elements whose relative error stays within `rtol`; a zero golden
/// falls back to the absolute error.
fn relative_pass_rate(golden: &[f64], actual: &[f64], rtol: f64) -> f64 {
    if golden.is_empty() {
        return 1.0;
    }
    let within = golden
        .iter()
        .zip(actual)
        .filter(|&(&g, &a)| {
            if g.is_nan() || a.is_nan() {
                return g.is_nan() && a.is_nan();
            }
            let err = (a - g).abs();
            if g == 0.0 { err <= rtol } else { err / g.abs() <= rtol }
        })
        .count();
    within as f64 / golden.len() as f64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRow {
    pub out_tensor_id: usize,
    pub precision_standard: String,
    pub information: ExecutedInformation,
    pub metrics: MetricColumns,
    pub fail_reason: String,
}

impl TensorRow {
    #[must_use]
    pub fn from_verdict(out_tensor_id: usize, verdict: &ComparisonVerdict, metrics: MetricColumns) -> Self {
        let (information, fail_reason) = if verdict.passed {
            (ExecutedInformation::Pass, String::new())
        } else {
            (ExecutedInformation::Failed, verdict.describe())
        };
        Self {
            out_tensor_id,
            precision_standard: verdict.precision_standard.clone(),
            information,
            metrics,
            fail_reason,
        }
    }
}

/// Everything known about one verified record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseOutcome {
    pub op_id: String,
    pub op_name: String,
    pub op_param: String,
    pub tensor_path: String,
    pub fingerprint: String,
    pub information: ExecutedInformation,
    pub fail_reason: String,
    pub reason_code: Option<String>,
    pub validation: Option<ValidationOutcome>,
    pub verdicts: Vec<ComparisonVerdict>,
    pub tensors: Vec<TensorRow>,
    pub ledger: CaseLedger,
}

impl CaseOutcome {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.information == ExecutedInformation::Pass
    }

    /// CSV rows: one per compared tensor, or a single case-level row.
    /// `extra` names the trailing metric columns in header order.
    #[must_use]
    pub fn csv_rows(&self, extra: &[&str]) -> Vec<Vec<String>> {
        let lead = [
            self.op_id.clone(),
            self.op_name.clone(),
            self.op_param.clone(),
            self.tensor_path.clone(),
        ];
        if self.tensors.is_empty() {
            let mut row = lead.to_vec();
            row.extend([
                String::new(),
                String::new(),
                self.information.to_string(),
            ]);
            let empty = MetricColumns::default();
            row.extend(metric_cells(&empty));
            row.push(self.fail_reason.clone());
            row.extend(extra_cells(&empty, extra));
            return vec![row];
        }
        self.tensors
            .iter()
            .map(|tensor| {
                let mut row = lead.to_vec();
                row.extend([
                    tensor.out_tensor_id.to_string(),
                    tensor.precision_standard.clone(),
                    tensor.information.to_string(),
                ]);
                row.extend(metric_cells(&tensor.metrics));
                row.push(if tensor.fail_reason.is_empty() {
                    self.fail_reason.clone()
                } else {
                    tensor.fail_reason.clone()
                });
                row.extend(extra_cells(&tensor.metrics, extra));
                row
            })
            .collect()
    }
}

fn metric_cells(metrics: &MetricColumns) -> [String; 6] {
    [
        metrics.rel_precision_rate,
        metrics.max_rel_error,
        metrics.abs_pass_rate,
        metrics.max_abs_error,
        metrics.cosine_similarity,
        metrics.kl_divergence,
    ]
    .map(|cell| cell.map_or_else(|| "NaN".to_string(), |v| v.to_string()))
}

fn extra_cells(metrics: &MetricColumns, names: &[&str]) -> Vec<String> {
    names
        .iter()
        .map(|name| metrics.extra.get(*name).map_or_else(|| "NaN".to_string(), f64::to_string))
        .collect()
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn csv_line(cells: &[String]) -> String {
    cells.iter().map(|c| csv_field(c)).collect::<Vec<_>>().join(",")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub no_actual_output: usize,
    pub unsupported: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub cases: Vec<CaseOutcome>,
}

impl VerificationReport {
    #[must_use]
    pub fn new(cases: Vec<CaseOutcome>) -> Self {
        Self { cases }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    #[must_use]
    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary {
            total: self.cases.len(),
            ..ReportSummary::default()
        };
        for case in &self.cases {
            match case.information {
                ExecutedInformation::Pass => summary.passed += 1,
                ExecutedInformation::Failed => summary.failed += 1,
                ExecutedInformation::Skipped => summary.skipped += 1,
                ExecutedInformation::NoActualOutput => summary.no_actual_output += 1,
                ExecutedInformation::Unsupported => summary.unsupported += 1,
            }
        }
        summary
    }

    /// Names of the extra metric columns present in any row, sorted.
    #[must_use]
    pub fn extra_metric_names(&self) -> Vec<&str> {
        let names: BTreeSet<&str> = self
            .cases
            .iter()
            .flat_map(|case| &case.tensors)
            .flat_map(|tensor| tensor.metrics.extra.keys())
            .map(String::as_str)
            .collect();
        names.into_iter().collect()
    }

    #[must_use]
    pub fn to_csv(&self) -> String {
        let extra = self.extra_metric_names();
        let header: Vec<String> = CSV_HEADER
            .iter()
            .chain(&extra)
            .map(|h| (*h).to_string())
            .collect();
        let mut out = csv_line(&header);
        out.push('\n');
        for row in self.cases.iter().flat_map(|case| case.csv_rows(&extra)) {
            out.push_str(&csv_line(&row));
            out.push('\n');
        }
        out
    }

    /// Writes `opcheck_result_<millis>.csv` and its `.json` sidecar under
    /// `output_dir`. Returns `None` without touching the disk when empty.
    pub fn write(&self, output_dir: &Path) -> Result<Option<PathBuf>, String> {
        if self.is_empty() {
            return Ok(None);
        }
        fs::create_dir_all(output_dir)
            .map_err(|err| format!("failed creating {}: {err}", output_dir.display()))?;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        let csv_path = output_dir.join(format!("opcheck_result_{stamp}.csv"));
        fs::write(&csv_path, self.to_csv())
            .map_err(|err| format!("failed writing {}: {err}", csv_path.display()))?;

        let json_path = csv_path.with_extension("json");
        let sidecar = serde_json::to_string_pretty(&Sidecar {
            summary: self.summary(),
            report: self,
        })
        .map_err(|err| format!("failed serializing verification report: {err}"))?;
        fs::write(&json_path, sidecar)
            .map_err(|err| format!("failed writing {}: {err}", json_path.display()))?;
        Ok(Some(csv_path))
    }
}

#[derive(Serialize)]
struct Sidecar<'a> {
    summary: ReportSummary,
    report: &'a VerificationReport,
}
