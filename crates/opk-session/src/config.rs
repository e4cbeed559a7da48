use std::fs;
use std::path::{Path, PathBuf};

use opk_compare::{MetricRegistry, ToleranceConfig};
use opk_runtime::{ConfigError, LogLevel, PrecisionMode, RunMode, SocVersion};
use serde::{Deserialize, Serialize};

/// Everything a verification run needs, threaded explicitly through the
/// session. Loaded from JSON and then overridden by command-line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub mode: RunMode,
    /// Record manifest in single mode, dump directory in autofuse mode.
    pub input: PathBuf,
    pub graph_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Id prefixes; `"3"` admits `3` and `3_*`.
    pub operation_ids: Vec<String>,
    /// Case-insensitive substrings of the operator name.
    pub operation_names: Vec<String>,
    pub precision_metrics: Vec<String>,
    pub precision_mode: PrecisionMode,
    pub tolerances: ToleranceConfig,
    pub num_workers: usize,
    pub rerun: bool,
    pub log_level: LogLevel,
    pub soc_version: SocVersion,
    pub case_log_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Single,
            input: PathBuf::new(),
            graph_path: None,
            output_dir: PathBuf::from("."),
            operation_ids: Vec::new(),
            operation_names: Vec::new(),
            precision_metrics: Vec::new(),
            precision_mode: PrecisionMode::Keep,
            tolerances: ToleranceConfig::default(),
            num_workers: 1,
            rerun: false,
            log_level: LogLevel::Info,
            soc_version: SocVersion::Ascend910B,
            case_log_path: None,
        }
    }
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = fs::read_to_string(path)
            .map_err(|err| format!("failed reading {}: {err}", path.display()))?;
        serde_json::from_str(&raw).map_err(|err| format!("failed parsing {}: {err}", path.display()))
    }

    /// Rejects configurations that would abort the run later. Nothing has
    /// been read yet when this fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == RunMode::Autofuse && self.graph_path.is_none() {
            return Err(ConfigError::MissingGraphPath);
        }
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidWorkerCount(self.num_workers));
        }
        if let Err(reason) = self.tolerances.validate() {
            return Err(ConfigError::InvalidValue {
                field: "tolerances",
                value: reason,
            });
        }
        let metrics = MetricRegistry::with_builtins();
        if let Some(unknown) = self.precision_metrics.iter().find(|m| !metrics.contains(m)) {
            return Err(ConfigError::InvalidValue {
                field: "precision_metrics",
                value: unknown.clone(),
            });
        }
        if !self.input.as_os_str().is_empty() && !self.input.exists() {
            return Err(ConfigError::InputNotFound(self.input.display().to_string()));
        }
        Ok(())
    }

    /// Parallel execution is disabled when rerunning so cases replay in order.
    #[must_use]
    pub const fn parallel(&self) -> bool {
        self.num_workers > 1 && !self.rerun
    }
}

#[cfg(test)]
mod tests {
    use super::SessionConfig;
    use opk_runtime::{ConfigError, RunMode};
    use std::path::PathBuf;

    #[test]
    fn autofuse_requires_graph_path() {
        let cfg = SessionConfig {
            mode: RunMode::Autofuse,
            ..SessionConfig::default()
        };
        let err = cfg.validate().expect_err("graph path missing");
        assert_eq!(err, ConfigError::MissingGraphPath);
        assert!(err.to_string().contains("must be used together with parameter '--graph-path'"));
    }

    #[test]
    fn rejects_zero_workers_and_unknown_metrics() {
        let cfg = SessionConfig {
            num_workers: 0,
            ..SessionConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidWorkerCount(0)));

        let cfg = SessionConfig {
            precision_metrics: vec!["abs".to_string(), "ulp".to_string()],
            ..SessionConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { field: "precision_metrics", .. })
        ));
    }

    #[test]
    fn missing_input_is_reported() {
        let cfg = SessionConfig {
            input: PathBuf::from("/definitely/not/here.json"),
            ..SessionConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InputNotFound(_))));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: SessionConfig =
            serde_json::from_str(r#"{"num_workers": 4, "precision_mode": "force_fp16"}"#)
                .expect("partial config");
        assert_eq!(cfg.num_workers, 4);
        assert!(cfg.parallel());
        assert_eq!(cfg.mode, RunMode::Single);
        assert!(cfg.validate().is_ok());

        let rerun = SessionConfig {
            rerun: true,
            ..cfg
        };
        assert!(!rerun.parallel());
    }
}
