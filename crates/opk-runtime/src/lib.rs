#![forbid(unsafe_code)]

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use opk_dtype::DType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Verify a record manifest directly.
    #[default]
    Single,
    /// Derive records from a serialized graph and its dump directory.
    Autofuse,
}

impl RunMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Autofuse => "autofuse",
        }
    }
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "op" => Ok(Self::Single),
            "autofuse" | "graph" => Ok(Self::Autofuse),
            other => Err(ConfigError::InvalidValue {
                field: "mode",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "fatal" | "critical" => Ok(Self::Fatal),
            other => Err(ConfigError::InvalidValue {
                field: "log_level",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionMode {
    #[default]
    Keep,
    ForceFp16,
    ForceFp32,
}

impl PrecisionMode {
    /// Dtype an input of `dtype` is converted to before golden computation.
    /// Integer and bool inputs are never touched.
    #[must_use]
    pub const fn target_dtype(self, dtype: DType) -> DType {
        match (self, dtype) {
            (Self::Keep, d) => d,
            (Self::ForceFp16, DType::F16 | DType::BF16 | DType::F32) => DType::F16,
            (Self::ForceFp32, DType::F16 | DType::BF16 | DType::F32) => DType::F32,
            (_, d) => d,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Keep => "keep",
            Self::ForceFp16 => "force_fp16",
            Self::ForceFp32 => "force_fp32",
        }
    }
}

impl FromStr for PrecisionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" => Ok(Self::Keep),
            "force_fp16" | "fp16" => Ok(Self::ForceFp16),
            "force_fp32" | "fp32" => Ok(Self::ForceFp32),
            other => Err(ConfigError::InvalidValue {
                field: "precision_mode",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocVersion {
    Ascend310P,
    Ascend910A,
    #[default]
    Ascend910B,
}

impl SocVersion {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ascend310P => "Ascend310P",
            Self::Ascend910A => "Ascend910A",
            Self::Ascend910B => "Ascend910B",
        }
    }

    /// 910B parts use the ND cache layout and support the collective linear
    /// kernels.
    #[must_use]
    pub const fn is_910b_class(self) -> bool {
        matches!(self, Self::Ascend910B)
    }
}

impl FromStr for SocVersion {
    type Err = ConfigError;

    /// Accepts the family name or a concrete part name (`Ascend910B3`,
    /// `Ascend310P1`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        if lower.starts_with("ascend910b") || lower.starts_with("ascend910_9") {
            Ok(Self::Ascend910B)
        } else if lower.starts_with("ascend910") {
            Ok(Self::Ascend910A)
        } else if lower.starts_with("ascend310p") {
            Ok(Self::Ascend310P)
        } else {
            Err(ConfigError::InvalidValue {
                field: "soc_version",
                value: s.trim().to_string(),
            })
        }
    }
}

/// What golden kernels may ask about the device that produced the actual
/// outputs. Verification runs supply [`HostBackend`]; tests supply their own.
pub trait HardwareBackend: Send + Sync {
    fn soc_version(&self) -> SocVersion;

    fn is_910b(&self) -> bool {
        self.soc_version().is_910b_class()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostBackend {
    soc: SocVersion,
}

impl HostBackend {
    #[must_use]
    pub const fn new(soc: SocVersion) -> Self {
        Self { soc }
    }
}

impl HardwareBackend for HostBackend {
    fn soc_version(&self) -> SocVersion {
        self.soc
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingGraphPath,
    InvalidValue { field: &'static str, value: String },
    InvalidWorkerCount(usize),
    InputNotFound(String),
}

impl ConfigError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::MissingGraphPath => "config_missing_graph_path",
            Self::InvalidValue { .. } => "config_invalid_value",
            Self::InvalidWorkerCount(_) => "config_invalid_worker_count",
            Self::InputNotFound(_) => "config_input_not_found",
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingGraphPath => write!(
                f,
                "parameter '--mode autofuse' must be used together with parameter '--graph-path'"
            ),
            Self::InvalidValue { field, value } => {
                write!(f, "invalid value {value:?} for {field}")
            }
            Self::InvalidWorkerCount(n) => write!(f, "num_workers must be >= 1, got {n}"),
            Self::InputNotFound(path) => write!(f, "input path {path} does not exist"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
    Created,
    Validated,
    Computed,
    Compared,
    Reported,
    Skipped,
    Failed,
}

impl CaseState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Reported | Self::Skipped)
    }

    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        use CaseState::*;
        matches!(
            (self, next),
            (Created, Validated)
                | (Created, Skipped)
                | (Validated, Computed)
                | (Validated, Failed)
                | (Computed, Compared)
                | (Computed, Failed)
                | (Computed, Reported)
                | (Compared, Reported)
                | (Compared, Failed)
                | (Failed, Reported)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseEvent {
    pub ts_millis: u128,
    pub state: CaseState,
    pub note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: CaseState,
    pub to: CaseState,
}

impl std::fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "case cannot move from {:?} to {:?}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// Ordered state transitions of one verified case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseLedger {
    events: Vec<CaseEvent>,
}

impl Default for CaseLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl CaseLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: vec![CaseEvent {
                ts_millis: now_millis(),
                state: CaseState::Created,
                note: String::new(),
            }],
        }
    }

    pub fn advance(
        &mut self,
        state: CaseState,
        note: impl Into<String>,
    ) -> Result<(), IllegalTransition> {
        let from = self.state();
        if !from.can_advance_to(state) {
            return Err(IllegalTransition { from, to: state });
        }
        self.events.push(CaseEvent {
            ts_millis: now_millis(),
            state,
            note: note.into(),
        });
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> CaseState {
        self.events
            .last()
            .map_or(CaseState::Created, |event| event.state)
    }

    #[must_use]
    pub fn events(&self) -> &[CaseEvent] {
        &self.events
    }

    #[must_use]
    pub fn states(&self) -> Vec<CaseState> {
        self.events.iter().map(|event| event.state).collect()
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

#[cfg(test)]
mod tests {
    use super::{
        CaseLedger, CaseState, ConfigError, HardwareBackend, HostBackend, LogLevel, PrecisionMode,
        RunMode, SocVersion,
    };
    use opk_dtype::DType;

    #[test]
    fn parses_run_configuration_tokens() {
        assert_eq!("autofuse".parse::<RunMode>(), Ok(RunMode::Autofuse));
        assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warning));
        assert_eq!("force_fp32".parse::<PrecisionMode>(), Ok(PrecisionMode::ForceFp32));
        assert!(matches!(
            "verbose".parse::<LogLevel>(),
            Err(ConfigError::InvalidValue { field: "log_level", .. })
        ));
    }

    #[test]
    fn soc_part_names_map_to_families() {
        assert_eq!("Ascend910B3".parse::<SocVersion>(), Ok(SocVersion::Ascend910B));
        assert_eq!("Ascend310P1".parse::<SocVersion>(), Ok(SocVersion::Ascend310P));
        assert_eq!("Ascend910PremiumA".parse::<SocVersion>(), Ok(SocVersion::Ascend910A));
        assert!("Kunpeng".parse::<SocVersion>().is_err());
        assert!(HostBackend::new(SocVersion::Ascend910B).is_910b());
        assert!(!HostBackend::new(SocVersion::Ascend310P).is_910b());
    }

    #[test]
    fn precision_mode_leaves_integers_alone() {
        assert_eq!(PrecisionMode::ForceFp16.target_dtype(DType::F32), DType::F16);
        assert_eq!(PrecisionMode::ForceFp32.target_dtype(DType::BF16), DType::F32);
        assert_eq!(PrecisionMode::ForceFp16.target_dtype(DType::I32), DType::I32);
        assert_eq!(PrecisionMode::Keep.target_dtype(DType::F32), DType::F32);
        assert_eq!(PrecisionMode::ForceFp32.target_dtype(DType::F64), DType::F64);
    }

    #[test]
    fn missing_graph_path_message_names_flag() {
        let message = ConfigError::MissingGraphPath.to_string();
        assert!(message.contains("must be used together with parameter '--graph-path'"));
    }

    #[test]
    fn ledger_follows_happy_path() {
        let mut ledger = CaseLedger::new();
        for state in [
            CaseState::Validated,
            CaseState::Computed,
            CaseState::Compared,
            CaseState::Reported,
        ] {
            ledger.advance(state, "").expect("transition");
        }
        assert_eq!(
            ledger.states(),
            vec![
                CaseState::Created,
                CaseState::Validated,
                CaseState::Computed,
                CaseState::Compared,
                CaseState::Reported,
            ]
        );
        assert!(ledger.state().is_terminal());
    }

    #[test]
    fn ledger_rejects_skipping_compute() {
        let mut ledger = CaseLedger::new();
        ledger.advance(CaseState::Validated, "ok").expect("validated");
        let err = ledger
            .advance(CaseState::Compared, "early")
            .expect_err("must compute first");
        assert_eq!(err.from, CaseState::Validated);
        ledger.advance(CaseState::Failed, "IndexError").expect("failed");
        ledger.advance(CaseState::Reported, "").expect("reported");
    }

    #[test]
    fn enums_serialize_as_snake_case() {
        let json = serde_json::to_string(&PrecisionMode::ForceFp16).expect("serialize");
        assert_eq!(json, "\"force_fp16\"");
        let level: LogLevel = serde_json::from_str("\"warning\"").expect("deserialize");
        assert_eq!(level, LogLevel::Warning);
    }
}
