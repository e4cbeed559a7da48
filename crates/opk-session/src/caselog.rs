use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use opk_runtime::CaseState;
use serde::{Deserialize, Serialize};

use crate::report::{CaseOutcome, ExecutedInformation};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseLogEntry {
    pub op_id: String,
    pub op_name: String,
    pub state: CaseState,
    pub outcome: ExecutedInformation,
    pub reason_code: String,
    pub fingerprint: String,
    pub ts_millis: u128,
}

impl CaseLogEntry {
    #[must_use]
    pub fn from_outcome(outcome: &CaseOutcome) -> Self {
        Self {
            op_id: outcome.op_id.clone(),
            op_name: outcome.op_name.clone(),
            state: outcome.ledger.state(),
            outcome: outcome.information,
            reason_code: outcome
                .reason_code
                .clone()
                .unwrap_or_else(|| "none".to_string()),
            fingerprint: outcome.fingerprint.clone(),
            ts_millis: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_millis()),
        }
    }
}

/// Appends one JSON line per entry, creating the file and its parent.
pub fn append_case_log(path: &Path, entries: &[CaseLogEntry]) -> Result<(), String> {
    if entries.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("failed creating {}: {err}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| format!("failed opening {}: {err}", path.display()))?;
    let mut payload = Vec::new();
    for entry in entries {
        let line = serde_json::to_string(entry)
            .map_err(|err| format!("failed serializing case log entry: {err}"))?;
        payload.extend_from_slice(line.as_bytes());
        payload.push(b'\n');
    }
    file.write_all(&payload)
        .map_err(|err| format!("failed appending case log {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::{CaseLogEntry, append_case_log};
    use crate::report::ExecutedInformation;
    use opk_runtime::CaseState;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn appends_one_line_per_entry() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock after epoch")
            .as_nanos();
        let path = std::env::temp_dir()
            .join(format!("opk_caselog_{nanos}"))
            .join("cases.jsonl");
        let entry = CaseLogEntry {
            op_id: "0".to_string(),
            op_name: "CumsumOperation".to_string(),
            state: CaseState::Reported,
            outcome: ExecutedInformation::Pass,
            reason_code: "none".to_string(),
            fingerprint: "f00d".to_string(),
            ts_millis: 1,
        };
        append_case_log(&path, std::slice::from_ref(&entry)).expect("first append");
        append_case_log(&path, &[entry.clone(), entry.clone()]).expect("second append");

        let raw = std::fs::read_to_string(&path).expect("log written");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: CaseLogEntry = serde_json::from_str(lines[2]).expect("jsonl line");
        assert_eq!(parsed, entry);
        assert!(lines[0].contains("\"outcome\":\"PASS\""));
        assert!(lines[0].contains("\"state\":\"reported\""));
    }
}
