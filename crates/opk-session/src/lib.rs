#![forbid(unsafe_code)]

pub mod caselog;
pub mod config;
pub mod filter;
pub mod graph;
pub mod record;
pub mod report;
pub mod session;

pub use caselog::{CaseLogEntry, append_case_log};
pub use config::SessionConfig;
pub use filter::CaseFilter;
pub use graph::{GraphCase, OpInfo, bind_dump_files, collect_op_infos, graph_names};
pub use record::{Manifest, Record, TensorSource};
pub use report::{CaseOutcome, ExecutedInformation, ReportSummary, VerificationReport};
pub use session::{MISSING_RANK_REASON, Session, SessionOutput};
