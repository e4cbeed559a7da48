#![forbid(unsafe_code)]

pub mod contract;
pub mod error;
pub mod golden;
pub mod param;
pub mod registry;

pub use contract::{ExecuteError, Execution, Operator, ValidatedOperator, ValidationOutcome};
pub use error::{GOLDEN_REASON_CODES, GoldenError};
pub use golden::golden_calc;
pub use param::OpParam;
pub use registry::OpKind;
