//! Error types for sheetflow
//!
//! Cell- and field-level problems (conversion, validation) are not errors in
//! this enum: they travel as plain values and are aggregated into counts and
//! reports. This enum covers the failures that end a sheet or a job.

use thiserror::Error;

/// Result type alias for sheetflow operations
pub type Result<T> = std::result::Result<T, SheetflowError>;

/// How far an error reaches: callers inspect this to decide whether to
/// continue with the remaining work or stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The current sheet is lost; other sheets may proceed
    Sheet,
    /// The whole job is lost
    Job,
}

/// Main error type for sheetflow
#[derive(Error, Debug)]
pub enum SheetflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("workbook container error: {0}")]
    Container(String),

    #[error("XML error in sheet part: {0}")]
    Xml(String),

    #[error("sheet not found: {0}")]
    SheetNotFound(String),

    #[error("error threshold exceeded: {errors} row errors by row {row}")]
    ErrorThreshold { errors: u64, row: u32 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("workbook write error: {0}")]
    Write(String),

    #[error("staging store error: {0}")]
    Staging(String),

    #[error("insert stage error: {0}")]
    Stage(String),

    #[error("job cancelled")]
    Cancelled,

    #[error("unknown job: {0}")]
    JobNotFound(String),
}

impl SheetflowError {
    /// Blast radius of this error.
    pub fn severity(&self) -> Severity {
        match self {
            // A missing/corrupt container or an unknown job kills the job
            SheetflowError::Container(_)
            | SheetflowError::Config(_)
            | SheetflowError::JobNotFound(_)
            | SheetflowError::Cancelled => Severity::Job,
            _ => Severity::Sheet,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        assert_eq!(
            SheetflowError::Container("bad zip".into()).severity(),
            Severity::Job
        );
        assert_eq!(
            SheetflowError::ErrorThreshold { errors: 11, row: 42 }.severity(),
            Severity::Sheet
        );
        assert_eq!(
            SheetflowError::Stage("constraint violation".into()).severity(),
            Severity::Sheet
        );
    }

    #[test]
    fn test_error_display() {
        let err = SheetflowError::ErrorThreshold { errors: 10, row: 99 };
        assert_eq!(
            err.to_string(),
            "error threshold exceeded: 10 row errors by row 99"
        );
    }
}
