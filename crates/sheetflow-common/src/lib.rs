//! Sheetflow Common Library
//!
//! Shared error handling and logging for the sheetflow workspace.
//!
//! - **Error Handling**: the `SheetflowError` taxonomy and `Result` alias
//! - **Logging**: tracing subscriber setup with console/file outputs

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{Result, Severity, SheetflowError};
