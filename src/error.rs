use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum UploadError {
    #[error("malformed workbook {file}: {reason}")]
    MalformedWorkbook { file: String, reason: String },

    #[error("failed to read workbook {0}: {1}")]
    Workbook(PathBuf, String),

    #[error("missing required setting {0}")]
    MissingSetting(&'static str),

    #[error("invalid value for setting {name}: {value}")]
    InvalidSetting { name: &'static str, value: String },

    #[error("QBench request failed: {0}")]
    QBenchHttp(String),

    #[error("QBench returned status {status}: {message}")]
    QBenchStatus { status: u16, message: String },

    #[error("QBench authentication failed: {0}")]
    QBenchAuth(String),

    #[error("unexpected QBench payload: {0}")]
    QBenchPayload(String),

    #[error("results were delivered to QBench but the backup record failed: {0}")]
    Audit(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl UploadError {
    pub fn malformed(file: impl Into<String>, reason: impl Into<String>) -> Self {
        UploadError::MalformedWorkbook {
            file: file.into(),
            reason: reason.into(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            UploadError::QBenchHttp(_)
                | UploadError::QBenchStatus { .. }
                | UploadError::QBenchAuth(_)
                | UploadError::QBenchPayload(_)
        )
    }
}
