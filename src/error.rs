use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unreadable file: {0}")]
    UnreadableFile(String),

    #[error("File too large: {0}")]
    FileTooLarge(String),

    #[error("Workbook contains no sheets")]
    EmptyWorkbook,

    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid metric schema: {0}")]
    InvalidSchema(String),

    #[error("Failed to persist report {upload_id}: {details}")]
    Persistence { upload_id: String, details: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PipelineError {
    /// Input errors abort the run before any table is processed.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::UnreadableFile(_) | Self::FileTooLarge(_) | Self::EmptyWorkbook
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
