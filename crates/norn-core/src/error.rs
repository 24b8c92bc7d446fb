use thiserror::Error;

#[derive(Debug, Error)]
pub enum NornError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NornError {
    /// Short, stable error code for CLI output and structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            NornError::Config(_) => "CONFIG_ERROR",
            NornError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, NornError>;
