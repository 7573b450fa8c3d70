use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid allocator configuration: {0}")]
    Config(#[from] hpha::ConfigError),
    #[error("allocation of {size} bytes failed at step {step}")]
    OutOfMemory { step: usize, size: usize },
    #[error("invariant violated at step {step}: {detail}")]
    Invariant { step: usize, detail: String },
    #[error("worker thread panicked")]
    WorkerPanicked,
    #[error("invalid option: {0}")]
    InvalidOption(String),
}
