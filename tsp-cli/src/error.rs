use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] tsp_core::PipelineError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] tsp_core::PluginError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Pipeline task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
