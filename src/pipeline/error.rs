//! Media pipeline error types

use thiserror::Error;

/// Errors raised by the media engine or the pipeline controller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Invalid pipeline spec: {0}")]
    InvalidSpec(String),

    #[error("Failed to start pipeline: {0}")]
    Start(String),

    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("Pipeline bus error: {0}")]
    Bus(String),

    #[error("End of stream")]
    EndOfStream,

    #[error("Pipeline stopped")]
    Stopped,
}
