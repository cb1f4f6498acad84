use anyhow::anyhow;
use thiserror::Error;

use crate::failure::FailureCause;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    InvalidConfig(anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("workflow input error: {0}")]
    WorkflowInput(anyhow::Error),
    #[error(transparent)]
    Logging(anyhow::Error),
    #[error(transparent)]
    Simulation(#[from] FailureCause),
    #[error(transparent)]
    Others(#[from] anyhow::Error),
}

/// A type alias that forces the usage of the custom error type.
pub type Result<T> = std::result::Result<T, Error>;

impl From<tracing::subscriber::SetGlobalDefaultError> for Error {
    fn from(err: tracing::subscriber::SetGlobalDefaultError) -> Self {
        Self::Logging(anyhow::Error::from(err))
    }
}

impl From<tracing_subscriber::util::TryInitError> for Error {
    fn from(err: tracing_subscriber::util::TryInitError) -> Self {
        Self::Logging(anyhow::Error::from(err))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::InvalidConfig(anyhow::Error::from(err))
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Self::WorkflowInput(anyhow::Error::from(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::WorkflowInput(anyhow::Error::from(err))
    }
}

impl From<roxmltree::Error> for Error {
    fn from(err: roxmltree::Error) -> Self {
        Self::WorkflowInput(anyhow::Error::from(err))
    }
}

impl Error {
    pub fn adhoc(msg: &'static str) -> Self {
        Self::Others(anyhow!(msg))
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(anyhow!(msg.into()))
    }

    pub fn workflow_input(msg: impl Into<String>) -> Self {
        Self::WorkflowInput(anyhow!(msg.into()))
    }
}
