use std::io;

use thiserror::Error;

/// Failure taxonomy of the build pipeline. Every variant is fatal: the
/// pipeline halts and nothing is promoted to the output directory.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("resolution failed: {0}")]
    Resolution(String),

    #[error("environment is not relocatable: {0}")]
    Relocation(String),

    #[error("assembly failed: {0}")]
    Assembly(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl BuildError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        BuildError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::Resolution(_) => "resolution",
            BuildError::Relocation(_) => "relocation",
            BuildError::Assembly(_) => "assembly",
            BuildError::Configuration(_) => "configuration",
            BuildError::Io { .. } => "io",
        }
    }
}

pub type BuildResult<T> = Result<T, BuildError>;
