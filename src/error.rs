use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the pipeline
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Error types for the consolidation and balancing stages
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// A data.yaml descriptor could not be parsed
    #[error("Malformed descriptor {path:?}: {source}")]
    Descriptor {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// An input image or label file could not be read
    #[error("Unreadable source {path:?}: {source}")]
    UnreadableSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A path does not follow the images/labels layout
    #[error("Path does not follow the images/labels layout: {path:?}")]
    LayoutMismatch { path: PathBuf },

    /// Writing into the output location failed
    #[error("Cannot write {path:?}: {source}")]
    OutputIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The worker pool could not be started
    #[error("Worker pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl PipelineError {
    pub fn unreadable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::UnreadableSource {
            path: path.into(),
            source,
        }
    }

    pub fn output(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::OutputIo {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure only affects a single entry, which can be skipped.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::UnreadableSource { .. } | PipelineError::LayoutMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        let io = || std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(PipelineError::unreadable("a.png", io()).is_recoverable());
        assert!(PipelineError::LayoutMismatch {
            path: PathBuf::from("x/a.png")
        }
        .is_recoverable());
        assert!(!PipelineError::output("out/a.png", io()).is_recoverable());
        assert!(!PipelineError::Config("bad".to_string()).is_recoverable());
    }
}
