//! Unified error types for PlotBot

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for all PlotBot operations
#[derive(Error, Debug)]
pub enum PlotError {
    // Startup errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown {family} component: {name}")]
    UnknownComponent { family: &'static str, name: String },

    // Instance lifecycle errors
    #[error("Failed to launch plotter: {0}")]
    Launch(String),

    #[error("Monitoring error: {0}")]
    Monitoring(String),

    #[error("Plotting failed: {0}")]
    PlottingFailure(String),

    // Destination errors
    #[error("Relocation error: {0}")]
    Relocation(String),

    #[error("Clearers could not free {required} bytes on {drive}")]
    ClearerExhausted { drive: PathBuf, required: u64 },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl PlotError {
    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// True for errors raised while validating configuration
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::UnknownComponent { .. })
    }
}

/// Result type alias using PlotError
pub type Result<T> = std::result::Result<T, PlotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_component_message() {
        let err = PlotError::UnknownComponent {
            family: "delay policy",
            name: "nope".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown delay policy component: nope");
        assert!(err.is_configuration());
    }

    #[test]
    fn test_io_is_not_configuration() {
        let err = PlotError::from(std::io::Error::other("disk gone"));
        assert!(!err.is_configuration());
        assert!(err.to_string().contains("disk gone"));
    }
}
