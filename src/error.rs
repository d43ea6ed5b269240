//! Error types for runejail

use thiserror::Error;

/// Result type for runejail operations
pub type Result<T> = std::result::Result<T, JailError>;

/// runejail error types
///
/// Every variant is fatal: the pipeline stops at the first error and the
/// binary reports it.
#[derive(Error, Debug)]
pub enum JailError {
    #[error("Invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Failed to fetch manifest: {0}")]
    ManifestFetch(String),

    #[error("Unsupported manifest type: {0}")]
    UnsupportedManifest(String),

    #[error("Failed to fetch layer {digest}: {message}")]
    LayerFetch { digest: String, message: String },

    #[error("Failed to extract layer {digest}: {message}")]
    Extraction { digest: String, message: String },

    #[error("Failed to launch isolated process: {0}")]
    Launch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JailError {
    pub(crate) fn layer_fetch(digest: &str, message: impl ToString) -> Self {
        JailError::LayerFetch {
            digest: digest.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn extraction(digest: &str, message: impl ToString) -> Self {
        JailError::Extraction {
            digest: digest.to_string(),
            message: message.to_string(),
        }
    }
}
