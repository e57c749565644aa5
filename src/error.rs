//! Error types for swe-kiln operations.
//!
//! Defines error types for the major subsystems:
//! - Dataset streaming from HuggingFace
//! - Instance spec resolution (tables, manifests, descriptor fields)
//! - Layered Docker image builds
//! - Two-step differential validation

use thiserror::Error;

/// Errors that can occur while streaming instance rows from a dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Dataset API returned status {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("Failed to parse dataset response: {0}")]
    Parse(String),

    #[error("Instance '{0}' not found in dataset")]
    InstanceNotFound(String),
}

/// Errors that can occur while resolving a descriptor into an `InstanceSpec`.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("Unknown repo '{0}'")]
    UnknownRepo(String),

    #[error("Unknown version '{version}' for repo '{repo}'")]
    UnknownVersion { repo: String, version: String },

    #[error("Missing required field '{0}' in instance record")]
    MissingField(&'static str),

    #[error("Invalid FAIL_TO_PASS/PASS_TO_PASS payload: {0}")]
    InvalidTestList(String),

    #[error("Could not fetch {kind} for {repo}@{commit}: {reason}")]
    ManifestFetch {
        kind: &'static str,
        repo: String,
        commit: String,
        reason: String,
    },
}

/// Errors that can occur while building images.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Build of '{image}' failed: {message}")]
    Failed {
        image: String,
        message: String,
        /// Partial build log collected before the failing chunk.
        build_log: String,
    },

    #[error("Failed to prepare build context: {0}")]
    Context(String),

    #[error("Docker API error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during container-based validation.
///
/// Expected validation *failures* (tests misbehaving, unparsable output,
/// timeouts) are not errors — they are encoded in `ValidationResult`.
/// This type covers infrastructure faults only.
#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to create container from '{image}': {reason}")]
    ContainerCreate { image: String, reason: String },

    #[error("Container exec failed: {0}")]
    Exec(String),

    #[error("Docker API error: {0}")]
    Api(#[from] bollard::errors::Error),
}
