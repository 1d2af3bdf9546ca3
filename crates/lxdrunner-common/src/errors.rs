// Error taxonomy for LXDRunner.
// Each enum belongs to one stage of a job's life; failures are contained at
// the stage boundary and never escape the dispatch loop.

use crate::models::LabelSet;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration could not be located, parsed or validated.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration file found (searched: {0})")]
    NotFound(String),

    #[error("failed to read configuration {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A job was refused at admission. Never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("no matching runner configuration for labels {0}")]
    NoMatchingConfig(LabelSet),
}

/// Failure talking to the fleet management API.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("fleet API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("operation {operation} failed: {message}")]
    Operation { operation: String, message: String },

    #[error("fleet transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("event stream error: {0}")]
    Stream(String),

    #[error("unexpected fleet response: {0}")]
    Decode(String),
}

impl FleetError {
    /// Whether the error means the addressed resource does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            FleetError::NotFound(_) => true,
            FleetError::Api { status, .. } => *status == 404,
            _ => false,
        }
    }
}

/// Failure talking to the CI provider.
#[derive(Debug, Error)]
pub enum CiError {
    #[error("access denied: {0}")]
    Forbidden(String),

    #[error("CI provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("CI transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected CI response: {0}")]
    Decode(String),
}

/// Failure while driving one instance through its lifecycle.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("verification failed: {}", .0.join("; "))]
    Verification(Vec<String>),

    #[error("failed to launch {instance}: {source}")]
    Launch {
        instance: String,
        #[source]
        source: FleetError,
    },

    #[error("failed to provision {instance}: {reason}")]
    Provisioning { instance: String, reason: String },

    #[error("guest agent of {instance} unreachable after {attempts} attempts")]
    GuestUnreachable { instance: String, attempts: u32 },

    #[error("failed to clean up {instance}: {source}")]
    Cleanup {
        instance: String,
        #[source]
        source: FleetError,
    },
}

/// Failure while refreshing or reading the runner package cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to fetch runner releases: {0}")]
    Feed(#[source] CiError),

    #[error("no stable runner release published")]
    NoRelease,

    #[error("unrecognised runner asset name: {0}")]
    AssetName(String),

    #[error("no runner package for {os}/{arch}")]
    NoPackage { os: String, arch: String },

    #[error("failed to download {filename}: {reason}")]
    Download { filename: String, reason: String },

    #[error("package cache I/O failed: {0}")]
    Io(String),
}

/// Failure of one dispatched job before or during launch.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("registration token for {scope}: {source}")]
    Token {
        scope: String,
        #[source]
        source: CiError,
    },

    #[error(transparent)]
    Package(#[from] CacheError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        assert!(FleetError::NotFound("lxdrunner-abc".into()).is_not_found());
        assert!(FleetError::Api {
            status: 404,
            message: "Instance not found".into()
        }
        .is_not_found());
        assert!(!FleetError::Api {
            status: 500,
            message: "boom".into()
        }
        .is_not_found());
    }

    #[test]
    fn test_verification_message_lists_every_problem() {
        let err = LifecycleError::Verification(vec![
            "image does not exist: jammy".into(),
            "profile does not exist: gpu".into(),
        ]);
        assert_eq!(
            err.to_string(),
            "verification failed: image does not exist: jammy; profile does not exist: gpu"
        );
    }

    #[test]
    fn test_admission_message() {
        let labels = LabelSet::new(["self-hosted", "linux"]);
        let err = AdmissionError::NoMatchingConfig(labels);
        assert_eq!(
            err.to_string(),
            "no matching runner configuration for labels {linux,self-hosted}"
        );
    }
}
