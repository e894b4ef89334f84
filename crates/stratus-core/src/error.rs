//! Error taxonomy shared by every Stratus action.

use thiserror::Error;

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can end a lifecycle action.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error(
        "there are already instances running in group {coordinator_group} or {worker_group}"
    )]
    ClusterOccupied {
        coordinator_group: String,
        worker_group: String,
    },

    #[error(
        "failed to ssh to remote host {host}; check that the correct identity file \
         and key pair were provided and try again"
    )]
    RemoteAuth { host: String },

    #[error("remote command on {host} exited with status {code}")]
    RemoteCommand { host: String, code: i32 },

    #[error("provider request {operation} failed: {message}")]
    ProviderRequest { operation: String, message: String },

    #[error(
        "failed to delete all security groups after {attempts} attempts, remaining: {}; \
         try re-running in a few minutes",
        remaining.join(", ")
    )]
    PartialTeardown { attempts: u32, remaining: Vec<String> },

    #[error("spot acquisition interrupted ({reason}); {running} instance(s) still running")]
    SpotAcquisitionInterrupted {
        reason: String,
        running: usize,
        operator_cancelled: bool,
    },

    #[error("wait cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short, stable name of the error kind for operator messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "ConfigurationError",
            Error::ClusterNotFound(_) => "ClusterNotFoundError",
            Error::ClusterOccupied { .. } => "ClusterOccupiedError",
            Error::RemoteAuth { .. } => "RemoteAuthError",
            Error::RemoteCommand { .. } => "RemoteCommandError",
            Error::ProviderRequest { .. } => "ProviderRequestError",
            Error::PartialTeardown { .. } => "PartialTeardownError",
            Error::SpotAcquisitionInterrupted { .. } => "SpotAcquisitionInterrupted",
            Error::Cancelled => "Cancelled",
            Error::Io(_) => "IoError",
        }
    }

    /// An operator cancel of spot acquisition that left nothing running is a
    /// clean abort, not a failure.
    pub fn is_clean_abort(&self) -> bool {
        matches!(
            self,
            Error::SpotAcquisitionInterrupted {
                running: 0,
                operator_cancelled: true,
                ..
            }
        )
    }
}
