//! Error types for the OCI monitor
//!
//! All fallible operations in the crate return [`Result`]. Process-fatal
//! conditions met during startup are classified by [`StartupError`], which
//! carries the exit code the daemon terminates with.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Local I/O failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// HTTP client failure talking to the downstream service
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// A host command ran but exited unsuccessfully
    #[error("Command `{command}` failed with exit code {code:?}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    /// Container runtime collaborator failure
    #[error("Container runtime error: {0}")]
    RuntimeError(String),

    /// Image could not be pulled
    #[error("Could not pull {image}: {reason}")]
    PullFailed { image: String, reason: String },

    /// Installer container failed to stage the new bundle
    #[error("Could not stage {image}: {reason}")]
    StageFailed { image: String, reason: String },

    /// Promoting the staged bundle into the live location failed
    #[error("Bundle swap failed: {0}")]
    SwapFailed(String),

    /// Service request verb outside the supported set
    #[error("Unsupported service request: {0}")]
    UnsupportedRequest(String),

    /// Cordon/drain coordination failure
    #[error("Drain error: {0}")]
    DrainError(String),

    /// The node watch stream reported an error
    #[error("Watch error: {0}")]
    WatchError(#[from] kube::runtime::watcher::Error),

    /// This node could not be located in the cluster
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl Error {
    /// Captured output of a failed host command, empty otherwise.
    pub fn command_output(&self) -> &str {
        match self {
            Error::CommandFailed { output, .. } => output,
            _ => "",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Process-fatal startup conditions
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("required host mounts missing: {0}")]
    MissingMounts(String),

    #[error("could not determine own container: {0}")]
    NotInContainer(String),

    #[error("could not find this node in the cluster: {0}")]
    NodeNotFound(String),

    #[error("initial {operation} failed: {source}")]
    InitialOperation {
        operation: &'static str,
        #[source]
        source: Error,
    },

    #[error("startup failed: {0}")]
    Other(#[from] Error),
}

impl StartupError {
    /// Exit status reported to the supervisor for this condition.
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::MissingMounts(_) => 2,
            StartupError::NotInContainer(_) => 3,
            StartupError::NodeNotFound(_) => 4,
            StartupError::InitialOperation { .. } => 5,
            StartupError::Other(_) => 6,
        }
    }
}
