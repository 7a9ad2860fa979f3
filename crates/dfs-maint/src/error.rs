use thiserror::Error;

/// Errors raised by maintenance components and their collaborators.
#[derive(Debug, Error)]
pub enum MaintError {
    /// Cluster topology, identity source or local configuration is unusable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No usable credentials for the cluster.
    #[error("credentials: {0}")]
    Credentials(String),

    /// The scan root could not be listed.
    #[error("scan of {path} failed: {reason}")]
    Scan { path: String, reason: String },

    /// A collaborator command could not be run.
    #[error("command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    /// A collaborator command did not finish in time.
    #[error("command `{command}` timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// Collaborator output could not be understood.
    #[error("cannot parse {what}: {input:?}")]
    Parse { what: &'static str, input: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MaintError>;
