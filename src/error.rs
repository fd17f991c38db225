use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ShoveyError {
    #[error("Job has no target nodes")]
    EmptyTargets,

    #[error("Job command is empty")]
    EmptyCommand,

    #[error("Invalid quorum: {0}")]
    InvalidQuorum(String),

    #[error("Run timeout must be greater than zero")]
    InvalidTimeout,

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("No run for node {node} in job {job_id}")]
    RunNotFound { job_id: Uuid, node: String },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Message bus error: {0}")]
    Bus(String),

    #[error("Target resolution failed: {0}")]
    Resolve(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error("Job table is at capacity")]
    JobTableFull,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShoveyError {
    /// Errors caused by the caller's request rather than the server.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            ShoveyError::EmptyTargets
                | ShoveyError::EmptyCommand
                | ShoveyError::InvalidQuorum(_)
                | ShoveyError::InvalidTimeout
                | ShoveyError::Resolve(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ShoveyError::JobNotFound(_)
                | ShoveyError::RunNotFound { .. }
                | ShoveyError::NodeNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ShoveyError>;
