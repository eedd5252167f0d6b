//! Error types for Portfolio Assist.

/// Top-level error type for the desk.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Account '{account}' is not valid")]
    InvalidAccount { account: String },

    #[error("No stocks given for account {account}")]
    EmptyUniverse { account: String },

    #[error("Executor is shutting down, job {id} was not scheduled")]
    ExecutorClosed { id: String },
}

/// Workflow graph construction and step execution errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow {workflow} has no entry step")]
    MissingEntry { workflow: String },

    #[error("Step {step} is registered twice")]
    DuplicateStep { step: String },

    #[error("Edge references unknown step {step}")]
    UnknownStep { step: String },

    #[error("Step {step} has no outgoing edge")]
    MissingEdge { step: String },

    #[error("Step {step} needs field {field}, which is not set yet")]
    MissingField { step: String, field: String },

    #[error("Step {step} failed: {source}")]
    Service {
        step: String,
        #[source]
        source: ServiceError,
    },

    #[error("Branch from {step} routed to unknown step {target}")]
    BadRoute { step: String, target: String },
}

/// Errors raised by the external domain services.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Batch job {id} is unknown to the batch service")]
    UnknownBatchJob { id: String },

    #[error("{service} request failed: {reason}")]
    RequestFailed { service: String, reason: String },

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),
}

/// Artifact construction errors.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Artifact field {field} must not be empty")]
    EmptyField { field: &'static str },
}

/// Intent classifier errors.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Classifier returned an invalid response: {reason}")]
    InvalidResponse { reason: String },
}

/// Result type alias for the desk.
pub type Result<T> = std::result::Result<T, Error>;
