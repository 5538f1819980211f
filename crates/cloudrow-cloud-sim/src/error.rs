//! Simulated provider and table store error types

use cloudrow_engine::{EngineError, TransientKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Region not found: {0}")]
    RegionNotFound(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Dependency violation: {0}")]
    DependencyViolation(String),

    #[error("Request throttled: {0}")]
    Throttled(String),

    #[error("Resource not yet visible: {0}")]
    NotYetVisible(String),

    #[error("Operation not permitted: {0}")]
    OperationNotPermitted(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Store is locked by {holder} since {since}")]
    Locked { holder: String, since: String },

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl SimError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        SimError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SimError>;

impl From<SimError> for EngineError {
    fn from(err: SimError) -> Self {
        match err {
            SimError::NotFound { kind, id } => EngineError::NotFound(format!("{} {}", kind, id)),
            SimError::Throttled(msg) => EngineError::transient(TransientKind::Throttled, msg),
            SimError::DependencyViolation(msg) => {
                EngineError::transient(TransientKind::DependencyViolation, msg)
            }
            SimError::NotYetVisible(msg) => EngineError::transient(TransientKind::NotYetVisible, msg),
            SimError::OperationNotPermitted(msg) => EngineError::PolicyViolation(msg),
            SimError::AuthenticationFailed(msg) => EngineError::AuthenticationFailed(msg),
            SimError::RegionNotFound(region) => {
                EngineError::Validation(format!("region '{}' does not exist", region))
            }
            SimError::InvalidParameter(msg) => EngineError::Validation(msg),
            SimError::AlreadyExists { .. } => EngineError::Provider(err.to_string()),
            SimError::Store(_) | SimError::Locked { .. } | SimError::IoError(_) => {
                EngineError::Store(err.to_string())
            }
            SimError::JsonError(e) => EngineError::Json(e),
        }
    }
}
