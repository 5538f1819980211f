//! Engine error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Named classes of transient provider failures.
///
/// Only these are ever retried; anything the provider reports outside of
/// them propagates on the first occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    /// Request rate exceeded
    Throttled,
    /// Delete refused while something still depends on the resource
    DependencyViolation,
    /// Eventual consistency: a just-created resource is not visible yet
    NotYetVisible,
    /// An asynchronous completion wait ran out of time
    Timeout,
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransientKind::Throttled => write!(f, "throttled"),
            TransientKind::DependencyViolation => write!(f, "dependency-violation"),
            TransientKind::NotYetVisible => write!(f, "not-yet-visible"),
            TransientKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// How the engine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The entity disappeared between enumeration and action
    Vanished,
    /// Retry with backoff, then leave the identity for the next pass
    Transient,
    /// A mapper business rule: restore from the observed state instead
    PolicyViolation,
    /// Abort the mapper's pass
    Fatal,
}

/// Reconciliation engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Transient provider error ({kind}): {message}")]
    Transient { kind: TransientKind, message: String },

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid identity for {kind}: {message}")]
    InvalidIdentity { kind: String, message: String },

    #[error("Missing relation: {kind} '{id}' does not exist")]
    MissingRelation { kind: String, id: String },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Unknown mapper: {0}")]
    UnknownMapper(String),

    #[error("Module {0} is not installed")]
    ModuleNotInstalled(String),

    #[error("Module {module} is still needed by {dependent}")]
    ModuleInUse { module: String, dependent: String },

    #[error("Duplicate registration: {0}")]
    DuplicateRegistration(String),

    #[error("Module dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Module {module} did not converge within {passes} passes")]
    PassCeilingExceeded { module: String, passes: u32 },

    #[error("Forward progress halted in module {module} at pass {pass}")]
    ForwardProgressHalted { module: String, pass: u32 },

    #[error("Account {0} is locked by another reconciliation run")]
    LeaseHeld(String),

    #[error("Run deadline exceeded")]
    DeadlineExceeded,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        EngineError::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_identity(kind: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::InvalidIdentity {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn missing_relation(kind: impl Into<String>, id: impl Into<String>) -> Self {
        EngineError::MissingRelation {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::NotFound(_) => ErrorClass::Vanished,
            EngineError::Transient { .. } => ErrorClass::Transient,
            EngineError::PolicyViolation(_) => ErrorClass::PolicyViolation,
            _ => ErrorClass::Fatal,
        }
    }

    /// The transient kind, if this is a transient error
    pub fn transient_kind(&self) -> Option<TransientKind> {
        match self {
            EngineError::Transient { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
