//! Error types for the Lodestar core library.
//!
//! Uses `thiserror` for structured variants covering the session registry,
//! the research engine boundary, and configuration loading.

use uuid::Uuid;

use crate::types::UnitState;

/// Errors raised by the session registry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("Research session not found: {id}")]
    NotFound { id: Uuid },

    #[error("Invalid transition for research session {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: UnitState,
        to: UnitState,
    },

    #[error("Research session {id} is {state}, expected {expected}")]
    InvalidState {
        id: Uuid,
        state: UnitState,
        expected: UnitState,
    },
}

/// An opaque failure surfaced by a research engine.
///
/// Network, parsing, quota and provider failures all collapse into this one
/// type; the cause string is passed through to the caller verbatim.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Failure of a research workflow: either the unit was in the wrong place or
/// the engine gave up.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors from configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Missing credential: environment variable {env_var} is not set")]
    MissingCredential { env_var: String },

    #[error("Invalid configuration value for {field}: {message}")]
    Invalid { field: String, message: String },
}
