//! The uniform result envelope returned by every research operation.
//!
//! ```json
//! {"success": true,  "data": {...}}
//! {"success": false, "error": {"operation": "...", "kind": "...", "message": "..."}}
//! ```

use lodestar_core::{EngineError, RegistryError, ServiceError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Names of the externally invocable operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ResearchResource,
    DeepResearch,
    QuickSearch,
    WriteReport,
    GetResearchSources,
    GetResearchContext,
    ResearchQuery,
}

impl Operation {
    /// Operations exposed as `tools/call` targets.
    pub const TOOLS: [Operation; 5] = [
        Operation::DeepResearch,
        Operation::QuickSearch,
        Operation::WriteReport,
        Operation::GetResearchSources,
        Operation::GetResearchContext,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::ResearchResource => "research_resource",
            Operation::DeepResearch => "deep_research",
            Operation::QuickSearch => "quick_search",
            Operation::WriteReport => "write_report",
            Operation::GetResearchSources => "get_research_sources",
            Operation::GetResearchContext => "get_research_context",
            Operation::ResearchQuery => "research_query",
        }
    }

    /// Look up a tool by its `tools/call` name.
    pub fn from_tool_name(name: &str) -> Option<Self> {
        Self::TOOLS.into_iter().find(|op| op.as_str() == name)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable machine-readable failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    SessionNotFound,
    EngineError,
    InvalidTransition,
    InvalidState,
}

/// Everything that can go wrong inside an operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid input '{field}': {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Research session not found: {id}")]
    SessionNotFound { id: String },

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("{0}")]
    Registry(RegistryError),
}

impl DispatchError {
    pub fn invalid_input(field: &str, reason: impl Into<String>) -> Self {
        DispatchError::InvalidInput {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::InvalidInput { .. } => ErrorKind::InvalidInput,
            DispatchError::SessionNotFound { .. } => ErrorKind::SessionNotFound,
            DispatchError::Engine(_) => ErrorKind::EngineError,
            DispatchError::Registry(RegistryError::InvalidTransition { .. }) => {
                ErrorKind::InvalidTransition
            }
            DispatchError::Registry(RegistryError::InvalidState { .. }) => ErrorKind::InvalidState,
            DispatchError::Registry(RegistryError::NotFound { .. }) => ErrorKind::SessionNotFound,
        }
    }
}

impl From<RegistryError> for DispatchError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { id } => DispatchError::SessionNotFound { id: id.to_string() },
            other => DispatchError::Registry(other),
        }
    }
}

impl From<ServiceError> for DispatchError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Registry(e) => e.into(),
            ServiceError::Engine(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub operation: Operation,
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of one operation: exactly one of `data` or `error` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Envelope {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(operation: Operation, err: &DispatchError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                operation,
                kind: err.kind(),
                message: err.to_string(),
            }),
        }
    }

    /// Fold an operation outcome into an envelope.
    pub fn from_result(operation: Operation, result: Result<Value, DispatchError>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(err) => Self::failure(operation, &err),
        }
    }

    pub fn to_json(&self) -> String {
        // Envelope holds only strings, bools and `Value`s, so this cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"success":false,"error":{"operation":"research_resource","kind":"engine_error","message":"unserializable envelope"}}"#
                .to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestar_core::UnitState;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_success_shape() {
        let env = Envelope::success(json!({"context": "x"}));
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({"success": true, "data": {"context": "x"}})
        );
    }

    #[test]
    fn test_failure_shape() {
        let err = DispatchError::SessionNotFound { id: "abc".into() };
        let env = Envelope::failure(Operation::WriteReport, &err);
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({
                "success": false,
                "error": {
                    "operation": "write_report",
                    "kind": "session_not_found",
                    "message": "Research session not found: abc"
                }
            })
        );
    }

    #[test]
    fn test_registry_errors_map_to_kinds() {
        let id = Uuid::new_v4();
        let err: DispatchError = RegistryError::NotFound { id }.into();
        assert_eq!(err, DispatchError::SessionNotFound { id: id.to_string() });

        let err: DispatchError = ServiceError::Registry(RegistryError::InvalidState {
            id,
            state: UnitState::Running,
            expected: UnitState::Completed,
        })
        .into();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let err: DispatchError = ServiceError::Engine(EngineError::new("429")).into();
        assert_eq!(err.kind(), ErrorKind::EngineError);
        assert_eq!(err.to_string(), "429");
    }

    #[test]
    fn test_tool_names() {
        assert_eq!(
            Operation::from_tool_name("deep_research"),
            Some(Operation::DeepResearch)
        );
        assert!(Operation::from_tool_name("research_resource").is_none());
        assert!(Operation::from_tool_name("shell").is_none());
    }
}
