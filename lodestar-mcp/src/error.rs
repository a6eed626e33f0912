//! MCP-specific error types.
//!
//! These are protocol faults answered with a JSON-RPC error object. Failures
//! of the research operations themselves never surface here; they travel
//! inside the result envelope instead.

/// Errors that can occur while serving MCP requests.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("JSON-RPC parse error: {message}")]
    ParseError { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Invalid parameters: {message}")]
    InvalidParams { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },

    #[error("Resource not found: {uri}")]
    ResourceNotFound { uri: String },

    #[error("Transport error: {message}")]
    TransportError { message: String },

    #[error("Server not initialized")]
    NotInitialized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Convert to a JSON-RPC error code.
    pub fn error_code(&self) -> i64 {
        match self {
            McpError::ParseError { .. } | McpError::Json(_) => -32700,
            McpError::InvalidRequest { .. } => -32600,
            McpError::MethodNotFound { .. } => -32601,
            McpError::InvalidParams { .. } => -32602,
            McpError::InternalError { .. } | McpError::Io(_) => -32603,
            McpError::ResourceNotFound { .. } => -32001,
            McpError::TransportError { .. } => -32002,
            McpError::NotInitialized => -32003,
        }
    }

    pub(crate) fn internal(err: impl std::fmt::Display) -> Self {
        McpError::InternalError {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases = [
            (McpError::ParseError { message: "x".into() }, -32700),
            (McpError::InvalidRequest { message: "x".into() }, -32600),
            (McpError::MethodNotFound { method: "x".into() }, -32601),
            (McpError::InvalidParams { message: "x".into() }, -32602),
            (McpError::InternalError { message: "x".into() }, -32603),
            (McpError::ResourceNotFound { uri: "research://".into() }, -32001),
            (McpError::TransportError { message: "x".into() }, -32002),
            (McpError::NotInitialized, -32003),
        ];
        for (err, code) in cases {
            assert_eq!(err.error_code(), code, "{err}");
        }
    }

    #[test]
    fn test_unknown_research_uri_is_resource_not_found() {
        let err = McpError::ResourceNotFound {
            uri: "file:///etc/hosts".into(),
        };
        assert_eq!(err.to_string(), "Resource not found: file:///etc/hosts");
        assert_eq!(err.error_code(), -32001);
    }

    #[test]
    fn test_malformed_params_map_to_parse_code() {
        let bad = serde_json::from_str::<crate::protocol::CallToolParams>("{\"name\": 5}")
            .unwrap_err();
        let err = McpError::from(bad);
        assert!(err.to_string().starts_with("JSON error"));
        assert_eq!(err.error_code(), -32700);
        assert_eq!(McpError::internal("relay closed").error_code(), -32603);
    }
}
