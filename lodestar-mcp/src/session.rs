//! Per-connection MCP session state.
//!
//! A session is one client connection: a stdio pipe, an SSE stream or a
//! streamable-HTTP `Mcp-Session-Id`. It is unrelated to research sessions.

use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

#[derive(Debug)]
pub struct McpSession {
    id: String,
    initialized: AtomicBool,
}

impl McpSession {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().simple().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the client completed `initialize`.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }
}

impl Default for McpSession {
    fn default() -> Self {
        Self::new()
    }
}
