//! MCP request handlers: routes JSON-RPC methods to the dispatch shell.

use async_trait::async_trait;
use lodestar_core::progress::{progress_channel, relay, ProgressSink, DEFAULT_PROGRESS_BUFFER};
use lodestar_core::{Progress, ResearchService};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::catalog;
use crate::dispatch::Dispatcher;
use crate::envelope::Operation;
use crate::error::McpError;
use crate::protocol::{
    CallToolParams, CallToolResult, GetPromptParams, GetPromptResult, IncomingMessage,
    InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcResponse,
    ListChangedCapability, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListToolsResult, ProgressParams, PromptMessage, ReadResourceParams, ReadResourceResult,
    RequestId, ResourcesCapability, ServerCapabilities, ServerInfo, TextContent,
    MCP_PROTOCOL_VERSION, PROGRESS_NOTIFICATION,
};
use crate::resources;
use crate::session::McpSession;

const INSTRUCTIONS: &str = "Use deep_research to gather evidence on a topic, then write_report \
     with the returned research_id. Cached research is readable as research://{topic}.";

/// Serialized server-to-client messages of one connection.
pub type Outbound = mpsc::Sender<String>;

/// Delivers progress as `notifications/progress` on a connection's outbound queue.
struct NotificationSink {
    token: Value,
    outbound: Outbound,
}

#[async_trait]
impl ProgressSink for NotificationSink {
    async fn emit(&self, progress: &Progress) -> bool {
        let params = ProgressParams {
            progress_token: self.token.clone(),
            progress: progress.completed,
            total: (progress.total > 0).then_some(progress.total),
            message: progress.current_query.clone(),
        };
        let notification = match serde_json::to_value(params) {
            Ok(params) => JsonRpcNotification::new(PROGRESS_NOTIFICATION, Some(params)),
            Err(e) => {
                warn!(error = %e, "Failed to serialize progress");
                return true;
            }
        };
        match serde_json::to_string(&notification) {
            Ok(json) => self.outbound.send(json).await.is_ok(),
            Err(_) => true,
        }
    }
}

fn parse_params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, McpError> {
    serde_json::from_value(params).map_err(|e| McpError::InvalidParams {
        message: format!("Invalid {method} params: {e}"),
    })
}

fn to_result<T: serde::Serialize>(what: &str, value: T) -> Result<Value, McpError> {
    serde_json::to_value(value).map_err(|e| McpError::InternalError {
        message: format!("Failed to serialize {what}: {e}"),
    })
}

/// Handles MCP protocol requests for every connection of a server.
pub struct RequestHandler {
    dispatcher: Dispatcher,
    server_info: ServerInfo,
}

impl RequestHandler {
    pub fn new(service: ResearchService) -> Self {
        Self {
            dispatcher: Dispatcher::new(service),
            server_info: ServerInfo {
                name: "lodestar".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Methods that may wait on the research engine and therefore run on
    /// their own task.
    pub fn is_long_running(method: &str) -> bool {
        matches!(method, "tools/call" | "resources/read")
    }

    /// Parse and validate one raw JSON-RPC message.
    pub fn parse_message(raw: &str) -> Result<IncomingMessage, McpError> {
        let incoming: IncomingMessage =
            serde_json::from_str(raw).map_err(|e| McpError::ParseError {
                message: format!("Invalid JSON-RPC message: {e}"),
            })?;
        if incoming.jsonrpc != "2.0" {
            return Err(McpError::InvalidRequest {
                message: format!("Expected jsonrpc version 2.0, got: {}", incoming.jsonrpc),
            });
        }
        Ok(incoming)
    }

    /// Handle one message. Returns `None` for notifications.
    ///
    /// When `outbound` is given and the request carries a progress token,
    /// progress notifications are queued on it before this returns.
    pub async fn handle_message(
        &self,
        session: &McpSession,
        message: IncomingMessage,
        outbound: Option<&Outbound>,
    ) -> Option<JsonRpcResponse> {
        let progress_token = message.progress_token();
        let IncomingMessage { id, method, params, .. } = message;

        let Some(id) = id else {
            debug!(session = session.id(), method = %method, "Processing notification");
            if let Err(e) = self.route(session, &method, params, None).await {
                warn!(method = %method, error = %e, "Notification handler error");
            }
            return None;
        };

        debug!(session = session.id(), method = %method, "Processing request");
        let progress = match (progress_token, outbound) {
            (Some(token), Some(outbound)) => Some(NotificationSink {
                token,
                outbound: outbound.clone(),
            }),
            _ => None,
        };
        Some(match self.route(session, &method, params, progress).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => JsonRpcResponse::from_mcp_error(id, e),
        })
    }

    /// Handle one raw line, answering parse failures with a null-id error.
    pub async fn handle_raw(
        &self,
        session: &McpSession,
        raw: &str,
        outbound: Option<&Outbound>,
    ) -> Option<JsonRpcResponse> {
        match Self::parse_message(raw) {
            Ok(message) => self.handle_message(session, message, outbound).await,
            Err(e) => {
                warn!(error = %e, "Rejected malformed MCP message");
                Some(JsonRpcResponse::from_mcp_error(RequestId::Null, e))
            }
        }
    }

    async fn route(
        &self,
        session: &McpSession,
        method: &str,
        params: Value,
        progress: Option<NotificationSink>,
    ) -> Result<Value, McpError> {
        match method {
            "initialize" => self.handle_initialize(session, parse_params(method, params)?),
            "ping" => Ok(Value::Object(Default::default())),
            "notifications/initialized" => {
                info!(session = session.id(), "MCP client initialized successfully");
                Ok(Value::Null)
            }
            "notifications/cancelled" => {
                // The engine call cannot be aborted; the unit still commits.
                debug!(session = session.id(), "Client cancelled a request");
                Ok(Value::Null)
            }
            _ if !session.is_initialized() => Err(McpError::NotInitialized),
            "tools/list" => to_result("tools list", ListToolsResult { tools: catalog::tools() }),
            "tools/call" => {
                self.handle_tools_call(parse_params(method, params)?, progress)
                    .await
            }
            "resources/list" => to_result(
                "resources list",
                ListResourcesResult {
                    resources: resources::list_cached(self.dispatcher.service().cache()),
                },
            ),
            "resources/templates/list" => to_result(
                "resource templates",
                ListResourceTemplatesResult {
                    resource_templates: vec![resources::research_template()],
                },
            ),
            "resources/read" => {
                let params: ReadResourceParams = parse_params(method, params)?;
                info!(uri = %params.uri, "Reading resource via MCP");
                let contents = resources::read(&self.dispatcher, &params.uri).await?;
                to_result("resource contents", ReadResourceResult { contents })
            }
            "prompts/list" => to_result("prompts list", ListPromptsResult { prompts: catalog::prompts() }),
            "prompts/get" => self.handle_prompts_get(parse_params(method, params)?),
            _ => Err(McpError::MethodNotFound {
                method: method.to_string(),
            }),
        }
    }

    fn handle_initialize(
        &self,
        session: &McpSession,
        params: InitializeParams,
    ) -> Result<Value, McpError> {
        info!(
            session = session.id(),
            client = %params.client_info.name,
            client_version = ?params.client_info.version,
            protocol_version = %params.protocol_version,
            "MCP client connecting"
        );
        session.mark_initialized();

        to_result(
            "initialize result",
            InitializeResult {
                protocol_version: MCP_PROTOCOL_VERSION.to_string(),
                capabilities: ServerCapabilities {
                    tools: Some(ListChangedCapability {
                        list_changed: Some(false),
                    }),
                    resources: Some(ResourcesCapability {
                        subscribe: Some(false),
                        list_changed: Some(false),
                    }),
                    prompts: Some(ListChangedCapability {
                        list_changed: Some(false),
                    }),
                },
                server_info: self.server_info.clone(),
                instructions: Some(INSTRUCTIONS.to_string()),
            },
        )
    }

    async fn handle_tools_call(
        &self,
        params: CallToolParams,
        progress: Option<NotificationSink>,
    ) -> Result<Value, McpError> {
        let operation =
            Operation::from_tool_name(&params.name).ok_or_else(|| McpError::InvalidParams {
                message: format!("Unknown tool: {}", params.name),
            })?;
        let arguments = params.arguments.unwrap_or(Value::Null);
        info!(tool = %operation, "Calling tool via MCP");

        let envelope = match progress {
            Some(sink) if operation == Operation::DeepResearch => {
                let (tx, rx) = progress_channel(DEFAULT_PROGRESS_BUFFER);
                let (envelope, relayed) = tokio::join!(
                    self.dispatcher.call_tool(operation, &arguments, Some(tx)),
                    relay(rx, &sink)
                );
                debug!(tool = %operation, relayed, "Progress relay finished");
                envelope
            }
            _ => self.dispatcher.call_tool(operation, &arguments, None).await,
        };

        to_result(
            "tool result",
            CallToolResult {
                is_error: (!envelope.success).then_some(true),
                content: vec![TextContent::new(envelope.to_json())],
            },
        )
    }

    fn handle_prompts_get(&self, params: GetPromptParams) -> Result<Value, McpError> {
        if params.name != Operation::ResearchQuery.as_str() {
            return Err(McpError::InvalidParams {
                message: format!("Unknown prompt: {}", params.name),
            });
        }
        let text = self
            .dispatcher
            .research_query(&Value::Object(params.arguments))
            .map_err(|e| McpError::InvalidParams {
                message: format!("{}: {e}", Operation::ResearchQuery),
            })?;
        to_result(
            "prompt",
            GetPromptResult {
                description: Some("Research a topic toward a goal".to_string()),
                messages: vec![PromptMessage {
                    role: "user".to_string(),
                    content: TextContent::new(text),
                }],
            },
        )
    }
}
