//! # Lodestar MCP
//!
//! Model Context Protocol surface of the Lodestar research session manager.
//!
//! ```text
//! Client <-> Transport (stdio / channel / SSE / streamable HTTP)
//!               <-> McpServer <-> RequestHandler <-> Dispatcher <-> ResearchService
//! ```
//!
//! Requests that reach the research engine (`tools/call`, `resources/read`)
//! run on their own task, so one slow research call never holds up another.
//! Everything a connection sends back, progress notifications included,
//! goes through a single outbound queue.

pub mod catalog;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod http;
pub mod protocol;
pub mod resources;
pub mod session;
pub mod transport;

use std::sync::Arc;

use error::McpError;
use handlers::RequestHandler;
use lodestar_core::ResearchService;
use protocol::JsonRpcResponse;
use session::McpSession;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use transport::Transport;

/// Capacity of a connection's outbound message queue.
pub const OUTBOUND_BUFFER: usize = 64;

pub(crate) fn serialize_response(response: &JsonRpcResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|e| {
        error!(error = %e, "Failed to serialize response");
        r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#
            .to_string()
    })
}

/// The MCP server. Cheap to clone; clones share the research state.
#[derive(Clone)]
pub struct McpServer {
    handler: Arc<RequestHandler>,
}

impl McpServer {
    pub fn new(service: ResearchService) -> Self {
        Self {
            handler: Arc::new(RequestHandler::new(service)),
        }
    }

    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.handler
    }

    /// Serve one connection until the transport reaches EOF or the client
    /// can no longer be written to.
    ///
    /// On EOF the server stops reading and discards anything still queued for
    /// the client, then waits for in-flight research calls so their results
    /// are committed to the registry and cache before returning.
    pub async fn run<T: Transport>(&self, transport: &mut T) -> Result<(), McpError> {
        let session = Arc::new(McpSession::new());
        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        let mut tasks = JoinSet::new();
        info!(session = session.id(), "MCP server starting");

        loop {
            tokio::select! {
                incoming = transport.read_message() => {
                    let raw = match incoming {
                        Ok(Some(raw)) => raw,
                        Ok(None) => {
                            info!("Transport closed (EOF), shutting down MCP server");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Transport read error");
                            break;
                        }
                    };
                    if raw.trim().is_empty() {
                        continue;
                    }
                    debug!(message = %raw, "Received MCP message");

                    let message = match RequestHandler::parse_message(&raw) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(error = %e, "Rejected malformed MCP message");
                            let response = JsonRpcResponse::from_mcp_error(protocol::RequestId::Null, e);
                            if let Err(e) = transport.write_message(&serialize_response(&response)).await {
                                warn!(error = %e, "Client unreachable, stopping");
                                break;
                            }
                            continue;
                        }
                    };

                    if RequestHandler::is_long_running(&message.method) && !message.is_notification() {
                        let handler = Arc::clone(&self.handler);
                        let session = Arc::clone(&session);
                        let out = out_tx.clone();
                        tasks.spawn(async move {
                            if let Some(response) = handler.handle_message(&session, message, Some(&out)).await {
                                if out.send(serialize_response(&response)).await.is_err() {
                                    debug!("Client gone, discarding response");
                                }
                            }
                        });
                    } else if let Some(response) = self.handler.handle_message(&session, message, None).await {
                        if let Err(e) = transport.write_message(&serialize_response(&response)).await {
                            warn!(error = %e, "Client unreachable, stopping");
                            break;
                        }
                    }
                }
                Some(outgoing) = out_rx.recv() => {
                    debug!(response = %outgoing, "Sending MCP message");
                    if let Err(e) = transport.write_message(&outgoing).await {
                        warn!(error = %e, "Client unreachable, stopping");
                        break;
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Request task panicked");
                    }
                }
            }
        }

        drop(out_rx);
        drop(out_tx);
        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight research to commit");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Request task panicked");
            }
        }

        transport.close().await?;
        info!("MCP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MCP_PROTOCOL_VERSION;
    use crate::transport::ChannelTransport;
    use lodestar_core::StaticEngine;
    use serde_json::{json, Value};

    fn server() -> McpServer {
        McpServer::new(ResearchService::new(Arc::new(StaticEngine::new(
            "ctx",
            vec![],
        ))))
    }

    fn init_request(id: i64) -> String {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": {
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "test-client", "version": "1.0"}
            }
        })
        .to_string()
    }

    async fn read_json(client: &mut ChannelTransport) -> Value {
        let raw = client.read_message().await.unwrap().unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_run_initialize_and_eof() {
        let server = server();
        let (mut client, mut server_side) = ChannelTransport::pair(16);
        let handle = tokio::spawn(async move { server.run(&mut server_side).await });

        client.write_message(&init_request(1)).await.unwrap();
        let resp = read_json(&mut client).await;
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["protocolVersion"], MCP_PROTOCOL_VERSION);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_parse_error_keeps_serving() {
        let server = server();
        let (mut client, mut server_side) = ChannelTransport::pair(16);
        let handle = tokio::spawn(async move { server.run(&mut server_side).await });

        client.write_message("{oops").await.unwrap();
        let resp = read_json(&mut client).await;
        assert_eq!(resp["error"]["code"], -32700);
        assert_eq!(resp["id"], Value::Null);

        client
            .write_message(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#)
            .await
            .unwrap();
        let resp = read_json(&mut client).await;
        assert_eq!(resp["id"], 2);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_call_still_commits() {
        let (engine, gate) = StaticEngine::new("late evidence", vec![]).stalled();
        let service = ResearchService::new(Arc::new(engine));
        let server = McpServer::new(service.clone());
        let (mut client, mut server_side) = ChannelTransport::pair(16);
        let handle = tokio::spawn(async move { server.run(&mut server_side).await });

        client.write_message(&init_request(1)).await.unwrap();
        read_json(&mut client).await;
        client
            .write_message(
                &json!({
                    "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                    "params": {"name": "deep_research", "arguments": {"query": "slow topic"}}
                })
                .to_string(),
            )
            .await
            .unwrap();

        while service.registry().is_empty() {
            tokio::task::yield_now().await;
        }
        drop(client);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        gate.release();
        handle.await.unwrap().unwrap();

        let id = service.registry().ids()[0];
        let unit = service.registry().get(&id).unwrap();
        assert_eq!(unit.state, lodestar_core::UnitState::Completed);
        assert!(service.cache().lookup("slow topic").is_some());
    }
}
