//! HTTP adapter for a remote research service.
//!
//! Wire contract:
//! - `POST {base}/research` `{query, report_type}` streams newline-delimited
//!   JSON events: `{"type":"progress", ...}` any number of times, then one
//!   `{"type":"result", ...}` or `{"type":"error","message":...}`.
//! - `POST {base}/search` `{query}` returns `{"results": [...]}`.
//! - `POST {base}/report` `{query, report_type, context, sources,
//!   custom_prompt}` returns `{"report": "...", "costs": 0.0}`.
//!
//! Requests carry the configured credential as a bearer token.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::ResearchEngine;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::progress::{Progress, ProgressSender};
use crate::types::{Findings, Report, ResearchMode, ResearchUnit, SearchResult, Source};

/// One line of the `/research` event stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResearchEvent {
    Progress {
        #[serde(alias = "completed_queries")]
        completed: u64,
        #[serde(alias = "total_queries")]
        total: u64,
        #[serde(default)]
        current_query: Option<String>,
    },
    Result {
        #[serde(default)]
        context: String,
        #[serde(default)]
        sources: Vec<Source>,
        #[serde(default)]
        source_urls: Vec<String>,
        #[serde(default)]
        costs: f64,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct ReportResponse {
    report: String,
    #[serde(default)]
    costs: f64,
}

/// Research engine reached over HTTP.
pub struct HttpResearchEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for HttpResearchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResearchEngine")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl HttpResearchEngine {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Build from the `[engine]` section with a credential already resolved by
    /// [`EngineConfig::credential`].
    pub fn from_config(config: &EngineConfig, api_key: String) -> Result<Self, EngineError> {
        Self::new(
            config.base_url.clone(),
            api_key,
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response, EngineError> {
        let url = self.endpoint(path);
        debug!(url = %url, "Sending research engine request");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::new(format!("Request to research engine failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::new(format!(
                "Research engine returned HTTP {}: {}",
                status.as_u16(),
                text.trim()
            )));
        }
        Ok(response)
    }

    /// Handle one NDJSON line. Returns the findings when the line is the final result.
    async fn handle_line(
        line: &str,
        progress: Option<&ProgressSender>,
    ) -> Result<Option<Findings>, EngineError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let event: ResearchEvent = serde_json::from_str(line)
            .map_err(|e| EngineError::new(format!("Invalid research event: {e}")))?;
        match event {
            ResearchEvent::Progress {
                completed,
                total,
                current_query,
            } => {
                if let Some(tx) = progress {
                    if !tx.is_closed() {
                        tx.report(Progress::new(completed, total, current_query)).await;
                    }
                }
                Ok(None)
            }
            ResearchEvent::Result {
                context,
                sources,
                source_urls,
                costs,
            } => Ok(Some(
                Findings {
                    context,
                    sources,
                    source_urls,
                    costs,
                }
                .normalized(),
            )),
            ResearchEvent::Error { message } => Err(EngineError::new(message)),
        }
    }
}

#[async_trait]
impl ResearchEngine for HttpResearchEngine {
    fn name(&self) -> &str {
        "http"
    }

    async fn conduct_research(
        &self,
        query: &str,
        mode: ResearchMode,
        progress: Option<ProgressSender>,
    ) -> Result<Findings, EngineError> {
        let response = self
            .post(
                "research",
                json!({ "query": query, "report_type": mode.to_string() }),
            )
            .await?;

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut findings = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                EngineError::new(format!("Failed to read research event stream: {e}"))
            })?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                if let Some(result) = Self::handle_line(&line, progress.as_ref()).await? {
                    findings = Some(result);
                }
            }
        }
        if !buffer.is_empty() {
            let line = String::from_utf8_lossy(&buffer).to_string();
            if let Some(result) = Self::handle_line(&line, progress.as_ref()).await? {
                findings = Some(result);
            }
        }

        findings.ok_or_else(|| {
            warn!(query, "Research stream ended without a result");
            EngineError::new("Research engine closed the stream without a result")
        })
    }

    async fn quick_search(&self, query: &str) -> Result<Vec<SearchResult>, EngineError> {
        let response = self.post("search", json!({ "query": query })).await?;
        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| EngineError::new(format!("Invalid search response: {e}")))?;
        Ok(body.results)
    }

    async fn write_report(
        &self,
        unit: &ResearchUnit,
        custom_prompt: Option<&str>,
    ) -> Result<Report, EngineError> {
        let response = self
            .post(
                "report",
                json!({
                    "query": unit.query,
                    "report_type": unit.mode.to_string(),
                    "context": unit.context,
                    "sources": unit.sources,
                    "custom_prompt": custom_prompt,
                }),
            )
            .await?;
        let body: ReportResponse = response
            .json()
            .await
            .map_err(|e| EngineError::new(format!("Invalid report response: {e}")))?;
        Ok(Report {
            text: body.report,
            costs: body.costs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::progress_channel;

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let engine =
            HttpResearchEngine::new("http://localhost:9000/", "key", Duration::from_secs(5))
                .unwrap();
        assert_eq!(engine.endpoint("research"), "http://localhost:9000/research");
    }

    #[test]
    fn test_from_config_uses_engine_section() {
        let config = EngineConfig {
            base_url: "https://research.internal:8443/v1/".into(),
            timeout_secs: 30,
            ..EngineConfig::default()
        };
        let engine = HttpResearchEngine::from_config(&config, "sk-test".into()).unwrap();
        assert_eq!(engine.endpoint("report"), "https://research.internal:8443/v1/report");
        assert_eq!(engine.name(), "http");
    }

    #[test]
    fn test_debug_hides_credential() {
        let engine =
            HttpResearchEngine::new("http://localhost:9000", "sk-secret", Duration::from_secs(5))
                .unwrap();
        assert!(!format!("{engine:?}").contains("sk-secret"));
    }

    #[tokio::test]
    async fn test_progress_line_is_relayed() {
        let (tx, mut rx) = progress_channel(4);
        let line = r#"{"type":"progress","completed_queries":1,"total_queries":4,"current_query":"cpi 2024"}"#;
        let result = HttpResearchEngine::handle_line(line, Some(&tx)).await.unwrap();
        assert!(result.is_none());
        let progress = rx.recv().await.unwrap();
        assert_eq!(progress, Progress::new(1, 4, Some("cpi 2024".into())));
    }

    #[tokio::test]
    async fn test_result_line_is_normalized() {
        let line = r#"{"type":"result","context":"ctx","sources":[{"title":"A","url":"https://a.example","raw_content":"x"}],"costs":0.1}"#;
        let findings = HttpResearchEngine::handle_line(line, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(findings.context, "ctx");
        assert_eq!(findings.sources[0].content, "x");
        assert_eq!(findings.source_urls, vec!["https://a.example"]);
    }

    #[tokio::test]
    async fn test_error_line_surfaces_message() {
        let line = r#"{"type":"error","message":"quota exceeded"}"#;
        let err = HttpResearchEngine::handle_line(line, None).await.unwrap_err();
        assert_eq!(err.message, "quota exceeded");
    }

    #[tokio::test]
    async fn test_malformed_line() {
        let err = HttpResearchEngine::handle_line("not json", None).await.unwrap_err();
        assert!(err.message.starts_with("Invalid research event"));
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        let engine =
            HttpResearchEngine::new("http://127.0.0.1:1", "key", Duration::from_secs(2)).unwrap();
        let err = engine.quick_search("q").await.unwrap_err();
        assert!(err.message.contains("Request to research engine failed"));
    }
}
