//! Research topics exposed as MCP resources.
//!
//! `research://{topic}` reads the cached evidence for a topic, running the
//! research first on a miss. Topics are percent-encoded in the URI and
//! decoded before they reach the cache, so the cache key is the exact text
//! the caller meant.

use lodestar_core::TopicCache;

use crate::dispatch::Dispatcher;
use crate::error::McpError;
use crate::protocol::{McpResource, ResourceContent, ResourceTemplate};

/// URI scheme prefix of research resources.
pub const RESEARCH_SCHEME: &str = "research://";

/// MIME type of the formatted context.
const MARKDOWN: &str = "text/markdown";

/// Extract the decoded topic from a `research://` URI.
pub fn topic_from_uri(uri: &str) -> Result<String, McpError> {
    let raw = uri
        .strip_prefix(RESEARCH_SCHEME)
        .ok_or_else(|| McpError::ResourceNotFound {
            uri: uri.to_string(),
        })?;
    let topic = urlencoding::decode(raw)
        .map_err(|e| McpError::InvalidParams {
            message: format!("Topic in {uri} is not valid UTF-8: {e}"),
        })?
        .into_owned();
    if topic.trim().is_empty() {
        return Err(McpError::InvalidParams {
            message: format!("Resource URI has no topic: {uri}"),
        });
    }
    Ok(topic)
}

/// Build the URI for a topic.
pub fn uri_for_topic(topic: &str) -> String {
    format!("{RESEARCH_SCHEME}{}", urlencoding::encode(topic))
}

/// The one parameterized resource this server offers.
pub fn research_template() -> ResourceTemplate {
    ResourceTemplate {
        uri_template: format!("{RESEARCH_SCHEME}{{topic}}"),
        name: "research_resource".to_string(),
        description: Some(
            "Web research context for a topic, with sources. Cached per exact topic; \
             a miss runs the research first."
                .to_string(),
        ),
        mime_type: Some(MARKDOWN.to_string()),
    }
}

/// Every cached topic as a concrete resource, sorted by topic.
pub fn list_cached(cache: &TopicCache) -> Vec<McpResource> {
    cache
        .topics()
        .into_iter()
        .map(|topic| McpResource {
            uri: uri_for_topic(&topic),
            description: Some(format!("Cached research on '{topic}'")),
            name: topic,
            mime_type: Some(MARKDOWN.to_string()),
        })
        .collect()
}

/// Read a research resource through the dispatcher.
pub async fn read(dispatcher: &Dispatcher, uri: &str) -> Result<Vec<ResourceContent>, McpError> {
    let topic = topic_from_uri(uri)?;
    let text = dispatcher.research_resource(&topic).await;
    Ok(vec![ResourceContent {
        uri: uri.to_string(),
        mime_type: Some(MARKDOWN.to_string()),
        text: Some(text),
    }])
}
