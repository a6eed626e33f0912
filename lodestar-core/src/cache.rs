//! Topic cache: the latest completed research artifact per topic string.
//!
//! Entries are immutable `Arc` snapshots. A store replaces the snapshot under
//! a brief write lock, so readers of other topics are never held up by the
//! research that produced the new entry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::types::{Findings, Source};

/// Default upper bound on cached topics.
pub const DEFAULT_MAX_TOPICS: usize = 256;

/// A cached research artifact. Copies, never references, of a unit's data.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub context: String,
    pub sources: Vec<Source>,
    pub source_urls: Vec<String>,
    /// Context plus a human-readable list of sources.
    pub formatted_context: String,
    pub cached_at: DateTime<Utc>,
}

/// Exact-match topic -> artifact store with capacity and optional TTL.
pub struct TopicCache {
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    max_topics: usize,
    ttl: Option<chrono::Duration>,
}

impl TopicCache {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_TOPICS, None)
    }

    pub fn with_limits(max_topics: usize, ttl: Option<chrono::Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_topics: max_topics.max(1),
            ttl,
        }
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        self.ttl
            .is_some_and(|ttl| Utc::now() - entry.cached_at > ttl)
    }

    /// Look up a topic. The key is matched exactly as given.
    pub fn lookup(&self, topic: &str) -> Option<Arc<CacheEntry>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(topic)?;
        if self.is_expired(entry) {
            debug!(topic, "Cached research expired");
            return None;
        }
        Some(Arc::clone(entry))
    }

    /// Store (or overwrite) the artifact for `topic`.
    ///
    /// When `formatted_context` is `None` it is derived with
    /// [`format_context_with_sources`].
    pub fn store(
        &self,
        topic: &str,
        findings: &Findings,
        formatted_context: Option<String>,
    ) -> Arc<CacheEntry> {
        let formatted_context = formatted_context.unwrap_or_else(|| {
            format_context_with_sources(topic, &findings.context, &findings.sources)
        });
        let entry = Arc::new(CacheEntry {
            context: findings.context.clone(),
            sources: findings.sources.clone(),
            source_urls: findings.source_urls.clone(),
            formatted_context,
            cached_at: Utc::now(),
        });

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.contains_key(topic) && entries.len() >= self.max_topics {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.cached_at)
                .map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                entries.remove(&key);
                info!(topic = %key, "Evicted cached research to stay within capacity");
            }
        }
        entries.insert(topic.to_string(), Arc::clone(&entry));
        debug!(topic, sources = entry.sources.len(), "Cached research");
        entry
    }

    /// Remove a topic. Returns whether it was present.
    pub fn evict(&self, topic: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(topic).is_some()
    }

    pub fn purge_expired(&self) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry));
        before - entries.len()
    }

    /// Cached topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut topics: Vec<String> = entries
            .iter()
            .filter(|(_, e)| !self.is_expired(e))
            .map(|(k, _)| k.clone())
            .collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TopicCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Render research context followed by a numbered "Sources" section.
pub fn format_context_with_sources(topic: &str, context: &str, sources: &[Source]) -> String {
    let mut formatted = format!("## Research: {topic}\n\n{context}\n\n## Sources:\n");
    for (i, source) in sources.iter().enumerate() {
        formatted.push_str(&format!(
            "{}. {}: {}\n",
            i + 1,
            source.display_title(),
            source.url
        ));
    }
    formatted
}
