//! Research engine adapters.
//!
//! The engine is an opaque capability: it plans queries, retrieves and ranks
//! pages, and writes reports. Lodestar only talks to it through
//! [`ResearchEngine`]. Two implementations ship with the crate:
//! - [`StaticEngine`]: deterministic canned results, for tests and offline runs
//! - [`HttpResearchEngine`]: a remote research service reached over HTTP

pub mod http;
pub mod stub;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::progress::ProgressSender;
use crate::types::{Findings, Report, ResearchMode, ResearchUnit, SearchResult};

pub use http::HttpResearchEngine;
pub use stub::{StallGate, StaticEngine};

/// Narrow interface to the research engine.
///
/// Failures of any kind are reported as an [`EngineError`] whose message is
/// passed through to the caller untouched; adapters do not retry.
#[async_trait]
pub trait ResearchEngine: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Run a full research pass. May report progress any number of times
    /// before returning.
    async fn conduct_research(
        &self,
        query: &str,
        mode: ResearchMode,
        progress: Option<ProgressSender>,
    ) -> Result<Findings, EngineError>;

    /// A fast search returning raw hits with snippets.
    async fn quick_search(&self, query: &str) -> Result<Vec<SearchResult>, EngineError>;

    /// Write a report from a completed unit's accumulated evidence.
    async fn write_report(
        &self,
        unit: &ResearchUnit,
        custom_prompt: Option<&str>,
    ) -> Result<Report, EngineError>;
}
