//! Core data types: research units, sources, findings and reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Context stored for a completed unit whose engine returned no evidence text.
pub const EMPTY_CONTEXT_PLACEHOLDER: &str = "No research context was gathered.";

/// The kind of engine invocation a research unit represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchMode {
    QuickSearch,
    ResearchReport,
    DeepResearch,
}

impl ResearchMode {
    /// Map the `deep` flag of the `deep_research` tool onto a mode.
    pub fn from_deep(deep: bool) -> Self {
        if deep {
            ResearchMode::DeepResearch
        } else {
            ResearchMode::ResearchReport
        }
    }
}

impl std::fmt::Display for ResearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResearchMode::QuickSearch => write!(f, "quick_search"),
            ResearchMode::ResearchReport => write!(f, "research_report"),
            ResearchMode::DeepResearch => write!(f, "deep"),
        }
    }
}

/// Lifecycle state of a research unit.
///
/// Units only ever move forward: `Pending -> Running -> {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl UnitState {
    /// Whether no further transition can leave this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitState::Completed | UnitState::Failed)
    }

    /// Whether `self -> next` is a legal edge of the state machine.
    pub fn can_transition_to(self, next: UnitState) -> bool {
        matches!(
            (self, next),
            (UnitState::Pending, UnitState::Running)
                | (UnitState::Running, UnitState::Completed)
                | (UnitState::Running, UnitState::Failed)
        )
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitState::Pending => write!(f, "pending"),
            UnitState::Running => write!(f, "running"),
            UnitState::Completed => write!(f, "completed"),
            UnitState::Failed => write!(f, "failed"),
        }
    }
}

/// A single web source gathered by the engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    /// Raw content excerpt scraped from the page.
    #[serde(default, alias = "raw_content")]
    pub content: String,
}

impl Source {
    pub fn new(title: impl Into<String>, url: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            content: content.into(),
        }
    }

    /// Title to show to humans, falling back when the page had none.
    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            "Untitled"
        } else {
            &self.title
        }
    }
}

/// The trimmed-down view of a source returned in tool responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub title: String,
    pub url: String,
    pub content_length: usize,
}

impl From<&Source> for SourceSummary {
    fn from(source: &Source) -> Self {
        Self {
            title: source.display_title().to_string(),
            url: source.url.clone(),
            content_length: source.content.chars().count(),
        }
    }
}

/// Summarize sources for a response payload, preserving order.
pub fn summarize_sources(sources: &[Source]) -> Vec<SourceSummary> {
    sources.iter().map(SourceSummary::from).collect()
}

/// One hit returned by a quick search.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "href")]
    pub url: String,
    #[serde(default, alias = "body")]
    pub snippet: String,
}

/// The evidence produced by one engine research call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Findings {
    pub context: String,
    pub sources: Vec<Source>,
    #[serde(default)]
    pub source_urls: Vec<String>,
    /// Cost incurred by the call that produced these findings.
    #[serde(default)]
    pub costs: f64,
}

impl Findings {
    /// Build findings whose URL list is derived from `sources`.
    pub fn new(context: impl Into<String>, sources: Vec<Source>) -> Self {
        let source_urls = distinct_urls(&sources, &[]);
        Self {
            context: context.into(),
            sources,
            source_urls,
            costs: 0.0,
        }
    }

    pub fn with_costs(mut self, costs: f64) -> Self {
        self.costs = costs;
        self
    }

    /// Make `source_urls` agree with `sources`.
    ///
    /// The result is the distinct URLs of `sources` in order of first
    /// appearance, followed by any extra engine-reported URLs not already
    /// present. Empty URLs are dropped.
    pub fn normalized(mut self) -> Self {
        self.source_urls = distinct_urls(&self.sources, &self.source_urls);
        if !self.costs.is_finite() || self.costs < 0.0 {
            self.costs = 0.0;
        }
        self
    }
}

fn distinct_urls(sources: &[Source], extra: &[String]) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    let candidates = sources.iter().map(|s| s.url.as_str()).chain(extra.iter().map(String::as_str));
    for url in candidates {
        let url = url.trim();
        if !url.is_empty() && !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
        }
    }
    urls
}

/// A generated report and the cost of producing it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Report {
    pub text: String,
    #[serde(default)]
    pub costs: f64,
}

/// One tracked invocation of the research engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchUnit {
    pub id: Uuid,
    pub query: String,
    pub mode: ResearchMode,
    pub state: UnitState,
    pub context: String,
    pub sources: Vec<Source>,
    pub source_urls: Vec<String>,
    /// Raw hits for quick-search units.
    pub search_results: Vec<SearchResult>,
    pub report: Option<String>,
    pub costs: f64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResearchUnit {
    pub fn new(query: impl Into<String>, mode: ResearchMode) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            query: query.into(),
            mode,
            state: UnitState::Pending,
            context: String::new(),
            sources: Vec::new(),
            source_urls: Vec::new(),
            search_results: Vec::new(),
            report: None,
            costs: 0.0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Add `delta` to the running cost; negative or non-finite deltas are ignored.
    pub(crate) fn add_costs(&mut self, delta: f64) {
        if delta.is_finite() && delta > 0.0 {
            self.costs += delta;
        }
    }
}
