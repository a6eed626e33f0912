//! Deterministic engine returning canned findings.
//!
//! Counts every call, can emit a scripted sequence of progress events, can be
//! forced to fail, and can be held open with a [`StallGate`] to observe units
//! while they are still running.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use super::ResearchEngine;
use crate::error::EngineError;
use crate::progress::{Progress, ProgressSender};
use crate::types::{Findings, Report, ResearchMode, ResearchUnit, SearchResult, Source};

/// Releases every call blocked on a stalled [`StaticEngine`].
#[derive(Debug)]
pub struct StallGate {
    tx: watch::Sender<bool>,
}

impl StallGate {
    pub fn release(&self) {
        let _ = self.tx.send(true);
    }
}

/// Canned-answer research engine.
pub struct StaticEngine {
    context: String,
    sources: Vec<Source>,
    search_results: Vec<SearchResult>,
    progress: Vec<Progress>,
    costs: f64,
    failure: Option<String>,
    report_failure: Option<String>,
    stall: Option<watch::Receiver<bool>>,
    research_calls: AtomicUsize,
    search_calls: AtomicUsize,
    report_calls: AtomicUsize,
}

impl StaticEngine {
    pub fn new(context: impl Into<String>, sources: Vec<Source>) -> Self {
        Self {
            context: context.into(),
            sources,
            search_results: Vec::new(),
            progress: Vec::new(),
            costs: 0.0,
            failure: None,
            report_failure: None,
            stall: None,
            research_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
            report_calls: AtomicUsize::new(0),
        }
    }

    /// Engine used by `engine.kind = "stub"`: echoes the query back as evidence.
    pub fn offline() -> Self {
        Self::new(String::new(), Vec::new())
    }

    pub fn with_search_results(mut self, results: Vec<SearchResult>) -> Self {
        self.search_results = results;
        self
    }

    pub fn with_progress(mut self, steps: Vec<Progress>) -> Self {
        self.progress = steps;
        self
    }

    /// Cost charged per research and report call.
    pub fn with_costs(mut self, costs: f64) -> Self {
        self.costs = costs;
        self
    }

    /// Make every call fail with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Make only `write_report` fail with `message`; research still succeeds.
    pub fn failing_reports(mut self, message: impl Into<String>) -> Self {
        self.report_failure = Some(message.into());
        self
    }

    /// Block every research and search call until the returned gate is released.
    pub fn stalled(mut self) -> (Self, StallGate) {
        let (tx, rx) = watch::channel(false);
        self.stall = Some(rx);
        (self, StallGate { tx })
    }

    pub fn research_calls(&self) -> usize {
        self.research_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn report_calls(&self) -> usize {
        self.report_calls.load(Ordering::SeqCst)
    }

    async fn wait_for_release(&self) {
        if let Some(rx) = &self.stall {
            let mut rx = rx.clone();
            // An error means the gate was dropped, which also releases us.
            let _ = rx.wait_for(|released| *released).await;
        }
    }

    fn check_failure(&self) -> Result<(), EngineError> {
        match &self.failure {
            Some(message) => Err(EngineError::new(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ResearchEngine for StaticEngine {
    fn name(&self) -> &str {
        "static"
    }

    async fn conduct_research(
        &self,
        query: &str,
        mode: ResearchMode,
        progress: Option<ProgressSender>,
    ) -> Result<Findings, EngineError> {
        self.research_calls.fetch_add(1, Ordering::SeqCst);
        debug!(query, mode = %mode, "Static engine research");

        if let Some(tx) = &progress {
            for step in &self.progress {
                if !tx.report(step.clone()).await {
                    break;
                }
            }
        }
        self.wait_for_release().await;
        self.check_failure()?;

        let context = if self.context.is_empty() {
            format!("Offline research notes for '{query}' ({mode}).")
        } else {
            self.context.clone()
        };
        Ok(Findings::new(context, self.sources.clone()).with_costs(self.costs))
    }

    async fn quick_search(&self, query: &str) -> Result<Vec<SearchResult>, EngineError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        debug!(query, "Static engine quick search");
        self.wait_for_release().await;
        self.check_failure()?;
        Ok(self.search_results.clone())
    }

    async fn write_report(
        &self,
        unit: &ResearchUnit,
        custom_prompt: Option<&str>,
    ) -> Result<Report, EngineError> {
        self.report_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        if let Some(message) = &self.report_failure {
            return Err(EngineError::new(message.clone()));
        }

        let mut text = format!("# {}\n\n", unit.query);
        if let Some(prompt) = custom_prompt {
            text.push_str(&format!("_Focus: {prompt}_\n\n"));
        }
        text.push_str(&unit.context);
        if !unit.source_urls.is_empty() {
            text.push_str("\n\n## References\n");
            for url in &unit.source_urls {
                text.push_str(&format!("- {url}\n"));
            }
        }
        Ok(Report {
            text,
            costs: self.costs,
        })
    }
}
