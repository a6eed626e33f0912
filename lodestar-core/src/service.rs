//! The research workflows shared by every protocol surface.
//!
//! [`ResearchService`] owns the session registry, the topic cache and the
//! engine. Each workflow registers a unit before calling the engine and
//! commits the outcome afterwards, whether or not anyone is still waiting for
//! the answer.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{CacheEntry, TopicCache};
use crate::config::{ttl_from_secs, EngineKind, LodestarConfig};
use crate::engine::{HttpResearchEngine, ResearchEngine, StaticEngine};
use crate::error::{ConfigError, RegistryError, ServiceError};
use crate::progress::ProgressSender;
use crate::registry::SessionRegistry;
use crate::types::{Findings, ResearchMode, ResearchUnit, UnitState};

/// Explicit context object handed to every handler.
#[derive(Clone)]
pub struct ResearchService {
    registry: Arc<SessionRegistry>,
    cache: Arc<TopicCache>,
    engine: Arc<dyn ResearchEngine>,
}

impl std::fmt::Debug for ResearchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResearchService")
            .field("engine", &self.engine.name())
            .field("sessions", &self.registry.len())
            .field("cached_topics", &self.cache.len())
            .finish()
    }
}

impl ResearchService {
    /// A service with default-sized registry and cache.
    pub fn new(engine: Arc<dyn ResearchEngine>) -> Self {
        Self::with_parts(
            engine,
            Arc::new(SessionRegistry::new()),
            Arc::new(TopicCache::new()),
        )
    }

    pub fn with_parts(
        engine: Arc<dyn ResearchEngine>,
        registry: Arc<SessionRegistry>,
        cache: Arc<TopicCache>,
    ) -> Self {
        Self {
            registry,
            cache,
            engine,
        }
    }

    /// Build the engine, registry and cache described by `config`.
    ///
    /// Fails when the HTTP engine is selected and its credential is missing.
    pub fn from_config(config: &LodestarConfig) -> Result<Self, ConfigError> {
        let engine: Arc<dyn ResearchEngine> = match config.engine.kind {
            EngineKind::Stub => Arc::new(StaticEngine::offline()),
            EngineKind::Http => {
                let api_key = config.engine.credential()?.unwrap_or_default();
                let engine = HttpResearchEngine::from_config(&config.engine, api_key).map_err(|e| ConfigError::Invalid {
                    field: "engine".into(),
                    message: e.message,
                })?;
                Arc::new(engine)
            }
        };

        let registry = SessionRegistry::with_limits(
            config.registry.max_sessions,
            ttl_from_secs("registry.ttl_secs", config.registry.ttl_secs)?,
        );
        let cache = TopicCache::with_limits(
            config.cache.max_topics,
            ttl_from_secs("cache.ttl_secs", config.cache.ttl_secs)?,
        );
        Ok(Self::with_parts(engine, Arc::new(registry), Arc::new(cache)))
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &TopicCache {
        &self.cache
    }

    pub fn engine(&self) -> &dyn ResearchEngine {
        self.engine.as_ref()
    }

    /// Run a full research pass on `query` as a new unit.
    ///
    /// On success the unit is COMPLETED and its evidence is cached under the
    /// exact query string. On an engine failure the unit is FAILED, nothing is
    /// cached and the engine error is returned.
    pub async fn deep_research(
        &self,
        query: &str,
        mode: ResearchMode,
        progress: Option<ProgressSender>,
    ) -> Result<ResearchUnit, ServiceError> {
        let id = self.registry.create(query, mode);
        self.registry.transition_to_running(&id)?;
        info!(research_id = %id, query, mode = %mode, engine = self.engine.name(), "Starting research");

        match self.engine.conduct_research(query, mode, progress).await {
            Ok(findings) => {
                let unit = self.registry.complete(&id, findings)?;
                let cached = Findings {
                    context: unit.context.clone(),
                    sources: unit.sources.clone(),
                    source_urls: unit.source_urls.clone(),
                    costs: 0.0,
                };
                self.cache.store(query, &cached, None);
                info!(research_id = %id, sources = unit.sources.len(), "Research completed");
                Ok(unit)
            }
            Err(e) => {
                warn!(research_id = %id, error = %e, "Research failed");
                self.registry.fail(&id, e.message.clone())?;
                Err(e.into())
            }
        }
    }

    /// Run a quick search on `query` as a new unit. Results are not cached.
    pub async fn quick_search(&self, query: &str) -> Result<ResearchUnit, ServiceError> {
        let id = self.registry.create(query, ResearchMode::QuickSearch);
        self.registry.transition_to_running(&id)?;
        info!(search_id = %id, query, "Starting quick search");

        match self.engine.quick_search(query).await {
            Ok(results) => {
                let unit = self.registry.complete_search(&id, results)?;
                info!(search_id = %id, results = unit.search_results.len(), "Quick search completed");
                Ok(unit)
            }
            Err(e) => {
                warn!(search_id = %id, error = %e, "Quick search failed");
                self.registry.fail(&id, e.message.clone())?;
                Err(e.into())
            }
        }
    }

    /// Write a report for a completed unit and attach it.
    ///
    /// The unit must be COMPLETED both before the engine call and when the
    /// report is attached. An engine failure leaves the unit untouched.
    pub async fn write_report(
        &self,
        id: &Uuid,
        custom_prompt: Option<&str>,
    ) -> Result<ResearchUnit, ServiceError> {
        let unit = self.registry.get(id)?;
        if unit.state != UnitState::Completed {
            return Err(RegistryError::InvalidState {
                id: *id,
                state: unit.state,
                expected: UnitState::Completed,
            }
            .into());
        }

        info!(research_id = %id, custom_prompt = custom_prompt.is_some(), "Generating report");
        let report = self.engine.write_report(&unit, custom_prompt).await.map_err(|e| {
            warn!(research_id = %id, error = %e, "Report generation failed");
            e
        })?;
        Ok(self.registry.attach_report(id, report)?)
    }

    /// Snapshot of a unit by id.
    pub fn unit(&self, id: &Uuid) -> Result<ResearchUnit, ServiceError> {
        Ok(self.registry.get(id)?)
    }

    /// Cached evidence for `topic`, researching it first on a miss.
    ///
    /// Topic reads do not create research units. Failures are not cached.
    pub async fn research_topic(&self, topic: &str) -> Result<Arc<CacheEntry>, ServiceError> {
        if let Some(entry) = self.cache.lookup(topic) {
            info!(topic, "Returning cached research");
            return Ok(entry);
        }

        info!(topic, "Conducting new research for topic");
        let findings = self
            .engine
            .conduct_research(topic, ResearchMode::ResearchReport, None)
            .await?;
        Ok(self.cache.store(topic, &findings.normalized(), None))
    }

    /// Drop expired units and cache entries. Returns `(units, topics)` purged.
    pub fn purge_expired(&self) -> (usize, usize) {
        (self.registry.purge_expired(), self.cache.purge_expired())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::progress::{progress_channel, Progress};
    use crate::types::Source;

    fn inflation_engine() -> Arc<StaticEngine> {
        Arc::new(
            StaticEngine::new(
                "CPI rose 3.1% year over year.",
                vec![Source::new("BLS Report", "https://bls.gov/x", "CPI data")],
            )
            .with_costs(0.01),
        )
    }

    #[tokio::test]
    async fn test_deep_research_completes_and_caches() {
        let engine = inflation_engine();
        let service = ResearchService::new(engine.clone());

        let unit = service
            .deep_research("current US inflation rate", ResearchMode::ResearchReport, None)
            .await
            .unwrap();
        assert_eq!(unit.state, UnitState::Completed);
        assert_eq!(unit.source_urls, vec!["https://bls.gov/x"]);

        let entry = service.research_topic("current US inflation rate").await.unwrap();
        assert!(entry.formatted_context.contains("CPI rose 3.1%"));
        assert!(entry.formatted_context.contains("https://bls.gov/x"));
        assert_eq!(engine.research_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_research_is_recorded_not_cached() {
        let engine = Arc::new(StaticEngine::new("ctx", vec![]).failing("quota exceeded"));
        let service = ResearchService::new(engine);

        let err = service
            .deep_research("q", ResearchMode::DeepResearch, None)
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::Engine(EngineError::new("quota exceeded")));
        assert!(service.cache().lookup("q").is_none());

        let ids = service.registry().ids();
        assert_eq!(ids.len(), 1);
        let unit = service.unit(&ids[0]).unwrap();
        assert_eq!(unit.state, UnitState::Failed);
        assert_eq!(unit.error.as_deref(), Some("quota exceeded"));
    }

    #[tokio::test]
    async fn test_topic_cache_is_idempotent() {
        let engine = inflation_engine();
        let service = ResearchService::new(engine.clone());

        let first = service.research_topic("tides").await.unwrap();
        let second = service.research_topic("tides").await.unwrap();
        assert_eq!(first.formatted_context, second.formatted_context);
        assert_eq!(engine.research_calls(), 1);

        // Keys are exact.
        service.research_topic("Tides").await.unwrap();
        assert_eq!(engine.research_calls(), 2);
    }

    #[tokio::test]
    async fn test_topic_failure_is_not_cached() {
        let service = ResearchService::new(Arc::new(StaticEngine::offline().failing("down")));
        assert!(service.research_topic("t").await.is_err());
        assert!(service.cache().is_empty());
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn test_write_report_accumulates_costs() {
        let service = ResearchService::new(inflation_engine());
        let unit = service
            .deep_research("inflation", ResearchMode::ResearchReport, None)
            .await
            .unwrap();

        let reported = service
            .write_report(&unit.id, Some("focus on housing"))
            .await
            .unwrap();
        let report = reported.report.unwrap();
        assert!(report.contains("focus on housing"));
        assert!(report.contains("https://bls.gov/x"));
        assert!((reported.costs - 0.02).abs() < 1e-9);

        // The cached copy is unaffected by the report.
        let entry = service.cache().lookup("inflation").unwrap();
        assert!(!entry.formatted_context.contains("focus on housing"));
    }

    #[tokio::test]
    async fn test_report_failure_leaves_unit_untouched() {
        let engine = Arc::new(
            StaticEngine::new("CPI rose 3.1%.", vec![])
                .with_costs(0.01)
                .failing_reports("report model unavailable"),
        );
        let service = ResearchService::new(engine.clone());
        let unit = service
            .deep_research("inflation", ResearchMode::ResearchReport, None)
            .await
            .unwrap();

        let err = service.write_report(&unit.id, None).await.unwrap_err();
        assert_eq!(
            err,
            ServiceError::Engine(EngineError::new("report model unavailable"))
        );
        assert_eq!(engine.report_calls(), 1);

        let after = service.unit(&unit.id).unwrap();
        assert_eq!(after.state, UnitState::Completed);
        assert!(after.report.is_none());
        assert!((after.costs - 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_write_report_on_running_unit() {
        let (engine, gate) = StaticEngine::new("ctx", vec![]).stalled();
        let service = ResearchService::new(Arc::new(engine));

        let research = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .deep_research("slow", ResearchMode::ResearchReport, None)
                    .await
            })
        };

        let id = loop {
            if let Some(id) = service.registry().ids().first().copied() {
                break id;
            }
            tokio::task::yield_now().await;
        };
        while service.registry().state(&id).unwrap() != UnitState::Running {
            tokio::task::yield_now().await;
        }

        let err = service.write_report(&id, None).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Registry(RegistryError::InvalidState {
                state: UnitState::Running,
                ..
            })
        ));
        assert!(service.unit(&id).unwrap().report.is_none());

        gate.release();
        research.await.unwrap().unwrap();
        assert!(service.write_report(&id, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_quick_search_is_reportable() {
        let engine = StaticEngine::offline().with_search_results(vec![crate::types::SearchResult {
            title: "Rust".into(),
            url: "https://rust-lang.org".into(),
            snippet: "A language empowering everyone".into(),
        }]);
        let service = ResearchService::new(Arc::new(engine));

        let unit = service.quick_search("rust").await.unwrap();
        assert_eq!(unit.mode, ResearchMode::QuickSearch);
        assert_eq!(unit.search_results.len(), 1);
        assert!(service.cache().lookup("rust").is_none());

        let reported = service.write_report(&unit.id, None).await.unwrap();
        assert!(reported.report.unwrap().contains("https://rust-lang.org"));
    }

    #[tokio::test]
    async fn test_progress_flows_through() {
        let engine = StaticEngine::new("ctx", vec![])
            .with_progress(vec![Progress::new(1, 3, None), Progress::new(3, 3, None)]);
        let service = ResearchService::new(Arc::new(engine));
        let (tx, mut rx) = progress_channel(8);

        service
            .deep_research("q", ResearchMode::DeepResearch, Some(tx))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().completed, 1);
        assert_eq!(rx.recv().await.unwrap().completed, 3);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_unit() {
        let service = ResearchService::new(inflation_engine());
        let id = Uuid::new_v4();
        assert_eq!(
            service.write_report(&id, None).await.unwrap_err(),
            ServiceError::Registry(RegistryError::NotFound { id })
        );
    }

    #[test]
    fn test_from_config_stub() {
        let mut config = LodestarConfig::default();
        config.engine.kind = EngineKind::Stub;
        config.registry.max_sessions = 4;
        let service = ResearchService::from_config(&config).unwrap();
        assert_eq!(service.engine().name(), "static");
    }

    #[test]
    fn test_from_config_rejects_out_of_range_ttl() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_dir = dir.path().join(".lodestar");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.toml"),
            "[engine]\nkind = \"stub\"\n\n[cache]\nttl_secs = 10000000000000000\n",
        )
        .unwrap();

        let config = crate::config::load_config(Some(dir.path()), None).unwrap();
        match ResearchService::from_config(&config).unwrap_err() {
            ConfigError::Invalid { field, .. } => assert_eq!(field, "cache.ttl_secs"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_from_config_requires_credential() {
        let mut config = LodestarConfig::default();
        config.engine.api_key_env = "LODESTAR_TEST_UNSET_KEY_91C2".into();
        assert!(matches!(
            ResearchService::from_config(&config).unwrap_err(),
            ConfigError::MissingCredential { .. }
        ));
    }
}
