//! Session registry: research id -> research unit.
//!
//! The map itself sits behind a short-held `RwLock` that only guards
//! membership. Each unit has its own `Mutex`, so transitions on one id never
//! wait on work happening to another. No lock is ever held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::types::{
    Findings, Report, ResearchMode, ResearchUnit, SearchResult, Source, UnitState,
    EMPTY_CONTEXT_PLACEHOLDER,
};

/// Default upper bound on tracked research units.
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

type UnitHandle = Arc<Mutex<ResearchUnit>>;

/// In-memory registry of research units keyed by generated id.
pub struct SessionRegistry {
    units: RwLock<HashMap<Uuid, UnitHandle>>,
    max_sessions: usize,
    ttl: Option<chrono::Duration>,
}

fn lock_unit(handle: &Mutex<ResearchUnit>) -> MutexGuard<'_, ResearchUnit> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_SESSIONS, None)
    }

    /// Create a registry bounded to `max_sessions` units, optionally expiring
    /// finished units that have not been updated for `ttl`.
    pub fn with_limits(max_sessions: usize, ttl: Option<chrono::Duration>) -> Self {
        Self {
            units: RwLock::new(HashMap::new()),
            max_sessions: max_sessions.max(1),
            ttl,
        }
    }

    /// Register a new unit in the `Pending` state and return its id.
    pub fn create(&self, query: impl Into<String>, mode: ResearchMode) -> Uuid {
        let unit = ResearchUnit::new(query, mode);
        let id = unit.id;

        let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
        if units.len() >= self.max_sessions {
            self.evict_for_capacity(&mut units);
        }
        units.insert(id, Arc::new(Mutex::new(unit)));
        debug!(research_id = %id, mode = %mode, "Registered research unit");
        id
    }

    /// Drop the least recently updated finished unit. In-flight units are
    /// never evicted, so the bound may be exceeded while many calls run.
    fn evict_for_capacity(&self, units: &mut HashMap<Uuid, UnitHandle>) {
        let victim = units
            .iter()
            .filter_map(|(id, handle)| {
                let unit = handle.try_lock().ok()?;
                unit.state.is_terminal().then_some((*id, unit.updated_at))
            })
            .min_by_key(|(_, updated_at)| *updated_at)
            .map(|(id, _)| id);

        if let Some(id) = victim {
            units.remove(&id);
            info!(research_id = %id, "Evicted research unit to stay within capacity");
        }
    }

    fn handle(&self, id: &Uuid) -> Result<UnitHandle, RegistryError> {
        let units = self.units.read().unwrap_or_else(PoisonError::into_inner);
        units
            .get(id)
            .cloned()
            .ok_or(RegistryError::NotFound { id: *id })
    }

    fn is_expired(&self, unit: &ResearchUnit) -> bool {
        match self.ttl {
            Some(ttl) => unit.state.is_terminal() && Utc::now() - unit.updated_at > ttl,
            None => false,
        }
    }

    /// Apply `f` to the unit after checking that `next` is a legal transition.
    fn transition<F>(
        &self,
        id: &Uuid,
        next: UnitState,
        f: F,
    ) -> Result<ResearchUnit, RegistryError>
    where
        F: FnOnce(&mut ResearchUnit),
    {
        let handle = self.handle(id)?;
        let mut unit = lock_unit(&handle);
        if !unit.state.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                id: *id,
                from: unit.state,
                to: next,
            });
        }
        f(&mut *unit);
        unit.state = next;
        unit.touch();
        debug!(research_id = %id, state = %next, "Research unit transitioned");
        Ok(unit.clone())
    }

    pub fn transition_to_running(&self, id: &Uuid) -> Result<(), RegistryError> {
        self.transition(id, UnitState::Running, |_| {}).map(|_| ())
    }

    /// Record successful research findings and return the completed unit.
    pub fn complete(&self, id: &Uuid, findings: Findings) -> Result<ResearchUnit, RegistryError> {
        let findings = findings.normalized();
        self.transition(id, UnitState::Completed, move |unit| {
            unit.context = if findings.context.trim().is_empty() {
                EMPTY_CONTEXT_PLACEHOLDER.to_string()
            } else {
                findings.context
            };
            unit.sources = findings.sources;
            unit.source_urls = findings.source_urls;
            unit.add_costs(findings.costs);
        })
    }

    /// Record the hits of a quick search. The hits double as the unit's
    /// sources and their rendering becomes its context.
    pub fn complete_search(
        &self,
        id: &Uuid,
        results: Vec<SearchResult>,
    ) -> Result<ResearchUnit, RegistryError> {
        let sources: Vec<Source> = results
            .iter()
            .map(|hit| Source::new(hit.title.clone(), hit.url.clone(), hit.snippet.clone()))
            .collect();
        let findings = Findings::new(render_search_results(&results), sources);
        self.transition(id, UnitState::Completed, move |unit| {
            unit.context = if findings.context.trim().is_empty() {
                EMPTY_CONTEXT_PLACEHOLDER.to_string()
            } else {
                findings.context
            };
            unit.sources = findings.sources;
            unit.source_urls = findings.source_urls;
            unit.search_results = results;
        })
    }

    pub fn fail(&self, id: &Uuid, error: impl Into<String>) -> Result<(), RegistryError> {
        let error = error.into();
        self.transition(id, UnitState::Failed, move |unit| {
            unit.error = Some(error);
        })
        .map(|_| ())
    }

    /// Snapshot of a unit.
    pub fn get(&self, id: &Uuid) -> Result<ResearchUnit, RegistryError> {
        let handle = self.handle(id)?;
        let unit = lock_unit(&handle).clone();
        if self.is_expired(&unit) {
            self.evict(id);
            return Err(RegistryError::NotFound { id: *id });
        }
        Ok(unit)
    }

    pub fn state(&self, id: &Uuid) -> Result<UnitState, RegistryError> {
        self.get(id).map(|unit| unit.state)
    }

    /// Attach a generated report to a completed unit and accumulate its cost.
    pub fn attach_report(&self, id: &Uuid, report: Report) -> Result<ResearchUnit, RegistryError> {
        let handle = self.handle(id)?;
        let mut unit = lock_unit(&handle);
        if unit.state != UnitState::Completed {
            return Err(RegistryError::InvalidState {
                id: *id,
                state: unit.state,
                expected: UnitState::Completed,
            });
        }
        unit.report = Some(report.text);
        unit.add_costs(report.costs);
        unit.touch();
        Ok(unit.clone())
    }

    /// Remove a unit. Returns whether it was present.
    pub fn evict(&self, id: &Uuid) -> bool {
        let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
        units.remove(id).is_some()
    }

    /// Remove every finished unit older than the TTL. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
        let before = units.len();
        units.retain(|_, handle| match handle.try_lock() {
            Ok(unit) => !self.is_expired(&unit),
            Err(_) => true,
        });
        let purged = before - units.len();
        if purged > 0 {
            info!(purged, "Purged expired research units");
        }
        purged
    }

    pub fn ids(&self) -> Vec<Uuid> {
        let units = self.units.read().unwrap_or_else(PoisonError::into_inner);
        units.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.units.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Render quick-search hits as plain evidence text.
pub fn render_search_results(results: &[SearchResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, hit)| {
            let title = if hit.title.trim().is_empty() {
                "Untitled"
            } else {
                hit.title.as_str()
            };
            if hit.snippet.is_empty() {
                format!("{}. {} ({})", i + 1, title, hit.url)
            } else {
                format!("{}. {} ({})\n{}", i + 1, title, hit.url, hit.snippet)
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
