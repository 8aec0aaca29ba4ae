//! Asynchronous buyer-name resolution
//!
//! Every actor id the aggregator sees goes through one lifecycle:
//!
//! ```text
//! enqueue ──▶ Pending{retries} ──▶ InFlight{retries} ──ok──▶ Cached(name)
//!                   ▲                    │
//!                   └──── err, retries ≤ max ────┘
//!                                        └── err, retries > max ──▶ Abandoned
//! ```
//!
//! `Cached` and `Abandoned` are terminal for the life of the process.
//! The resolver pass runs on its own cadence and is the only place lookups
//! are issued; `name_for` never triggers one.

use crate::lookup::NameLookup;
use crate::state::{placeholder_name, State};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;
use tokio::task::JoinSet;

/// Default number of retries after the first failed lookup
pub const MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Waiting for the next pass
    Pending { retries: u32 },
    /// A lookup for this id is outstanding
    InFlight { retries: u32 },
    Cached(String),
    /// Gave up; the placeholder name is permanent
    Abandoned,
}

/// Counts from a single resolution pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub attempted: usize,
    pub resolved: usize,
    pub failed: usize,
    pub abandoned: usize,
}

pub struct Resolver {
    lookup: Arc<dyn NameLookup>,
    entries: Mutex<HashMap<String, Resolution>>,
    max_retries: u32,
}

impl Resolver {
    pub fn new(lookup: Arc<dyn NameLookup>) -> Self {
        Self::with_max_retries(lookup, MAX_RETRIES)
    }

    pub fn with_max_retries(lookup: Arc<dyn NameLookup>, max_retries: u32) -> Self {
        Self {
            lookup,
            entries: Mutex::new(HashMap::new()),
            max_retries,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Resolution>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an id for resolution.
    ///
    /// No-op if the id is already pending, in flight, cached, or abandoned.
    /// Returns true if the id was newly queued.
    pub fn enqueue(&self, actor_id: &str) -> bool {
        let mut entries = self.entries();
        if entries.contains_key(actor_id) {
            return false;
        }
        entries.insert(actor_id.to_string(), Resolution::Pending { retries: 0 });
        true
    }

    /// Pre-populate the cache with a known name (e.g. from a loaded state)
    pub fn seed(&self, actor_id: &str, name: &str) {
        self.entries()
            .insert(actor_id.to_string(), Resolution::Cached(name.to_string()));
    }

    /// Cached name, or the truncated-id placeholder
    pub fn name_for(&self, actor_id: &str) -> String {
        match self.entries().get(actor_id) {
            Some(Resolution::Cached(name)) => name.clone(),
            _ => placeholder_name(actor_id),
        }
    }

    pub fn is_cached(&self, actor_id: &str) -> bool {
        matches!(self.entries().get(actor_id), Some(Resolution::Cached(_)))
    }

    pub fn resolution(&self, actor_id: &str) -> Option<Resolution> {
        self.entries().get(actor_id).cloned()
    }

    /// Ids still waiting for (or undergoing) a lookup
    pub fn pending_count(&self) -> usize {
        self.entries()
            .values()
            .filter(|r| matches!(r, Resolution::Pending { .. } | Resolution::InFlight { .. }))
            .count()
    }

    /// Run one resolution pass over every pending id.
    ///
    /// Lookups for distinct ids run concurrently; each id has at most one
    /// lookup outstanding. Resolved names are written back into the
    /// leaderboard under a single write lock once all lookups complete.
    pub async fn resolve_pass(&self, state: &RwLock<State>) -> PassSummary {
        let batch: Vec<String> = {
            let mut entries = self.entries();
            let mut batch = Vec::new();
            for (id, resolution) in entries.iter_mut() {
                if let Resolution::Pending { retries } = *resolution {
                    *resolution = Resolution::InFlight { retries };
                    batch.push(id.clone());
                }
            }
            batch
        };

        let mut summary = PassSummary {
            attempted: batch.len(),
            ..PassSummary::default()
        };
        if batch.is_empty() {
            return summary;
        }

        let mut lookups = JoinSet::new();
        for id in batch.iter().cloned() {
            let lookup = self.lookup.clone();
            lookups.spawn(async move {
                let result = lookup.lookup(&id).await;
                (id, result)
            });
        }

        let mut resolved_names = Vec::new();
        while let Some(joined) = lookups.join_next().await {
            let (id, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    // Id is unknown here; the sweep below requeues it
                    log::warn!("⚠️  Name lookup task failed: {}", e);
                    continue;
                }
            };

            match result {
                Ok(name) => {
                    log::debug!("✅ Resolved {} -> {}", placeholder_name(&id), name);
                    self.entries().insert(id.clone(), Resolution::Cached(name.clone()));
                    resolved_names.push((id, name));
                    summary.resolved += 1;
                }
                Err(e) => {
                    log::debug!("⚠️  Name lookup for {} failed: {}", id, e);
                    if self.record_failure(&id) {
                        summary.abandoned += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
            }
        }

        // Anything still in flight lost its task (panic/cancel): count a failure
        let orphaned: Vec<String> = {
            let entries = self.entries();
            batch
                .iter()
                .filter(|id| matches!(entries.get(*id), Some(Resolution::InFlight { .. })))
                .cloned()
                .collect()
        };
        for id in orphaned {
            if self.record_failure(&id) {
                summary.abandoned += 1;
            } else {
                summary.failed += 1;
            }
        }

        if !resolved_names.is_empty() {
            let mut state = state.write().await;
            for (id, name) in &resolved_names {
                state.set_display_name(id, name);
            }
        }

        summary
    }

    /// Bump the retry count for an in-flight id. Returns true if the id was
    /// abandoned as a result.
    fn record_failure(&self, actor_id: &str) -> bool {
        let mut entries = self.entries();
        let retries = match entries.get(actor_id) {
            Some(Resolution::InFlight { retries }) => retries + 1,
            _ => return false,
        };

        if retries > self.max_retries {
            log::warn!(
                "❌ Giving up on name for {} after {} attempts",
                actor_id,
                retries
            );
            entries.insert(actor_id.to_string(), Resolution::Abandoned);
            true
        } else {
            entries.insert(actor_id.to_string(), Resolution::Pending { retries });
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::LookupError;
    use crate::state::Sale;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Lookup that knows a fixed set of names and counts calls per id
    struct FakeLookup {
        names: HashMap<String, String>,
        calls: Mutex<HashMap<String, usize>>,
        in_flight: Mutex<HashSet<String>>,
        overlaps: AtomicUsize,
    }

    impl FakeLookup {
        fn new(names: &[(&str, &str)]) -> Self {
            Self {
                names: names
                    .iter()
                    .map(|(id, name)| (id.to_string(), name.to_string()))
                    .collect(),
                calls: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                overlaps: AtomicUsize::new(0),
            }
        }

        fn calls_for(&self, id: &str) -> usize {
            self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl NameLookup for FakeLookup {
        async fn lookup(&self, actor_id: &str) -> Result<String, LookupError> {
            *self.calls.lock().unwrap().entry(actor_id.to_string()).or_insert(0) += 1;
            if !self.in_flight.lock().unwrap().insert(actor_id.to_string()) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            tokio::task::yield_now().await;
            self.in_flight.lock().unwrap().remove(actor_id);

            self.names
                .get(actor_id)
                .cloned()
                .ok_or_else(|| LookupError::NotFound(actor_id.to_string()))
        }
    }

    fn state_with(ids: &[&str]) -> RwLock<State> {
        let mut state = State::new();
        let sales: Vec<Sale> = ids.iter().map(|id| Sale::new(*id, 1)).collect();
        state.record_session(&sales, placeholder_name);
        RwLock::new(state)
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let resolver = Resolver::new(Arc::new(FakeLookup::new(&[])));

        assert!(resolver.enqueue("abc"));
        assert!(!resolver.enqueue("abc"));
        assert_eq!(resolver.pending_count(), 1);

        resolver.seed("def", "Dave");
        assert!(!resolver.enqueue("def"));
        assert_eq!(resolver.pending_count(), 1);
    }

    #[test]
    fn test_name_for_falls_back_to_placeholder() {
        let resolver = Resolver::new(Arc::new(FakeLookup::new(&[])));
        assert_eq!(resolver.name_for("0123456789abcdef"), "01234567");

        resolver.seed("0123456789abcdef", "Steve");
        assert_eq!(resolver.name_for("0123456789abcdef"), "Steve");
    }

    #[tokio::test]
    async fn test_successful_pass_updates_cache_and_leaderboard() {
        let lookup = Arc::new(FakeLookup::new(&[("aaaaaaaaaaaa", "Alex")]));
        let resolver = Resolver::new(lookup.clone());
        let state = state_with(&["aaaaaaaaaaaa"]);
        resolver.enqueue("aaaaaaaaaaaa");

        let summary = resolver.resolve_pass(&state).await;

        assert_eq!(summary.resolved, 1);
        assert_eq!(resolver.pending_count(), 0);
        assert_eq!(resolver.name_for("aaaaaaaaaaaa"), "Alex");
        assert_eq!(state.read().await.leaderboard["aaaaaaaaaaaa"].display_name, "Alex");

        // Cached ids are never looked up again
        resolver.enqueue("aaaaaaaaaaaa");
        resolver.resolve_pass(&state).await;
        assert_eq!(lookup.calls_for("aaaaaaaaaaaa"), 1);
    }

    #[tokio::test]
    async fn test_six_failures_abandon_the_id() {
        let lookup = Arc::new(FakeLookup::new(&[]));
        let resolver = Resolver::new(lookup.clone());
        let state = state_with(&["xxxxxxxxxxxxxxxx"]);
        resolver.enqueue("xxxxxxxxxxxxxxxx");

        for pass in 1..=6 {
            let summary = resolver.resolve_pass(&state).await;
            assert_eq!(summary.attempted, 1, "pass {}", pass);
        }

        assert_eq!(resolver.resolution("xxxxxxxxxxxxxxxx"), Some(Resolution::Abandoned));
        assert_eq!(resolver.pending_count(), 0);
        assert_eq!(resolver.name_for("xxxxxxxxxxxxxxxx"), "xxxxxxxx");
        assert_eq!(
            state.read().await.leaderboard["xxxxxxxxxxxxxxxx"].display_name,
            "xxxxxxxx"
        );

        // No further attempts, even if re-enqueued
        assert!(!resolver.enqueue("xxxxxxxxxxxxxxxx"));
        let summary = resolver.resolve_pass(&state).await;
        assert_eq!(summary.attempted, 0);
        assert_eq!(lookup.calls_for("xxxxxxxxxxxxxxxx"), MAX_RETRIES as usize + 1);
    }

    #[tokio::test]
    async fn test_retry_count_is_tracked_between_passes() {
        let resolver = Resolver::new(Arc::new(FakeLookup::new(&[])));
        let state = state_with(&["y"]);
        resolver.enqueue("y");

        resolver.resolve_pass(&state).await;
        resolver.resolve_pass(&state).await;

        assert_eq!(resolver.resolution("y"), Some(Resolution::Pending { retries: 2 }));
    }

    #[tokio::test]
    async fn test_distinct_ids_resolve_in_one_pass_without_overlap() {
        let lookup = Arc::new(FakeLookup::new(&[("p1", "One"), ("p2", "Two"), ("p3", "Three")]));
        let resolver = Resolver::new(lookup.clone());
        let state = state_with(&["p1", "p2", "p3"]);
        for id in ["p1", "p2", "p3", "p1"] {
            resolver.enqueue(id);
        }

        let summary = resolver.resolve_pass(&state).await;

        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.resolved, 3);
        assert_eq!(lookup.overlaps.load(Ordering::SeqCst), 0);
        for id in ["p1", "p2", "p3"] {
            assert_eq!(lookup.calls_for(id), 1);
        }
    }

    #[tokio::test]
    async fn test_resolved_id_missing_from_leaderboard_is_still_cached() {
        let resolver = Resolver::new(Arc::new(FakeLookup::new(&[("ghost", "Casper")])));
        let state = RwLock::new(State::new());
        resolver.enqueue("ghost");

        resolver.resolve_pass(&state).await;

        assert!(resolver.is_cached("ghost"));
        assert!(state.read().await.leaderboard.is_empty());
    }
}
