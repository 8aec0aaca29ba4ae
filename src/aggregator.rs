//! Snapshot aggregator
//!
//! Owns the canonical [`State`] while the process runs. Each [`tick`]:
//!
//! 1. fetches a snapshot from the feed (failure = no-op)
//! 2. applies the change-detection rule; an unchanged total is dropped
//! 3. updates counters, history, and leaderboard spend
//! 4. queues unresolved buyer ids with the [`Resolver`]
//! 5. saves through the [`StateStore`], retrying a version conflict once
//!    with a reload + merge
//!
//! Persistence is best-effort: when the retry also fails the in-memory state
//! stays authoritative and the next tick tries again. Snapshots recorded
//! since the last successful save are kept and replayed onto the stored copy
//! on every merge, so sessions accepted while the store was contended are
//! never dropped.
//!
//! [`tick`]: Aggregator::tick

use crate::feed::FeedClient;
use crate::resolver::Resolver;
use crate::state::{Sale, SessionOutcome, State};
use crate::store::{StateStore, StoreError, VersionToken};
use std::sync::Arc;
use tokio::sync::RwLock;

/// How a tick's state change was persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    Saved(VersionToken),
    /// First save conflicted; reloaded, merged, and saved
    SavedAfterMerge(VersionToken),
    /// Store write failed; state lives in memory only for now
    InMemoryOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    FetchFailed,
    Unchanged {
        session_total: u64,
    },
    Recorded {
        session_total: u64,
        newly_queued: usize,
        persistence: Persistence,
    },
}

pub struct Aggregator {
    state: Arc<RwLock<State>>,
    feed: Arc<dyn FeedClient>,
    resolver: Arc<Resolver>,
    store: Arc<dyn StateStore>,
    version: Option<VersionToken>,
    /// Snapshots recorded in memory but not yet in the store, oldest first
    unsaved: Vec<Vec<Sale>>,
    unreadable_reported: bool,
}

/// Load the starting state, treating any load failure as a cold start.
///
/// Resolved names found in the loaded leaderboard seed the resolver cache;
/// ids still showing a placeholder are queued for resolution again.
pub async fn load_initial_state(
    store: &dyn StateStore,
    resolver: &Resolver,
) -> (State, Option<VersionToken>) {
    let (state, version) = match store.load().await {
        Ok(Some(doc)) => {
            log::info!(
                "📂 Loaded state {} from {} store ({} sessions, {} buyers)",
                doc.version,
                store.backend_type(),
                doc.state.session_count,
                doc.state.leaderboard.len()
            );
            if !doc.state.is_consistent() {
                log::warn!("⚠️  Loaded state fails counter/history checks; keeping it as-is");
            }
            (doc.state, Some(doc.version))
        }
        Ok(None) => {
            log::info!("No saved state in {} store; starting from zero", store.backend_type());
            (State::new(), None)
        }
        Err(e @ StoreError::Serialization(_)) => {
            log::error!(
                "❌ Saved state in {} store is unreadable ({}); starting cold. \
                 Saves will keep failing until the document is repaired or removed",
                store.backend_type(),
                e
            );
            (State::new(), None)
        }
        Err(e) => {
            log::warn!("⚠️  Could not retrieve saved state ({}); starting cold", e);
            (State::new(), None)
        }
    };

    let unresolved = state.unresolved_actors();
    for (id, entry) in &state.leaderboard {
        if !unresolved.contains(id) {
            resolver.seed(id, &entry.display_name);
        }
    }
    for id in &unresolved {
        resolver.enqueue(id);
    }
    if !unresolved.is_empty() {
        log::info!("   └─ Re-queued {} unresolved buyer names", unresolved.len());
    }

    (state, version)
}

impl Aggregator {
    pub fn new(
        state: Arc<RwLock<State>>,
        feed: Arc<dyn FeedClient>,
        resolver: Arc<Resolver>,
        store: Arc<dyn StateStore>,
        version: Option<VersionToken>,
    ) -> Self {
        Self {
            state,
            feed,
            resolver,
            store,
            version,
            unsaved: Vec::new(),
            unreadable_reported: false,
        }
    }

    pub fn state(&self) -> Arc<RwLock<State>> {
        self.state.clone()
    }

    /// Version of the last document this aggregator wrote or loaded
    pub fn version(&self) -> Option<VersionToken> {
        self.version
    }

    /// Run one poll cycle. Never fails; every error is logged and folded
    /// into the outcome.
    pub async fn tick(&mut self) -> TickOutcome {
        let sales = match self.feed.fetch_snapshot().await {
            Ok(sales) => sales,
            Err(e) => {
                log::warn!("⚠️  Feed fetch failed, skipping tick: {}", e);
                return TickOutcome::FetchFailed;
            }
        };

        let (outcome, local) = {
            let mut state = self.state.write().await;
            let resolver = &self.resolver;
            let outcome = state.record_session(&sales, |id| resolver.name_for(id));
            (outcome, state.clone())
        };

        let session_total = match outcome {
            SessionOutcome::Unchanged => {
                log::info!("No change in total ({}); skipping", local.latest_total);
                return TickOutcome::Unchanged {
                    session_total: local.latest_total,
                };
            }
            SessionOutcome::Recorded { session_total } => session_total,
        };

        let newly_queued = sales
            .iter()
            .filter(|sale| self.resolver.enqueue(&sale.actor_id))
            .count();

        log::info!(
            "📈 Session #{} recorded: total={} ({} sales, {} new names queued)",
            local.session_count,
            session_total,
            sales.len(),
            newly_queued
        );

        self.unsaved.push(sales);
        let persistence = self.persist(local).await;

        TickOutcome::Recorded {
            session_total,
            newly_queued,
            persistence,
        }
    }

    /// Save the current in-memory state (used on shutdown)
    pub async fn flush(&mut self) -> Persistence {
        let local = self.state.read().await.clone();
        self.persist(local).await
    }

    /// Number of recorded snapshots not yet written to the store
    pub fn unsaved_sessions(&self) -> usize {
        self.unsaved.len()
    }

    async fn persist(&mut self, local: State) -> Persistence {
        match self.store.save(&local, self.version).await {
            Ok(version) => {
                self.version = Some(version);
                self.unsaved.clear();
                self.unreadable_reported = false;
                log::debug!("💾 State saved as {}", version);
                Persistence::Saved(version)
            }
            Err(e) if e.is_conflict() => {
                log::warn!("⚠️  State save conflicted ({}); reloading to merge", e);
                self.merge_and_retry(local).await
            }
            Err(e @ StoreError::Serialization(_)) => {
                self.report_unreadable(&e);
                Persistence::InMemoryOnly
            }
            Err(e) => {
                log::error!("❌ Failed to save state: {}", e);
                Persistence::InMemoryOnly
            }
        }
    }

    /// An unreadable stored document blocks every save until an operator
    /// repairs or removes it; say so once instead of on every tick.
    fn report_unreadable(&mut self, e: &StoreError) {
        if self.unreadable_reported {
            log::debug!("Stored state still unreadable: {}", e);
        } else {
            log::error!(
                "❌ Stored state is unreadable ({}); keeping in-memory state. \
                 Repair or remove the document to resume saving",
                e
            );
            self.unreadable_reported = true;
        }
    }

    async fn merge_and_retry(&mut self, local: State) -> Persistence {
        let (mut remote, remote_version) = match self.store.load().await {
            Ok(Some(doc)) => (doc.state, Some(doc.version)),
            Ok(None) => (State::new(), None),
            Err(e @ StoreError::Serialization(_)) => {
                self.report_unreadable(&e);
                return Persistence::InMemoryOnly;
            }
            Err(e) => {
                log::error!("❌ Reload after conflict failed, keeping in-memory state: {}", e);
                return Persistence::InMemoryOnly;
            }
        };
        self.unreadable_reported = false;

        let resolver = &self.resolver;
        for sales in &self.unsaved {
            remote.record_session(sales, |id| resolver.name_for(id));
        }
        let merged = local.merge_with_remote(&remote);

        match self.store.save(&merged, remote_version).await {
            Ok(version) => {
                self.version = Some(version);
                self.unsaved.clear();
                let mut state = self.state.write().await;
                // Names resolved since `local` was cloned win over `merged`
                let adopted = state.merge_with_remote(&merged);
                *state = adopted;
                log::info!(
                    "🔀 Merged with stored state and saved as {} ({} sessions)",
                    version,
                    state.session_count
                );
                Persistence::SavedAfterMerge(version)
            }
            Err(e) => {
                log::error!(
                    "❌ Save failed again after merge, keeping in-memory state: {}",
                    e
                );
                Persistence::InMemoryOnly
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedError;
    use crate::lookup::{LookupError, NameLookup};
    use crate::store::{MemoryStore, StoreError, Versioned};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedFeed {
        responses: Mutex<VecDeque<Result<Vec<Sale>, FeedError>>>,
    }

    impl ScriptedFeed {
        fn new(responses: Vec<Result<Vec<Sale>, FeedError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl FeedClient for ScriptedFeed {
        async fn fetch_snapshot(&self) -> Result<Vec<Sale>, FeedError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FeedError::Malformed("script exhausted".into())))
        }
    }

    struct NoNames;

    #[async_trait]
    impl NameLookup for NoNames {
        async fn lookup(&self, actor_id: &str) -> Result<String, LookupError> {
            Err(LookupError::NotFound(actor_id.to_string()))
        }
    }

    /// Store whose next `interfering` saves are preceded by a write from
    /// "another process", so the caller's version is stale.
    struct ContendedStore {
        inner: MemoryStore,
        interfering: AtomicUsize,
        rival: State,
    }

    #[async_trait]
    impl StateStore for ContendedStore {
        async fn load(&self) -> Result<Option<Versioned>, StoreError> {
            self.inner.load().await
        }

        async fn save(
            &self,
            state: &State,
            expected: Option<VersionToken>,
        ) -> Result<VersionToken, StoreError> {
            if self.interfering.load(Ordering::SeqCst) > 0 {
                self.interfering.fetch_sub(1, Ordering::SeqCst);
                let current = self.inner.load().await?.map(|d| d.version);
                self.inner.save(&self.rival, current).await?;
            }
            self.inner.save(state, expected).await
        }

        fn backend_type(&self) -> &'static str {
            "contended"
        }
    }

    fn aggregator_with(
        responses: Vec<Result<Vec<Sale>, FeedError>>,
        store: Arc<dyn StateStore>,
    ) -> Aggregator {
        Aggregator::new(
            Arc::new(RwLock::new(State::new())),
            Arc::new(ScriptedFeed::new(responses)),
            Arc::new(Resolver::new(Arc::new(NoNames))),
            store,
            None,
        )
    }

    #[tokio::test]
    async fn test_first_tick_records_and_saves() {
        let store = Arc::new(MemoryStore::new());
        let mut agg = aggregator_with(
            vec![Ok(vec![Sale::new("a", 100), Sale::new("b", 50)])],
            store.clone(),
        );

        let outcome = agg.tick().await;

        assert!(matches!(
            outcome,
            TickOutcome::Recorded {
                session_total: 150,
                newly_queued: 2,
                persistence: Persistence::Saved(_)
            }
        ));
        let state = agg.state();
        let state = state.read().await;
        assert_eq!(state.session_count, 1);
        assert_eq!(state.history, vec![vec![150]]);
        assert_eq!(state.leaderboard["a"].spent, 100);
        assert_eq!(state.leaderboard["b"].spent, 50);

        let saved = store.load().await.unwrap().unwrap();
        assert_eq!(saved.state, *state);
        assert_eq!(Some(saved.version), agg.version());
    }

    #[tokio::test]
    async fn test_repeated_total_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let mut agg = aggregator_with(
            vec![
                Ok(vec![Sale::new("a", 100), Sale::new("b", 50)]),
                Ok(vec![Sale::new("a", 100), Sale::new("b", 50)]),
            ],
            store.clone(),
        );
        agg.tick().await;
        let version = agg.version();
        let before = agg.state().read().await.clone();

        let outcome = agg.tick().await;

        assert_eq!(outcome, TickOutcome::Unchanged { session_total: 150 });
        assert_eq!(*agg.state().read().await, before);
        assert_eq!(agg.version(), version);
        assert_eq!(store.load().await.unwrap().unwrap().version, version.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_failure_leaves_state_untouched() {
        let store = Arc::new(MemoryStore::new());
        let mut agg = aggregator_with(
            vec![Err(FeedError::Malformed("truncated".into()))],
            store.clone(),
        );

        assert_eq!(agg.tick().await, TickOutcome::FetchFailed);
        assert_eq!(*agg.state().read().await, State::new());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conflict_is_merged_and_retried_once() {
        let mut rival = State::new();
        rival.record_session(&[Sale::new("r", 7)], crate::state::placeholder_name);
        let store = Arc::new(ContendedStore {
            inner: MemoryStore::new(),
            interfering: AtomicUsize::new(1),
            rival,
        });
        let mut agg = aggregator_with(vec![Ok(vec![Sale::new("a", 10)])], store.clone());

        let outcome = agg.tick().await;

        assert!(matches!(
            outcome,
            TickOutcome::Recorded {
                persistence: Persistence::SavedAfterMerge(_),
                ..
            }
        ));
        let state = agg.state().read().await.clone();
        assert_eq!(state.session_count, 2);
        assert_eq!(state.history, vec![vec![7, 10]]);
        assert_eq!(state.grand_total, 17);
        assert_eq!(state.leaderboard["r"].spent, 7);
        assert_eq!(state.leaderboard["a"].spent, 10);
        assert_eq!(store.load().await.unwrap().unwrap().state, state);
    }

    #[tokio::test]
    async fn test_second_conflict_keeps_memory_authoritative() {
        let mut rival = State::new();
        rival.record_session(&[Sale::new("r", 7)], crate::state::placeholder_name);
        let store = Arc::new(ContendedStore {
            inner: MemoryStore::new(),
            interfering: AtomicUsize::new(2),
            rival: rival.clone(),
        });
        let mut agg = aggregator_with(vec![Ok(vec![Sale::new("a", 10)])], store.clone());

        let outcome = agg.tick().await;

        assert!(matches!(
            outcome,
            TickOutcome::Recorded {
                persistence: Persistence::InMemoryOnly,
                ..
            }
        ));
        let state = agg.state().read().await.clone();
        assert_eq!(state.session_count, 1);
        assert_eq!(state.latest_total, 10);
        assert_eq!(store.load().await.unwrap().unwrap().state, rival);
    }

    #[tokio::test]
    async fn test_sessions_kept_in_memory_are_replayed_on_next_merge() {
        let mut rival = State::new();
        rival.record_session(&[Sale::new("r", 1)], crate::state::placeholder_name);
        let store = Arc::new(ContendedStore {
            inner: MemoryStore::new(),
            interfering: AtomicUsize::new(2),
            rival,
        });
        let mut agg = aggregator_with(
            vec![
                Ok(vec![Sale::new("big", 1000)]),
                Ok(vec![Sale::new("small", 5)]),
            ],
            store.clone(),
        );

        assert!(matches!(
            agg.tick().await,
            TickOutcome::Recorded {
                persistence: Persistence::InMemoryOnly,
                ..
            }
        ));
        assert_eq!(agg.unsaved_sessions(), 1);
        assert_eq!(agg.state().read().await.grand_total, 1000);

        assert!(matches!(
            agg.tick().await,
            TickOutcome::Recorded {
                persistence: Persistence::SavedAfterMerge(_),
                ..
            }
        ));
        assert_eq!(agg.unsaved_sessions(), 0);

        let state = agg.state().read().await.clone();
        assert_eq!(state.session_count, 3);
        assert_eq!(state.grand_total, 1006);
        assert_eq!(state.history, vec![vec![1, 1000, 5]]);
        assert_eq!(state.leaderboard["big"].spent, 1000);
        assert_eq!(state.leaderboard["small"].spent, 5);
        assert!(state.is_consistent());
        assert_eq!(store.load().await.unwrap().unwrap().state, state);
    }

    #[tokio::test]
    async fn test_unreadable_stored_document_keeps_sessions_in_memory() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ truncated").unwrap();
        let store = Arc::new(crate::store::JsonFileStore::new(&path));
        let resolver = Resolver::new(Arc::new(NoNames));
        let (initial, version) = load_initial_state(store.as_ref(), &resolver).await;
        assert_eq!(version, None);

        let mut agg = Aggregator::new(
            Arc::new(RwLock::new(initial)),
            Arc::new(ScriptedFeed::new(vec![
                Ok(vec![Sale::new("a", 4)]),
                Ok(vec![Sale::new("a", 9)]),
            ])),
            Arc::new(resolver),
            store,
            version,
        );

        for _ in 0..2 {
            assert!(matches!(
                agg.tick().await,
                TickOutcome::Recorded {
                    persistence: Persistence::InMemoryOnly,
                    ..
                }
            ));
        }
        assert!(agg.unreadable_reported);
        assert_eq!(agg.unsaved_sessions(), 2);
        assert_eq!(agg.state().read().await.grand_total, 13);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ truncated");
    }

    #[tokio::test]
    async fn test_load_initial_state_seeds_and_requeues() {
        let mut saved = State::new();
        saved.record_session(
            &[Sale::new("resolved-id-1", 5), Sale::new("pending-id-2", 6)],
            |id| {
                if id == "resolved-id-1" {
                    "Known".to_string()
                } else {
                    crate::state::placeholder_name(id)
                }
            },
        );
        let store = MemoryStore::with_state(saved.clone());
        let resolver = Resolver::new(Arc::new(NoNames));

        let (state, version) = load_initial_state(&store, &resolver).await;

        assert_eq!(state, saved);
        assert!(version.is_some());
        assert_eq!(resolver.name_for("resolved-id-1"), "Known");
        assert!(!resolver.is_cached("pending-id-2"));
        assert_eq!(resolver.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_load_failure_is_a_cold_start() {
        struct BrokenStore;

        #[async_trait]
        impl StateStore for BrokenStore {
            async fn load(&self) -> Result<Option<Versioned>, StoreError> {
                Err(StoreError::Retrieval("connection refused".into()))
            }

            async fn save(
                &self,
                _state: &State,
                _expected: Option<VersionToken>,
            ) -> Result<VersionToken, StoreError> {
                Err(StoreError::Backend("read-only".into()))
            }

            fn backend_type(&self) -> &'static str {
                "broken"
            }
        }

        let resolver = Resolver::new(Arc::new(NoNames));
        let (state, version) = load_initial_state(&BrokenStore, &resolver).await;
        assert_eq!(state, State::new());
        assert_eq!(version, None);

        // Save errors never surface from a tick
        let mut agg = aggregator_with(vec![Ok(vec![Sale::new("a", 1)])], Arc::new(BrokenStore));
        assert!(matches!(
            agg.tick().await,
            TickOutcome::Recorded {
                persistence: Persistence::InMemoryOnly,
                ..
            }
        ));
        assert_eq!(agg.state().read().await.session_count, 1);
    }

    #[tokio::test]
    async fn test_flush_saves_current_state() {
        let store = Arc::new(MemoryStore::new());
        let mut agg = aggregator_with(vec![Ok(vec![Sale::new("a", 3)])], store.clone());
        agg.tick().await;
        agg.state().write().await.set_display_name("a", "Alice");

        assert!(matches!(agg.flush().await, Persistence::Saved(_)));
        let saved = store.load().await.unwrap().unwrap();
        assert_eq!(saved.state.leaderboard["a"].display_name, "Alice");
    }
}
