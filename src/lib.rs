//! # auctionflow
//!
//! Tracks the "GDP" of the Hypixel SkyBlock auction house: every minute the
//! ended-auctions feed is sampled, a new page is counted as a session, and
//! running totals, paged history, and a per-buyer leaderboard are kept up to
//! date and persisted.
//!
//! ## Architecture
//!
//! ```text
//! FeedClient ──▶ Aggregator::tick() ──▶ State ──▶ StateStore::save (CAS)
//!                      │                  ▲
//!                      ▼                  │ display names
//!               Resolver::enqueue ──▶ Resolver::resolve_pass ◀── NameLookup
//!
//! QueryFacade ──▶ read-only snapshots of State
//! ```
//!
//! ## Module Organization
//!
//! - `state` - aggregate document and its update rules
//! - `feed` / `lookup` - external HTTP collaborators
//! - `resolver` - bounded-retry name resolution
//! - `store` - optimistic-concurrency persistence backends
//! - `aggregator` - poll/aggregate/persist cycle
//! - `query` - read accessors for display code
//! - `scheduler` - background loops
//! - `config` - environment configuration

pub mod aggregator;
pub mod config;
pub mod feed;
pub mod lookup;
pub mod query;
pub mod resolver;
pub mod scheduler;
pub mod state;
pub mod store;

// Re-export commonly used types
pub use aggregator::{load_initial_state, Aggregator, Persistence, TickOutcome};
pub use config::{Config, StoreBackend};
pub use feed::{FeedClient, FeedError, HypixelFeedClient};
pub use lookup::{LookupError, MojangLookupClient, NameLookup};
pub use query::{QueryFacade, StatsSnapshot};
pub use resolver::{Resolution, Resolver};
pub use state::{LeaderboardEntry, Sale, State, CHUNK_SIZE};
pub use store::{StateStore, StoreError, VersionToken, Versioned};
