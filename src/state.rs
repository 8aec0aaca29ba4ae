//! Aggregate state for the auction GDP tracker
//!
//! `State` is the single document the aggregator mutates and the store
//! persists. Its serialized shape is backend-agnostic:
//!
//! ```json
//! {"count": 2, "current": 150, "total": 300,
//!  "history": [[150, 150]],
//!  "buyers": {"a1b2c3d4...": {"name": "Notch", "spent": 100}}}
//! ```
//!
//! Invariants maintained by [`State::record_session`]:
//! - `grand_total == history.iter().flatten().sum()`
//! - `session_count == history.iter().map(Vec::len).sum()`
//! - every chunk except the last holds exactly [`CHUNK_SIZE`] values

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Number of sessions per history page
pub const CHUNK_SIZE: usize = 30;

/// Length of the truncated-id display name used until a name resolves
pub const PLACEHOLDER_LEN: usize = 8;

/// One completed auction from a feed snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sale {
    pub actor_id: String,
    pub price: u64,
}

impl Sale {
    pub fn new(actor_id: impl Into<String>, price: u64) -> Self {
        Self {
            actor_id: actor_id.into(),
            price,
        }
    }
}

/// Leaderboard row for a single buyer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    #[serde(rename = "name")]
    pub display_name: String,
    pub spent: u64,
}

/// Result of applying a snapshot to the state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Snapshot total matched `latest_total`; nothing changed
    Unchanged,
    /// Snapshot was counted as a new session
    Recorded { session_total: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(rename = "count", default)]
    pub session_count: u64,
    #[serde(rename = "current", default)]
    pub latest_total: u64,
    #[serde(rename = "total", default)]
    pub grand_total: u64,
    #[serde(default)]
    pub history: Vec<Vec<u64>>,
    #[serde(rename = "buyers", default)]
    pub leaderboard: HashMap<String, LeaderboardEntry>,
}

/// Truncated-id name shown while (or after failing) resolving `actor_id`
pub fn placeholder_name(actor_id: &str) -> String {
    actor_id.chars().take(PLACEHOLDER_LEN).collect()
}

/// Sum of all prices in a snapshot
pub fn session_total(sales: &[Sale]) -> u64 {
    sales.iter().map(|s| s.price).fold(0u64, u64::saturating_add)
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the change-detection rule and, if the snapshot is new, update
    /// counters, history, and leaderboard spend.
    ///
    /// A snapshot whose total equals `latest_total` is treated as "feed has
    /// not advanced" and dropped. Two real sessions with identical totals are
    /// therefore indistinguishable and the second one is not counted.
    ///
    /// `name_for` supplies the display name for actors not yet on the
    /// leaderboard (or still showing a placeholder).
    pub fn record_session<F>(&mut self, sales: &[Sale], name_for: F) -> SessionOutcome
    where
        F: Fn(&str) -> String,
    {
        let total = session_total(sales);
        if total == self.latest_total {
            return SessionOutcome::Unchanged;
        }

        self.session_count += 1;
        self.latest_total = total;
        self.grand_total = self.grand_total.saturating_add(total);
        self.push_history(total);

        for sale in sales {
            self.credit(&sale.actor_id, sale.price, &name_for);
        }

        SessionOutcome::Recorded {
            session_total: total,
        }
    }

    fn push_history(&mut self, value: u64) {
        match self.history.last_mut() {
            Some(chunk) if chunk.len() < CHUNK_SIZE => chunk.push(value),
            _ => {
                let mut chunk = Vec::with_capacity(CHUNK_SIZE);
                chunk.push(value);
                self.history.push(chunk);
            }
        }
    }

    fn credit<F>(&mut self, actor_id: &str, price: u64, name_for: &F)
    where
        F: Fn(&str) -> String,
    {
        let entry = self
            .leaderboard
            .entry(actor_id.to_string())
            .or_insert_with(|| LeaderboardEntry {
                display_name: name_for(actor_id),
                spent: 0,
            });
        entry.spent = entry.spent.saturating_add(price);

        if entry.display_name == placeholder_name(actor_id) {
            entry.display_name = name_for(actor_id);
        }
    }

    /// Write a resolved name into an existing leaderboard row.
    ///
    /// Returns false if the actor is not on the leaderboard.
    pub fn set_display_name(&mut self, actor_id: &str, name: &str) -> bool {
        match self.leaderboard.get_mut(actor_id) {
            Some(entry) => {
                entry.display_name = name.to_string();
                true
            }
            None => false,
        }
    }

    /// Actor ids whose leaderboard name is still the truncated placeholder
    pub fn unresolved_actors(&self) -> Vec<String> {
        self.leaderboard
            .iter()
            .filter(|(id, entry)| entry.display_name == placeholder_name(id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Checks the counter/history invariants. Used on load to flag
    /// documents that were hand-edited or written by an older layout.
    pub fn is_consistent(&self) -> bool {
        let flattened = self
            .history
            .iter()
            .flatten()
            .try_fold(0u64, |acc, v| acc.checked_add(*v));
        let values: usize = self.history.iter().map(Vec::len).sum();
        let chunks_full = self
            .history
            .iter()
            .rev()
            .skip(1)
            .all(|chunk| chunk.len() == CHUNK_SIZE);
        let last_ok = self
            .history
            .last()
            .map_or(true, |c| !c.is_empty() && c.len() <= CHUNK_SIZE);

        flattened == Some(self.grand_total)
            && values as u64 == self.session_count
            && chunks_full
            && last_ok
    }

    /// Reconcile this (local) state with a remote copy that already had the
    /// unsaved local snapshots replayed onto it. Counters and history come
    /// from the remote only when it is ahead on both session count and
    /// grand total, so the result never falls behind `self`. Leaderboard
    /// rows keep the larger spend and prefer a resolved name over a
    /// placeholder.
    pub fn merge_with_remote(&self, remote: &State) -> State {
        let remote_ahead = remote.session_count >= self.session_count
            && remote.grand_total >= self.grand_total;
        let mut merged = if remote_ahead {
            State {
                session_count: remote.session_count,
                latest_total: remote.latest_total,
                grand_total: remote.grand_total,
                history: remote.history.clone(),
                leaderboard: HashMap::new(),
            }
        } else {
            State {
                leaderboard: HashMap::new(),
                ..self.clone()
            }
        };

        let ids = self.leaderboard.keys().chain(remote.leaderboard.keys());
        for id in ids {
            if merged.leaderboard.contains_key(id) {
                continue;
            }
            let entry = match (self.leaderboard.get(id), remote.leaderboard.get(id)) {
                (Some(local), Some(theirs)) => LeaderboardEntry {
                    display_name: prefer_resolved(id, &local.display_name, &theirs.display_name),
                    spent: local.spent.max(theirs.spent),
                },
                (Some(only), None) | (None, Some(only)) => only.clone(),
                (None, None) => continue,
            };
            merged.leaderboard.insert(id.clone(), entry);
        }

        merged
    }
}

fn prefer_resolved(actor_id: &str, local: &str, remote: &str) -> String {
    if local == placeholder_name(actor_id) {
        remote.to_string()
    } else {
        local.to_string()
    }
}
