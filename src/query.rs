//! Read-only view over the aggregate state for display code

use crate::state::State;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Number of sessions shown on the summary page
pub const RECENT_HISTORY_LEN: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedBuyer {
    pub rank: usize,
    pub actor_id: String,
    pub display_name: String,
    pub spent: u64,
}

/// Moment-in-time copy of the state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub session_count: u64,
    pub latest_total: u64,
    pub grand_total: u64,
    pub history: Vec<Vec<u64>>,
    pub leaderboard: Vec<RankedBuyer>,
}

/// Body of the JSON stats endpoint; `history` is newest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiStats {
    pub count: u64,
    pub latest_current: u64,
    pub grand_total: u64,
    pub history: Vec<u64>,
}

#[derive(Clone)]
pub struct QueryFacade {
    state: Arc<RwLock<State>>,
}

impl QueryFacade {
    pub fn new(state: Arc<RwLock<State>>) -> Self {
        Self { state }
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let state = self.state.read().await;
        StatsSnapshot {
            session_count: state.session_count,
            latest_total: state.latest_total,
            grand_total: state.grand_total,
            history: state.history.clone(),
            leaderboard: rank_buyers(&state),
        }
    }

    /// Up to `limit` most recent session totals, newest first
    pub async fn recent_history(&self, limit: usize) -> Vec<u64> {
        let state = self.state.read().await;
        newest_first(&state, limit)
    }

    pub async fn top_buyers(&self, limit: usize) -> Vec<RankedBuyer> {
        let state = self.state.read().await;
        let mut ranked = rank_buyers(&state);
        ranked.truncate(limit);
        ranked
    }

    pub async fn stats(&self) -> ApiStats {
        let state = self.state.read().await;
        ApiStats {
            count: state.session_count,
            latest_current: state.latest_total,
            grand_total: state.grand_total,
            history: newest_first(&state, RECENT_HISTORY_LEN),
        }
    }
}

fn newest_first(state: &State, limit: usize) -> Vec<u64> {
    state
        .history
        .iter()
        .rev()
        .flat_map(|chunk| chunk.iter().rev())
        .take(limit)
        .copied()
        .collect()
}

/// Highest spend first; ties broken by actor id so the order is stable
fn rank_buyers(state: &State) -> Vec<RankedBuyer> {
    let mut rows: Vec<_> = state.leaderboard.iter().collect();
    rows.sort_by(|(a_id, a), (b_id, b)| b.spent.cmp(&a.spent).then_with(|| a_id.cmp(b_id)));

    rows.into_iter()
        .enumerate()
        .map(|(i, (id, entry))| RankedBuyer {
            rank: i + 1,
            actor_id: id.clone(),
            display_name: entry.display_name.clone(),
            spent: entry.spent,
        })
        .collect()
}

/// `1234567` -> `"1,234,567"`
pub fn format_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
