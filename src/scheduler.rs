//! Background loops
//!
//! Two activities mutate shared data for the life of the process:
//! - the aggregator loop (one tick per `tick_interval`, never overlapping)
//! - the resolver loop (one pass per `resolve_interval`, never overlapping)
//!
//! A third, read-only loop logs a summary of the state in place of a
//! display layer. All loops run until cancelled.

use crate::aggregator::{Aggregator, TickOutcome};
use crate::query::{format_thousands, QueryFacade};
use crate::resolver::Resolver;
use crate::state::State;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Aggregator loop - fetch, aggregate, persist
///
/// The first tick fires immediately. A slow tick delays the next one
/// instead of bursting to catch up.
pub async fn aggregator_task(aggregator: Arc<Mutex<Aggregator>>, tick_interval: Duration) {
    log::info!("⏰ Starting aggregator loop (interval: {:?})", tick_interval);

    let mut timer = interval(tick_interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        timer.tick().await;

        let outcome = aggregator.lock().await.tick().await;
        if let TickOutcome::Recorded { session_total, .. } = outcome {
            log::debug!("Tick recorded session total {}", session_total);
        }
    }
}

/// Resolver loop - look up names for queued buyer ids
pub async fn resolver_task(
    resolver: Arc<Resolver>,
    state: Arc<RwLock<State>>,
    resolve_interval: Duration,
) {
    log::info!("🔎 Starting name resolver loop (interval: {:?})", resolve_interval);

    let mut timer = interval(resolve_interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        timer.tick().await;

        let summary = resolver.resolve_pass(&state).await;
        if summary.attempted > 0 {
            log::debug!(
                "Resolver pass: {} attempted, {} resolved, {} failed, {} abandoned",
                summary.attempted,
                summary.resolved,
                summary.failed,
                summary.abandoned
            );
        }
    }
}

/// Status loop - periodic summary of the aggregate
pub async fn status_task(facade: QueryFacade, resolver: Arc<Resolver>, status_interval: Duration) {
    let mut timer = interval(status_interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick; nothing has been fetched yet
    timer.tick().await;

    loop {
        timer.tick().await;

        let snapshot = facade.snapshot().await;
        log::info!("📊 Status:");
        log::info!("   ├─ Sessions: {}", snapshot.session_count);
        log::info!("   ├─ Latest session: {}", format_thousands(snapshot.latest_total));
        log::info!("   ├─ Grand total: {}", format_thousands(snapshot.grand_total));
        log::info!("   ├─ Names pending: {}", resolver.pending_count());
        match snapshot.leaderboard.first() {
            Some(top) => log::info!(
                "   └─ Top buyer: {} ({})",
                top.display_name,
                format_thousands(top.spent)
            ),
            None => log::info!("   └─ Top buyer: none yet"),
        }
    }
}
