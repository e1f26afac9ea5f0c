use std::collections::HashSet;

use leaderboard_core::{
    PlayerStore, PlayerUpsert, RankingEntry, RankingSource, SharedStore, SourceError, StoreError,
};
use serde::Serialize;

/// Counts of what one reconciliation pass changed.
#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct ReconcileReport {
    pub observed_at: i64,
    pub snapshot_size: usize,
    pub new_players: usize,
    /// Players that were inactive before this pass and are back in the ranking.
    pub returning_players: usize,
    pub updated_players: usize,
    pub xp_changes: usize,
    pub history_rows: usize,
    pub deactivated: usize,
}

/// Result of one scheduled poll.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PassOutcome {
    Completed(ReconcileReport),
    /// Nothing was written: the ranking could not be fetched or parsed.
    SourceFailed(SourceError),
    /// The snapshot was fetched but a store operation failed part way.
    StoreFailed(StoreError),
}

impl PassOutcome {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn log(&self) {
        match self {
            Self::Completed(report) => tracing::info!(
                observed_at = %leaderboard_core::format_unix_millis(report.observed_at),
                entries = report.snapshot_size,
                new_players = report.new_players,
                returning_players = report.returning_players,
                xp_changes = report.xp_changes,
                deactivated = report.deactivated,
                "leaderboard update complete"
            ),
            Self::SourceFailed(err) => {
                tracing::warn!(error = %err, "leaderboard fetch failed; skipping this poll");
            }
            Self::StoreFailed(err) => {
                tracing::error!(error = %err, "leaderboard update failed while writing");
            }
        }
    }
}

/// Brings stored state in line with `snapshot`, observed at `observed_at`.
///
/// Active players missing from the snapshot are deactivated first. Every
/// entry is then written in snapshot order; a history row is appended for
/// first observations and for entries whose xp differs from the stored value.
///
/// # Errors
/// Stops at the first failing store operation and returns its error. Writes
/// for earlier players stay committed.
pub fn reconcile<S>(
    store: &mut S,
    snapshot: &[RankingEntry],
    observed_at: i64,
) -> Result<ReconcileReport, StoreError>
where
    S: PlayerStore + ?Sized,
{
    let mut report = ReconcileReport {
        observed_at,
        snapshot_size: snapshot.len(),
        ..ReconcileReport::default()
    };

    let present: HashSet<&str> = snapshot.iter().map(|entry| entry.name.as_str()).collect();
    for player in store.get_active_players()? {
        if present.contains(player.name.as_str()) {
            continue;
        }
        store.deactivate_player(&player.name)?;
        report.deactivated += 1;
        tracing::info!(player = %player.name, last_rank = player.rank, "player dropped out of the ranking");
    }

    for entry in snapshot {
        match store.get_player(&entry.name)? {
            None => {
                store.record_observation(
                    &PlayerUpsert::observed(entry, observed_at, observed_at),
                    true,
                )?;
                report.new_players += 1;
                report.history_rows += 1;
                tracing::info!(
                    player = %entry.name,
                    rank = entry.rank,
                    xp = entry.xp,
                    "new player in the ranking"
                );
            }
            Some(existing) => {
                let xp_changed = existing.xp != entry.xp;
                store.record_observation(
                    &PlayerUpsert::observed(entry, existing.first_seen, observed_at),
                    xp_changed,
                )?;
                report.updated_players += 1;

                if !existing.is_active {
                    report.returning_players += 1;
                    tracing::info!(player = %entry.name, rank = entry.rank, "player returned to the ranking");
                }
                if xp_changed {
                    report.xp_changes += 1;
                    report.history_rows += 1;
                    tracing::info!(
                        player = %entry.name,
                        previous_xp = existing.xp,
                        xp = entry.xp,
                        gain = entry.xp - existing.xp,
                        "xp changed"
                    );
                }
            }
        }
    }

    Ok(report)
}

/// Fetches one snapshot from `source` and reconciles it into `store`.
///
/// `clock` is read once, after a successful fetch, and its value is shared by
/// every write of the pass.
pub fn run_pass<S, R, C>(source: &R, store: &SharedStore<S>, clock: C) -> PassOutcome
where
    S: PlayerStore,
    R: RankingSource + ?Sized,
    C: FnOnce() -> i64,
{
    tracing::debug!("fetching leaderboard");
    let snapshot = match source.fetch_top_n() {
        Ok(snapshot) => snapshot,
        Err(err) => return PassOutcome::SourceFailed(err),
    };
    tracing::debug!(entries = snapshot.len(), "fetched leaderboard");

    let observed_at = clock();
    match store.with(|store| reconcile(store, &snapshot, observed_at)) {
        Ok(report) => PassOutcome::Completed(report),
        Err(err) => PassOutcome::StoreFailed(err),
    }
}
