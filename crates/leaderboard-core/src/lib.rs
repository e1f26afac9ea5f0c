#![forbid(unsafe_code)]

//! Shared vocabulary for the leaderboard tracker: the tracked entities, the
//! error taxonomy, and the two seams the rest of the workspace plugs into
//! ([`PlayerStore`] for persistence and [`RankingSource`] for the upstream
//! ranking feed).

use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

/// Number of history rows returned when a caller does not ask for a limit.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    /// A constraint (unique name, foreign key, append-only trigger) rejected the write.
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("store is closed")]
    Closed,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SourceError {
    #[error("ranking transport failure: {0}")]
    Transport(String),
    #[error("ranking endpoint returned http status {0}")]
    Status(u16),
    #[error("ranking payload could not be parsed: {0}")]
    Parse(String),
}

/// Surrogate key of a player row. Assigned on first insert and never reused.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct PlayerId(pub i64);

impl Display for PlayerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row of the upstream top-N ranking, already normalized.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RankingEntry {
    pub rank: i64,
    pub name: String,
    pub level: i64,
    pub xp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub rank: i64,
    pub level: i64,
    pub xp: i64,
    /// Unix milliseconds of the first snapshot that contained this player.
    pub first_seen: i64,
    /// Unix milliseconds of the latest snapshot that contained this player.
    pub last_seen: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct XpHistoryEntry {
    pub id: i64,
    pub player_id: PlayerId,
    pub rank: i64,
    pub xp: i64,
    pub timestamp: i64,
}

/// Write payload for [`PlayerStore::upsert_player`].
///
/// `first_seen` is only used when the name is not stored yet; an existing
/// row keeps its original value.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PlayerUpsert {
    pub name: String,
    pub rank: i64,
    pub level: i64,
    pub xp: i64,
    pub first_seen: i64,
    pub last_seen: i64,
    pub is_active: bool,
}

impl PlayerUpsert {
    /// Builds the active-player write for an entry observed at `observed_at`.
    #[must_use]
    pub fn observed(entry: &RankingEntry, first_seen: i64, observed_at: i64) -> Self {
        Self {
            name: entry.name.clone(),
            rank: entry.rank,
            level: entry.level,
            xp: entry.xp,
            first_seen,
            last_seen: observed_at,
            is_active: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NewXpHistory {
    pub player_id: PlayerId,
    pub rank: i64,
    pub xp: i64,
    pub timestamp: i64,
}

/// Durable player and XP history state.
///
/// Reads take `&self`; writes take `&mut self` so that an implementation can
/// open transactions on its connection.
pub trait PlayerStore {
    #[allow(clippy::missing_errors_doc)]
    fn upsert_player(&mut self, player: &PlayerUpsert) -> Result<PlayerId, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn add_xp_history(&mut self, entry: &NewXpHistory) -> Result<i64, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn get_player(&self, name: &str) -> Result<Option<Player>, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn get_active_players(&self) -> Result<Vec<Player>, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn get_player_history(
        &self,
        player_id: PlayerId,
        limit: usize,
    ) -> Result<Vec<XpHistoryEntry>, StoreError>;

    /// Marks the named player inactive. Returns `false` when no row matched.
    #[allow(clippy::missing_errors_doc)]
    fn deactivate_player(&mut self, name: &str) -> Result<bool, StoreError>;

    /// Upserts a player and, when `append_history` is set, appends one XP
    /// history row at `player.last_seen` with the written rank and xp.
    ///
    /// The default runs the two writes back to back; stores that can should
    /// override it to apply both atomically.
    #[allow(clippy::missing_errors_doc)]
    fn record_observation(
        &mut self,
        player: &PlayerUpsert,
        append_history: bool,
    ) -> Result<PlayerId, StoreError> {
        let player_id = self.upsert_player(player)?;
        if append_history {
            self.add_xp_history(&NewXpHistory {
                player_id,
                rank: player.rank,
                xp: player.xp,
                timestamp: player.last_seen,
            })?;
        }
        Ok(player_id)
    }

    /// Releases the underlying resources.
    #[allow(clippy::missing_errors_doc)]
    fn close(self) -> Result<(), StoreError>
    where
        Self: Sized;
}

/// Supplier of the current top-N ranking.
pub trait RankingSource {
    #[allow(clippy::missing_errors_doc)]
    fn fetch_top_n(&self) -> Result<Vec<RankingEntry>, SourceError>;
}

impl<T: RankingSource + ?Sized> RankingSource for Arc<T> {
    fn fetch_top_n(&self) -> Result<Vec<RankingEntry>, SourceError> {
        (**self).fetch_top_n()
    }
}

/// Process-wide handle to one [`PlayerStore`].
///
/// Cloning shares the same store. After [`SharedStore::close`] every
/// operation fails with [`StoreError::Closed`].
#[derive(Debug)]
pub struct SharedStore<S> {
    inner: Arc<Mutex<Option<S>>>,
}

impl<S> Clone for SharedStore<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S: PlayerStore> SharedStore<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { inner: Arc::new(Mutex::new(Some(store))) }
    }

    /// Runs `op` with exclusive access to the store.
    ///
    /// # Errors
    /// Returns [`StoreError::Closed`] after close, or whatever `op` returns.
    pub fn with<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut S) -> Result<T, StoreError>,
    {
        let mut guard = self.lock()?;
        match guard.as_mut() {
            Some(store) => op(store),
            None => Err(StoreError::Closed),
        }
    }

    /// Closes the store. Returns `Ok(false)` when it was already closed.
    ///
    /// # Errors
    /// Propagates the store's own close failure.
    pub fn close(&self) -> Result<bool, StoreError> {
        let taken = self.lock()?.take();
        match taken {
            Some(store) => store.close().map(|()| true),
            None => Ok(false),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().map_or(true, |guard| guard.is_none())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<S>>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Storage("store lock poisoned".to_string()))
    }
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Milliseconds since the Unix epoch, the timestamp unit used in storage.
#[must_use]
pub fn unix_millis(value: OffsetDateTime) -> i64 {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

#[must_use]
pub fn now_unix_millis() -> i64 {
    unix_millis(now_utc())
}

/// Renders a storage timestamp as RFC3339 for logs.
#[must_use]
pub fn format_unix_millis(millis: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .ok()
        .and_then(|value| value.format(&time::format_description::well_known::Rfc3339).ok())
        .unwrap_or_else(|| millis.to_string())
}
