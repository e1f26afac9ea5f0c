#![forbid(unsafe_code)]

use std::path::Path;

use leaderboard_core::{
    format_unix_millis, now_unix_millis, NewXpHistory, Player, PlayerId, PlayerStore,
    PlayerUpsert, StoreError, XpHistoryEntry,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

const LEADERBOARD_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LEADERBOARD_V1: &str = r"
CREATE TABLE IF NOT EXISTS players (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  rank INTEGER NOT NULL,
  level INTEGER NOT NULL,
  xp INTEGER NOT NULL,
  first_seen INTEGER NOT NULL,
  last_seen INTEGER NOT NULL,
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  CHECK (first_seen <= last_seen)
);

CREATE TRIGGER IF NOT EXISTS trg_players_no_delete
BEFORE DELETE ON players
BEGIN
  SELECT RAISE(ABORT, 'players are deactivated, never deleted');
END;

CREATE TRIGGER IF NOT EXISTS trg_players_first_seen_immutable
BEFORE UPDATE OF first_seen ON players
WHEN NEW.first_seen IS NOT OLD.first_seen
BEGIN
  SELECT RAISE(ABORT, 'players.first_seen is immutable');
END;

CREATE INDEX IF NOT EXISTS idx_players_active_rank
  ON players(is_active, rank);

CREATE TABLE IF NOT EXISTS xp_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  player_id INTEGER NOT NULL,
  rank INTEGER NOT NULL,
  xp INTEGER NOT NULL,
  timestamp INTEGER NOT NULL,
  FOREIGN KEY (player_id) REFERENCES players(id)
);

CREATE TRIGGER IF NOT EXISTS trg_xp_history_no_update
BEFORE UPDATE ON xp_history
BEGIN
  SELECT RAISE(ABORT, 'xp_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_xp_history_no_delete
BEFORE DELETE ON xp_history
BEGIN
  SELECT RAISE(ABORT, 'xp_history is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_xp_history_player_timestamp
  ON xp_history(player_id, timestamp DESC);
";

const PLAYER_COLUMNS: &str = "id, name, rank, level, xp, first_seen, last_seen, is_active";

/// SQLite-backed [`PlayerStore`].
///
/// Uniqueness of names, referential integrity of history rows, the
/// append-only history and the immutable `first_seen` are all enforced by the
/// schema rather than by this type.
#[derive(Debug)]
pub struct SqlitePlayerStore {
    conn: Connection,
}

trait StoreResultExt<T> {
    fn store_context(self, context: &str) -> Result<T, StoreError>;
}

impl<T> StoreResultExt<T> for rusqlite::Result<T> {
    fn store_context(self, context: &str) -> Result<T, StoreError> {
        self.map_err(|err| classify(context, &err))
    }
}

fn classify(context: &str, err: &rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            StoreError::Integrity(format!("{context}: {err}"))
        }
        _ => StoreError::Storage(format!("{context}: {err}")),
    }
}

impl SqlitePlayerStore {
    /// Opens (creating if needed) the database at `path` and applies the schema.
    ///
    /// Missing parent directories are created first.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when the directory or database cannot
    /// be created or configured.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                StoreError::Storage(format!(
                    "failed to create database directory {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let conn = Connection::open(path).store_context(&format!(
            "failed to open sqlite database at {}",
            path.display()
        ))?;
        Self::from_connection(conn)
    }

    /// Opens a private in-memory database with the schema applied.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().store_context("failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .store_context("failed to configure sqlite pragmas")?;

        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Applies the schema. Safe to run against an already-initialized database.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when a DDL statement fails.
    pub fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .store_context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LEADERBOARD_V1)
            .store_context("failed to apply leaderboard schema")?;

        let applied = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEADERBOARD_MIGRATION_VERSION, format_unix_millis(now_unix_millis())],
            )
            .store_context("failed to register leaderboard schema migration")?;
        if applied > 0 {
            tracing::info!(version = LEADERBOARD_MIGRATION_VERSION, "applied leaderboard schema");
        }

        Ok(())
    }

    /// Highest applied schema version, `0` when nothing was applied.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] if the migrations table cannot be read.
    pub fn schema_version(&self) -> Result<i64, StoreError> {
        self.conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .store_context("failed to read schema version")
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn player_from_row(row: &Row<'_>) -> rusqlite::Result<Player> {
    Ok(Player {
        id: PlayerId(row.get(0)?),
        name: row.get(1)?,
        rank: row.get(2)?,
        level: row.get(3)?,
        xp: row.get(4)?,
        first_seen: row.get(5)?,
        last_seen: row.get(6)?,
        is_active: row.get(7)?,
    })
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<XpHistoryEntry> {
    Ok(XpHistoryEntry {
        id: row.get(0)?,
        player_id: PlayerId(row.get(1)?),
        rank: row.get(2)?,
        xp: row.get(3)?,
        timestamp: row.get(4)?,
    })
}

// SQLite checks the candidate row against `first_seen <= last_seen` before
// ON CONFLICT resolves, so an existing name proposes `last_seen` as its
// (discarded) first_seen. The stored row keeps its original value.
fn upsert_player_row(conn: &Connection, player: &PlayerUpsert) -> Result<PlayerId, StoreError> {
    conn.query_row(
        "INSERT INTO players(name, rank, level, xp, first_seen, last_seen, is_active)
         VALUES (
           ?1, ?2, ?3, ?4,
           CASE WHEN EXISTS (SELECT 1 FROM players WHERE name = ?1) THEN ?6 ELSE ?5 END,
           ?6, ?7
         )
         ON CONFLICT(name) DO UPDATE SET
           rank = excluded.rank,
           level = excluded.level,
           xp = excluded.xp,
           last_seen = excluded.last_seen,
           is_active = excluded.is_active
         RETURNING id",
        params![
            player.name,
            player.rank,
            player.level,
            player.xp,
            player.first_seen,
            player.last_seen,
            player.is_active,
        ],
        |row| row.get(0).map(PlayerId),
    )
    .store_context(&format!("failed to upsert player {}", player.name))
}

fn insert_history_row(conn: &Connection, entry: &NewXpHistory) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO xp_history(player_id, rank, xp, timestamp) VALUES (?1, ?2, ?3, ?4)",
        params![entry.player_id.0, entry.rank, entry.xp, entry.timestamp],
    )
    .store_context(&format!("failed to append xp history for player {}", entry.player_id))?;
    Ok(conn.last_insert_rowid())
}

impl PlayerStore for SqlitePlayerStore {
    fn upsert_player(&mut self, player: &PlayerUpsert) -> Result<PlayerId, StoreError> {
        upsert_player_row(&self.conn, player)
    }

    fn add_xp_history(&mut self, entry: &NewXpHistory) -> Result<i64, StoreError> {
        insert_history_row(&self.conn, entry)
    }

    fn get_player(&self, name: &str) -> Result<Option<Player>, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT {PLAYER_COLUMNS} FROM players WHERE name = ?1"),
                params![name],
                player_from_row,
            )
            .optional()
            .store_context(&format!("failed to load player {name}"))
    }

    fn get_active_players(&self) -> Result<Vec<Player>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!(
                "SELECT {PLAYER_COLUMNS} FROM players WHERE is_active = 1 ORDER BY rank ASC, id ASC"
            ))
            .store_context("failed to prepare active player query")?;
        let rows = stmt
            .query_map([], player_from_row)
            .store_context("failed to query active players")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .store_context("failed to read active players")
    }

    fn get_player_history(
        &self,
        player_id: PlayerId,
        limit: usize,
    ) -> Result<Vec<XpHistoryEntry>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT id, player_id, rank, xp, timestamp FROM xp_history
                 WHERE player_id = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2",
            )
            .store_context("failed to prepare history query")?;
        let rows = stmt
            .query_map(params![player_id.0, limit], history_from_row)
            .store_context(&format!("failed to query history for player {player_id}"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .store_context(&format!("failed to read history for player {player_id}"))
    }

    fn deactivate_player(&mut self, name: &str) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .execute("UPDATE players SET is_active = 0 WHERE name = ?1", params![name])
            .store_context(&format!("failed to deactivate player {name}"))?;
        Ok(changed > 0)
    }

    fn record_observation(
        &mut self,
        player: &PlayerUpsert,
        append_history: bool,
    ) -> Result<PlayerId, StoreError> {
        let tx = self
            .conn
            .transaction()
            .store_context("failed to start observation transaction")?;

        let player_id = upsert_player_row(&tx, player)?;
        if append_history {
            insert_history_row(
                &tx,
                &NewXpHistory {
                    player_id,
                    rank: player.rank,
                    xp: player.xp,
                    timestamp: player.last_seen,
                },
            )?;
        }

        tx.commit()
            .store_context(&format!("failed to commit observation of {}", player.name))?;
        Ok(player_id)
    }

    fn close(self) -> Result<(), StoreError> {
        self.conn
            .close()
            .map_err(|(_, err)| classify("failed to close sqlite database", &err))
    }
}
