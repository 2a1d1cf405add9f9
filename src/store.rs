//! Durable local records on the endpoint: the current-state table of known
//! items, the append-only event journal, in-flight restore sessions and
//! the sync watermark.
//!
//! Every worker thread opens its own connection; SQLite serializes the
//! writes, one event per transaction.

use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use rusqlite::{params, Connection, OptionalExtension};

use crate::protocol::wire::{Action, ItemKind};
use crate::tools;

/// Endpoint-side current state of a tracked item.
#[derive(Clone, Debug)]
pub struct Item {
    pub identity: String,
    pub current_path: String,
    pub kind: ItemKind,
    pub last_action: Action,
    pub last_event_at: i64,
    pub last_backup_at: Option<i64>,
}

/// One immutable journal row.
#[derive(Clone, Debug)]
pub struct EventRecord {
    pub seq: i64,
    pub identity: String,
    pub kind: ItemKind,
    pub action: Action,
    pub from_path: String,
    pub to_path: String,
    pub event_time: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreStatus {
    InProgress,
    Done,
    Failed,
}

impl RestoreStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RestoreStatus::InProgress => "in_progress",
            RestoreStatus::Done => "done",
            RestoreStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(RestoreStatus::InProgress),
            "done" => Some(RestoreStatus::Done),
            "failed" => Some(RestoreStatus::Failed),
            _ => None,
        }
    }
}

/// An in-flight (or finished) restore transfer on the endpoint.
#[derive(Clone, Debug)]
pub struct LocalRestoreSession {
    pub transfer_id: String,
    pub identity: String,
    pub version: u32,
    /// The `.part` staging path.
    pub local_path: PathBuf,
    pub current_offset: u64,
    pub total_size: u64,
    pub expected_hash: String,
    pub status: RestoreStatus,
    pub updated_at: i64,
}

pub struct LocalStore {
    conn: Connection,
}

// `rusqlite::Connection` holds its statement cache in a `RefCell`, so the
// auto-derived impl is `!Sync`. Per the module doc comment, a `LocalStore`
// is always owned and used sequentially by a single worker/task - it is
// never accessed from two threads at once - so it is safe to let a
// `&LocalStore` cross an `.await` point (which only requires the reference
// be movable between threads, not concurrently shared).
unsafe impl Sync for LocalStore {}

impl LocalStore {
    /// Open (and create if necessary) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, Error> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|err| format_err!("unable to create {:?} - {}", dir, err))?;
        }
        let conn = Connection::open(path)
            .map_err(|err| format_err!("unable to open store {:?} - {}", path, err))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 10000;
            CREATE TABLE IF NOT EXISTS item (
                identity TEXT PRIMARY KEY,
                current_path TEXT NOT NULL,
                kind TEXT NOT NULL,
                last_action TEXT NOT NULL,
                last_event_at INTEGER NOT NULL,
                last_backup_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS item_current_path ON item(current_path);
            CREATE TABLE IF NOT EXISTS journal (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                identity TEXT NOT NULL,
                kind TEXT NOT NULL,
                action TEXT NOT NULL,
                from_path TEXT NOT NULL DEFAULT '',
                to_path TEXT NOT NULL DEFAULT '',
                event_time INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS restore_session (
                transfer_id TEXT PRIMARY KEY,
                identity TEXT NOT NULL,
                version INTEGER NOT NULL,
                local_path TEXT NOT NULL,
                current_offset INTEGER NOT NULL,
                total_size INTEGER NOT NULL,
                expected_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    // ----- items -----

    /// Full replacement of the mutable fields, keyed by identity.
    pub fn upsert_item(
        &self,
        identity: &str,
        current_path: &str,
        kind: ItemKind,
        action: Action,
        event_at: i64,
    ) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO item (identity, current_path, kind, last_action, last_event_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(identity) DO UPDATE SET
                current_path = excluded.current_path,
                kind = excluded.kind,
                last_action = excluded.last_action,
                last_event_at = excluded.last_event_at",
            params![identity, current_path, kind.as_str(), action.as_str(), event_at],
        )?;
        Ok(())
    }

    /// Update only the action/time of a known item, leaving its path as
    /// the last not-absent location.
    pub fn touch_item(&self, identity: &str, action: Action, event_at: i64) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE item SET last_action = ?2, last_event_at = ?3 WHERE identity = ?1",
            params![identity, action.as_str(), event_at],
        )?;
        Ok(())
    }

    pub fn item_by_identity(&self, identity: &str) -> Result<Option<Item>, Error> {
        let item = self
            .conn
            .query_row(
                "SELECT identity, current_path, kind, last_action, last_event_at, last_backup_at
                 FROM item WHERE identity = ?1",
                params![identity],
                row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    pub fn item_by_path(&self, path: &str) -> Result<Option<Item>, Error> {
        let item = self
            .conn
            .query_row(
                "SELECT identity, current_path, kind, last_action, last_event_at, last_backup_at
                 FROM item WHERE current_path = ?1",
                params![path],
                row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    /// Items whose current path lies strictly below `dir_path`.
    pub fn items_under(&self, dir_path: &str) -> Result<Vec<Item>, Error> {
        let prefix = format!("{}/", dir_path.trim_end_matches('/'));
        let mut stmt = self.conn.prepare(
            "SELECT identity, current_path, kind, last_action, last_event_at, last_backup_at
             FROM item WHERE current_path LIKE ?1 || '%'",
        )?;
        let rows = stmt.query_map(params![prefix], row_to_item)?;
        let mut items = Vec::new();
        for item in rows {
            items.push(item?);
        }
        Ok(items)
    }

    /// Files whose last modification is newer than their last successful
    /// backup, most recently touched first.
    pub fn backup_candidates(&self, limit: usize) -> Result<Vec<Item>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT identity, current_path, kind, last_action, last_event_at, last_backup_at
             FROM item
             WHERE kind = 'file'
               AND last_action NOT IN ('delete', 'move_out')
               AND (last_backup_at IS NULL OR last_backup_at < last_event_at)
             ORDER BY last_event_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_item)?;
        let mut items = Vec::new();
        for item in rows {
            items.push(item?);
        }
        Ok(items)
    }

    pub fn mark_backed_up(&self, identity: &str, at: i64) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE item SET last_backup_at = ?2 WHERE identity = ?1",
            params![identity, at],
        )?;
        Ok(())
    }

    // ----- journal -----

    /// Append one event; the fresh strictly-increasing `seq` is returned.
    pub fn append_event(
        &self,
        identity: &str,
        kind: ItemKind,
        action: Action,
        from_path: &str,
        to_path: &str,
        event_time: i64,
    ) -> Result<i64, Error> {
        self.conn.execute(
            "INSERT INTO journal (identity, kind, action, from_path, to_path, event_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![identity, kind.as_str(), action.as_str(), from_path, to_path, event_time],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Journal rows with `seq` beyond the watermark, oldest first.
    pub fn events_after(&self, watermark: i64, limit: usize) -> Result<Vec<EventRecord>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, identity, kind, action, from_path, to_path, event_time
             FROM journal WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![watermark, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (seq, identity, kind, action, from_path, to_path, event_time) = row?;
            events.push(EventRecord {
                seq,
                identity,
                kind: ItemKind::parse(&kind)
                    .ok_or_else(|| format_err!("journal row {} has bad kind '{}'", seq, kind))?,
                action: Action::parse(&action)
                    .ok_or_else(|| format_err!("journal row {} has bad action '{}'", seq, action))?,
                from_path,
                to_path,
                event_time,
            });
        }
        Ok(events)
    }

    // ----- sync watermark -----

    pub fn watermark(&self) -> Result<i64, Error> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = 'journal'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0))
    }

    /// Advance the watermark; called only after the server acknowledged
    /// the batch.
    pub fn set_watermark(&self, value: i64) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO sync_state (key, value) VALUES ('journal', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![value],
        )?;
        Ok(())
    }

    // ----- restore sessions -----

    pub fn create_restore_session(&self, session: &LocalRestoreSession) -> Result<(), Error> {
        self.conn.execute(
            "INSERT OR REPLACE INTO restore_session
             (transfer_id, identity, version, local_path, current_offset,
              total_size, expected_hash, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session.transfer_id,
                session.identity,
                session.version,
                session.local_path.to_string_lossy(),
                session.current_offset as i64,
                session.total_size as i64,
                session.expected_hash,
                session.status.as_str(),
                session.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn update_restore_offset(&self, transfer_id: &str, offset: u64) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE restore_session SET current_offset = ?2, updated_at = ?3
             WHERE transfer_id = ?1",
            params![transfer_id, offset as i64, tools::epoch_i64()],
        )?;
        Ok(())
    }

    pub fn set_restore_status(&self, transfer_id: &str, status: RestoreStatus) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE restore_session SET status = ?2, updated_at = ?3 WHERE transfer_id = ?1",
            params![transfer_id, status.as_str(), tools::epoch_i64()],
        )?;
        Ok(())
    }

    pub fn restore_session(&self, transfer_id: &str) -> Result<Option<LocalRestoreSession>, Error> {
        let session = self
            .conn
            .query_row(
                "SELECT transfer_id, identity, version, local_path, current_offset,
                        total_size, expected_hash, status, updated_at
                 FROM restore_session WHERE transfer_id = ?1",
                params![transfer_id],
                row_to_restore_session,
            )
            .optional()?;
        Ok(session)
    }

    /// Sessions to recover after a crash.
    pub fn open_restore_sessions(&self) -> Result<Vec<LocalRestoreSession>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT transfer_id, identity, version, local_path, current_offset,
                    total_size, expected_hash, status, updated_at
             FROM restore_session WHERE status = 'in_progress'",
        )?;
        let rows = stmt.query_map([], row_to_restore_session)?;
        let mut sessions = Vec::new();
        for session in rows {
            sessions.push(session?);
        }
        Ok(sessions)
    }
}

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<Item> {
    let kind: String = row.get(2)?;
    let action: String = row.get(3)?;
    Ok(Item {
        identity: row.get(0)?,
        current_path: row.get(1)?,
        kind: ItemKind::parse(&kind).unwrap_or(ItemKind::File),
        last_action: Action::parse(&action).unwrap_or(Action::Modify),
        last_event_at: row.get(4)?,
        last_backup_at: row.get(5)?,
    })
}

fn row_to_restore_session(row: &rusqlite::Row) -> rusqlite::Result<LocalRestoreSession> {
    let status: String = row.get(7)?;
    let local_path: String = row.get(3)?;
    Ok(LocalRestoreSession {
        transfer_id: row.get(0)?,
        identity: row.get(1)?,
        version: row.get::<_, i64>(2)? as u32,
        local_path: PathBuf::from(local_path),
        current_offset: row.get::<_, i64>(4)? as u64,
        total_size: row.get::<_, i64>(5)? as u64,
        expected_hash: row.get(6)?,
        status: RestoreStatus::parse(&status).unwrap_or(RestoreStatus::Failed),
        updated_at: row.get(8)?,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn open_scratch() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(&dir.path().join("agent.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn journal_seq_is_strictly_increasing_from_one() {
        let (_dir, store) = open_scratch();
        let mut last = 0;
        for i in 0..5 {
            let seq = store
                .append_event("id-1", ItemKind::File, Action::Modify, "", "/w/a", 100 + i)
                .unwrap();
            assert_eq!(seq, last + 1);
            last = seq;
        }
        let events = store.events_after(0, 10).unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].seq, 1);
        assert!(events.windows(2).all(|w| w[1].seq == w[0].seq + 1));
    }

    #[test]
    fn upsert_keeps_one_row_per_identity() {
        let (_dir, store) = open_scratch();
        store
            .upsert_item("id-1", "/w/a", ItemKind::File, Action::Create, 100)
            .unwrap();
        store
            .upsert_item("id-1", "/w/b", ItemKind::File, Action::Rename, 200)
            .unwrap();

        let item = store.item_by_identity("id-1").unwrap().unwrap();
        assert_eq!(item.current_path, "/w/b");
        assert_eq!(item.last_action, Action::Rename);
        assert!(store.item_by_path("/w/a").unwrap().is_none());
    }

    #[test]
    fn touch_preserves_last_known_path() {
        let (_dir, store) = open_scratch();
        store
            .upsert_item("id-1", "/w/a", ItemKind::File, Action::Create, 100)
            .unwrap();
        store.touch_item("id-1", Action::Delete, 200).unwrap();

        let item = store.item_by_identity("id-1").unwrap().unwrap();
        assert_eq!(item.current_path, "/w/a");
        assert_eq!(item.last_action, Action::Delete);
    }

    #[test]
    fn backup_candidates_skip_backed_up_and_gone_items() {
        let (_dir, store) = open_scratch();
        store
            .upsert_item("fresh", "/w/a", ItemKind::File, Action::Create, 100)
            .unwrap();
        store
            .upsert_item("stale", "/w/b", ItemKind::File, Action::Modify, 100)
            .unwrap();
        store.mark_backed_up("stale", 150).unwrap();
        store
            .upsert_item("gone", "/w/c", ItemKind::File, Action::Create, 100)
            .unwrap();
        store.touch_item("gone", Action::Delete, 110).unwrap();
        store
            .upsert_item("dir", "/w/d", ItemKind::Folder, Action::Create, 100)
            .unwrap();

        let ids: Vec<_> = store
            .backup_candidates(10)
            .unwrap()
            .into_iter()
            .map(|i| i.identity)
            .collect();
        assert_eq!(ids, vec!["fresh".to_string()]);
    }

    #[test]
    fn watermark_roundtrip() {
        let (_dir, store) = open_scratch();
        assert_eq!(store.watermark().unwrap(), 0);
        store.set_watermark(42).unwrap();
        assert_eq!(store.watermark().unwrap(), 42);
    }

    #[test]
    fn items_under_matches_strict_prefix_only() {
        let (_dir, store) = open_scratch();
        store
            .upsert_item("a", "/w/d/a.bin", ItemKind::File, Action::Create, 1)
            .unwrap();
        store
            .upsert_item("b", "/w/d2/b.bin", ItemKind::File, Action::Create, 1)
            .unwrap();
        let under: Vec<_> = store
            .items_under("/w/d")
            .unwrap()
            .into_iter()
            .map(|i| i.identity)
            .collect();
        assert_eq!(under, vec!["a".to_string()]);
    }
}
