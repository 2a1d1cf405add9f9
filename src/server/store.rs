//! Durable records on the central service: transfer sessions, snapshots,
//! per-device event history, the derived directory tree and the command
//! queue.

use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use rusqlite::{params, Connection, OptionalExtension};

use crate::protocol::wire::{DeviceRegister, ItemKind, SyncEvent};
use crate::tools;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    InProgress,
    Canceled,
    Failed,
    Done,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Canceled => "canceled",
            SessionStatus::Failed => "failed",
            SessionStatus::Done => "done",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(SessionStatus::InProgress),
            "canceled" => Some(SessionStatus::Canceled),
            "failed" => Some(SessionStatus::Failed),
            "done" => Some(SessionStatus::Done),
            _ => None,
        }
    }
}

/// One endpoint→server transfer in flight (or settled).
#[derive(Clone, Debug)]
pub struct BackupSession {
    pub transfer_id: String,
    pub device_id: String,
    pub identity: String,
    pub file_name: String,
    pub version: u32,
    pub current_offset: u64,
    pub total_size: u64,
    pub head_hash: String,
    pub blob_path: PathBuf,
    pub status: SessionStatus,
    pub updated_at: i64,
}

/// A completed, immutable backup version.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub device_id: String,
    pub identity: String,
    pub version: u32,
    pub blob_path: PathBuf,
    pub size: u64,
    pub full_hash: String,
    pub created_at: i64,
}

/// One server→endpoint transfer.
#[derive(Clone, Debug)]
pub struct RestoreSession {
    pub transfer_id: String,
    pub device_id: String,
    pub identity: String,
    pub file_name: String,
    pub version: u32,
    pub blob_path: PathBuf,
    pub total_size: u64,
    pub full_hash: String,
    pub status: SessionStatus,
}

/// A node of the derived directory tree, keyed by identity.
#[derive(Clone, Debug)]
pub struct DirectoryNode {
    pub device_id: String,
    pub identity: String,
    pub parent_identity: Option<String>,
    pub name: String,
    pub path: String,
    pub kind: ItemKind,
    pub is_deleted: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Sent,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        }
    }
}

/// A queued administrative command for a device.
#[derive(Clone, Debug)]
pub struct Command {
    pub id: i64,
    pub device_id: String,
    pub command_type: u8,
    pub payload: String,
}

pub struct ServerStore {
    conn: Connection,
}

impl ServerStore {
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
            CREATE TABLE IF NOT EXISTS device (
                device_id TEXT PRIMARY KEY,
                hostname TEXT NOT NULL DEFAULT '',
                os_name TEXT NOT NULL DEFAULT '',
                os_version TEXT NOT NULL DEFAULT '',
                arch TEXT NOT NULL DEFAULT '',
                registered_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS backup_session (
                transfer_id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                identity TEXT NOT NULL,
                file_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                current_offset INTEGER NOT NULL,
                total_size INTEGER NOT NULL,
                head_hash TEXT NOT NULL,
                blob_path TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS backup_session_item
                ON backup_session(device_id, identity, status);
            CREATE TABLE IF NOT EXISTS snapshot (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                identity TEXT NOT NULL,
                version INTEGER NOT NULL,
                blob_path TEXT NOT NULL,
                size INTEGER NOT NULL,
                full_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(device_id, identity, version)
            );
            CREATE TABLE IF NOT EXISTS restore_session (
                transfer_id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                identity TEXT NOT NULL,
                file_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                blob_path TEXT NOT NULL,
                total_size INTEGER NOT NULL,
                full_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS event_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                identity TEXT NOT NULL,
                action TEXT NOT NULL,
                path TEXT NOT NULL,
                old_path TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL,
                event_time INTEGER NOT NULL,
                received_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS event_history_device
                ON event_history(device_id, identity);
            CREATE TABLE IF NOT EXISTS directory_node (
                device_id TEXT NOT NULL,
                identity TEXT NOT NULL,
                parent_identity TEXT,
                name TEXT NOT NULL,
                path TEXT NOT NULL,
                kind TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY(device_id, identity)
            );
            CREATE INDEX IF NOT EXISTS directory_node_path
                ON directory_node(device_id, path);
            CREATE TABLE IF NOT EXISTS command (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                command_type INTEGER NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS command_device ON command(device_id, status);",
        )?;
        Ok(Self { conn })
    }

    // ----- devices -----

    pub fn upsert_device(&self, reg: &DeviceRegister) -> Result<(), Error> {
        let now = tools::epoch_i64();
        self.conn.execute(
            "INSERT INTO device
                 (device_id, hostname, os_name, os_version, arch, registered_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(device_id) DO UPDATE SET
                hostname = excluded.hostname,
                os_name = excluded.os_name,
                os_version = excluded.os_version,
                arch = excluded.arch,
                last_seen_at = excluded.last_seen_at",
            params![reg.device_id, reg.hostname, reg.os_name, reg.os_version, reg.arch, now],
        )?;
        Ok(())
    }

    // ----- backup sessions -----

    /// Create a fresh session. Any session still `in_progress` for the
    /// same `(device, identity)` is superseded (canceled) first, keeping
    /// at most one in flight.
    pub fn create_backup_session(&self, session: &BackupSession) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE backup_session SET status = 'canceled', updated_at = ?3
             WHERE device_id = ?1 AND identity = ?2 AND status = 'in_progress'",
            params![session.device_id, session.identity, tools::epoch_i64()],
        )?;
        self.conn.execute(
            "INSERT INTO backup_session
                 (transfer_id, device_id, identity, file_name, version, current_offset,
                  total_size, head_hash, blob_path, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                session.transfer_id,
                session.device_id,
                session.identity,
                session.file_name,
                session.version,
                session.current_offset as i64,
                session.total_size as i64,
                session.head_hash,
                session.blob_path.to_string_lossy(),
                session.status.as_str(),
                session.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn backup_session(&self, transfer_id: &str) -> Result<Option<BackupSession>, Error> {
        let session = self
            .conn
            .query_row(
                "SELECT transfer_id, device_id, identity, file_name, version, current_offset,
                        total_size, head_hash, blob_path, status, updated_at
                 FROM backup_session WHERE transfer_id = ?1",
                params![transfer_id],
                row_to_backup_session,
            )
            .optional()?;
        Ok(session)
    }

    /// The at-most-one `in_progress` session for an item, if any.
    pub fn active_backup_session(
        &self,
        device_id: &str,
        identity: &str,
    ) -> Result<Option<BackupSession>, Error> {
        let session = self
            .conn
            .query_row(
                "SELECT transfer_id, device_id, identity, file_name, version, current_offset,
                        total_size, head_hash, blob_path, status, updated_at
                 FROM backup_session
                 WHERE device_id = ?1 AND identity = ?2 AND status = 'in_progress'
                 ORDER BY updated_at DESC LIMIT 1",
                params![device_id, identity],
                row_to_backup_session,
            )
            .optional()?;
        Ok(session)
    }

    /// Advance `current_offset` monotonically.
    pub fn update_backup_offset(&self, transfer_id: &str, offset_end: u64) -> Result<u64, Error> {
        self.conn.execute(
            "UPDATE backup_session
             SET current_offset = MAX(current_offset, ?2), updated_at = ?3
             WHERE transfer_id = ?1",
            params![transfer_id, offset_end as i64, tools::epoch_i64()],
        )?;
        let current = self.conn.query_row(
            "SELECT current_offset FROM backup_session WHERE transfer_id = ?1",
            params![transfer_id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(current as u64)
    }

    pub fn set_backup_status(&self, transfer_id: &str, status: SessionStatus) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE backup_session SET status = ?2, updated_at = ?3 WHERE transfer_id = ?1",
            params![transfer_id, status.as_str(), tools::epoch_i64()],
        )?;
        Ok(())
    }

    // ----- snapshots -----

    /// Highest committed version for an item; 0 when none exists.
    pub fn latest_snapshot_version(&self, device_id: &str, identity: &str) -> Result<u32, Error> {
        let version = self
            .conn
            .query_row(
                "SELECT MAX(version) FROM snapshot WHERE device_id = ?1 AND identity = ?2",
                params![device_id, identity],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten()
            .unwrap_or(0);
        Ok(version as u32)
    }

    pub fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO snapshot
                 (device_id, identity, version, blob_path, size, full_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot.device_id,
                snapshot.identity,
                snapshot.version,
                snapshot.blob_path.to_string_lossy(),
                snapshot.size as i64,
                snapshot.full_hash,
                snapshot.created_at,
            ],
        )?;
        Ok(())
    }

    /// A specific version, or the latest when `version` is 0.
    pub fn snapshot(
        &self,
        device_id: &str,
        identity: &str,
        version: u32,
    ) -> Result<Option<Snapshot>, Error> {
        let sql = if version == 0 {
            "SELECT device_id, identity, version, blob_path, size, full_hash, created_at
             FROM snapshot WHERE device_id = ?1 AND identity = ?2
             ORDER BY version DESC LIMIT 1"
        } else {
            "SELECT device_id, identity, version, blob_path, size, full_hash, created_at
             FROM snapshot WHERE device_id = ?1 AND identity = ?2 AND version = ?3
             LIMIT 1"
        };
        let snapshot = if version == 0 {
            self.conn
                .query_row(sql, params![device_id, identity], row_to_snapshot)
                .optional()?
        } else {
            self.conn
                .query_row(sql, params![device_id, identity, version], row_to_snapshot)
                .optional()?
        };
        Ok(snapshot)
    }

    // ----- restore sessions -----

    pub fn create_restore_session(&self, session: &RestoreSession) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO restore_session
                 (transfer_id, device_id, identity, file_name, version, blob_path,
                  total_size, full_hash, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                session.transfer_id,
                session.device_id,
                session.identity,
                session.file_name,
                session.version,
                session.blob_path.to_string_lossy(),
                session.total_size as i64,
                session.full_hash,
                session.status.as_str(),
                tools::epoch_i64(),
            ],
        )?;
        Ok(())
    }

    pub fn restore_session(&self, transfer_id: &str) -> Result<Option<RestoreSession>, Error> {
        let session = self
            .conn
            .query_row(
                "SELECT transfer_id, device_id, identity, file_name, version, blob_path,
                        total_size, full_hash, status
                 FROM restore_session WHERE transfer_id = ?1",
                params![transfer_id],
                |row| {
                    let status: String = row.get(8)?;
                    let blob_path: String = row.get(5)?;
                    Ok(RestoreSession {
                        transfer_id: row.get(0)?,
                        device_id: row.get(1)?,
                        identity: row.get(2)?,
                        file_name: row.get(3)?,
                        version: row.get::<_, i64>(4)? as u32,
                        blob_path: PathBuf::from(blob_path),
                        total_size: row.get::<_, i64>(6)? as u64,
                        full_hash: row.get(7)?,
                        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Failed),
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    pub fn set_restore_status(&self, transfer_id: &str, status: SessionStatus) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE restore_session SET status = ?2, updated_at = ?3 WHERE transfer_id = ?1",
            params![transfer_id, status.as_str(), tools::epoch_i64()],
        )?;
        Ok(())
    }

    // ----- event history -----

    /// History rows are advisory; duplicates from redelivered batches are
    /// tolerated.
    pub fn append_history(
        &self,
        device_id: &str,
        event: &SyncEvent,
        received_at: i64,
    ) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO event_history
                 (device_id, identity, action, path, old_path, kind, event_time, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                device_id,
                event.identity,
                event.action.as_str(),
                event.path,
                event.old_path,
                event.kind.as_str(),
                event.ts,
                received_at,
            ],
        )?;
        Ok(())
    }

    // ----- directory tree -----

    pub fn node_by_identity(
        &self,
        device_id: &str,
        identity: &str,
    ) -> Result<Option<DirectoryNode>, Error> {
        let node = self
            .conn
            .query_row(
                "SELECT device_id, identity, parent_identity, name, path, kind, is_deleted
                 FROM directory_node WHERE device_id = ?1 AND identity = ?2",
                params![device_id, identity],
                row_to_node,
            )
            .optional()?;
        Ok(node)
    }

    /// The live node at `path`, if any.
    pub fn node_by_path(&self, device_id: &str, path: &str) -> Result<Option<DirectoryNode>, Error> {
        let node = self
            .conn
            .query_row(
                "SELECT device_id, identity, parent_identity, name, path, kind, is_deleted
                 FROM directory_node
                 WHERE device_id = ?1 AND path = ?2 AND is_deleted = 0
                 LIMIT 1",
                params![device_id, path],
                row_to_node,
            )
            .optional()?;
        Ok(node)
    }

    /// Idempotent upsert keyed by `(device_id, identity)`.
    pub fn upsert_node(&self, node: &DirectoryNode) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO directory_node
                 (device_id, identity, parent_identity, name, path, kind, is_deleted, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(device_id, identity) DO UPDATE SET
                parent_identity = excluded.parent_identity,
                name = excluded.name,
                path = excluded.path,
                kind = excluded.kind,
                is_deleted = excluded.is_deleted,
                updated_at = excluded.updated_at",
            params![
                node.device_id,
                node.identity,
                node.parent_identity,
                node.name,
                node.path,
                node.kind.as_str(),
                node.is_deleted as i64,
                tools::epoch_i64(),
            ],
        )?;
        Ok(())
    }

    /// Soft-delete a node; a folder takes every descendant (by path
    /// prefix) with it.
    pub fn mark_node_deleted(&self, device_id: &str, identity: &str) -> Result<(), Error> {
        let node = match self.node_by_identity(device_id, identity)? {
            Some(node) => node,
            None => return Ok(()),
        };
        self.conn.execute(
            "UPDATE directory_node SET is_deleted = 1, updated_at = ?3
             WHERE device_id = ?1 AND identity = ?2",
            params![device_id, identity, tools::epoch_i64()],
        )?;
        if node.kind == ItemKind::Folder {
            let prefix = format!("{}/", node.path.trim_end_matches('/'));
            self.conn.execute(
                "UPDATE directory_node SET is_deleted = 1, updated_at = ?3
                 WHERE device_id = ?1 AND path LIKE ?2 || '%'",
                params![device_id, prefix, tools::epoch_i64()],
            )?;
        }
        Ok(())
    }

    /// Rewrite the path prefix of every descendant after a folder rename,
    /// in one sweep.
    pub fn update_descendant_paths(
        &self,
        device_id: &str,
        old_path: &str,
        new_path: &str,
    ) -> Result<usize, Error> {
        let old_prefix = format!("{}/", old_path.trim_end_matches('/'));
        let new_prefix = format!("{}/", new_path.trim_end_matches('/'));
        let changed = self.conn.execute(
            "UPDATE directory_node
             SET path = ?3 || SUBSTR(path, LENGTH(?2) + 1), updated_at = ?4
             WHERE device_id = ?1 AND path LIKE ?2 || '%'",
            params![device_id, old_prefix, new_prefix, tools::epoch_i64()],
        )?;
        Ok(changed)
    }

    /// Children of a parent node (or the roots), paginated.
    pub fn tree_children(
        &self,
        device_id: &str,
        parent_identity: Option<&str>,
        page: u32,
        page_size: u32,
        show_deleted: bool,
    ) -> Result<(Vec<DirectoryNode>, u64), Error> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 500);
        let deleted_clause = if show_deleted { "" } else { " AND is_deleted = 0" };

        let (filter, param): (&str, Option<&str>) = match parent_identity {
            Some(id) => (" AND parent_identity = ?2", Some(id)),
            None => (" AND parent_identity IS NULL", None),
        };

        let count_sql = format!(
            "SELECT COUNT(*) FROM directory_node WHERE device_id = ?1{}{}",
            filter, deleted_clause
        );
        let select_sql = format!(
            "SELECT device_id, identity, parent_identity, name, path, kind, is_deleted
             FROM directory_node WHERE device_id = ?1{}{}
             ORDER BY kind DESC, name ASC LIMIT {} OFFSET {}",
            filter,
            deleted_clause,
            page_size,
            (page - 1) * page_size,
        );

        let total: i64 = match param {
            Some(p) => self
                .conn
                .query_row(&count_sql, params![device_id, p], |row| row.get(0))?,
            None => self
                .conn
                .query_row(&count_sql, params![device_id], |row| row.get(0))?,
        };

        let mut nodes = Vec::new();
        match param {
            Some(p) => {
                let mut stmt = self.conn.prepare(&select_sql)?;
                let rows = stmt.query_map(params![device_id, p], row_to_node)?;
                for node in rows {
                    nodes.push(node?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare(&select_sql)?;
                let rows = stmt.query_map(params![device_id], row_to_node)?;
                for node in rows {
                    nodes.push(node?);
                }
            }
        }
        Ok((nodes, total as u64))
    }

    // ----- command queue -----

    pub fn insert_command(
        &self,
        device_id: &str,
        command_type: u8,
        payload: &str,
    ) -> Result<i64, Error> {
        let now = tools::epoch_i64();
        self.conn.execute(
            "INSERT INTO command (device_id, command_type, payload, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
            params![device_id, command_type as i64, payload, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Pending commands in insertion order.
    pub fn pending_commands(&self, device_id: &str) -> Result<Vec<Command>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT id, device_id, command_type, payload FROM command
             WHERE device_id = ?1 AND status = 'pending' ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![device_id], |row| {
            Ok(Command {
                id: row.get(0)?,
                device_id: row.get(1)?,
                command_type: row.get::<_, i64>(2)? as u8,
                payload: row.get(3)?,
            })
        })?;
        let mut commands = Vec::new();
        for command in rows {
            commands.push(command?);
        }
        Ok(commands)
    }

    pub fn set_command_status(&self, id: i64, status: CommandStatus) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE command SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), tools::epoch_i64()],
        )?;
        Ok(())
    }
}

fn row_to_backup_session(row: &rusqlite::Row) -> rusqlite::Result<BackupSession> {
    let status: String = row.get(9)?;
    let blob_path: String = row.get(8)?;
    Ok(BackupSession {
        transfer_id: row.get(0)?,
        device_id: row.get(1)?,
        identity: row.get(2)?,
        file_name: row.get(3)?,
        version: row.get::<_, i64>(4)? as u32,
        current_offset: row.get::<_, i64>(5)? as u64,
        total_size: row.get::<_, i64>(6)? as u64,
        head_hash: row.get(7)?,
        blob_path: PathBuf::from(blob_path),
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Failed),
        updated_at: row.get(10)?,
    })
}

fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<Snapshot> {
    let blob_path: String = row.get(3)?;
    Ok(Snapshot {
        device_id: row.get(0)?,
        identity: row.get(1)?,
        version: row.get::<_, i64>(2)? as u32,
        blob_path: PathBuf::from(blob_path),
        size: row.get::<_, i64>(4)? as u64,
        full_hash: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<DirectoryNode> {
    let kind: String = row.get(5)?;
    Ok(DirectoryNode {
        device_id: row.get(0)?,
        identity: row.get(1)?,
        parent_identity: row.get(2)?,
        name: row.get(3)?,
        path: row.get(4)?,
        kind: ItemKind::parse(&kind).unwrap_or(ItemKind::File),
        is_deleted: row.get::<_, i64>(6)? != 0,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn open_scratch() -> (tempfile::TempDir, ServerStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ServerStore::open(&dir.path().join("server.db")).unwrap();
        (dir, store)
    }

    fn session(transfer_id: &str, device: &str, identity: &str, version: u32) -> BackupSession {
        BackupSession {
            transfer_id: transfer_id.to_string(),
            device_id: device.to_string(),
            identity: identity.to_string(),
            file_name: "a.bin".to_string(),
            version,
            current_offset: 0,
            total_size: 1024,
            head_hash: "deadbeef".to_string(),
            blob_path: PathBuf::from("/tmp/blob"),
            status: SessionStatus::InProgress,
            updated_at: 1,
        }
    }

    #[test]
    fn a_fresh_session_supersedes_the_active_one() {
        let (_dir, store) = open_scratch();
        store.create_backup_session(&session("t1", "dev", "id", 1)).unwrap();
        store.create_backup_session(&session("t2", "dev", "id", 2)).unwrap();

        let active = store.active_backup_session("dev", "id").unwrap().unwrap();
        assert_eq!(active.transfer_id, "t2");
        let old = store.backup_session("t1").unwrap().unwrap();
        assert_eq!(old.status, SessionStatus::Canceled);
    }

    #[test]
    fn offsets_advance_monotonically() {
        let (_dir, store) = open_scratch();
        store.create_backup_session(&session("t1", "dev", "id", 1)).unwrap();
        assert_eq!(store.update_backup_offset("t1", 100).unwrap(), 100);
        // a replayed earlier chunk cannot move the offset backwards
        assert_eq!(store.update_backup_offset("t1", 50).unwrap(), 100);
        assert_eq!(store.update_backup_offset("t1", 150).unwrap(), 150);
    }

    #[test]
    fn snapshot_versions_are_dense_per_item() {
        let (_dir, store) = open_scratch();
        assert_eq!(store.latest_snapshot_version("dev", "id").unwrap(), 0);
        for version in 1..=3 {
            store
                .insert_snapshot(&Snapshot {
                    device_id: "dev".to_string(),
                    identity: "id".to_string(),
                    version,
                    blob_path: PathBuf::from(format!("/b/v{}", version)),
                    size: 10,
                    full_hash: "h".to_string(),
                    created_at: version as i64,
                })
                .unwrap();
        }
        assert_eq!(store.latest_snapshot_version("dev", "id").unwrap(), 3);

        let latest = store.snapshot("dev", "id", 0).unwrap().unwrap();
        assert_eq!(latest.version, 3);
        let second = store.snapshot("dev", "id", 2).unwrap().unwrap();
        assert_eq!(second.blob_path, PathBuf::from("/b/v2"));
        assert!(store.snapshot("dev", "id", 9).unwrap().is_none());
    }

    #[test]
    fn duplicate_snapshot_version_is_rejected() {
        let (_dir, store) = open_scratch();
        let snap = Snapshot {
            device_id: "dev".to_string(),
            identity: "id".to_string(),
            version: 1,
            blob_path: PathBuf::from("/b/v1"),
            size: 10,
            full_hash: "h".to_string(),
            created_at: 1,
        };
        store.insert_snapshot(&snap).unwrap();
        assert!(store.insert_snapshot(&snap).is_err());
    }

    #[test]
    fn pending_commands_keep_insertion_order() {
        let (_dir, store) = open_scratch();
        let first = store.insert_command("dev", 0x72, "{}").unwrap();
        let second = store.insert_command("dev", 0x72, "{}").unwrap();
        store.set_command_status(first, CommandStatus::Sent).unwrap();

        let pending = store.pending_commands("dev").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);
    }
}
