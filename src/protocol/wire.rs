//! Payload structs for every message type.
//!
//! The legacy dynamic-type bags are replaced by explicit per-message
//! structs; chunk bodies travel as lowercase hex in the `data` field.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What happened to an item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Modify,
    Rename,
    Delete,
    MoveOut,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Modify => "modify",
            Action::Rename => "rename",
            Action::Delete => "delete",
            Action::MoveOut => "move_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Action::Create),
            "modify" => Some(Action::Modify),
            "rename" => Some(Action::Rename),
            "delete" => Some(Action::Delete),
            "move_out" => Some(Action::MoveOut),
            _ => None,
        }
    }

    /// Terminal actions take the item out of its current path.
    pub fn is_terminal(self) -> bool {
        matches!(self, Action::Delete | Action::MoveOut)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    File,
    Folder,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::File => "file",
            ItemKind::Folder => "folder",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(ItemKind::File),
            "folder" => Some(ItemKind::Folder),
            _ => None,
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of every failure response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

// ----- device registration (0xC1/0xC2) -----

/// Which role a connection plays after registration.
pub const CHANNEL_REQUEST: &str = "request";
pub const CHANNEL_COMMAND: &str = "command";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceRegister {
    pub device_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os_name: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub arch: String,
    /// `request` (default) or `command`; a command channel stays open for
    /// server-initiated pushes.
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceRegisterResp {
    pub device_id: String,
}

// ----- file-event batch sync (0xE6/0xE7) -----

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncEvent {
    pub identity: String,
    pub action: Action,
    pub kind: ItemKind,
    pub path: String,
    #[serde(default)]
    pub old_path: String,
    /// UNIX seconds.
    pub ts: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventBatch {
    pub device_id: String,
    pub events: Vec<SyncEvent>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventBatchResp {
    pub synced: usize,
}

// ----- backup session (0xF1..0xF9) -----

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupResumeProbe {
    pub device_id: String,
    pub identity: String,
    pub head_hash: String,
    pub total_size: u64,
}

pub const RESUME_FOUND: &str = "found";
pub const RESUME_NOT_FOUND: &str = "not_found";
pub const RESUME_MISMATCH: &str = "mismatch";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupResumeResp {
    /// `found`, `not_found` or `mismatch`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupInit {
    pub device_id: String,
    pub identity: String,
    pub file_name: String,
    pub total_size: u64,
    pub head_hash: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupInitResp {
    pub transfer_id: String,
    pub version: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupChunk {
    pub transfer_id: String,
    pub offset: u64,
    pub data_len: u64,
    /// Lowercase hex.
    pub data: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupChunkResp {
    pub current_offset: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupFinish {
    pub transfer_id: String,
    pub full_hash: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupFinishResp {
    pub version: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupCancel {
    pub transfer_id: String,
}

// ----- restore session (0x70..0x7A) -----

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminRestore {
    pub device_id: String,
    pub identity: String,
    /// 0 selects the latest snapshot.
    #[serde(default)]
    pub version: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminRestoreResp {
    pub status: String,
    pub message: String,
}

/// Pushed to the endpoint on its command channel (0x72).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestoreCommand {
    pub identity: String,
    #[serde(default)]
    pub version: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestoreInit {
    pub device_id: String,
    pub identity: String,
    /// 0 selects the latest snapshot.
    #[serde(default)]
    pub version: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestoreInitResp {
    pub transfer_id: String,
    pub file_name: String,
    pub version: u32,
    pub total_size: u64,
    pub full_hash: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestoreChunkReq {
    pub transfer_id: String,
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestoreChunkResp {
    /// Lowercase hex; short at EOF.
    pub data: String,
    pub data_len: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestoreFinish {
    pub transfer_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestoreFinishResp {
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestoreResume {
    pub transfer_id: String,
}

// ----- admin file tree (0xE8/0xE9) -----

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileTreeQuery {
    pub device_id: String,
    /// None selects the roots.
    #[serde(default)]
    pub parent_identity: Option<String>,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub page_size: u32,
    #[serde(default)]
    pub show_deleted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreeNode {
    pub identity: String,
    #[serde(default)]
    pub parent_identity: Option<String>,
    pub name: String,
    pub path: String,
    pub kind: ItemKind,
    pub is_deleted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileTreeResp {
    pub nodes: Vec<TreeNode>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}
