//! Event batch ingest and the directory-tree projection.
//!
//! The projection is keyed by identity and every update is idempotent, so
//! replayed or out-of-order batches converge on the same tree. History
//! rows are advisory and duplicates are tolerated.

use std::path::Path;

use anyhow::Error;
use log::debug;

use crate::protocol::wire::{
    Action, EventBatch, EventBatchResp, FileTreeQuery, FileTreeResp, ItemKind, SyncEvent, TreeNode,
};
use crate::protocol::{msg, Frame};
use crate::server::store::{DirectoryNode, ServerStore};
use crate::server::ServerState;
use crate::tools;

pub fn handle_sync(state: &ServerState, frame: &Frame) -> Result<Frame, Error> {
    let batch: EventBatch = frame.parse()?;
    let received_at = tools::epoch_i64();

    let store = state.store.lock().unwrap();
    for event in &batch.events {
        store.append_history(&batch.device_id, event, received_at)?;
        apply_event(&store, &batch.device_id, event)?;
    }
    debug!("synced {} events from {}", batch.events.len(), batch.device_id);

    Frame::response(
        msg::EVENT_SYNC_RESP,
        &EventBatchResp { synced: batch.events.len() },
    )
}

/// Fold one event into the directory tree.
pub fn apply_event(store: &ServerStore, device_id: &str, event: &SyncEvent) -> Result<(), Error> {
    match event.action {
        Action::Create | Action::Modify | Action::Rename => {
            if event.path.is_empty() {
                return Ok(());
            }
            let parent_identity = ensure_parent(store, device_id, &event.path)?;

            if event.action == Action::Rename && event.kind == ItemKind::Folder {
                // sweep the descendants onto the new prefix
                if let Some(existing) = store.node_by_identity(device_id, &event.identity)? {
                    if existing.path != event.path {
                        store.update_descendant_paths(device_id, &existing.path, &event.path)?;
                    }
                }
            }

            store.upsert_node(&DirectoryNode {
                device_id: device_id.to_string(),
                identity: event.identity.clone(),
                parent_identity,
                name: basename(&event.path),
                path: event.path.clone(),
                kind: event.kind,
                is_deleted: false,
            })?;
        }
        Action::Delete | Action::MoveOut => {
            store.mark_node_deleted(device_id, &event.identity)?;
        }
    }
    Ok(())
}

/// Resolve (and if necessary materialize) the parent folder chain of
/// `path`. Placeholder folders get the same deterministic identity the
/// endpoint derives, so a later real folder event lands on the same node.
fn ensure_parent(
    store: &ServerStore,
    device_id: &str,
    path: &str,
) -> Result<Option<String>, Error> {
    let parent_path = match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() && parent != Path::new("/") => {
            parent.to_string_lossy().into_owned()
        }
        _ => return Ok(None),
    };

    if let Some(existing) = store.node_by_path(device_id, &parent_path)? {
        return Ok(Some(existing.identity));
    }

    let grandparent = ensure_parent(store, device_id, &parent_path)?;
    let identity = tools::folder_identity(device_id, Path::new(&parent_path));
    store.upsert_node(&DirectoryNode {
        device_id: device_id.to_string(),
        identity: identity.clone(),
        parent_identity: grandparent,
        name: basename(&parent_path),
        path: parent_path,
        kind: ItemKind::Folder,
        is_deleted: false,
    })?;
    Ok(Some(identity))
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

pub fn handle_tree(state: &ServerState, frame: &Frame) -> Result<Frame, Error> {
    let query: FileTreeQuery = frame.parse()?;
    let page = if query.page == 0 { 1 } else { query.page };
    let page_size = if query.page_size == 0 { 20 } else { query.page_size };

    let store = state.store.lock().unwrap();
    let (nodes, total) = store.tree_children(
        &query.device_id,
        query.parent_identity.as_deref(),
        page,
        page_size,
        query.show_deleted,
    )?;

    Frame::response(
        msg::FILE_TREE_RESP,
        &FileTreeResp {
            nodes: nodes
                .into_iter()
                .map(|n| TreeNode {
                    identity: n.identity,
                    parent_identity: n.parent_identity,
                    name: n.name,
                    path: n.path,
                    kind: n.kind,
                    is_deleted: n.is_deleted,
                })
                .collect(),
            total,
            page,
            page_size,
        },
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn open_scratch() -> (tempfile::TempDir, ServerStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ServerStore::open(&dir.path().join("server.db")).unwrap();
        (dir, store)
    }

    fn event(identity: &str, action: Action, kind: ItemKind, path: &str) -> SyncEvent {
        SyncEvent {
            identity: identity.to_string(),
            action,
            kind,
            path: path.to_string(),
            old_path: String::new(),
            ts: 1,
        }
    }

    #[test]
    fn projection_is_idempotent_under_replay() {
        let (_dir, store) = open_scratch();
        let batch = vec![
            event("fold", Action::Create, ItemKind::Folder, "/w/d"),
            event("f1", Action::Create, ItemKind::File, "/w/d/a.bin"),
            event("f1", Action::Modify, ItemKind::File, "/w/d/a.bin"),
        ];
        for _ in 0..3 {
            for evt in &batch {
                apply_event(&store, "dev", evt).unwrap();
            }
        }

        let node = store.node_by_identity("dev", "f1").unwrap().unwrap();
        assert_eq!(node.path, "/w/d/a.bin");
        assert!(!node.is_deleted);
        // exactly one node per identity, however often the batch replays
        let folder = store.node_by_identity("dev", "fold").unwrap().unwrap();
        assert_eq!(folder.path, "/w/d");
    }

    #[test]
    fn placeholder_parents_use_the_derived_folder_identity() {
        let (_dir, store) = open_scratch();
        apply_event(
            &store,
            "dev",
            &event("f1", Action::Create, ItemKind::File, "/w/d/a.bin"),
        )
        .unwrap();

        let node = store.node_by_identity("dev", "f1").unwrap().unwrap();
        let expected = tools::folder_identity("dev", Path::new("/w/d"));
        assert_eq!(node.parent_identity.as_deref(), Some(expected.as_str()));

        // a later real folder event converges on the placeholder node
        apply_event(
            &store,
            "dev",
            &event(&expected, Action::Create, ItemKind::Folder, "/w/d"),
        )
        .unwrap();
        let folder = store.node_by_identity("dev", &expected).unwrap().unwrap();
        assert_eq!(folder.kind, ItemKind::Folder);
        assert_eq!(folder.path, "/w/d");
    }

    #[test]
    fn folder_rename_sweeps_descendant_paths() {
        let (_dir, store) = open_scratch();
        let folder = tools::folder_identity("dev", Path::new("/w/old"));
        apply_event(&store, "dev", &event(&folder, Action::Create, ItemKind::Folder, "/w/old"))
            .unwrap();
        apply_event(&store, "dev", &event("f1", Action::Create, ItemKind::File, "/w/old/a.bin"))
            .unwrap();

        apply_event(&store, "dev", &event(&folder, Action::Rename, ItemKind::Folder, "/w/new"))
            .unwrap();

        let child = store.node_by_identity("dev", "f1").unwrap().unwrap();
        assert_eq!(child.path, "/w/new/a.bin");
        let moved = store.node_by_identity("dev", &folder).unwrap().unwrap();
        assert_eq!(moved.path, "/w/new");
    }

    #[test]
    fn folder_delete_cascades_to_descendants() {
        let (_dir, store) = open_scratch();
        let folder = tools::folder_identity("dev", Path::new("/w/d"));
        apply_event(&store, "dev", &event(&folder, Action::Create, ItemKind::Folder, "/w/d"))
            .unwrap();
        for (id, path) in [("a", "/w/d/a.bin"), ("b", "/w/d/b.bin"), ("c", "/w/d/sub/c.bin")] {
            apply_event(&store, "dev", &event(id, Action::Create, ItemKind::File, path)).unwrap();
        }

        apply_event(&store, "dev", &event(&folder, Action::Delete, ItemKind::Folder, ""))
            .unwrap();

        for id in [folder.as_str(), "a", "b", "c"] {
            let node = store.node_by_identity("dev", id).unwrap().unwrap();
            assert!(node.is_deleted, "{} should be deleted", id);
        }
    }

    #[test]
    fn rename_of_a_file_updates_path_without_new_identity() {
        let (_dir, store) = open_scratch();
        apply_event(&store, "dev", &event("f1", Action::Create, ItemKind::File, "/w/x/a.bin"))
            .unwrap();
        apply_event(&store, "dev", &event("f1", Action::Rename, ItemKind::File, "/w/y/a.bin"))
            .unwrap();

        let node = store.node_by_identity("dev", "f1").unwrap().unwrap();
        assert_eq!(node.path, "/w/y/a.bin");
        assert!(!node.is_deleted);
        let parent = tools::folder_identity("dev", Path::new("/w/y"));
        assert_eq!(node.parent_identity.as_deref(), Some(parent.as_str()));
    }
}
