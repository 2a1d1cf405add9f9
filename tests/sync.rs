//! Watermark sync against a live server: at-least-once delivery, the
//! directory-tree projection and the admin tree query.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::watch;

use sagiri_guard::client::{sync, Client};
use sagiri_guard::config::ServerConfig;
use sagiri_guard::protocol::msg;
use sagiri_guard::protocol::wire::{Action, FileTreeQuery, FileTreeResp, ItemKind};
use sagiri_guard::server::{self, ServerState};
use sagiri_guard::store::LocalStore;
use sagiri_guard::tools;

async fn start_server() -> (Arc<ServerState>, String, watch::Sender<bool>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        bind: "127.0.0.1:0".to_string(),
        data_dir: dir.path().join("data"),
        storage_root: dir.path().join("blobs"),
    };
    let state = Arc::new(ServerState::new(&config).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(server::run_with_listener(state.clone(), listener, shutdown_rx));
    (state, addr, shutdown, dir)
}

async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return;
        }
        if Instant::now() > deadline {
            panic!("condition not reached within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn journal_flows_to_the_server_and_projects_a_tree() {
    let (state, addr, shutdown, _server_dir) = start_server().await;

    let agent_dir = tempfile::tempdir().unwrap();
    let db_path = agent_dir.path().join("agent.db");
    let store = LocalStore::open(&db_path).unwrap();

    let folder = tools::folder_identity("dev-1", Path::new("/w/d"));
    store
        .append_event(&folder, ItemKind::Folder, Action::Create, "", "/w/d", 100)
        .unwrap();
    store
        .append_event("f-a", ItemKind::File, Action::Create, "", "/w/d/a.bin", 101)
        .unwrap();
    store
        .append_event("f-a", ItemKind::File, Action::Rename, "/w/d/a.bin", "/w/d/b.bin", 102)
        .unwrap();
    store
        .append_event("f-b", ItemKind::File, Action::Create, "", "/w/d/c.bin", 103)
        .unwrap();
    let last = store
        .append_event("f-b", ItemKind::File, Action::Delete, "/w/d/c.bin", "", 104)
        .unwrap();

    let client = Client::new(addr.clone());
    let (pump_shutdown, pump_shutdown_rx) = watch::channel(false);
    let db_path2 = db_path.clone();
    let pump = tokio::spawn(async move {
        sync::run_pump(client, &db_path2, "dev-1".to_string(), pump_shutdown_rx).await
    });

    // the watermark advances only after the server acknowledged
    wait_for(Duration::from_secs(15), || store.watermark().unwrap() == last).await;

    {
        let server_store = state.store.lock().unwrap();
        let renamed = server_store.node_by_identity("dev-1", "f-a").unwrap().unwrap();
        assert_eq!(renamed.path, "/w/d/b.bin");
        assert!(!renamed.is_deleted);

        let deleted = server_store.node_by_identity("dev-1", "f-b").unwrap().unwrap();
        assert!(deleted.is_deleted);

        let folder_node = server_store.node_by_identity("dev-1", &folder).unwrap().unwrap();
        assert_eq!(folder_node.kind, ItemKind::Folder);
        assert_eq!(folder_node.path, "/w/d");
    }

    // crash between fetch and acknowledgement: rewind the watermark and
    // let the pump redeliver; the projection must not change
    store.set_watermark(0).unwrap();
    wait_for(Duration::from_secs(15), || store.watermark().unwrap() == last).await;

    {
        let server_store = state.store.lock().unwrap();
        let renamed = server_store.node_by_identity("dev-1", "f-a").unwrap().unwrap();
        assert_eq!(renamed.path, "/w/d/b.bin");
        let deleted = server_store.node_by_identity("dev-1", "f-b").unwrap().unwrap();
        assert!(deleted.is_deleted);
    }

    // the admin tree query sees the projected children
    let admin = Client::new(addr);
    let resp: FileTreeResp = admin
        .call(
            msg::FILE_TREE,
            &FileTreeQuery {
                device_id: "dev-1".to_string(),
                parent_identity: Some(folder.clone()),
                page: 1,
                page_size: 50,
                show_deleted: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(resp.nodes.len(), 1);
    assert_eq!(resp.nodes[0].identity, "f-a");
    assert_eq!(resp.nodes[0].path, "/w/d/b.bin");

    let _ = pump_shutdown.send(true);
    let _ = pump.await;
    let _ = shutdown.send(true);
}
