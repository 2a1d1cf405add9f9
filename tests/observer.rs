//! Observer scenarios against a real watched directory: identity
//! stability across rename, and the delete cascade.
//!
//! Runs degrade to a skip on filesystems without `user.*` extended
//! attribute support (the agent treats such items as untracked).

use std::path::Path;
use std::time::{Duration, Instant};

use sagiri_guard::monitor::{tag_store, Observer};
use sagiri_guard::protocol::wire::Action;
use sagiri_guard::store::LocalStore;

fn xattr_supported(dir: &Path) -> bool {
    let probe = dir.join("probe");
    std::fs::write(&probe, b"x").unwrap();
    let ok = tag_store::ensure(&probe).is_ok();
    let _ = std::fs::remove_file(&probe);
    ok
}

fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn identity_survives_rename_and_deletes_cascade() {
    let dir = tempfile::tempdir().unwrap();
    if !xattr_supported(dir.path()) {
        eprintln!("skipping: extended attributes unsupported here");
        return;
    }

    let root = dir.path().join("w");
    std::fs::create_dir_all(&root).unwrap();
    let db_path = dir.path().join("agent.db");
    let store = LocalStore::open(&db_path).unwrap();

    let observer = Observer::start("dev-1", &db_path, &[root.clone()]).unwrap();
    // give the watch registration a moment
    std::thread::sleep(Duration::from_millis(300));

    // --- create ---
    let file = root.join("a.bin");
    std::fs::write(&file, b"payload").unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || {
            store
                .item_by_path(&file.to_string_lossy())
                .unwrap()
                .is_some()
        }),
        "create event never reached the store"
    );
    let identity = store
        .item_by_path(&file.to_string_lossy())
        .unwrap()
        .unwrap()
        .identity;
    assert_eq!(tag_store::get(&file).as_deref(), Some(identity.as_str()));

    // --- rename within the watched root ---
    let renamed = root.join("b.bin");
    std::fs::rename(&file, &renamed).unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || {
            store
                .item_by_identity(&identity)
                .unwrap()
                .map(|item| item.current_path == renamed.to_string_lossy())
                .unwrap_or(false)
        }),
        "rename was not applied to the item"
    );
    // the tag moved with the file: same identity, no new row
    assert_eq!(tag_store::get(&renamed).as_deref(), Some(identity.as_str()));
    let rename_events: Vec<_> = store
        .events_after(0, 1000)
        .unwrap()
        .into_iter()
        .filter(|e| e.identity == identity && e.action == Action::Rename)
        .collect();
    assert!(!rename_events.is_empty(), "no rename event journaled");

    // --- delete cascade over a subtree ---
    let sub = root.join("d");
    std::fs::create_dir(&sub).unwrap();
    let child_a = sub.join("x.bin");
    let child_b = sub.join("y.bin");
    std::fs::write(&child_a, b"xx").unwrap();
    std::fs::write(&child_b, b"yy").unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || {
            store.item_by_path(&child_a.to_string_lossy()).unwrap().is_some()
                && store.item_by_path(&child_b.to_string_lossy()).unwrap().is_some()
        }),
        "children never tracked"
    );
    let id_a = store
        .item_by_path(&child_a.to_string_lossy())
        .unwrap()
        .unwrap()
        .identity;
    let id_b = store
        .item_by_path(&child_b.to_string_lossy())
        .unwrap()
        .unwrap()
        .identity;

    std::fs::remove_dir_all(&sub).unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || {
            [&id_a, &id_b].iter().all(|id| {
                store
                    .item_by_identity(id)
                    .unwrap()
                    .map(|item| item.last_action == Action::Delete)
                    .unwrap_or(false)
            })
        }),
        "delete did not cascade to the children"
    );
    let deletes: Vec<_> = store
        .events_after(0, 1000)
        .unwrap()
        .into_iter()
        .filter(|e| e.action == Action::Delete)
        .collect();
    assert!(deletes.len() >= 2, "expected delete events for the subtree");
    assert!(deletes.iter().all(|e| e.to_path.is_empty()));

    observer.stop();
}

#[test]
fn journal_seq_has_no_gaps_after_observation() {
    let dir = tempfile::tempdir().unwrap();
    if !xattr_supported(dir.path()) {
        eprintln!("skipping: extended attributes unsupported here");
        return;
    }

    let root = dir.path().join("w");
    std::fs::create_dir_all(&root).unwrap();
    let db_path = dir.path().join("agent.db");
    let store = LocalStore::open(&db_path).unwrap();

    let observer = Observer::start("dev-1", &db_path, &[root.clone()]).unwrap();
    std::thread::sleep(Duration::from_millis(300));

    for i in 0..10 {
        std::fs::write(root.join(format!("f{}.bin", i)), b"data").unwrap();
    }
    assert!(
        wait_for(Duration::from_secs(10), || {
            store.events_after(0, 1000).unwrap().len() >= 10
        }),
        "events never arrived"
    );
    observer.stop();

    let events = store.events_after(0, 1000).unwrap();
    assert_eq!(events[0].seq, 1);
    assert!(
        events.windows(2).all(|w| w[1].seq == w[0].seq + 1),
        "journal has gaps"
    );
}
