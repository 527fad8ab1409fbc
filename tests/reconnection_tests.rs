//! Reconnection tests: durable identities across peer restarts, zombie
//! cleanup once a peer returns, and fallback retention when the pool empties.

mod test_helpers;

use test_helpers::*;

/// Initialize tracing for tests
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_approved_peer_reconnects_without_reapproval() {
    init_tracing();
    let mut cluster = TestCluster::start(1).await;
    let original_id = cluster.handle.list_connected().await.unwrap()[0].id;

    cluster.kill_peer(0);
    cluster.wait_for_connected(0).await;

    // Same instance, same saved identity file: the daemon validates straight
    // back in with no new approval round.
    cluster.spawn_peer(0).await;
    cluster.wait_for_connected(1).await;
    let connected = cluster.handle.list_connected().await.unwrap();
    assert_eq!(connected[0].id, original_id);
    assert!(cluster.handle.list_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_zombie_chunk_cleaned_after_reconnect() {
    init_tracing();
    let mut cluster = TestCluster::start(1).await;
    let contents = b"leftover bytes".repeat(32);
    let source = create_test_file(cluster.temp_dir.path(), "leftover.bin", &contents);
    cluster.handle.distribute(&source).await.unwrap();
    assert_eq!(dir_entry_count(&cluster.peer_chunk_dir(0)), 1);

    // Crash the only owner: the fragment cannot be pulled back, so it is
    // written off and the remote copy becomes a zombie delete.
    cluster.kill_peer(0);
    cluster.wait_for_connected(0).await;
    let handle = cluster.handle.clone();
    wait_for("the fragment to be written off", || {
        let handle = handle.clone();
        async move { !handle.availability("leftover.bin").await.unwrap().retrievable }
    })
    .await;

    // The chunk file survived the crash on disk.
    assert_eq!(dir_entry_count(&cluster.peer_chunk_dir(0)), 1);

    // Once the peer is back, the sweep deletes the stale chunk from it.
    cluster.spawn_peer(0).await;
    cluster.wait_for_connected(1).await;
    let chunk_dir = cluster.peer_chunk_dir(0);
    wait_for("the zombie chunk to be deleted", || {
        let chunk_dir = chunk_dir.clone();
        async move { dir_entry_count(&chunk_dir) == 0 }
    })
    .await;

    // The unretrievable record can still be deleted cleanly.
    cluster.handle.delete("leftover.bin").await.unwrap();
    assert!(cluster.handle.stored_files().await.is_empty());
}

#[tokio::test]
async fn test_fallback_retention_and_drain() {
    init_tracing();
    let mut cluster = TestCluster::start(0).await;
    let manual = spawn_manual_peer(
        cluster.registry.local_addr(),
        &cluster.handle,
        cluster.temp_dir.path().join("manual-chunks"),
    )
    .await;
    cluster.wait_for_connected(1).await;

    let contents = b"kept on the registry when the pool empties".to_vec();
    let source = create_test_file(cluster.temp_dir.path(), "kept.txt", &contents);
    cluster.handle.distribute(&source).await.unwrap();

    // The only peer goes stale with its listener still up: the fragment is
    // pulled back, and with no replacement target it lands in the fallback
    // store on the registry itself.
    manual.stop_heartbeats();
    cluster.wait_for_connected(0).await;
    let fallback_dir = cluster.fallback_dir();
    wait_for("the fragment to reach the fallback store", || {
        let fallback_dir = fallback_dir.clone();
        async move { dir_entry_count(&fallback_dir) == 1 }
    })
    .await;

    // Retrieval is served straight from the fallback store.
    let out = cluster.handle.retrieve_to("kept.txt", None).await.unwrap();
    assert_eq!(std::fs::read(out).unwrap(), contents);

    // A new peer joining gives the sweep somewhere to drain the fragment to.
    cluster.spawn_peer(7).await;
    cluster.approve_pending(1).await;
    cluster.wait_for_connected(1).await;
    wait_for("the fallback store to drain", || {
        let fallback_dir = fallback_dir.clone();
        async move { dir_entry_count(&fallback_dir) == 0 }
    })
    .await;
    assert_eq!(dir_entry_count(&cluster.peer_chunk_dir(7)), 1);

    let availability = cluster.handle.availability("kept.txt").await.unwrap();
    assert!(availability.retrievable);
}
