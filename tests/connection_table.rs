//! Integration tests for the connection table.
//!
//! Exercises add-or-replace teardown, removal semantics and self-removal on
//! peer disconnect, over real sockets on 127.0.0.1.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test connection_table -- --nocapture

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use segrelay::{ConnectionTable, LocalBridge, PeerLink};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const SELF_QUAD: [u8; 4] = [10, 0, 0, 1];

/// Bridge double for a quiet segment: broadcasts vanish, receive pends.
struct QuietBridge;

#[async_trait]
impl LocalBridge for QuietBridge {
    async fn broadcast(&self, _frame: &[u8]) -> io::Result<()> {
        Ok(())
    }

    async fn receive(&self, _buf: &mut [u8]) -> io::Result<usize> {
        std::future::pending().await
    }
}

/// One established TCP connection: (local end, remote end).
async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
    let (remote, _) = accepted.expect("accept");
    (connected.expect("connect"), remote)
}

/// Register a link under `peer_id`; returns the remote end of its socket.
async fn add_link(table: &ConnectionTable, peer_id: &str) -> (Arc<PeerLink>, TcpStream) {
    let (local, remote) = tcp_pair().await;
    let peer_addr = local.peer_addr().expect("peer addr");
    let (link, task) = PeerLink::spawn(
        peer_id.to_string(),
        peer_addr,
        local,
        SELF_QUAD,
        Arc::new(QuietBridge),
        table.clone(),
    );
    table.add_or_replace(link.clone(), task).await;
    (link, remote)
}

/// Assert the remote end observes the link's socket closing.
async fn expect_closed(mut remote: TcpStream) {
    let mut buf = [0u8; 16];
    let read = timeout(TEST_TIMEOUT, remote.read(&mut buf))
        .await
        .expect("socket never closed");
    assert_eq!(read.expect("read"), 0, "expected EOF on old link's socket");
}

async fn wait_for_len(table: &ConnectionTable, len: usize) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    loop {
        if table.snapshot().await.len() == len {
            return;
        }
        assert!(Instant::now() < deadline, "table never reached {len} entries");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ============================================================================
// Add-or-replace
// ============================================================================

#[tokio::test]
async fn replace_keeps_only_the_new_link() {
    let table = ConnectionTable::spawn();

    let (_old_link, old_remote) = add_link(&table, "10.0.0.7").await;
    let (new_link, _new_remote) = add_link(&table, "10.0.0.7").await;

    let snapshot = table.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].0, "10.0.0.7");
    assert!(
        Arc::ptr_eq(&snapshot[0].1, &new_link),
        "table must hold the replacement link"
    );

    expect_closed(old_remote).await;
}

#[tokio::test]
async fn distinct_peers_coexist_in_order() {
    let table = ConnectionTable::spawn();

    let (_b, _rb) = add_link(&table, "10.0.0.9").await;
    let (_a, _ra) = add_link(&table, "10.0.0.8").await;

    let ids: Vec<String> = table.snapshot().await.into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec!["10.0.0.8".to_string(), "10.0.0.9".to_string()]);
}

// ============================================================================
// Removal
// ============================================================================

#[tokio::test]
async fn remove_closes_socket_and_empties_table() {
    let table = ConnectionTable::spawn();
    let (_link, remote) = add_link(&table, "10.0.0.7").await;

    assert!(table.remove("10.0.0.7").await);
    assert!(table.snapshot().await.is_empty());

    expect_closed(remote).await;
}

#[tokio::test]
async fn remove_absent_is_a_noop() {
    let table = ConnectionTable::spawn();
    let (_link, _remote) = add_link(&table, "10.0.0.7").await;

    assert!(!table.remove("10.9.9.9").await);
    assert_eq!(table.snapshot().await.len(), 1);
}

#[tokio::test]
async fn remove_on_empty_table_returns_false() {
    let table = ConnectionTable::spawn();
    assert!(!table.remove("10.0.0.7").await);
    assert!(table.snapshot().await.is_empty());
}

// ============================================================================
// Self-removal on disconnect
// ============================================================================

#[tokio::test]
async fn disconnected_peer_reclaims_its_entry() {
    let table = ConnectionTable::spawn();
    let (_link, remote) = add_link(&table, "10.0.0.7").await;
    wait_for_len(&table, 1).await;

    // The remote side hangs up; the receive task must remove its own entry.
    drop(remote);
    wait_for_len(&table, 0).await;
}

#[tokio::test]
async fn late_self_removal_spares_the_replacement() {
    let table = ConnectionTable::spawn();

    let (_old_link, old_remote) = add_link(&table, "10.0.0.7").await;
    let (new_link, _new_remote) = add_link(&table, "10.0.0.7").await;

    // Old link's task exits now that its socket is gone; its self-removal
    // must not evict the replacement registered under the same identifier.
    drop(old_remote);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = table.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert!(Arc::ptr_eq(&snapshot[0].1, &new_link));
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn shutdown_tears_down_every_link() {
    let table = ConnectionTable::spawn();
    let (_l1, r1) = add_link(&table, "10.0.0.7").await;
    let (_l2, r2) = add_link(&table, "10.0.0.8").await;

    table.shutdown().await;

    expect_closed(r1).await;
    expect_closed(r2).await;
}
