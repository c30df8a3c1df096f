// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::needless_continue,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::redundant_pub_crate,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! Reconnection behavior against a real backend.
//!
//! Verifies the supervised link detects an unexpected closure, backs off,
//! redials, and resumes messaging; and that the attempt cap terminates the
//! link when the backend stays gone.
//!
//! ## Disconnect simulation
//!
//! Aborting the server's `JoinHandle` does not close already-established
//! WebSocket connections (they live on independently-spawned tasks). Two
//! mechanisms are used instead: `ServerState::close_all_connections`
//! (server-initiated close frames) and a TCP proxy whose connection tasks
//! are aborted to simulate a network partition.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sohbet::conversation::DeliveryState;
use sohbet::history::RestClient;
use sohbet::reconnect::{ConnectionLink, LinkState, ReconnectConfig};
use sohbet::session::SessionManager;
use sohbet::transport::Credential;
use sohbet::transport::ws::WsConnector;
use sohbet_proto::message::UserId;
use sohbet_server::server::{ServerState, start_server_with_state};

type Session = SessionManager<WsConnector, RestClient>;

// =============================================================================
// TCP proxy helper
// =============================================================================

/// A TCP proxy between the client and the real backend. Calling `kill()`
/// aborts all tracked connection tasks, dropping both ends of every proxied
/// stream so the client's WebSocket layer sees an immediate disconnect.
struct TcpProxy {
    client_addr: String,
    accept_handle: tokio::task::JoinHandle<()>,
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    async fn new(proxy_port: u16, backend_addr: &str) -> Self {
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{proxy_port}"))
            .await
            .unwrap_or_else(|e| panic!("proxy: failed to bind port {proxy_port}: {e}"));
        let bound_addr = listener.local_addr().unwrap();
        let client_addr = format!("127.0.0.1:{}", bound_addr.port());
        let backend = backend_addr.to_string();
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let conn_handles_clone = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            loop {
                let Ok((mut client_stream, _)) = listener.accept().await else {
                    break;
                };
                let backend = backend.clone();
                let conn_handle = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(&backend).await
                    else {
                        return;
                    };
                    let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                        .await;
                });
                conn_handles_clone.lock().push(conn_handle);
            }
        });

        Self {
            client_addr,
            accept_handle,
            conn_handles,
        }
    }

    fn kill(self) {
        self.accept_handle.abort();
        let handles = self.conn_handles.lock();
        for h in handles.iter() {
            h.abort();
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn find_free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind port 0");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(2),
        max_attempts: None,
    }
}

fn build_session(
    ws_base: &str,
    http_base: &str,
    token: &str,
    reconnect: ReconnectConfig,
) -> Session {
    let credential = Credential::new(token);
    let link = ConnectionLink::spawn(WsConnector::new(ws_base), credential.clone(), reconnect, 64);
    let rest = RestClient::new(http_base, credential);
    SessionManager::new(UserId::new(token), link, rest, 64)
}

async fn wait_for_link_state(session: &Session, want: LinkState, timeout: Duration) {
    let mut rx = session.watch_link_state();
    tokio::time::timeout(timeout, async {
        while *rx.borrow() != want {
            rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for link state {want}"));
}

// =============================================================================
// Test 1: reconnect after server-initiated close
// =============================================================================

#[tokio::test]
async fn reconnects_after_server_close() {
    let state = Arc::new(ServerState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();

    let alice = build_session(
        &format!("ws://{addr}"),
        &format!("http://{addr}"),
        "alice",
        fast_reconnect(),
    );
    wait_for_link_state(&alice, LinkState::Connected, Duration::from_secs(5)).await;

    // Server drops every connection; the link must notice and redial.
    // The watch channel coalesces, so wait for any departure from
    // Connected rather than the (brief) BackingOff state specifically.
    let mut rx = alice.watch_link_state();
    state.close_all_connections().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while *rx.borrow_and_update() == LinkState::Connected {
            rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .expect("link never noticed the server close");
    wait_for_link_state(&alice, LinkState::Connected, Duration::from_secs(10)).await;

    // Messaging resumes on the new connection.
    let bob_id = UserId::new("bob");
    alice.select_peer(bob_id.clone()).await.unwrap();
    alice.send_message(&bob_id, "after reconnect").await.unwrap();

    let confirmed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let view = alice.conversation_view(&bob_id).unwrap();
            if view
                .last()
                .is_some_and(|m| m.delivery == DeliveryState::Confirmed)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(confirmed.is_ok(), "message never confirmed after reconnect");

    alice.shutdown();
}

// =============================================================================
// Test 2: reconnect through a network partition
// =============================================================================

#[tokio::test]
async fn reconnects_after_network_partition() {
    let state = Arc::new(ServerState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &addr.to_string()).await;

    let alice = build_session(
        &format!("ws://{}", proxy.client_addr),
        &format!("http://{addr}"),
        "alice",
        fast_reconnect(),
    );
    wait_for_link_state(&alice, LinkState::Connected, Duration::from_secs(5)).await;

    // Sever every proxied stream: the link backs off and keeps dialing.
    proxy.kill();
    wait_for_link_state(&alice, LinkState::BackingOff, Duration::from_secs(5)).await;

    // Bring the proxy back on the same port; the next attempt succeeds.
    let _proxy2 = TcpProxy::new(proxy_port, &addr.to_string()).await;
    wait_for_link_state(&alice, LinkState::Connected, Duration::from_secs(10)).await;

    alice.shutdown();
}

// =============================================================================
// Test 3: attempt cap exhausts into Terminated
// =============================================================================

#[tokio::test]
async fn attempt_cap_exhausts_into_terminated() {
    // Nothing is listening on this address.
    let alice = build_session(
        "ws://127.0.0.1:1",
        "http://127.0.0.1:1",
        "alice",
        ReconnectConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts: Some(3),
        },
    );

    wait_for_link_state(&alice, LinkState::Terminated, Duration::from_secs(10)).await;
    assert_eq!(alice.link_state(), LinkState::Terminated);
}

// =============================================================================
// Test 4: explicit teardown during backoff stays down
// =============================================================================

#[tokio::test]
async fn shutdown_during_backoff_terminates() {
    let state = Arc::new(ServerState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();

    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &addr.to_string()).await;
    let alice = build_session(
        &format!("ws://{}", proxy.client_addr),
        &format!("http://{addr}"),
        "alice",
        ReconnectConfig {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            max_attempts: None,
        },
    );
    wait_for_link_state(&alice, LinkState::Connected, Duration::from_secs(5)).await;

    proxy.kill();
    wait_for_link_state(&alice, LinkState::BackingOff, Duration::from_secs(5)).await;

    // Teardown while a retry is pending must not leave a dialing task behind.
    alice.shutdown();
    wait_for_link_state(&alice, LinkState::Terminated, Duration::from_secs(5)).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(alice.link_state(), LinkState::Terminated);
}
