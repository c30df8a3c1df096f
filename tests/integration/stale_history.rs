// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! Stale history responses during rapid peer switching.
//!
//! When the user selects peer A and then peer B before A's transcript
//! arrives, the late response must be discarded — it must not seed a
//! conversation the user has already navigated away from. Scripted
//! loaders control the timing; the loopback transport stands in for the
//! live channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sohbet::history::{HistoryError, HistoryLoader};
use sohbet::reconnect::{ConnectionLink, ReconnectConfig};
use sohbet::session::SessionManager;
use sohbet::transport::loopback::LoopbackTransport;
use sohbet::transport::{Connector, Credential, TransportError};
use sohbet_proto::message::{MessageId, MessageRecord, Timestamp, UserId};

/// Connector handing out fresh loopback transports (peers are dropped,
/// which is fine — these tests never exercise the wire).
struct LoopbackConnector;

impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&self, _credential: &Credential) -> Result<LoopbackTransport, TransportError> {
        let (transport, peer) = LoopbackTransport::create_pair(16);
        // Keep the peer alive for the transport's lifetime.
        std::mem::forget(peer);
        Ok(transport)
    }
}

/// Loader with a per-peer artificial delay and canned transcripts.
struct ScriptedLoader {
    delays: HashMap<String, Duration>,
    transcripts: HashMap<String, Vec<MessageRecord>>,
}

impl HistoryLoader for ScriptedLoader {
    async fn load(&self, peer: &UserId) -> Result<Vec<MessageRecord>, HistoryError> {
        if let Some(delay) = self.delays.get(peer.as_str()) {
            tokio::time::sleep(*delay).await;
        }
        Ok(self
            .transcripts
            .get(peer.as_str())
            .cloned()
            .unwrap_or_default())
    }
}

fn record(id: &str, sender: &str, receiver: &str, content: &str) -> MessageRecord {
    MessageRecord {
        id: MessageId::new(id),
        sender_id: UserId::new(sender),
        receiver_id: UserId::new(receiver),
        content: content.into(),
        timestamp: Timestamp::from_millis(1_000),
        local_id: None,
    }
}

fn session_with(loader: ScriptedLoader) -> Arc<SessionManager<LoopbackConnector, ScriptedLoader>> {
    let link = ConnectionLink::spawn(
        LoopbackConnector,
        Credential::new("me"),
        ReconnectConfig::default(),
        16,
    );
    Arc::new(SessionManager::new(UserId::new("me"), link, loader, 32))
}

#[tokio::test]
async fn late_response_for_superseded_selection_is_discarded() {
    let loader = ScriptedLoader {
        delays: HashMap::from([("slow-peer".to_string(), Duration::from_millis(300))]),
        transcripts: HashMap::from([
            (
                "slow-peer".to_string(),
                vec![record("m1", "slow-peer", "me", "stale transcript")],
            ),
            (
                "fast-peer".to_string(),
                vec![record("m2", "fast-peer", "me", "current transcript")],
            ),
        ]),
    };
    let session = session_with(loader);

    // Select the slow peer, then switch away before its load lands.
    let slow = Arc::clone(&session);
    let slow_task =
        tokio::spawn(async move { slow.select_peer(UserId::new("slow-peer")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.select_peer(UserId::new("fast-peer")).await.unwrap();

    // The superseded load completes without error and without effect.
    let stale_result = slow_task.await.unwrap();
    assert!(stale_result.is_ok());

    assert!(
        session
            .conversation_view(&UserId::new("slow-peer"))
            .is_none(),
        "stale transcript must not create a conversation"
    );
    let view = session
        .conversation_view(&UserId::new("fast-peer"))
        .unwrap();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].content, "current transcript");

    session.shutdown();
}

#[tokio::test]
async fn reselecting_same_peer_supersedes_the_first_load() {
    // Both selections target the same peer; the first, slower load must
    // not clobber the state seeded by the second.
    let loader = ScriptedLoader {
        delays: HashMap::new(),
        transcripts: HashMap::from([(
            "peer".to_string(),
            vec![record("m1", "peer", "me", "transcript")],
        )]),
    };
    let session = session_with(loader);
    let peer = UserId::new("peer");

    session.select_peer(peer.clone()).await.unwrap();
    session.select_peer(peer.clone()).await.unwrap();

    // Re-selection replaced the store and reseeded it; the transcript
    // appears exactly once.
    let view = session.conversation_view(&peer).unwrap();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].content, "transcript");

    session.shutdown();
}

#[tokio::test]
async fn switching_back_and_forth_settles_on_the_last_selection() {
    let loader = ScriptedLoader {
        delays: HashMap::from([
            ("a".to_string(), Duration::from_millis(200)),
            ("b".to_string(), Duration::from_millis(100)),
        ]),
        transcripts: HashMap::from([
            ("a".to_string(), vec![record("m1", "a", "me", "from a")]),
            ("b".to_string(), vec![record("m2", "b", "me", "from b")]),
        ]),
    };
    let session = session_with(loader);

    let s1 = Arc::clone(&session);
    let t1 = tokio::spawn(async move { s1.select_peer(UserId::new("a")).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let s2 = Arc::clone(&session);
    let t2 = tokio::spawn(async move { s2.select_peer(UserId::new("b")).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The final selection is "a" again; it reloads and wins.
    session.select_peer(UserId::new("a")).await.unwrap();
    let _ = t1.await.unwrap();
    let _ = t2.await.unwrap();

    let view = session.conversation_view(&UserId::new("a")).unwrap();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].content, "from a");
    assert!(session.conversation_view(&UserId::new("b")).is_none());

    session.shutdown();
}
