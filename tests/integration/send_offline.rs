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

//! Sending while the link is down.
//!
//! A send attempted with no live connection must fail fast: the optimistic
//! copy stays visible, flips to failed, nothing is transmitted, and no
//! error escapes to the caller beyond content validation.

use std::time::Duration;

use sohbet::conversation::DeliveryState;
use sohbet::history::{HistoryError, HistoryLoader, RestClient};
use sohbet::reconnect::{ConnectionLink, ReconnectConfig};
use sohbet::session::{SelectError, SendError, SessionEvent, SessionManager};
use sohbet::transport::Credential;
use sohbet::transport::ws::WsConnector;
use sohbet_proto::message::{MessageRecord, UserId};
use tokio::sync::mpsc;

/// A session whose connector dials an address nothing listens on.
fn offline_session() -> SessionManager<WsConnector, RestClient> {
    let credential = Credential::new("alice");
    let link = ConnectionLink::spawn(
        WsConnector::new("ws://127.0.0.1:1"),
        credential.clone(),
        ReconnectConfig {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(1),
            max_attempts: None,
        },
        16,
    );
    let rest = RestClient::new("http://127.0.0.1:1", credential);
    SessionManager::new(UserId::new("alice"), link, rest, 32)
}

async fn wait_for_event<F>(rx: &mut mpsc::Receiver<SessionEvent>, description: &str, pred: F)
where
    F: Fn(&SessionEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline - tokio::time::Instant::now();
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(evt)) if pred(&evt) => return,
            Ok(Some(_)) => {}
            Ok(None) => panic!("event channel closed while waiting for {description}"),
            Err(_) => break,
        }
    }
    panic!("timeout waiting for {description}");
}

#[tokio::test]
async fn offline_send_marks_copy_failed() {
    let session = offline_session();
    let mut events = session.take_events().unwrap();
    let bob_id = UserId::new("bob");

    let local_id = session.send_message(&bob_id, "into the void").await.unwrap();

    // The copy is inserted and promptly marked failed; the second
    // ConversationUpdated signals the state flip.
    wait_for_event(&mut events, "optimistic insert", |evt| {
        matches!(evt, SessionEvent::ConversationUpdated { .. })
    })
    .await;
    wait_for_event(&mut events, "failure flip", |evt| {
        matches!(evt, SessionEvent::ConversationUpdated { .. })
    })
    .await;

    let view = session.conversation_view(&bob_id).unwrap();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].local_id, Some(local_id));
    assert_eq!(view[0].delivery, DeliveryState::Failed);
    assert!(view[0].id.is_none(), "no server id without a round trip");

    session.shutdown();
}

#[tokio::test]
async fn offline_send_returns_ok_not_error() {
    let session = offline_session();
    let bob_id = UserId::new("bob");

    // Transport failure is a delivery-state concern, not a caller error.
    let result = session.send_message(&bob_id, "still ok").await;
    assert!(result.is_ok());

    session.shutdown();
}

#[tokio::test]
async fn validation_still_applies_while_offline() {
    let session = offline_session();
    let bob_id = UserId::new("bob");

    let result = session.send_message(&bob_id, "  \n ").await;
    assert!(matches!(result, Err(SendError::InvalidContent(_))));
    // Nothing inserted for rejected content.
    assert!(
        session
            .conversation_view(&bob_id)
            .is_none_or(|view| view.is_empty())
    );

    session.shutdown();
}

#[tokio::test]
async fn history_load_failure_is_reported_and_retryable() {
    /// Fails the first load, succeeds on the second.
    struct FlakyLoader {
        calls: std::sync::atomic::AtomicU32,
    }

    impl HistoryLoader for FlakyLoader {
        async fn load(&self, _peer: &UserId) -> Result<Vec<MessageRecord>, HistoryError> {
            let n = self
                .calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                Err(HistoryError::Unavailable("connection refused".into()))
            } else {
                Ok(Vec::new())
            }
        }
    }

    let credential = Credential::new("alice");
    let link = ConnectionLink::spawn(
        WsConnector::new("ws://127.0.0.1:1"),
        credential,
        ReconnectConfig::default(),
        16,
    );
    let session = SessionManager::new(
        UserId::new("alice"),
        link,
        FlakyLoader {
            calls: std::sync::atomic::AtomicU32::new(0),
        },
        32,
    );
    let mut events = session.take_events().unwrap();
    let bob_id = UserId::new("bob");

    // First selection fails; the error goes to the caller and the event
    // stream, and no conversation is seeded.
    let first = session.select_peer(bob_id.clone()).await;
    assert!(matches!(
        first,
        Err(SelectError::History(HistoryError::Unavailable(_)))
    ));
    wait_for_event(&mut events, "history failure notice", |evt| {
        matches!(evt, SessionEvent::HistoryFailed { .. })
    })
    .await;

    // No background retry happened: selecting again is the retry.
    let second = session.select_peer(bob_id.clone()).await;
    assert!(second.is_ok());
    assert!(session.conversation_view(&bob_id).is_some());

    session.shutdown();
}
