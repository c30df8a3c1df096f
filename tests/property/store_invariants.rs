//! Property-based tests for the conversation store.
//!
//! Uses proptest to drive a [`ConversationStore`] through arbitrary
//! operation sequences and verify the structural invariants hold after
//! every step:
//! 1. No two messages share a server id.
//! 2. No two messages share a correlation id.
//! 3. The view is append-only: existing entries keep their position and
//!    identity, only delivery state / id / timestamp may change in place.
//!    The one exception is the seed itself, which splices the transcript
//!    ahead of optimistic copies made while the load was in flight — no
//!    entry is lost, but positions shift once.
//! 4. Confirmed and received messages carry a server id and timestamp;
//!    pending and failed ones carry neither.
//! 5. Feeding the same record twice never produces a second entry.

use std::collections::HashSet;

use proptest::prelude::*;
use sohbet::conversation::{ApplyOutcome, ConversationStore, DeliveryState};
use sohbet_proto::message::{LocalId, MessageId, MessageRecord, Timestamp, UserId};

const SELF_ID: &str = "me";
const PEER_ID: &str = "peer";

/// One scripted operation against the store.
#[derive(Debug, Clone)]
enum Op {
    Seed(Vec<(u8, bool, u8)>),
    /// (id, from_peer, content, echo_local_id_of_optimistic_n)
    Apply {
        id: u8,
        from_peer: bool,
        content: u8,
        echo_of: Option<u8>,
    },
    AppendOptimistic(u8),
    /// Mark the n-th issued optimistic copy failed.
    MarkFailed(u8),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        prop::collection::vec((0u8..16, any::<bool>(), 0u8..8), 0..6).prop_map(Op::Seed),
        (0u8..16, any::<bool>(), 0u8..8, prop::option::of(0u8..4)).prop_map(
            |(id, from_peer, content, echo_of)| Op::Apply {
                id,
                from_peer,
                content,
                echo_of,
            }
        ),
        (0u8..8).prop_map(Op::AppendOptimistic),
        (0u8..4).prop_map(Op::MarkFailed),
    ]
}

fn make_record(id: u8, from_peer: bool, content: u8, local_id: Option<LocalId>) -> MessageRecord {
    let (sender, receiver) = if from_peer {
        (PEER_ID, SELF_ID)
    } else {
        (SELF_ID, PEER_ID)
    };
    MessageRecord {
        id: MessageId::new(format!("m{id}")),
        sender_id: UserId::new(sender),
        receiver_id: UserId::new(receiver),
        content: format!("content-{content}"),
        timestamp: Timestamp::from_millis(u64::from(id) * 100),
        local_id,
    }
}

/// Check the structural invariants of the current view.
fn check_invariants(store: &ConversationStore) {
    let view = store.messages();

    let mut server_ids = HashSet::new();
    let mut local_ids = HashSet::new();
    for message in view {
        if let Some(id) = &message.id {
            assert!(
                server_ids.insert(id.clone()),
                "duplicate server id {id} in view"
            );
        }
        if let Some(local_id) = message.local_id {
            assert!(
                local_ids.insert(local_id),
                "duplicate correlation id {local_id} in view"
            );
        }
        match message.delivery {
            DeliveryState::Confirmed | DeliveryState::Received => {
                assert!(message.id.is_some(), "confirmed message without server id");
                assert!(
                    message.timestamp.is_some(),
                    "confirmed message without timestamp"
                );
            }
            DeliveryState::Pending | DeliveryState::Failed => {
                assert!(message.id.is_none(), "unconfirmed message with server id");
                assert!(
                    message.timestamp.is_none(),
                    "unconfirmed message with timestamp"
                );
            }
        }
    }
}

/// Snapshot of the identity-bearing parts of the view, used to verify
/// append-only behavior across operations.
fn identities(store: &ConversationStore) -> Vec<(String, String)> {
    store
        .messages()
        .iter()
        .map(|m| (m.sender_id.as_str().to_string(), m.content.clone()))
        .collect()
}

proptest! {
    #[test]
    fn store_invariants_hold_across_any_operation_sequence(ops in prop::collection::vec(arb_op(), 0..40)) {
        let mut store = ConversationStore::new(UserId::new(SELF_ID), UserId::new(PEER_ID));
        let mut issued: Vec<LocalId> = Vec::new();

        for op in ops {
            let before = identities(&store);
            let mut spliced = false;

            match op {
                Op::Seed(rows) => {
                    let transcript = rows
                        .into_iter()
                        .map(|(id, from_peer, content)| make_record(id, from_peer, content, None))
                        .collect();
                    // A second seed must be rejected and change nothing.
                    let was_seeded = store.is_seeded();
                    let result = store.seed(transcript);
                    prop_assert_eq!(result.is_err(), was_seeded);
                    spliced = !was_seeded;
                }
                Op::Apply { id, from_peer, content, echo_of } => {
                    let local_id = echo_of.and_then(|n| issued.get(usize::from(n)).copied());
                    // An echo is always from self; ignore from_peer then.
                    let from_peer = from_peer && local_id.is_none();
                    store.apply_incoming(make_record(id, from_peer, content, local_id));
                }
                Op::AppendOptimistic(content) => {
                    issued.push(store.append_optimistic(format!("content-{content}")));
                }
                Op::MarkFailed(n) => {
                    if let Some(local_id) = issued.get(usize::from(n)).copied() {
                        store.mark_failed(local_id);
                    }
                }
            }

            check_invariants(&store);

            let after = identities(&store);
            prop_assert!(after.len() >= before.len());
            if spliced {
                // The seed reorders (history first) but loses nothing.
                for entry in &before {
                    prop_assert!(after.contains(entry));
                }
            } else {
                // Append-only: the previous view is a prefix of the new one.
                prop_assert_eq!(&after[..before.len()], &before[..]);
            }
        }
    }

    #[test]
    fn duplicate_application_is_idempotent(
        id in 0u8..16,
        from_peer in any::<bool>(),
        content in 0u8..8,
    ) {
        let mut store = ConversationStore::new(UserId::new(SELF_ID), UserId::new(PEER_ID));
        store.seed(Vec::new()).unwrap();

        let record = make_record(id, from_peer, content, None);
        store.apply_incoming(record.clone());
        let len_after_first = store.messages().len();

        let outcome = store.apply_incoming(record);
        prop_assert_eq!(outcome, ApplyOutcome::Duplicate);
        prop_assert_eq!(store.messages().len(), len_after_first);
    }

    #[test]
    fn every_optimistic_copy_is_trackable(contents in prop::collection::vec(0u8..8, 1..10)) {
        let mut store = ConversationStore::new(UserId::new(SELF_ID), UserId::new(PEER_ID));
        store.seed(Vec::new()).unwrap();

        let mut issued = Vec::new();
        for content in contents {
            issued.push(store.append_optimistic(format!("content-{content}")));
        }

        // Each issued correlation id maps to exactly one pending entry.
        for local_id in issued {
            let matching = store
                .messages()
                .iter()
                .filter(|m| m.local_id == Some(local_id))
                .count();
            prop_assert_eq!(matching, 1);
        }
    }
}
