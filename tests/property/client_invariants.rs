//! Property-based tests for the client's state invariants.
//!
//! Uses proptest to verify:
//! 1. The message buffer never holds two messages with the same id, keeps
//!    first arrivals in order, and always keeps id-less messages.
//! 2. Backoff delays never decrease with the attempt count and never
//!    exceed the ceiling.
//! 3. Presence behaves as a set under any sequence of seeds, joins and
//!    leaves.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use bowlchat::backoff::Backoff;
use bowlchat::buffer::MessageBuffer;
use bowlchat::presence::PresenceTracker;
use bowlchat_proto::event::ChatMessage;
use proptest::prelude::*;

/// Strategy for a delivery: an optional id drawn from a small pool so
/// duplicates are common.
fn arb_delivery() -> impl Strategy<Value = (Option<u8>, String)> {
    (prop::option::weighted(0.8, 0u8..8), "[a-z ]{0,12}")
}

fn message(id: Option<u8>, content: &str) -> ChatMessage {
    let message = ChatMessage::new("bob", content);
    match id {
        Some(id) => message.with_id(format!("m{id}")),
        None => message,
    }
}

#[derive(Debug, Clone)]
enum PresenceOp {
    Seed(BTreeSet<String>),
    Join(String),
    Leave(String),
}

fn arb_identity() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["alice", "bob", "carol", "dave", "erin"]).prop_map(String::from)
}

fn arb_presence_op() -> impl Strategy<Value = PresenceOp> {
    prop_oneof![
        prop::collection::btree_set(arb_identity(), 0..5).prop_map(PresenceOp::Seed),
        arb_identity().prop_map(PresenceOp::Join),
        arb_identity().prop_map(PresenceOp::Leave),
    ]
}

proptest! {
    #[test]
    fn buffer_ids_stay_unique(deliveries in prop::collection::vec(arb_delivery(), 0..64)) {
        let mut buffer = MessageBuffer::new();
        for (id, content) in &deliveries {
            buffer.ingest(message(*id, content));
        }

        let ids: Vec<&str> = buffer.iter().filter_map(|m| m.id.as_deref()).collect();
        let unique: HashSet<&str> = ids.iter().copied().collect();
        prop_assert_eq!(ids.len(), unique.len());

        // First arrivals survive, in arrival order; id-less messages always do.
        let mut seen = HashSet::new();
        let expected: Vec<String> = deliveries
            .iter()
            .filter(|(id, _)| id.is_none_or(|id| seen.insert(id)))
            .map(|(_, content)| content.clone())
            .collect();
        let kept: Vec<String> = buffer.iter().map(|m| m.content.clone()).collect();
        prop_assert_eq!(kept, expected);
    }

    #[test]
    fn redelivery_never_grows_the_buffer(deliveries in prop::collection::vec(arb_delivery(), 1..32)) {
        let mut buffer = MessageBuffer::new();
        for (id, content) in deliveries.iter().filter(|(id, _)| id.is_some()) {
            buffer.ingest(message(*id, content));
        }
        let before = buffer.len();
        for (id, content) in deliveries.iter().filter(|(id, _)| id.is_some()) {
            prop_assert!(!buffer.ingest(message(*id, content)));
        }
        prop_assert_eq!(buffer.len(), before);
    }

    #[test]
    fn backoff_is_monotonic_and_capped(
        base_ms in 1u64..5_000,
        max_ms in 1u64..120_000,
        attempts in 0u32..80,
    ) {
        let backoff = Backoff::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms));
        let mut previous = Duration::ZERO;
        for attempt in 0..=attempts {
            let delay = backoff.delay(attempt);
            prop_assert!(delay >= previous);
            prop_assert!(delay <= backoff.max());
            prop_assert!(delay >= backoff.base());
            previous = delay;
        }
    }

    #[test]
    fn presence_matches_set_model(ops in prop::collection::vec(arb_presence_op(), 0..40)) {
        let mut tracker = PresenceTracker::new();
        let mut model = BTreeSet::new();
        for op in ops {
            match op {
                PresenceOp::Seed(members) => {
                    tracker.seed(members.iter().cloned());
                    model = members;
                }
                PresenceOp::Join(who) => {
                    prop_assert_eq!(tracker.join(&who), model.insert(who));
                }
                PresenceOp::Leave(who) => {
                    prop_assert_eq!(tracker.leave(&who), model.remove(&who));
                }
            }
            prop_assert_eq!(tracker.members(), &model);
        }
    }
}

#[test]
fn backoff_sequence_doubles_to_the_ceiling() {
    let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(4));
    let delays: Vec<u64> = (0..6).map(|n| backoff.delay(n).as_secs()).collect();
    assert_eq!(delays, [1, 2, 4, 4, 4, 4]);
}
