//! Property-based tests for the wire format.
//!
//! Uses proptest to verify:
//! 1. Every accepted presence snapshot shape normalizes to the same set.
//! 2. Publication payloads classify by `type`: pings and read receipts are
//!    never chat messages, every other shape is.
//! 3. Numeric and string ids decode to the same dedup key.
//! 4. Private channel names map back to their owner.
//! 5. Arbitrary text never panics the frame decoder.

use std::collections::BTreeSet;

use bowlchat_proto::descriptor::ChannelLayout;
use bowlchat_proto::event::WireEvent;
use bowlchat_proto::frame;
use bowlchat_proto::presence::normalize_snapshot;
use proptest::prelude::*;
use serde_json::{Map, Value, json};

/// Strategy for a set of identities.
fn arb_identities() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set("[a-z][a-z0-9_]{0,11}", 0..8)
}

/// Strategy for a `type` discriminant other than the control types.
fn arb_chat_kind() -> impl Strategy<Value = Option<String>> {
    prop::option::of("[a-z_]{1,16}".prop_filter("control type", |k| {
        k != "ping" && k != "read_receipt"
    }))
}

proptest! {
    #[test]
    fn snapshot_shapes_agree(identities in arb_identities()) {
        let names: Vec<&String> = identities.iter().collect();
        let as_strings = json!(names);
        let as_objects = Value::Array(
            names.iter().map(|n| json!({ "username": n })).collect(),
        );
        let as_client_map: Map<String, Value> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (format!("c{i}"), json!({ "client": format!("c{i}"), "user": n })))
            .collect();
        let as_string_map: Map<String, Value> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (format!("c{i}"), json!(n)))
            .collect();

        prop_assert_eq!(&normalize_snapshot(&as_strings), &identities);
        prop_assert_eq!(&normalize_snapshot(&as_objects), &identities);
        prop_assert_eq!(&normalize_snapshot(&Value::Object(as_client_map)), &identities);
        prop_assert_eq!(&normalize_snapshot(&Value::Object(as_string_map)), &identities);
    }

    #[test]
    fn non_control_payloads_are_chat(
        kind in arb_chat_kind(),
        content in ".{0,64}",
        from in "[a-z]{1,10}",
    ) {
        let mut payload = json!({ "id": "m1", "content": content, "from": from });
        if let Some(kind) = &kind {
            payload["type"] = json!(kind);
        }
        let event = WireEvent::from_value(payload).unwrap();
        prop_assert!(!event.is_ping());
        let chat = event.into_chat().unwrap();
        prop_assert_eq!(chat.content, content);
        prop_assert_eq!(chat.from, from);
    }

    #[test]
    fn control_payloads_are_never_chat(extra in "[a-z]{0,8}") {
        let ping = WireEvent::from_value(json!({ "type": "ping", "note": extra })).unwrap();
        prop_assert!(ping.is_ping());
        prop_assert!(ping.into_chat().is_none());

        let receipt = WireEvent::from_value(
            json!({ "type": "read_receipt", "message_id": 1, "read_by": extra }),
        )
        .unwrap();
        prop_assert!(receipt.into_chat().is_none());
    }

    #[test]
    fn numeric_ids_match_string_ids(id in any::<u32>()) {
        let numeric = WireEvent::from_value(json!({ "id": id, "content": "x" }))
            .unwrap()
            .into_chat()
            .unwrap();
        let textual = WireEvent::from_value(json!({ "id": id.to_string(), "content": "x" }))
            .unwrap()
            .into_chat()
            .unwrap();
        prop_assert_eq!(numeric.id, textual.id);
    }

    #[test]
    fn private_channels_map_back_to_owner(identity in "[a-z0-9_]{1,16}") {
        let layout = ChannelLayout::default();
        let channel = layout.private_channel(&identity);
        prop_assert_eq!(layout.owner_of(&channel), Some(identity.as_str()));
        prop_assert!(!layout.is_room(&channel));
    }

    #[test]
    fn decoder_never_panics(text in ".{0,256}") {
        let _ = frame::decode_server(&text);
        let _ = frame::decode_client(&text);
        let _ = WireEvent::decode(&text);
    }
}
