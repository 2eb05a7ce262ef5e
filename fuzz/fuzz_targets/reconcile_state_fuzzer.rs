//! Fuzz target for the InboundReconciler state machine
//!
//! # Strategy
//!
//! - Local sends, their live echoes and durable acks in any order
//! - Foreign live messages with and without durable ids
//! - History pages overlapping what is already displayed
//! - Messages for other rooms
//!
//! # Invariants
//!
//! - No two entries share a durable id or a local id
//! - A submitted message is displayed exactly once
//! - Foreign rooms never reach the list

#![no_main]

use arbitrary::Arbitrary;
use chrono::{DateTime, TimeZone, Utc};
use libfuzzer_sys::fuzz_target;
use parley_core::{InboundReconciler, LocalId, PendingMessage};
use parley_proto::{LiveMessage, MessageId, RoomId, StoredMessage, UserId};

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    Submit(u8),
    Echo(u8),
    Ack(u8),
    Fail(u8),
    Foreign { id: Option<u8>, secs: u8 },
    History(Vec<u8>),
    OtherRoom(u8),
}

fn room() -> RoomId {
    "room".into()
}

fn ts(secs: u8) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_550_400 + i64::from(secs), 0).single().unwrap_or_default()
}

fn server_id(n: u8) -> MessageId {
    MessageId::new(format!("srv-{n}"))
}

fn stored(n: u8, user: &str, room_id: RoomId) -> StoredMessage {
    StoredMessage {
        id: server_id(n),
        room_id,
        user_id: user.into(),
        content: format!("m{n}"),
        created_at: ts(n),
        user_name: None,
    }
}

fuzz_target!(|ops: Vec<Op>| {
    let me: UserId = "me".into();
    let mut reconciler = InboundReconciler::new(room(), me.clone());
    let mut submitted = Vec::new();

    for op in ops {
        match op {
            Op::Submit(n) => {
                if submitted.contains(&n) {
                    continue;
                }
                let Ok(pending) = PendingMessage::new(
                    LocalId::new(u128::from(n)),
                    room(),
                    me.clone(),
                    format!("local {n}"),
                    None,
                    ts(n),
                ) else {
                    continue;
                };
                reconciler.submit_local(&pending, "Me");
                submitted.push(n);
            },
            Op::Echo(n) => {
                reconciler.apply_live(&LiveMessage {
                    room_id: room(),
                    sender_id: me.clone(),
                    sender_name: "Me".into(),
                    content: format!("local {n}"),
                    message_id: None,
                    timestamp: ts(n),
                });
            },
            Op::Ack(n) => {
                if submitted.contains(&n) {
                    let mut message = stored(n, "me", room());
                    message.content = format!("local {n}");
                    reconciler.apply_durable(Some(LocalId::new(u128::from(n))), &message);
                }
            },
            Op::Fail(n) => {
                reconciler.mark_failed(LocalId::new(u128::from(n)));
            },
            Op::Foreign { id, secs } => {
                reconciler.apply_live(&LiveMessage {
                    room_id: room(),
                    sender_id: "bob".into(),
                    sender_name: "Bob".into(),
                    content: format!("m{secs}"),
                    message_id: id.map(server_id),
                    timestamp: ts(secs),
                });
            },
            Op::History(ids) => {
                let page: Vec<_> = ids.into_iter().map(|n| stored(n, "bob", room())).collect();
                reconciler.apply_history(&page);
            },
            Op::OtherRoom(n) => {
                reconciler.apply_durable(None, &stored(n, "bob", "elsewhere".into()));
            },
        }

        if let Err(violation) = reconciler.check_invariants() {
            panic!("invariant violated: {violation}");
        }
    }

    for n in &submitted {
        let local_id = LocalId::new(u128::from(*n));
        let copies = reconciler.messages().iter().filter(|m| m.local_id == Some(local_id)).count();
        assert_eq!(copies, 1, "message {n} displayed {copies} times");
    }
    assert!(reconciler.messages().iter().all(|m| m.room_id == room()));
});
