//! Turns session snapshots into printable lines.
//!
//! A terminal in line mode cannot redraw, so [`Printer`] remembers what it
//! already printed and only emits the difference.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parley_client::SessionSnapshot;
use parley_core::{ConnectionState, LocalId, Message, MessageOrigin, ToastId};
use parley_proto::{InboundEvent, MessageId, RoomId, UserId};

/// Identity of a displayed message across snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Local(LocalId),
    Stored(MessageId),
    Live(UserId, DateTime<Utc>, String),
}

impl Key {
    fn of(message: &Message) -> Self {
        match (&message.local_id, &message.id) {
            (Some(local_id), _) => Self::Local(*local_id),
            (None, Some(id)) => Self::Stored(id.clone()),
            (None, None) => {
                Self::Live(message.sender_id.clone(), message.created_at, message.content.clone())
            },
        }
    }
}

/// Diffing printer.
#[derive(Debug, Default)]
pub struct Printer {
    room: Option<RoomId>,
    connection: Option<ConnectionState>,
    failed: HashMap<Key, bool>,
    notices: HashSet<ToastId>,
}

impl Printer {
    /// Lines describing what changed since the previous snapshot.
    pub fn update(&mut self, snapshot: &SessionSnapshot) -> Vec<String> {
        let mut lines = Vec::new();

        if snapshot.room_id != self.room {
            self.room.clone_from(&snapshot.room_id);
            self.failed.clear();
            lines.push(match &snapshot.room_id {
                Some(room) => format!("-- room {room} --"),
                None => "-- no room --".to_owned(),
            });
        }

        if self.connection != Some(snapshot.connection) {
            self.connection = Some(snapshot.connection);
            if let Some(status) = connection_status(snapshot.connection) {
                lines.push(format!("-- {status} --"));
            }
        }

        for message in &snapshot.messages {
            let key = Key::of(message);
            match self.failed.insert(key, message.failed) {
                None => lines.push(message_line(message)),
                Some(false) if message.failed => lines.push(failure_line(message)),
                Some(_) => {},
            }
        }

        let visible: HashSet<ToastId> = snapshot.notices.iter().map(|n| n.id).collect();
        for notice in &snapshot.notices {
            if self.notices.insert(notice.id) {
                lines.push(format!("! [{}] {} (#{})", notice.kind, notice.text, notice.id));
            }
        }
        self.notices.retain(|id| visible.contains(id));

        lines
    }
}

fn connection_status(state: ConnectionState) -> Option<&'static str> {
    match state {
        ConnectionState::Idle => None,
        ConnectionState::Connecting => Some("connecting"),
        ConnectionState::Open => Some("connected"),
        ConnectionState::Closed { will_retry: true } => Some("disconnected, retrying"),
        ConnectionState::Closed { will_retry: false } => Some("disconnected"),
    }
}

fn message_line(message: &Message) -> String {
    let time = message.created_at.format("%H:%M:%S");
    let marker = match message.origin {
        _ if message.failed => " (not saved)",
        MessageOrigin::LocalPending => " (sending)",
        MessageOrigin::LiveConfirmed | MessageOrigin::DurableConfirmed => "",
    };
    format!("[{time}] {}: {}{marker}", message.sender_name, message.content)
}

fn failure_line(message: &Message) -> String {
    match message.local_id {
        Some(id) => format!("! not saved: {:?}, /retry {id}", message.content),
        None => format!("! not saved: {:?}", message.content),
    }
}

/// Line for typing and presence activity. Receipts are not shown.
pub fn activity_line(event: &InboundEvent) -> Option<String> {
    match event {
        InboundEvent::Typing { user_id, is_typing: true } => Some(format!("* {user_id} is typing")),
        InboundEvent::PresenceJoin { user_id, user_name } => {
            Some(format!("* {} joined", user_name.as_deref().unwrap_or(user_id.as_str())))
        },
        InboundEvent::PresenceLeave { user_id, user_name } => {
            Some(format!("* {} left", user_name.as_deref().unwrap_or(user_id.as_str())))
        },
        InboundEvent::Typing { is_typing: false, .. }
        | InboundEvent::ReadReceipt { .. }
        | InboundEvent::Message(_)
        | InboundEvent::Error { .. } => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;
    use parley_client::Notice;
    use parley_core::ToastKind;

    use super::*;

    fn message(content: &str, origin: MessageOrigin, local: Option<u128>) -> Message {
        Message {
            id: None,
            local_id: local.map(LocalId::new),
            room_id: "room".into(),
            sender_id: "me".into(),
            sender_name: "Me".into(),
            content: content.into(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
            origin,
            failed: false,
        }
    }

    fn snapshot(messages: Vec<Message>) -> SessionSnapshot {
        SessionSnapshot {
            room_id: Some("room".into()),
            connection: ConnectionState::Open,
            messages,
            ..SessionSnapshot::default()
        }
    }

    #[test]
    fn first_snapshot_prints_room_status_and_messages() {
        let mut printer = Printer::default();
        let lines =
            printer.update(&snapshot(vec![message("hi", MessageOrigin::LocalPending, Some(1))]));
        assert_eq!(lines, vec![
            "-- room room --".to_owned(),
            "-- connected --".to_owned(),
            "[09:30:00] Me: hi (sending)".to_owned(),
        ]);
    }

    #[test]
    fn unchanged_messages_are_not_reprinted() {
        let mut printer = Printer::default();
        let pending = message("hi", MessageOrigin::LocalPending, Some(1));
        printer.update(&snapshot(vec![pending]));

        let confirmed = message("hi", MessageOrigin::DurableConfirmed, Some(1));
        let other = message("yo", MessageOrigin::LiveConfirmed, None);
        let lines = printer.update(&snapshot(vec![confirmed, other]));
        assert_eq!(lines, vec!["[09:30:00] Me: yo".to_owned()]);
    }

    #[test]
    fn failure_is_reported_once_with_retry_hint() {
        let mut printer = Printer::default();
        printer.update(&snapshot(vec![message("hi", MessageOrigin::LocalPending, Some(1))]));

        let mut failed = message("hi", MessageOrigin::LocalPending, Some(1));
        failed.failed = true;
        let lines = printer.update(&snapshot(vec![failed.clone()]));
        assert_eq!(lines, vec![format!("! not saved: \"hi\", /retry {}", LocalId::new(1))]);
        assert!(printer.update(&snapshot(vec![failed])).is_empty());
    }

    #[test]
    fn notices_print_once_while_visible() {
        let mut printer = Printer::default();
        let id: ToastId = "4".parse().unwrap();
        let mut state = snapshot(Vec::new());
        state.notices =
            vec![Notice { id, kind: ToastKind::Warning, text: "Connection lost".into() }];

        let lines = printer.update(&state);
        assert_eq!(lines.last().unwrap(), "! [warning] Connection lost (#4)");
        assert!(printer.update(&state).is_empty());
    }

    #[test]
    fn connection_changes_are_announced() {
        let mut printer = Printer::default();
        let mut state = snapshot(Vec::new());
        printer.update(&state);

        state.connection = ConnectionState::Closed { will_retry: true };
        assert_eq!(printer.update(&state), vec!["-- disconnected, retrying --".to_owned()]);
    }

    #[test]
    fn activity_lines() {
        let typing = InboundEvent::Typing { user_id: "bob".into(), is_typing: true };
        assert_eq!(activity_line(&typing).unwrap(), "* bob is typing");

        let join = InboundEvent::PresenceJoin { user_id: "bob".into(), user_name: Some("Bob".into()) };
        assert_eq!(activity_line(&join).unwrap(), "* Bob joined");

        let stopped = InboundEvent::Typing { user_id: "bob".into(), is_typing: false };
        assert_eq!(activity_line(&stopped), None);
    }
}
