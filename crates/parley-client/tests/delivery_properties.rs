//! Property-based tests for end-to-end delivery.
//!
//! Random scripts of sends, channel drops, server frames and failures run
//! through the real runtime. However the faults fall, every message is
//! displayed once, goes out on the live channel exactly once and in the
//! order it was composed (a durable ack does not cancel the live copy),
//! and nothing is left queued once the channel is back.

use std::time::Duration;

use parley_client::{Command, LocalUser, RoomSession, Runtime, SessionConfig};
use parley_core::ConnectionState;
use parley_harness::{SimDriver, SimEnv, Step};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Send,
    Drop,
    Wait(u64),
    Foreign(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Send),
        2 => Just(Op::Drop),
        1 => (1u64..8_000).prop_map(Op::Wait),
        1 => any::<u8>().prop_map(Op::Foreign),
    ]
}

fn foreign_frame(n: u8) -> String {
    format!(
        r#"{{"type":"message","roomId":"room","userId":"bob","content":"bob {n}","timestamp":"2024-05-01T00:00:01Z"}}"#
    )
}

fn script(ops: &[Op]) -> (Vec<Step>, Vec<String>) {
    let mut steps = vec![Step::Command(Command::EnterRoom("room".into()))];
    let mut sent = Vec::new();
    for op in ops {
        steps.push(match op {
            Op::Send => {
                let content = format!("m{}", sent.len());
                sent.push(content.clone());
                Step::Command(Command::Submit { content, metadata: None })
            },
            Op::Drop => Step::DropChannel,
            Op::Wait(ms) => Step::Advance(Duration::from_millis(*ms)),
            Op::Foreign(n) => Step::ServerFrame(foreign_frame(*n)),
        });
    }
    (steps, sent)
}

fn content_of(frame: &str) -> Option<String> {
    let start = frame.find(r#""content":""#)? + r#""content":""#.len();
    let len = frame[start..].find('"')?;
    Some(frame[start..start + len].to_owned())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_message_delivered_once_in_order(
        ops in prop::collection::vec(op(), 1..24),
        seed in any::<u64>(),
        dial_failures in 0usize..3,
        transmit_failures in 0usize..3,
        write_failures in 0usize..4,
    ) {
        let (steps, sent) = script(&ops);
        let env = SimEnv::with_seed(seed);
        let driver = SimDriver::new(env.clone(), "me");
        driver.fail_dials(dial_failures);
        driver.fail_transmits(transmit_failures);
        driver.fail_writes(write_failures);
        driver.script(steps);

        let user = LocalUser { user_id: "me".into(), display_name: "Me".into() };
        let session = RoomSession::new(env, user, SessionConfig::default());
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(Runtime::new(driver.clone(), session).run()).unwrap();

        let settled = driver.rendered_at_quit().unwrap();
        prop_assert_eq!(settled.connection, ConnectionState::Open);
        prop_assert_eq!(settled.pending_outbound, 0);

        for content in &sent {
            let shown = settled.messages.iter().filter(|m| &m.content == content).count();
            prop_assert_eq!(shown, 1, "{} shown {} times", content, shown);
        }

        let transmitted: Vec<String> =
            driver.transmitted().iter().filter_map(|f| content_of(f)).collect();
        prop_assert_eq!(transmitted, sent);
    }
}
