//! End-to-end runtime tests.
//!
//! The real [`Runtime`] and [`RoomSession`] run against the simulation
//! driver, with virtual time and a seeded RNG.

use chrono::{TimeZone, Utc};
use parley_client::{
    Command, LocalUser, RoomSession, Runtime, SessionConfig,
    session::{CONNECTION_LOST_NOTICE, RECONNECTED_NOTICE},
};
use parley_core::{ConnectionState, Environment, LocalId, MessageOrigin, ToastKind};
use parley_harness::{Effect, Rendered, SimDriver, SimEnv, Step};
use parley_proto::{InboundEvent, MessageId, StoredMessage};

const SEED: u64 = 7;

fn user() -> LocalUser {
    LocalUser { user_id: "me".into(), display_name: "Me".into() }
}

fn enter() -> Step {
    Step::Command(Command::EnterRoom("room".into()))
}

fn submit(content: &str) -> Step {
    Step::Command(Command::Submit { content: content.into(), metadata: None })
}

async fn run(env: &SimEnv, driver: &SimDriver) -> RoomSession<SimEnv> {
    let session = RoomSession::new(env.clone(), user(), SessionConfig::default());
    Runtime::new(driver.clone(), session)
        .run()
        .await
        .unwrap_or_else(|e| panic!("runtime failed: {e}"))
}

fn settled(driver: &SimDriver) -> Rendered {
    driver.rendered_at_quit().unwrap_or_else(|| panic!("nothing rendered before quit"))
}

fn dials(driver: &SimDriver) -> usize {
    driver.effects().iter().filter(|e| matches!(e, Effect::Dial { .. })).count()
}

fn bob_frame(content: &str, message_id: &str) -> String {
    format!(
        r#"{{"type":"message","roomId":"room","userId":"bob","content":"{content}","timestamp":"2024-05-01T00:00:01Z","metadata":{{"userName":"Bob","messageId":"{message_id}"}}}}"#
    )
}

fn stored_by_bob(id: &str, content: &str, secs: u32) -> StoredMessage {
    StoredMessage {
        id: MessageId::new(id),
        room_id: "room".into(),
        user_id: "bob".into(),
        content: content.into(),
        created_at: Utc.with_ymd_and_hms(2024, 4, 30, 12, 0, secs).single().unwrap_or_default(),
        user_name: Some("Bob".into()),
    }
}

#[tokio::test]
async fn message_sent_while_connecting_is_flushed_once() {
    let env = SimEnv::with_seed(SEED);
    let driver = SimDriver::new(env.clone(), "me");
    driver.fail_dials(1);
    driver.fail_writes(1);
    driver.script([enter(), submit("hello")]);

    run(&env, &driver).await;

    let frames = driver.transmitted();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].contains(r#""content":"hello""#));
    assert_eq!(dials(&driver), 2);

    let state = settled(&driver);
    assert_eq!(state.connection, ConnectionState::Open);
    assert_eq!(state.pending_outbound, 0);
    // Own echo was suppressed; the failed write keeps the entry pending
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].origin, MessageOrigin::LocalPending);
    assert!(state.messages[0].failed);
    assert_eq!(driver.notices_seen(), vec![(
        ToastKind::Error,
        "Message not saved: server returned 500: internal error".to_owned()
    )]);
}

#[tokio::test]
async fn durable_ack_while_disconnected_still_goes_out_live() {
    let env = SimEnv::with_seed(SEED);
    let driver = SimDriver::new(env.clone(), "me");
    driver.fail_dials(1);
    driver.script([enter(), submit("hello")]);

    run(&env, &driver).await;

    // The write lands during the reconnect delay; the queued copy still
    // reaches the room once the channel opens
    assert_eq!(driver.stored(&"room".into()).len(), 1);
    let frames = driver.transmitted();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].contains(r#""content":"hello""#));

    let state = settled(&driver);
    assert_eq!(state.pending_outbound, 0);
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].origin, MessageOrigin::DurableConfirmed);
    assert_eq!(state.messages[0].id, Some(MessageId::new("srv-1")));
}

#[tokio::test]
async fn dropped_channel_reconnects_with_notices() {
    let env = SimEnv::with_seed(SEED);
    let driver = SimDriver::new(env.clone(), "me");
    driver.script([enter(), Step::Advance(std::time::Duration::from_secs(1)), Step::DropChannel]);

    run(&env, &driver).await;

    assert_eq!(dials(&driver), 2);
    assert_eq!(settled(&driver).connection, ConnectionState::Open);
    assert_eq!(driver.notices_seen(), vec![
        (ToastKind::Warning, CONNECTION_LOST_NOTICE.to_owned()),
        (ToastKind::Success, RECONNECTED_NOTICE.to_owned()),
    ]);
    // Both notices expired before the script ended
    assert!(settled(&driver).notices.is_empty());
}

#[tokio::test]
async fn transmit_failure_requeues_in_order() {
    let env = SimEnv::with_seed(SEED);
    let driver = SimDriver::new(env.clone(), "me");
    driver.fail_writes(2);
    driver.fail_transmits(1);
    driver.script([enter(), submit("first"), submit("second")]);

    run(&env, &driver).await;

    let frames = driver.transmitted();
    assert_eq!(frames.len(), 2);
    assert!(frames[0].contains(r#""content":"first""#));
    assert!(frames[1].contains(r#""content":"second""#));

    let state = settled(&driver);
    let contents: Vec<_> = state.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second"]);
    assert!(driver.notices_seen().contains(&(ToastKind::Success, RECONNECTED_NOTICE.to_owned())));
}

#[tokio::test]
async fn history_and_live_merge_without_duplicates() {
    let env = SimEnv::with_seed(SEED);
    let driver = SimDriver::new(env.clone(), "me");
    driver.seed_history(&"room".into(), vec![
        stored_by_bob("h1", "first", 0),
        stored_by_bob("h2", "second", 1),
    ]);
    driver.script([
        enter(),
        Step::ServerFrame(bob_frame("second", "h2")),
        Step::ServerFrame(bob_frame("third", "b3")),
    ]);

    run(&env, &driver).await;

    let state = settled(&driver);
    let contents: Vec<_> = state.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second", "third"]);
    let origins: Vec<_> = state.messages.iter().map(|m| m.origin).collect();
    assert_eq!(origins, vec![
        MessageOrigin::DurableConfirmed,
        MessageOrigin::DurableConfirmed,
        MessageOrigin::LiveConfirmed,
    ]);
}

#[tokio::test]
async fn typing_is_forwarded_as_activity() {
    let env = SimEnv::with_seed(SEED);
    let driver = SimDriver::new(env.clone(), "me");
    driver.script([
        enter(),
        Step::ServerFrame(
            r#"{"type":"typing","roomId":"room","userId":"bob","timestamp":"2024-05-01T00:00:01Z","metadata":{"isTyping":true}}"#
                .into(),
        ),
    ]);

    run(&env, &driver).await;

    assert!(driver.effects().contains(&Effect::Activity {
        room_id: "room".into(),
        event: InboundEvent::Typing { user_id: "bob".into(), is_typing: true },
    }));
    assert!(settled(&driver).messages.is_empty());
}

#[tokio::test]
async fn rejected_commands_raise_notices() {
    let env = SimEnv::with_seed(SEED);
    let driver = SimDriver::new(env.clone(), "me");
    driver.script([submit("too early"), enter(), submit("   ")]);

    run(&env, &driver).await;

    let texts: Vec<_> = driver.notices_seen().into_iter().map(|(_, text)| text).collect();
    assert_eq!(texts, vec!["no active room", "message content is empty"]);
    assert!(!driver.effects().iter().any(|e| matches!(e, Effect::Post { .. })));
}

#[tokio::test]
async fn retry_resolves_failed_write() {
    // The session draws its jitter seed first, then one id per message
    let twin = SimEnv::with_seed(SEED);
    twin.random_u64();
    let local_id = LocalId::new(twin.random_u128());

    let env = SimEnv::with_seed(SEED);
    let driver = SimDriver::new(env.clone(), "me");
    driver.fail_writes(1);
    driver.script([enter(), submit("hello"), Step::Command(Command::Retry(local_id))]);

    run(&env, &driver).await;

    let posts: Vec<_> = driver
        .effects()
        .into_iter()
        .filter_map(|e| match e {
            Effect::Post { local_id, .. } => Some(local_id),
            _ => None,
        })
        .collect();
    assert_eq!(posts, vec![local_id, local_id]);

    let state = settled(&driver);
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].origin, MessageOrigin::DurableConfirmed);
    assert!(!state.messages[0].failed);
}

#[tokio::test]
async fn quit_hangs_up_and_stops() {
    let env = SimEnv::with_seed(SEED);
    let driver = SimDriver::new(env.clone(), "me");
    driver.script([enter(), Step::Command(Command::Quit)]);

    let session = run(&env, &driver).await;

    assert!(driver.is_stopped());
    assert!(driver.effects().iter().any(|e| matches!(e, Effect::Hangup { .. })));
    assert_eq!(session.room_id(), None);
    assert_eq!(session.connection_state(), ConnectionState::Closed { will_retry: false });
}

#[tokio::test]
async fn same_seed_same_run() {
    async fn effects(seed: u64) -> Vec<Effect> {
        let env = SimEnv::with_seed(seed);
        let driver = SimDriver::new(env.clone(), "me");
        driver.fail_dials(2);
        driver.script([enter(), submit("a"), submit("b"), Step::DropChannel, submit("c")]);
        run(&env, &driver).await;
        driver.effects()
    }

    assert_eq!(effects(SEED).await, effects(SEED).await);
    assert_ne!(effects(SEED).await, effects(SEED + 1).await);
}
