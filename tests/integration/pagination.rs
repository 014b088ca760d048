// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for history loading: the newest-page seed, backwards
//! pagination, single-flight suppression, reset generations and failures.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use whisper::api::{ApiError, ChatApi};
use whisper::config::{ReconnectConfig, SyncConfig};
use whisper::sim::{SimulatedApi, SimulatedServer};
use whisper::sync::{LoadOutcome, Session, SyncError, SyncEvent};
use whisper::transport::loopback::LoopbackConnector;
use whisper_proto::message::{ChatUser, Conversation, ConversationId, MessageId, MessageStatus, UserId};

type TestSession = Session<SimulatedApi, LoopbackConnector>;

const PAGE: usize = 5;

fn user(name: &str) -> ChatUser {
    ChatUser {
        id: UserId::new(name),
        username: name.to_string(),
    }
}

fn conversation_id() -> ConversationId {
    ConversationId::new("c1")
}

/// A server holding `n` messages from bob, `srv1` oldest.
fn server_with(n: usize) -> Arc<SimulatedServer> {
    let server = SimulatedServer::new();
    for i in 1..=n {
        server.insert_message(&conversation_id(), &user("bob"), format!("message {i}"));
    }
    server
}

async fn open(server: &Arc<SimulatedServer>) -> (TestSession, mpsc::Receiver<SyncEvent>) {
    let alice = user("alice");
    let (tx, rx) = mpsc::channel(256);
    let session = Session::open(
        Conversation::new(conversation_id(), vec![alice.id.clone(), UserId::new("bob")]),
        alice.id.clone(),
        Arc::new(server.api(alice.clone())),
        server.connector(alice),
        SyncConfig {
            page_size: PAGE,
            ..SyncConfig::default()
        },
        ReconnectConfig {
            max_attempts: 1,
            ..ReconnectConfig::default()
        },
        tx,
    )
    .await;
    (session, rx)
}

fn ids(session: &TestSession) -> Vec<String> {
    session
        .snapshot()
        .messages
        .iter()
        .map(|m| m.id.as_str().to_string())
        .collect()
}

fn srv(range: std::ops::RangeInclusive<usize>) -> Vec<String> {
    range.map(|i| format!("srv{i}")).collect()
}

#[tokio::test]
async fn open_seeds_newest_page() {
    let server = server_with(12);
    let (session, _events) = open(&server).await;

    let snapshot = session.snapshot();
    assert_eq!(ids(&session), srv(8..=12));
    assert!(snapshot.has_more);
    assert!(!snapshot.loading);
    assert!(snapshot.error.is_none());
    assert!(snapshot.messages.iter().all(|m| m.status == MessageStatus::Delivered));
    assert_eq!(server.history_calls(), 1);
}

#[tokio::test]
async fn older_pages_prepend_without_disturbing_visible_messages() {
    let server = server_with(12);
    let (session, _events) = open(&server).await;
    let visible = session.snapshot().messages;

    assert_eq!(
        session.load_more_messages().await.unwrap(),
        LoadOutcome::Loaded { count: PAGE }
    );
    let after = session.snapshot().messages;
    assert_eq!(after.len(), 10);
    // Previously visible messages keep their identity and relative order.
    assert_eq!(after[PAGE..], visible[..]);
    assert_eq!(ids(&session), srv(3..=12));

    assert_eq!(
        session.load_more_messages().await.unwrap(),
        LoadOutcome::Loaded { count: 2 }
    );
    assert_eq!(ids(&session), srv(1..=12));
    assert!(!session.snapshot().has_more);

    // Exhausted: no further request is made.
    assert_eq!(session.load_more_messages().await.unwrap(), LoadOutcome::Exhausted);
    assert_eq!(server.history_calls(), 3);
}

#[tokio::test]
async fn load_messages_without_reset_pages_backwards() {
    let server = server_with(7);
    let (session, _events) = open(&server).await;

    assert_eq!(
        session.load_messages(false).await.unwrap(),
        LoadOutcome::Loaded { count: 2 }
    );
    assert_eq!(ids(&session), srv(1..=7));
}

#[tokio::test(start_paused = true)]
async fn rapid_duplicate_requests_fetch_once() {
    let server = server_with(12);
    let (session, _events) = open(&server).await;
    server.set_response_delay(Duration::from_millis(200));

    let (first, second) = tokio::join!(session.load_more_messages(), session.load_more_messages());

    assert_eq!(first.unwrap(), LoadOutcome::Loaded { count: PAGE });
    assert_eq!(second.unwrap(), LoadOutcome::InFlight);
    assert_eq!(server.history_calls(), 2);
    assert_eq!(session.snapshot().messages.len(), 10);
}

#[tokio::test(start_paused = true)]
async fn loading_flag_tracks_outstanding_fetch() {
    let server = server_with(12);
    let (session, mut events) = open(&server).await;
    while events.try_recv().is_ok() {}
    server.set_response_delay(Duration::from_millis(200));

    let ((), loaded) = tokio::join!(
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(session.snapshot().loading);
        },
        session.load_more_messages()
    );
    loaded.unwrap();
    assert!(!session.snapshot().loading);

    let mut flags = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::LoadingChanged { loading } = event {
            flags.push(loading);
        }
    }
    assert_eq!(flags, [true, false]);
}

#[tokio::test(start_paused = true)]
async fn reset_drops_older_page_in_flight() {
    let server = server_with(12);
    let (session, _events) = open(&server).await;
    server.set_response_delay(Duration::from_millis(200));

    let (older, reset) = tokio::join!(session.load_more_messages(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.load_messages(true).await
    });

    assert_eq!(older.unwrap(), LoadOutcome::Stale);
    assert_eq!(reset.unwrap(), LoadOutcome::Loaded { count: PAGE });
    assert_eq!(ids(&session), srv(8..=12));
    assert!(!session.snapshot().loading);

    // The cursor restarted from the reset page.
    server.set_response_delay(Duration::ZERO);
    session.load_more_messages().await.unwrap();
    assert_eq!(ids(&session), srv(3..=12));
}

#[tokio::test(start_paused = true)]
async fn older_page_waits_while_reset_is_loading() {
    let server = server_with(12);
    let (session, _events) = open(&server).await;
    server.set_response_delay(Duration::from_millis(200));

    let (reset, older) = tokio::join!(session.load_messages(true), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.load_more_messages().await
    });

    assert_eq!(reset.unwrap(), LoadOutcome::Loaded { count: PAGE });
    assert_eq!(older.unwrap(), LoadOutcome::InFlight);
    assert_eq!(server.history_calls(), 2);
}

#[tokio::test]
async fn failed_fetch_sets_error_and_leaves_store() {
    let server = server_with(12);
    let (session, _events) = open(&server).await;
    let before = session.snapshot().messages;

    server.fail_history(true);
    let err = session.load_more_messages().await.unwrap_err();
    assert!(matches!(err, SyncError::Api(ApiError::Status { status: 500, .. })));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.messages, before);
    assert!(snapshot.error.is_some());
    assert!(!snapshot.loading);

    // The slot was released: the next attempt goes out.
    server.fail_history(false);
    assert_eq!(
        session.load_more_messages().await.unwrap(),
        LoadOutcome::Loaded { count: PAGE }
    );

    // A successful reset clears the error flag.
    session.load_messages(true).await.unwrap();
    assert!(session.snapshot().error.is_none());
}

#[tokio::test(start_paused = true)]
async fn history_fetch_is_bounded_by_timeout() {
    let server = server_with(12);
    let (session, _events) = open(&server).await;
    server.set_response_delay(SyncConfig::default().history_timeout + Duration::from_secs(5));

    assert_eq!(session.load_more_messages().await, Err(SyncError::Timeout));
    let snapshot = session.snapshot();
    assert_eq!(snapshot.messages.len(), PAGE);
    assert!(!snapshot.loading);
    assert!(snapshot.error.is_some());
}

#[tokio::test]
async fn failed_initial_load_leaves_session_usable() {
    let server = server_with(3);
    server.fail_history(true);
    let (session, _events) = open(&server).await;

    let snapshot = session.snapshot();
    assert!(snapshot.messages.is_empty());
    assert!(snapshot.error.is_some());

    server.fail_history(false);
    assert_eq!(
        session.load_messages(true).await.unwrap(),
        LoadOutcome::Loaded { count: 3 }
    );
    assert_eq!(ids(&session), srv(1..=3));
    assert!(!session.snapshot().has_more);
}

#[tokio::test]
async fn reset_keeps_unsent_messages() {
    let server = server_with(3);
    server.refuse_connections(true);
    server.fail_sends(true);
    let (session, _events) = open(&server).await;

    let failed = session.send_message("pending").await.unwrap();
    server.insert_message(&conversation_id(), &user("bob"), "newer");

    session.load_messages(true).await.unwrap();

    let snapshot = session.snapshot();
    assert_eq!(snapshot.messages.len(), 5);
    assert!(snapshot.messages.iter().any(|m| m.id == failed && m.status == MessageStatus::Failed));
    assert!(snapshot.messages.iter().any(|m| m.id == MessageId::new("srv4")));
}

#[tokio::test]
async fn deleting_oldest_loaded_message_keeps_paging() {
    let server = server_with(12);
    let (session, _events) = open(&server).await;

    session.delete_message(&MessageId::new("srv8")).await.unwrap();
    assert_eq!(ids(&session), srv(9..=12));

    assert_eq!(
        session.load_more_messages().await.unwrap(),
        LoadOutcome::Loaded { count: PAGE }
    );
    let mut expected = srv(3..=7);
    expected.extend(srv(9..=12));
    assert_eq!(ids(&session), expected);

    assert_eq!(
        session.load_more_messages().await.unwrap(),
        LoadOutcome::Loaded { count: 2 }
    );
    assert!(session.snapshot().error.is_none());
}

#[tokio::test]
async fn server_side_delete_of_oldest_loaded_message_keeps_paging() {
    let server = server_with(12);
    let (session, _events) = open(&server).await;

    server
        .api(user("bob"))
        .delete(&conversation_id(), &MessageId::new("srv8"))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while ids(&session).contains(&"srv8".to_string()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(
        session.load_more_messages().await.unwrap(),
        LoadOutcome::Loaded { count: PAGE }
    );
    assert_eq!(ids(&session)[..PAGE], srv(3..=7)[..]);
}
