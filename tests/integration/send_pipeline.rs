// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Integration tests for the send pipeline: optimistic insert, dual-channel
//! delivery, soft failure, retry and delete.
//!
//! Every test runs a [`Session`] against an in-process [`SimulatedServer`],
//! switching its fault knobs to exercise each branch of the delivery state
//! machine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use whisper::config::{ReconnectConfig, SyncConfig};
use whisper::sim::{SimulatedApi, SimulatedServer};
use whisper::sync::{SendError, Session, SyncEvent, SyncSnapshot};
use whisper::transport::loopback::LoopbackConnector;
use whisper_proto::event::ClientCommand;
use whisper_proto::message::{ChatUser, Conversation, ConversationId, MessageId, MessageStatus, UserId};

type TestSession = Session<SimulatedApi, LoopbackConnector>;

fn user(name: &str) -> ChatUser {
    ChatUser {
        id: UserId::new(name),
        username: name.to_string(),
    }
}

fn conversation_id() -> ConversationId {
    ConversationId::new("c1")
}

fn conversation() -> Conversation {
    Conversation::new(conversation_id(), vec![UserId::new("alice"), UserId::new("bob")])
}

async fn open(server: &Arc<SimulatedServer>) -> (TestSession, mpsc::Receiver<SyncEvent>) {
    let alice = user("alice");
    let (tx, rx) = mpsc::channel(256);
    let session = Session::open(
        conversation(),
        alice.id.clone(),
        Arc::new(server.api(alice.clone())),
        server.connector(alice),
        SyncConfig::default(),
        ReconnectConfig {
            max_attempts: 1,
            backoff: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(1),
        },
        tx,
    )
    .await;
    (session, rx)
}

/// Polls the snapshot until `pred` holds.
async fn eventually(session: &TestSession, what: &str, pred: impl Fn(&SyncSnapshot) -> bool) -> SyncSnapshot {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = session.snapshot();
            if pred(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

fn status_of(snapshot: &SyncSnapshot, id: &MessageId) -> Option<MessageStatus> {
    snapshot.messages.iter().find(|m| m.id == *id).map(|m| m.status)
}

#[tokio::test]
async fn send_over_both_channels_yields_one_sent_entry() {
    let server = SimulatedServer::new();
    for text in ["one", "two", "three"] {
        server.insert_message(&conversation_id(), &user("bob"), text);
    }
    let (session, _events) = open(&server).await;
    assert!(session.snapshot().transport_connected);

    let provisional = session.send_message("hi").await.unwrap();
    assert!(provisional.is_provisional());

    let snapshot = eventually(&session, "confirmed copy", |s| {
        s.messages.len() == 4 && s.messages.iter().all(|m| !m.id.is_provisional())
    })
    .await;
    let last = snapshot.messages.last().unwrap();
    assert_eq!(last.id.as_str(), "srv4");
    assert_eq!(last.content, "hi");
    assert_eq!(last.status, MessageStatus::Sent);
    assert!(last.timestamp > snapshot.messages[2].timestamp);
    assert_eq!(
        snapshot.messages.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
        ["srv1", "srv2", "srv3", "srv4"]
    );

    // The server stored it once even though both channels carried it.
    assert_eq!(server.messages(&conversation_id()).len(), 4);
    assert!(
        server
            .received_commands()
            .iter()
            .any(|c| matches!(c, ClientCommand::SendMessage { client_id, .. } if *client_id == provisional))
    );

    // Late echoes change nothing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.snapshot().messages.len(), 4);
}

#[tokio::test]
async fn send_without_transport_uses_request_response() {
    let server = SimulatedServer::new();
    server.refuse_connections(true);
    let (session, _events) = open(&server).await;
    assert!(session.snapshot().degraded);

    session.send_message("offline hello").await.unwrap();

    let snapshot = session.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].id.as_str(), "srv1");
    assert_eq!(snapshot.messages[0].status, MessageStatus::Sent);
    assert_eq!(server.send_calls(), 1);
    assert!(server.received_commands().is_empty());
}

#[tokio::test]
async fn both_channels_failing_marks_failed_then_retry_confirms() {
    let server = SimulatedServer::new();
    server.refuse_connections(true);
    server.fail_sends(true);
    let (session, mut events) = open(&server).await;

    let id = session.send_message("doomed").await.unwrap();
    let snapshot = session.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(status_of(&snapshot, &id), Some(MessageStatus::Failed));

    let mut saw_failed = false;
    while let Ok(event) = events.try_recv() {
        if event
            == (SyncEvent::StatusChanged {
                message_id: id.clone(),
                status: MessageStatus::Failed,
            })
        {
            saw_failed = true;
        }
    }
    assert!(saw_failed);

    server.fail_sends(false);
    session.retry_message(&id).await.unwrap();

    let snapshot = session.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].id.as_str(), "srv1");
    assert_eq!(snapshot.messages[0].status, MessageStatus::Sent);
    assert_eq!(snapshot.messages[0].client_id.as_ref(), Some(&id));
}

#[tokio::test]
async fn retry_that_fails_again_does_not_duplicate() {
    let server = SimulatedServer::new();
    server.refuse_connections(true);
    server.fail_sends(true);
    let (session, mut events) = open(&server).await;

    let id = session.send_message("still doomed").await.unwrap();
    while events.try_recv().is_ok() {}

    session.retry_message(&id).await.unwrap();

    let snapshot = session.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(status_of(&snapshot, &id), Some(MessageStatus::Failed));

    // The retry passed back through `sending` before failing.
    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::StatusChanged { status, .. } = event {
            statuses.push(status);
        }
    }
    assert_eq!(statuses, [MessageStatus::Sending, MessageStatus::Failed]);
    assert_eq!(server.send_calls(), 2);
}

#[tokio::test]
async fn retry_is_only_for_failed_messages() {
    let server = SimulatedServer::new();
    let (session, _events) = open(&server).await;

    session.send_message("fine").await.unwrap();
    let confirmed = eventually(&session, "confirmation", |s| {
        s.messages.iter().any(|m| m.status == MessageStatus::Sent)
    })
    .await
    .messages[0]
        .id
        .clone();

    assert_eq!(
        session.retry_message(&confirmed).await,
        Err(SendError::NotRetryable {
            id: confirmed,
            status: MessageStatus::Sent,
        })
    );
    assert_eq!(
        session.retry_message(&MessageId::new("nope")).await,
        Err(SendError::UnknownMessage(MessageId::new("nope")))
    );
}

#[tokio::test(start_paused = true)]
async fn soft_failure_shows_sent_after_grace() {
    let server = SimulatedServer::new();
    let (session, _events) = open(&server).await;
    assert!(session.snapshot().transport_connected);

    // The transport frame is accepted but never persisted, and the
    // request/response channel fails: the ambiguous case.
    server.ignore_transport_sends(true);
    server.fail_sends(true);

    let id = session.send_message("maybe").await.unwrap();
    assert_eq!(status_of(&session.snapshot(), &id), Some(MessageStatus::Sending));

    tokio::time::sleep(SyncConfig::default().soft_failure_grace + Duration::from_millis(100)).await;

    let snapshot = session.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(status_of(&snapshot, &id), Some(MessageStatus::Sent));
    // Nothing verified the transport delivery.
    assert!(server.messages(&conversation_id()).is_empty());
}

#[tokio::test]
async fn unauthorized_send_fails_and_asks_for_login() {
    use whisper::api::{ApiError, ChatApi};
    use whisper_proto::api::{ApiMessage, HistoryQuery, MarkReadRequest, MarkReadResponse, SendRequest};

    /// Rejects every call as 401.
    struct Expired;

    impl ChatApi for Expired {
        async fn history(&self, _: &ConversationId, _: &HistoryQuery) -> Result<Vec<ApiMessage>, ApiError> {
            Ok(Vec::new())
        }
        async fn send(&self, _: &ConversationId, _: &SendRequest) -> Result<ApiMessage, ApiError> {
            Err(ApiError::Unauthorized)
        }
        async fn delete(&self, _: &ConversationId, _: &MessageId) -> Result<(), ApiError> {
            Err(ApiError::Unauthorized)
        }
        async fn mark_read(&self, _: &ConversationId, _: &MarkReadRequest) -> Result<MarkReadResponse, ApiError> {
            Err(ApiError::Unauthorized)
        }
    }

    let server = SimulatedServer::new();
    server.ignore_transport_sends(true);
    let alice = user("alice");
    let (tx, mut events) = mpsc::channel(256);
    let session = Session::open(
        conversation(),
        alice.id.clone(),
        Arc::new(Expired),
        server.connector(alice),
        SyncConfig::default(),
        ReconnectConfig::default(),
        tx,
    )
    .await;

    let id = session.send_message("hello?").await.unwrap();

    // A rejected credential is never treated as a soft failure.
    assert_eq!(status_of(&session.snapshot(), &id), Some(MessageStatus::Failed));
    let mut auth_required = false;
    while let Ok(event) = events.try_recv() {
        auth_required |= event == SyncEvent::AuthenticationRequired;
    }
    assert!(auth_required);
}

#[tokio::test]
async fn blank_content_is_rejected_before_insert() {
    let server = SimulatedServer::new();
    let (session, _events) = open(&server).await;

    assert!(matches!(session.send_message("   \n").await, Err(SendError::Validation(_))));
    assert!(session.snapshot().messages.is_empty());
    assert_eq!(server.send_calls(), 0);
}

#[tokio::test]
async fn delete_removes_locally_and_on_server() {
    let server = SimulatedServer::new();
    let (session, _events) = open(&server).await;

    session.send_message("regret").await.unwrap();
    let id = eventually(&session, "confirmation", |s| {
        s.messages.len() == 1 && !s.messages[0].id.is_provisional()
    })
    .await
    .messages[0]
        .id
        .clone();

    session.delete_message(&id).await.unwrap();

    assert!(session.snapshot().messages.is_empty());
    assert!(server.messages(&conversation_id()).is_empty());
    // The transport delete won; the request/response delete found nothing.
    assert_eq!(server.delete_calls(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.snapshot().messages.is_empty());
}

#[tokio::test]
async fn failed_delete_stays_absent_until_resync() {
    let server = SimulatedServer::new();
    server.refuse_connections(true);
    let posted = server.insert_message(&conversation_id(), &user("alice"), "keep me?");
    let (session, _events) = open(&server).await;
    assert_eq!(session.snapshot().messages.len(), 1);

    server.fail_deletes(true);
    let result = session.delete_message(&posted.id).await;
    assert!(matches!(result, Err(SendError::DeleteFailed { ref id, .. }) if *id == posted.id));

    let snapshot = session.snapshot();
    assert!(snapshot.messages.is_empty());
    assert!(snapshot.error.is_some());

    session.load_messages(true).await.unwrap();
    let snapshot = session.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].id, posted.id);
    assert!(snapshot.error.is_none());
}

#[tokio::test]
async fn deleting_unsent_message_is_local_only() {
    let server = SimulatedServer::new();
    server.refuse_connections(true);
    server.fail_sends(true);
    let (session, _events) = open(&server).await;

    let id = session.send_message("never left").await.unwrap();
    session.delete_message(&id).await.unwrap();

    assert!(session.snapshot().messages.is_empty());
    assert_eq!(server.delete_calls(), 0);
    assert_eq!(
        session.delete_message(&id).await,
        Err(SendError::UnknownMessage(id))
    );
}

#[tokio::test(start_paused = true)]
async fn message_deleted_mid_send_does_not_resurface() {
    let server = SimulatedServer::new();
    server.refuse_connections(true);
    server.set_response_delay(Duration::from_millis(500));
    let (session, _events) = open(&server).await;

    let (sent, deleted) = tokio::join!(session.send_message("oops"), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let id = session.snapshot().messages[0].id.clone();
        session.delete_message(&id).await
    });
    sent.unwrap();
    deleted.unwrap();

    assert!(session.snapshot().messages.is_empty());
    // The copy the server created meanwhile was cleaned up.
    assert!(server.messages(&conversation_id()).is_empty());
}

#[tokio::test]
async fn closed_session_rejects_sends() {
    let server = SimulatedServer::new();
    let (session, _events) = open(&server).await;

    session.close().await;
    assert!(session.is_closed());
    assert_eq!(session.send_message("late").await, Err(SendError::Closed));
    assert_eq!(server.attached(&conversation_id()), 0);
}
