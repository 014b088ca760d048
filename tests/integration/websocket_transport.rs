// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for the WebSocket transport against a minimal
//! in-test chat endpoint built on `tokio-tungstenite`.
//!
//! Each test binds an ephemeral port, accepts exactly one connection, and
//! scripts the server side of the exchange.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use whisper::auth::{AuthProvider, StaticToken};
use whisper::transport::websocket::WebSocketConnector;
use whisper::transport::{Connector, Transport, TransportError};
use whisper_proto::event::{ClientCommand, ServerEvent};
use whisper_proto::message::{ConversationId, UserId};

type ServerStream = WebSocketStream<tokio::net::TcpStream>;

fn conversation_id() -> ConversationId {
    ConversationId::new("c1")
}

fn connector(port: u16, auth: &Arc<StaticToken>) -> WebSocketConnector {
    let auth: Arc<dyn AuthProvider> = Arc::clone(auth) as Arc<dyn AuthProvider>;
    WebSocketConnector::new(format!("ws://127.0.0.1:{port}"), auth, Duration::from_secs(5))
}

/// Accepts one WebSocket connection, runs `script` on it, and returns the
/// request URI together with the script's result.
async fn serve_once<F, Fut, T>(script: F) -> (u16, tokio::task::JoinHandle<(String, T)>)
where
    F: FnOnce(ServerStream) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send,
    T: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut uri = String::new();
        let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
            uri = request.uri().to_string();
            Ok(response)
        })
        .await
        .unwrap();
        let result = script(ws).await;
        (uri, result)
    });
    (port, handle)
}

fn frame(event: &ServerEvent) -> Message {
    Message::Text(serde_json::to_string(event).unwrap().into())
}

async fn next_command(ws: &mut ServerStream) -> ClientCommand {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

#[tokio::test]
async fn connects_with_token_and_exchanges_frames() {
    let (port, server) = serve_once(|mut ws| async move {
        let join = next_command(&mut ws).await;
        ws.send(frame(&ServerEvent::UserTyping {
            conversation_id: conversation_id(),
            user_id: UserId::new("bob"),
        }))
        .await
        .unwrap();
        let typing = next_command(&mut ws).await;
        (join, typing)
    })
    .await;

    let auth = Arc::new(StaticToken::new(Some("s3cret".to_string())));
    let transport = connector(port, &auth).connect(&conversation_id()).await.unwrap();
    assert!(transport.is_connected());

    transport
        .send(&ClientCommand::JoinChat {
            conversation_id: conversation_id(),
        })
        .await
        .unwrap();
    let event = transport.recv().await.unwrap();
    assert_eq!(
        event,
        ServerEvent::UserTyping {
            conversation_id: conversation_id(),
            user_id: UserId::new("bob"),
        }
    );
    transport
        .send(&ClientCommand::Typing {
            conversation_id: conversation_id(),
        })
        .await
        .unwrap();

    let (uri, (join, typing)) = server.await.unwrap();
    assert_eq!(uri, "/ws/chat/c1/?token=s3cret");
    assert_eq!(
        join,
        ClientCommand::JoinChat {
            conversation_id: conversation_id(),
        }
    );
    assert_eq!(
        typing,
        ClientCommand::Typing {
            conversation_id: conversation_id(),
        }
    );
    transport.close().await;
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn malformed_frames_are_skipped() {
    let (port, server) = serve_once(|mut ws| async move {
        ws.send(Message::Text("{not json".into())).await.unwrap();
        ws.send(Message::Text(r#"{"event":"somethingNew","data":{}}"#.into()))
            .await
            .unwrap();
        ws.send(frame(&ServerEvent::Error {
            message: "after garbage".to_string(),
        }))
        .await
        .unwrap();
        // Keep the socket open until the client has read.
        let _ = ws.next().await;
    })
    .await;

    let auth = Arc::new(StaticToken::new(None));
    let transport = connector(port, &auth).connect(&conversation_id()).await.unwrap();
    let event = transport.recv().await.unwrap();
    assert_eq!(
        event,
        ServerEvent::Error {
            message: "after garbage".to_string(),
        }
    );
    transport.close().await;
    let (uri, ()) = server.await.unwrap();
    assert_eq!(uri, "/ws/chat/c1/");
}

async fn close_with(code: u16) -> (Result<ServerEvent, TransportError>, Arc<StaticToken>) {
    let (port, server) = serve_once(move |mut ws| async move {
        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        })))
        .await
        .unwrap();
        let _ = ws.next().await;
    })
    .await;

    let auth = Arc::new(StaticToken::new(Some("expired".to_string())));
    let transport = connector(port, &auth).connect(&conversation_id()).await.unwrap();
    let result = transport.recv().await;
    drop(transport);
    let _ = server.await;
    (result, auth)
}

#[tokio::test]
async fn close_4001_is_unauthorized_and_reported() {
    let (result, auth) = close_with(4001).await;
    assert!(matches!(result, Err(TransportError::Unauthorized)));
    assert_eq!(auth.rejections(), 1);
}

#[tokio::test]
async fn close_4003_is_forbidden() {
    let (result, auth) = close_with(4003).await;
    assert!(matches!(result, Err(TransportError::Forbidden(ref c)) if *c == conversation_id()));
    assert_eq!(auth.rejections(), 0);
}

#[tokio::test]
async fn normal_close_is_a_plain_disconnect() {
    let (result, _auth) = close_with(1000).await;
    let err = result.unwrap_err();
    assert!(matches!(err, TransportError::ConnectionClosed));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn handshake_401_is_unauthorized() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let rejected = tokio_tungstenite::accept_hdr_async(stream, |_: &Request, _: Response| {
            let mut response = ErrorResponse::new(None);
            *response.status_mut() = StatusCode::UNAUTHORIZED;
            Err(response)
        })
        .await;
        assert!(rejected.is_err());
    });

    let auth = Arc::new(StaticToken::new(Some("bad".to_string())));
    let result = connector(port, &auth).connect(&conversation_id()).await;
    assert!(matches!(result, Err(TransportError::Unauthorized)));
    assert_eq!(auth.rejections(), 1);
    server.await.unwrap();
}

#[tokio::test]
async fn unreachable_endpoint_is_retryable() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let auth = Arc::new(StaticToken::new(None));
    let Err(err) = connector(port, &auth).connect(&conversation_id()).await else {
        panic!("connected to a closed port");
    };
    assert!(matches!(err, TransportError::Unreachable(_)));
    assert!(err.is_retryable());
}
