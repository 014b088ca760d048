//! WebSocket transport to the backend's chat endpoint.
//!
//! Connects to `{ws_base}/ws/chat/{conversation_id}/?token=<bearer>`, the
//! route the backend authenticates with its token middleware. Frames are
//! JSON text messages (see [`whisper_proto::codec`]).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use whisper_proto::codec;
use whisper_proto::event::{ClientCommand, ServerEvent};
use whisper_proto::message::ConversationId;

use super::{Connector, Transport, TransportError};
use crate::auth::AuthProvider;

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Close code the backend uses for an unauthenticated socket.
const CLOSE_UNAUTHENTICATED: u16 = 4001;

/// Close code the backend uses when the user is not a participant.
const CLOSE_FORBIDDEN: u16 = 4003;

/// Capacity of the decoded-event channel between reader task and `recv`.
const INCOMING_BUFFER: usize = 256;

/// Opens [`WebSocketTransport`] sessions against one backend.
#[derive(Clone)]
pub struct WebSocketConnector {
    ws_base: String,
    auth: Arc<dyn AuthProvider>,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Creates a connector for the WebSocket root `ws_base`
    /// (e.g. `wss://chat.example.com`).
    #[must_use]
    pub fn new(ws_base: impl Into<String>, auth: Arc<dyn AuthProvider>, connect_timeout: Duration) -> Self {
        Self {
            ws_base: ws_base.into(),
            auth,
            connect_timeout,
        }
    }
}

impl Connector for WebSocketConnector {
    type Transport = WebSocketTransport;

    async fn connect(&self, conversation: &ConversationId) -> Result<WebSocketTransport, TransportError> {
        let token = self.auth.bearer_token();
        let url = chat_url(&self.ws_base, conversation, token.as_deref())?;
        WebSocketTransport::connect(
            &url,
            conversation.clone(),
            Arc::clone(&self.auth),
            self.connect_timeout,
        )
        .await
    }
}

/// Builds the chat endpoint URL for a conversation.
///
/// # Errors
///
/// Returns [`TransportError::Unreachable`] if the base is not a valid URL.
pub fn chat_url(
    ws_base: &str,
    conversation: &ConversationId,
    token: Option<&str>,
) -> Result<Url, TransportError> {
    let mut url = Url::parse(ws_base)
        .map_err(|e| TransportError::Unreachable(format!("invalid WebSocket URL {ws_base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| TransportError::Unreachable(format!("WebSocket URL cannot be a base: {ws_base}")))?
        .pop_if_empty()
        .extend(["ws", "chat", conversation.as_str(), ""]);
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

/// One WebSocket session bound to a conversation.
///
/// A background reader task decodes incoming text frames into
/// [`ServerEvent`]s; [`Transport::recv`] drains them in order.
pub struct WebSocketTransport {
    /// Write half, shared for concurrent sends.
    ws_sender: Mutex<WsSender>,
    /// Decoded events (or the terminal error) from the reader task.
    incoming: Mutex<mpsc::Receiver<Result<ServerEvent, TransportError>>>,
    /// Whether the socket is still open.
    connected: Arc<AtomicBool>,
    /// Background reader task.
    reader_handle: tokio::task::JoinHandle<()>,
}

impl WebSocketTransport {
    /// Connect to `url` and spawn the reader task.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the handshake does not finish in time.
    /// - [`TransportError::Unauthorized`] if the handshake is rejected with 401.
    /// - [`TransportError::Unreachable`] / [`TransportError::Io`] for network failures.
    pub async fn connect(
        url: &Url,
        conversation: ConversationId,
        auth: Arc<dyn AuthProvider>,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let (ws_stream, _response) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                tracing::warn!(conversation = %conversation, "WebSocket connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(conversation = %conversation, err = %e, "WebSocket connect failed");
                map_ws_connect_error(e, auth.as_ref())
            })?;

        let (ws_sender, ws_reader) = ws_stream.split();
        let (tx, rx) = mpsc::channel(INCOMING_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));

        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            tx,
            Arc::clone(&connected),
            conversation.clone(),
            auth,
        ));

        tracing::info!(conversation = %conversation, "WebSocket connected");

        Ok(Self {
            ws_sender: Mutex::new(ws_sender),
            incoming: Mutex::new(rx),
            connected,
            reader_handle,
        })
    }
}

impl Transport for WebSocketTransport {
    async fn send(&self, command: &ClientCommand) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }

        let text = codec::encode_command(command)?;
        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "WebSocket send failed");
            self.connected.store(false, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })
    }

    async fn recv(&self) -> Result<ServerEvent, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.unwrap_or(Err(TransportError::ConnectionClosed))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            let mut sender = self.ws_sender.lock().await;
            let _ = sender.send(Message::Close(None)).await;
        }
        self.reader_handle.abort();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Background task that reads frames and forwards decoded events.
///
/// Malformed frames are logged and skipped. The backend's authentication
/// and membership close codes are turned into a terminal error so the
/// connection manager does not retry them.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<Result<ServerEvent, TransportError>>,
    connected: Arc<AtomicBool>,
    conversation: ConversationId,
    auth: Arc<dyn AuthProvider>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match codec::decode_event(text.as_str()) {
                Ok(event) => {
                    if tx.send(Ok(event)).await.is_err() {
                        // Transport dropped.
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed WebSocket frame, skipping");
                }
            },
            Ok(Message::Close(frame)) => {
                if let Some(err) = close_error(frame.as_ref(), &conversation) {
                    if matches!(err, TransportError::Unauthorized) {
                        auth.on_unauthorized();
                    }
                    let _ = tx.send(Err(err)).await;
                }
                tracing::info!(conversation = %conversation, "WebSocket closed by server");
                break;
            }
            Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::debug!(conversation = %conversation, "WebSocket reader task exiting");
}

/// Maps a server close frame to a terminal transport error, if it carries one.
fn close_error(frame: Option<&CloseFrame>, conversation: &ConversationId) -> Option<TransportError> {
    match u16::from(frame?.code) {
        CLOSE_UNAUTHENTICATED => Some(TransportError::Unauthorized),
        CLOSE_FORBIDDEN => Some(TransportError::Forbidden(conversation.clone())),
        _ => None,
    }
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(
    err: tokio_tungstenite::tungstenite::Error,
    auth: &dyn AuthProvider,
) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(io_err.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) if response.status().as_u16() == 401 => {
            auth.on_unauthorized();
            TransportError::Unauthorized
        }
        WsError::Http(response) => TransportError::Io(std::io::Error::other(format!(
            "WebSocket HTTP error: status {}",
            response.status()
        ))),
        other => TransportError::Io(std::io::Error::other(format!(
            "WebSocket connection error: {other}"
        ))),
    }
}
