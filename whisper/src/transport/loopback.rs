//! Loopback transport for testing and the offline demo.
//!
//! Each [`LoopbackTransport`] is a link into a [`SimulatedServer`]: commands
//! are handled by the server synchronously and pushed events arrive on an
//! in-process [`tokio::sync::mpsc`] channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};

use whisper_proto::event::{ClientCommand, ServerEvent};
use whisper_proto::message::{ChatUser, ConversationId};

use super::{Connector, Transport, TransportError};
use crate::sim::SimulatedServer;

/// Opens loopback links to a [`SimulatedServer`] as one user.
#[derive(Clone)]
pub struct LoopbackConnector {
    server: Arc<SimulatedServer>,
    user: ChatUser,
}

impl LoopbackConnector {
    /// Creates a connector for `user`.
    #[must_use]
    pub const fn new(server: Arc<SimulatedServer>, user: ChatUser) -> Self {
        Self { server, user }
    }
}

impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&self, conversation: &ConversationId) -> Result<LoopbackTransport, TransportError> {
        let (link_id, rx) = self.server.open_link(&self.user, conversation)?;
        tracing::debug!(conversation = %conversation, link = link_id, "loopback link opened");
        Ok(LoopbackTransport {
            link_id,
            server: Arc::clone(&self.server),
            rx: Mutex::new(rx),
            open: AtomicBool::new(true),
        })
    }
}

/// In-process transport session backed by a [`SimulatedServer`] link.
pub struct LoopbackTransport {
    link_id: u64,
    server: Arc<SimulatedServer>,
    /// Events pushed by the server.
    rx: Mutex<mpsc::Receiver<ServerEvent>>,
    /// Cleared by `close`.
    open: AtomicBool,
}

impl Transport for LoopbackTransport {
    async fn send(&self, command: &ClientCommand) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }
        self.server.handle_command(self.link_id, command.clone())
    }

    async fn recv(&self) -> Result<ServerEvent, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::Relaxed) && self.server.has_link(self.link_id)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::Relaxed) {
            self.server.close_link(self.link_id);
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        if self.open.swap(false, Ordering::Relaxed) {
            self.server.close_link(self.link_id);
        }
    }
}
