//! Socket abstraction for the HMR channel.

use crate::error::Result;
use async_trait::async_trait;
use futures::channel::mpsc;
use url::Url;

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Open,
    /// One text frame.
    Message(String),
    /// The socket closed. `clean` is `false` for drops and failed handshakes.
    Close { clean: bool },
}

/// An established (or establishing) socket.
///
/// Text pushed into `outgoing` is sent as one frame once the socket is open.
/// `incoming` ends after the `Close` event.
pub struct Connection {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<SocketEvent>,
}

impl Connection {
    /// A connection that closes uncleanly without ever opening.
    #[must_use]
    pub fn refused() -> Self {
        let (outgoing, _) = mpsc::unbounded();
        let (events, incoming) = mpsc::unbounded();
        let _ = events.unbounded_send(SocketEvent::Close { clean: false });
        Self { outgoing, incoming }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a socket to `url`, requesting the given subprotocol.
    ///
    /// Handshake failures should surface as a `Close { clean: false }` event
    /// without a preceding `Open`.
    async fn connect(&self, url: &Url, protocol: &str) -> Result<Connection>;
}
