//! Framing transport abstraction and the in-process direct channel.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

/// Errors surfaced by a [`Channel`].
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Orderly end of stream: the peer or the local side closed the channel.
    #[error("channel closed")]
    Closed,
    #[error("channel i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// A message-oriented byte transport. A frame is one complete JSON value
/// (object or array); how frames are delimited (newlines, length prefixes,
/// HTTP bodies) is entirely the implementation's business.
///
/// Contract:
/// - `send` transmits a whole frame or fails; partial frames never appear
///   on the wire. Callers serialize their sends.
/// - `recv` returns whole frames in order. Only one task reads at a time.
/// - `close` releases the transport and causes a blocked `recv` on the same
///   endpoint to return [`ChannelError::Closed`].
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    async fn send(&self, frame: &[u8]) -> Result<(), ChannelError>;
    async fn recv(&self) -> Result<Vec<u8>, ChannelError>;
    async fn close(&self) -> Result<(), ChannelError>;
}

/// One endpoint of an in-process channel pair created by [`direct`].
///
/// Frames pass between the two endpoints through unbounded queues, one per
/// direction. Closing either endpoint ends the stream for both.
pub struct Direct {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl Direct {
    fn new(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            closed_tx,
            closed_rx,
        }
    }
}

/// Constructs a connected pair of in-process endpoints. What one sends the
/// other receives, in order.
pub fn direct() -> (Direct, Direct) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (Direct::new(a_tx, b_rx), Direct::new(b_tx, a_rx))
}

#[async_trait]
impl Channel for Direct {
    async fn send(&self, frame: &[u8]) -> Result<(), ChannelError> {
        let guard = self.tx.lock().expect("direct channel lock poisoned");
        match guard.as_ref() {
            Some(tx) => tx.send(frame.to_vec()).map_err(|_| ChannelError::Closed),
            None => Err(ChannelError::Closed),
        }
    }

    async fn recv(&self) -> Result<Vec<u8>, ChannelError> {
        let mut closed = self.closed_rx.clone();
        if *closed.borrow() {
            return Err(ChannelError::Closed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => frame.ok_or(ChannelError::Closed),
            _ = closed.changed() => Err(ChannelError::Closed),
        }
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.tx.lock().expect("direct channel lock poisoned").take();
        let _ = self.closed_tx.send(true);
        Ok(())
    }
}

/// Network type guessed for a listen or dial address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Unix => "unix",
        }
    }

    /// Classifies an address string.
    ///
    /// An address of the form `host:port` where the port looks like a legal
    /// service name (ASCII letters, digits, and `-`) and the host contains
    /// no `/` is `Tcp`; everything else is `Unix`. The address is not
    /// otherwise validated.
    pub fn guess(address: &str) -> Network {
        let Some((host, port)) = address.rsplit_once(':') else {
            return Network::Unix;
        };
        if port.is_empty() || !is_service_name(port) {
            return Network::Unix;
        }
        if host.contains('/') {
            return Network::Unix;
        }
        Network::Tcp
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_service_name(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-')
}
