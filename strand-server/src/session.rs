//! Per-connection session state and the outbound socket.
//!
//! ```text
//! request handler ──send()──► mpsc (bounded) ──► writer task ──► WebSocket sink
//! ```
//!
//! The writer task owns the sink. A full queue makes `send` wait, which is
//! the backpressure seen by chunked responses and broadcasts.

use async_trait::async_trait;
use futures_util::{Sink, SinkExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use strand_core::WorkspaceId;

use crate::error::ServerError;
use crate::protocol::{Codec, HelloParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, waiting for `hello`.
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Outbound half of a connection.
#[async_trait]
pub trait ConnectionSocket: Send + Sync {
    fn is_closed(&self) -> bool;

    /// Queue one frame. Fails with [`ServerError::Closed`] once the peer is gone.
    async fn send(&self, message: Message) -> Result<(), ServerError>;
}

/// WebSocket sink driven by a dedicated writer task.
pub struct WsSocket {
    sender: mpsc::Sender<Message>,
    closed: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
}

impl WsSocket {
    pub fn spawn<S>(mut sink: S, queue_capacity: usize) -> (Arc<Self>, JoinHandle<()>)
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
    {
        let (sender, mut rx) = mpsc::channel::<Message>(queue_capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(AtomicUsize::new(0));

        let writer_closed = closed.clone();
        let writer_pending = pending.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                let result = sink.send(message).await;
                writer_pending.fetch_sub(1, Ordering::Relaxed);
                if let Err(e) = result {
                    log::debug!("Writer stopped: {e}");
                    break;
                }
                if is_close {
                    break;
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
            rx.close();
            let _ = sink.close().await;
        });

        (
            Arc::new(Self {
                sender,
                closed,
                pending,
            }),
            writer,
        )
    }

    /// Frames queued but not yet written.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Stop accepting frames. Already queued frames are still written.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionSocket for WsSocket {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.sender.is_closed()
    }

    async fn send(&self, message: Message) -> Result<(), ServerError> {
        if self.is_closed() {
            return Err(ServerError::Closed);
        }
        self.pending.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(message).await.is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            self.closed.store(true, Ordering::SeqCst);
            return Err(ServerError::Closed);
        }
        Ok(())
    }
}

/// One client connection to one workspace.
pub struct Session {
    pub id: Uuid,
    pub workspace: WorkspaceId,
    state: SessionState,
    codec: Codec,
    socket: Arc<WsSocket>,
}

impl Session {
    pub fn new(workspace: WorkspaceId, socket: Arc<WsSocket>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace,
            state: SessionState::Connecting,
            codec: Codec::default(),
            socket,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn binary_mode(&self) -> bool {
        self.codec.binary
    }

    pub fn use_compression(&self) -> bool {
        self.codec.compression
    }

    pub fn pending_send(&self) -> usize {
        self.socket.pending()
    }

    pub fn socket(&self) -> &Arc<WsSocket> {
        &self.socket
    }

    /// Apply `hello`. The reply to `hello` itself is still sent with the
    /// previous codec; the caller switches afterwards.
    pub fn open(&mut self, hello: HelloParams) -> Codec {
        let previous = self.codec;
        self.codec = Codec::new(hello.binary, hello.compression);
        self.state = SessionState::Open;
        previous
    }

    pub fn closing(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closing;
        }
        self.socket.close();
    }

    pub fn closed(&mut self) {
        self.state = SessionState::Closed;
        self.socket.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::sink::drain;

    fn socket() -> (Arc<WsSocket>, JoinHandle<()>) {
        WsSocket::spawn(drain().sink_map_err(|_: std::convert::Infallible| tungstenite::Error::ConnectionClosed), 8)
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (socket, _writer) = socket();
        let mut session = Session::new(WorkspaceId::new("ws"), socket);
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.codec(), Codec::default());

        let previous = session.open(HelloParams {
            binary: true,
            compression: true,
        });
        assert_eq!(previous, Codec::default());
        assert_eq!(session.state(), SessionState::Open);
        assert!(session.binary_mode());
        assert!(session.use_compression());

        session.closing();
        assert_eq!(session.state(), SessionState::Closing);
        assert!(session.socket().is_closed());
        session.closed();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (socket, writer) = socket();
        socket.send(Message::Text("a".into())).await.unwrap();
        socket.send(Message::Close(None)).await.unwrap();
        writer.await.unwrap();
        assert!(socket.is_closed());
        assert!(matches!(
            socket.send(Message::Text("b".into())).await,
            Err(ServerError::Closed)
        ));
        assert_eq!(socket.pending(), 0);
    }
}
