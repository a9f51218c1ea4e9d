//! WebSocket session client.
//!
//! Provides:
//! - Connection and codec negotiation (`hello`)
//! - Request/response correlation by id
//! - Reassembly of chunked responses and broadcasts
//! - Committed transactions of the workspace as [`SessionEvent`]s

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};

use strand_core::{CollaborativeRef, Doc, DocId, Tx};

use crate::error::ServerError;
use crate::protocol::{Codec, FindParams, FindResult, HelloParams, ProtocolError, Request, Response};
use crate::session::{ConnectionSocket, WsSocket};

/// Events emitted by the session client.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Session opened
    Connected,
    /// Transactions committed in the workspace
    Transactions(Vec<Tx>),
    /// Connection lost
    Disconnected,
}

/// Collects the chunks of one response.
#[derive(Debug, Default)]
struct ChunkAssembler {
    items: Vec<Value>,
}

impl ChunkAssembler {
    /// Returns the whole response once its last chunk is in.
    fn push(&mut self, response: Response) -> Option<Response> {
        let Some(chunk) = response.chunk else {
            return Some(response);
        };
        if let Value::Array(items) = response.result {
            self.items.extend(items);
        }
        if !chunk.is_final {
            return None;
        }
        Some(Response {
            result: Value::Array(std::mem::take(&mut self.items)),
            chunk: None,
            ..response
        })
    }
}

struct PendingCall {
    reply: oneshot::Sender<Response>,
    chunks: ChunkAssembler,
}

struct Shared {
    /// Codec of frames from the server.
    codec: RwLock<Codec>,
    pending: Mutex<HashMap<u64, PendingCall>>,
}

/// The session client.
pub struct SessionClient {
    socket: Arc<WsSocket>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    session_id: Option<uuid::Uuid>,
}

impl SessionClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:9090`) and open a session on
    /// `workspace` with the given codec options.
    pub async fn connect(url: &str, workspace: &str, hello: HelloParams) -> Result<Self, ServerError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(format!("{url}/{workspace}")).await?;
        let (ws_writer, ws_reader) = ws_stream.split();

        let (socket, _writer) = WsSocket::spawn(ws_writer, 64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let shared = Arc::new(Shared {
            codec: RwLock::new(Codec::default()),
            pending: Mutex::new(HashMap::new()),
        });
        tokio::spawn(read_loop(ws_reader, shared.clone(), event_tx.clone()));

        let mut client = Self {
            socket,
            shared,
            next_id: AtomicU64::new(1),
            event_rx: Some(event_rx),
            session_id: None,
        };

        // The hello itself goes out as plain JSON; the server switches after
        // replying, so frames read from here on use the negotiated codec.
        let request = Request::hello(client.next_id(), hello.binary, hello.compression);
        *client.shared.codec.write().await = Codec::new(hello.binary, hello.compression);
        let response = client.exchange(request, Codec::default()).await?;
        client.session_id = response
            .result
            .get("session")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok());

        let _ = event_tx.send(SessionEvent::Connected).await;
        log::info!("Session {:?} opened on {workspace}", client.session_id);
        Ok(client)
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn session_id(&self) -> Option<uuid::Uuid> {
        self.session_id
    }

    pub fn is_connected(&self) -> bool {
        !self.socket.is_closed()
    }

    pub async fn find_all(&self, params: &FindParams) -> Result<FindResult, ServerError> {
        let request = Request::find_all(self.next_id(), params);
        let response = self.call(request).await?;

        let docs: Vec<Doc> = from_value(response.result)?;
        let lookup_map: BTreeMap<DocId, Doc> = match response.lookup_map {
            Some(map) => from_value(map)?,
            None => BTreeMap::new(),
        };
        Ok(FindResult {
            total: response.total.unwrap_or(docs.len() as u64),
            docs,
            lookup_map,
        })
    }

    /// Commit one transaction. Returns its log sequence.
    pub async fn apply(&self, tx: &Tx) -> Result<u64, ServerError> {
        let response = self.call(Request::tx(self.next_id(), tx)).await?;
        from_value(response.result)
    }

    pub async fn load_collaborative(
        &self,
        reference: &CollaborativeRef,
    ) -> Result<Option<Vec<u8>>, ServerError> {
        let response = self
            .call(Request::load_collaborative(self.next_id(), reference))
            .await?;
        from_value(response.result)
    }

    pub async fn update_collaborative(
        &self,
        reference: &CollaborativeRef,
        update: &[u8],
    ) -> Result<Option<u64>, ServerError> {
        let response = self
            .call(Request::update_collaborative(self.next_id(), reference, update))
            .await?;
        from_value(response.result)
    }

    pub async fn ping(&self) -> Result<(), ServerError> {
        self.call(Request::ping(self.next_id())).await.map(|_| ())
    }

    /// Close the connection. Pending calls fail with [`ServerError::Closed`].
    pub async fn close(&self) -> Result<(), ServerError> {
        let result = self.socket.send(Message::Close(None)).await;
        self.socket.close();
        result
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn call(&self, request: Request) -> Result<Response, ServerError> {
        let codec = *self.shared.codec.read().await;
        self.exchange(request, codec).await
    }

    async fn exchange(&self, request: Request, codec: Codec) -> Result<Response, ServerError> {
        let id = request.id.unwrap_or_default();
        let (reply, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(
            id,
            PendingCall {
                reply,
                chunks: ChunkAssembler::default(),
            },
        );

        let sent = match codec.encode(&request) {
            Ok(frame) => self.socket.send(frame).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            self.shared.pending.lock().await.remove(&id);
            return Err(e);
        }

        let response = rx.await.map_err(|_| ServerError::Closed)?;
        match response.error {
            Some(message) => Err(ServerError::Remote(message)),
            None => Ok(response),
        }
    }
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ServerError> {
    Ok(serde_json::from_value(value).map_err(ProtocolError::Json)?)
}

/// Route server frames to pending calls and broadcasts to `events`.
async fn read_loop<S>(mut stream: S, shared: Arc<Shared>, events: mpsc::Sender<SessionEvent>)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let mut broadcast = ChunkAssembler::default();
    while let Some(msg) = stream.next().await {
        let message = match msg {
            Ok(Message::Close(_)) => break,
            Ok(message @ (Message::Text(_) | Message::Binary(_))) => message,
            Ok(_) => continue,
            Err(e) => {
                log::debug!("Client connection error: {e}");
                break;
            }
        };

        let codec = *shared.codec.read().await;
        let response: Response = match codec.decode_message(&message) {
            Ok(Some(response)) => response,
            Ok(None) => continue,
            Err(e) => {
                log::warn!("Undecodable frame from server: {e}");
                continue;
            }
        };

        match response.id {
            None => {
                let Some(complete) = broadcast.push(response) else {
                    continue;
                };
                match serde_json::from_value::<Vec<Tx>>(complete.result) {
                    Ok(txs) => {
                        // A slow event consumer must not stall replies.
                        if let Err(mpsc::error::TrySendError::Full(_)) =
                            events.try_send(SessionEvent::Transactions(txs))
                        {
                            log::warn!("Event queue full, broadcast dropped");
                        }
                    }
                    Err(e) => log::warn!("Malformed broadcast: {e}"),
                }
            }
            Some(id) => {
                let mut pending = shared.pending.lock().await;
                let Some(call) = pending.get_mut(&id) else {
                    log::debug!("Response to unknown request {id}");
                    continue;
                };
                if let Some(complete) = call.chunks.push(response) {
                    if let Some(call) = pending.remove(&id) {
                        let _ = call.reply.send(complete);
                    }
                }
            }
        }
    }

    // Dropping the reply senders fails every pending call.
    shared.pending.lock().await.clear();
    let _ = events.try_send(SessionEvent::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChunkInfo;
    use serde_json::json;

    fn chunk(index: u32, is_final: bool, items: Value) -> Response {
        Response {
            id: Some(1),
            result: items,
            chunk: Some(ChunkInfo { index, is_final }),
            total: is_final.then_some(5),
            ..Response::default()
        }
    }

    #[test]
    fn test_chunks_are_reassembled() {
        let mut assembler = ChunkAssembler::default();
        assert!(assembler.push(chunk(1, false, json!([1, 2]))).is_none());
        assert!(assembler.push(chunk(2, false, json!([3, 4]))).is_none());
        let whole = assembler.push(chunk(3, true, json!([5]))).unwrap();

        assert_eq!(whole.result, json!([1, 2, 3, 4, 5]));
        assert_eq!(whole.total, Some(5));
        assert!(whole.chunk.is_none());
        assert!(assembler.items.is_empty());
    }

    #[test]
    fn test_unchunked_response_passes_through() {
        let mut assembler = ChunkAssembler::default();
        let response = Response::ok(Some(2), json!("pong"));
        assert_eq!(assembler.push(response.clone()), Some(response));
    }

    #[tokio::test]
    async fn test_read_loop_routes_frames() {
        let shared = Arc::new(Shared {
            codec: RwLock::new(Codec::default()),
            pending: Mutex::new(HashMap::new()),
        });
        let (reply, rx) = oneshot::channel();
        shared.pending.lock().await.insert(
            1,
            PendingCall {
                reply,
                chunks: ChunkAssembler::default(),
            },
        );

        let codec = Codec::default();
        let frames: Vec<Result<Message, tungstenite::Error>> = vec![
            Ok(codec.encode(&chunk(1, false, json!([1]))).unwrap()),
            Ok(codec.encode(&Response::transactions(&[])).unwrap()),
            Ok(codec.encode(&chunk(2, true, json!([2]))).unwrap()),
        ];
        let (events_tx, mut events) = mpsc::channel(8);
        read_loop(futures_util::stream::iter(frames), shared, events_tx).await;

        assert_eq!(rx.await.unwrap().result, json!([1, 2]));
        assert!(matches!(events.recv().await, Some(SessionEvent::Transactions(t)) if t.is_empty()));
        assert!(matches!(events.recv().await, Some(SessionEvent::Disconnected)));
    }
}
