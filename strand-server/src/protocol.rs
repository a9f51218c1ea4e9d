//! Wire protocol for client sessions.
//!
//! Requests and responses are JSON objects. A session starts in text mode;
//! the `hello` request may switch it to binary framing and/or LZ4:
//!
//! ```text
//! text:    JSON
//! binary:  bincode(Envelope { version, payload: JSON })
//! +lz4:    size-prepended LZ4 block of either of the above
//! ```
//!
//! Truncated frames decode to [`ProtocolError::Incomplete`], which the
//! server drops silently. A compressed frame whose size prefix exceeds
//! [`MAX_FRAME_SIZE`] is rejected before anything is allocated.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

use strand_core::{ClassId, CollaborativeRef, Doc, DocId, Query, Tx};

const ENVELOPE_VERSION: u8 = 1;

/// Largest decompressed frame accepted, matching the WebSocket message limit.
pub const MAX_FRAME_SIZE: usize = 64 << 20;

pub mod method {
    pub const HELLO: &str = "hello";
    pub const FIND_ALL: &str = "findAll";
    pub const TX: &str = "tx";
    pub const LOAD_COLLABORATIVE: &str = "loadCollaborative";
    pub const UPDATE_COLLABORATIVE: &str = "updateCollaborative";
    pub const PING: &str = "ping";
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame ended early. Not an error for the connection.
    #[error("Incomplete frame")]
    Incomplete,

    #[error("JSON error: {0}")]
    Json(serde_json::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Decode error: {0}")]
    Decode(bincode::error::DecodeError),

    #[error("Decompression error: {0}")]
    Compression(lz4_flex::block::DecompressError),

    #[error("Frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),

    #[error("Unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid params for {method}: {source}")]
    InvalidParams {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ProtocolError {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::Incomplete)
    }

    fn from_json(e: serde_json::Error) -> Self {
        if e.is_eof() {
            ProtocolError::Incomplete
        } else {
            ProtocolError::Json(e)
        }
    }

    fn from_bincode(e: bincode::error::DecodeError) -> Self {
        match e {
            bincode::error::DecodeError::UnexpectedEnd { .. } => ProtocolError::Incomplete,
            other => ProtocolError::Decode(other),
        }
    }

    fn from_lz4(e: lz4_flex::block::DecompressError) -> Self {
        use lz4_flex::block::DecompressError;
        match e {
            DecompressError::ExpectedAnotherByte => ProtocolError::Incomplete,
            other => ProtocolError::Compression(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloParams {
    #[serde(default)]
    pub binary: bool,
    #[serde(default)]
    pub compression: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindParams {
    pub class: ClassId,
    #[serde(default)]
    pub query: Query,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Reference attributes whose targets are returned in `lookupMap`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lookup: Vec<String>,
}

impl FindParams {
    pub fn new(class: ClassId, query: Query) -> Self {
        Self {
            class,
            query,
            limit: None,
            lookup: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TxParams {
    tx: Tx,
}

#[derive(Debug, Deserialize)]
struct LoadParams {
    #[serde(rename = "ref")]
    reference: CollaborativeRef,
}

#[derive(Debug, Deserialize)]
struct UpdateParams {
    #[serde(rename = "ref")]
    reference: CollaborativeRef,
    update: Vec<u8>,
}

/// A request decoded into its typed form.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Hello(HelloParams),
    FindAll(FindParams),
    Tx(Tx),
    LoadCollaborative(CollaborativeRef),
    UpdateCollaborative {
        reference: CollaborativeRef,
        update: Vec<u8>,
    },
    Ping,
}

impl Request {
    pub fn new(id: Option<u64>, method: &str, params: Value) -> Self {
        Self {
            id,
            method: method.to_string(),
            params,
        }
    }

    pub fn hello(id: u64, binary: bool, compression: bool) -> Self {
        Self::new(
            Some(id),
            method::HELLO,
            json!({ "binary": binary, "compression": compression }),
        )
    }

    pub fn find_all(id: u64, params: &FindParams) -> Self {
        Self::new(
            Some(id),
            method::FIND_ALL,
            serde_json::to_value(params).unwrap_or(Value::Null),
        )
    }

    pub fn tx(id: u64, tx: &Tx) -> Self {
        Self::new(Some(id), method::TX, json!({ "tx": tx }))
    }

    pub fn load_collaborative(id: u64, reference: &CollaborativeRef) -> Self {
        Self::new(Some(id), method::LOAD_COLLABORATIVE, json!({ "ref": reference }))
    }

    pub fn update_collaborative(id: u64, reference: &CollaborativeRef, update: &[u8]) -> Self {
        Self::new(
            Some(id),
            method::UPDATE_COLLABORATIVE,
            json!({ "ref": reference, "update": update }),
        )
    }

    pub fn ping(id: u64) -> Self {
        Self::new(Some(id), method::PING, Value::Null)
    }

    pub fn call(&self) -> Result<Call, ProtocolError> {
        match self.method.as_str() {
            method::HELLO => Ok(Call::Hello(self.params()?)),
            method::FIND_ALL => Ok(Call::FindAll(self.params()?)),
            method::TX => Ok(Call::Tx(self.params::<TxParams>()?.tx)),
            method::LOAD_COLLABORATIVE => {
                Ok(Call::LoadCollaborative(self.params::<LoadParams>()?.reference))
            }
            method::UPDATE_COLLABORATIVE => {
                let p: UpdateParams = self.params()?;
                Ok(Call::UpdateCollaborative {
                    reference: p.reference,
                    update: p.update,
                })
            }
            method::PING => Ok(Call::Ping),
            other => Err(ProtocolError::UnknownMethod(other.to_string())),
        }
    }

    fn params<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let params = match &self.params {
            Value::Null => json!({}),
            other => other.clone(),
        };
        serde_json::from_value(params).map_err(|source| ProtocolError::InvalidParams {
            method: self.method.clone(),
            source,
        })
    }
}

/// Position of a chunk within a split response. `index` starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: u32,
    #[serde(rename = "final")]
    pub is_final: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_map: Option<Value>,
}

impl Response {
    pub fn ok(id: Option<u64>, result: Value) -> Self {
        Self {
            id,
            result,
            ..Self::default()
        }
    }

    pub fn error(id: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            id,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Broadcast frame carrying committed transactions.
    pub fn transactions(txs: &[Tx]) -> Self {
        Self::ok(None, serde_json::to_value(txs).unwrap_or(Value::Null))
    }

    pub fn is_broadcast(&self) -> bool {
        self.id.is_none()
    }
}

/// Documents returned by `findAll`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindResult {
    pub docs: Vec<Doc>,
    pub total: u64,
    pub lookup_map: BTreeMap<DocId, Doc>,
}

impl FindResult {
    pub fn into_response(self, id: Option<u64>) -> Response {
        Response {
            id,
            result: serde_json::to_value(&self.docs).unwrap_or(Value::Null),
            total: Some(self.total),
            lookup_map: if self.lookup_map.is_empty() {
                None
            } else {
                serde_json::to_value(&self.lookup_map).ok()
            },
            ..Response::default()
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u8,
    payload: Vec<u8>,
}

/// Frame encoding negotiated per session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Codec {
    pub binary: bool,
    pub compression: bool,
}

impl Codec {
    pub fn new(binary: bool, compression: bool) -> Self {
        Self {
            binary,
            compression,
        }
    }

    /// Plain JSON text frames are used unless binary or compression is on.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Message, ProtocolError> {
        if !self.binary && !self.compression {
            let text = serde_json::to_string(value).map_err(ProtocolError::Json)?;
            return Ok(Message::Text(text.into()));
        }
        Ok(Message::Binary(self.encode_bytes(value)?.into()))
    }

    pub fn encode_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        let json = serde_json::to_vec(value).map_err(ProtocolError::Json)?;
        let bytes = if self.binary {
            let envelope = Envelope {
                version: ENVELOPE_VERSION,
                payload: json,
            };
            bincode::serde::encode_to_vec(&envelope, bincode::config::standard())?
        } else {
            json
        };
        if self.compression {
            Ok(lz4_flex::compress_prepend_size(&bytes))
        } else {
            Ok(bytes)
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ProtocolError> {
        let decompressed;
        let mut bytes = bytes;
        if self.compression {
            let (size, block) = lz4_flex::block::uncompressed_size(bytes).map_err(ProtocolError::from_lz4)?;
            if size > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(size));
            }
            decompressed = lz4_flex::block::decompress(block, size).map_err(ProtocolError::from_lz4)?;
            bytes = &decompressed;
        }
        if self.binary {
            let (envelope, _): (Envelope, usize) =
                bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                    .map_err(ProtocolError::from_bincode)?;
            if envelope.version != ENVELOPE_VERSION {
                return Err(ProtocolError::UnsupportedVersion(envelope.version));
            }
            return serde_json::from_slice(&envelope.payload).map_err(ProtocolError::from_json);
        }
        serde_json::from_slice(bytes).map_err(ProtocolError::from_json)
    }

    pub fn decode_request(&self, bytes: &[u8]) -> Result<Request, ProtocolError> {
        self.decode(bytes)
    }

    pub fn decode_response(&self, bytes: &[u8]) -> Result<Response, ProtocolError> {
        self.decode(bytes)
    }

    /// Decode a WebSocket message. Text frames are always plain JSON;
    /// control frames yield `None`.
    pub fn decode_message<T: DeserializeOwned>(
        &self,
        message: &Message,
    ) -> Result<Option<T>, ProtocolError> {
        match message {
            Message::Text(text) => serde_json::from_str(text.as_str())
                .map(Some)
                .map_err(ProtocolError::from_json),
            Message::Binary(bytes) => self.decode(bytes).map(Some),
            _ => Ok(None),
        }
    }
}
