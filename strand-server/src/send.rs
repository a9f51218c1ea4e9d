//! Chunked delivery of large results.
//!
//! A multi-item result is split so that each frame holds roughly
//! `chunk_limit` bytes of JSON. Between frames the sender yields to the
//! scheduler, so one large result cannot starve other sessions.

use serde_json::Value;
use std::ops::Range;

use crate::error::ServerError;
use crate::protocol::{ChunkInfo, Codec, ProtocolError, Response};
use crate::session::ConnectionSocket;

/// Default chunk size in bytes of JSON.
pub const DEFAULT_CHUNK_LIMIT: usize = 32 * 1024;

/// Item ranges for `count` items whose JSON array is `json_len` bytes long.
///
/// Every chunk has `round(chunk_limit / avg_item_len) + 1` items, except
/// that a tail shorter than half a chunk is folded into the chunk before it.
pub fn chunk_ranges(json_len: usize, count: usize, chunk_limit: usize) -> Vec<Range<usize>> {
    if count == 0 {
        return Vec::new();
    }
    let avg = ((json_len as f64 / count as f64).round() as usize).max(1);
    let per_chunk = (chunk_limit as f64 / avg as f64).round() as usize + 1;

    let mut ranges = Vec::new();
    let mut start = 0;
    while start < count {
        let remaining = count - start;
        let tail = remaining as i64 - per_chunk as i64;
        let take = if 2 * tail < per_chunk as i64 {
            remaining
        } else {
            per_chunk
        };
        ranges.push(start..start + take);
        start += take;
    }
    ranges
}

/// Send `response`, split into chunks when its result is an array of more
/// than one item and `chunk_limit` is non-zero.
///
/// Only the final chunk carries `total` and `lookupMap`. The send stops
/// quietly as soon as the socket is closed.
pub async fn send_response(
    socket: &dyn ConnectionSocket,
    response: Response,
    chunk_limit: usize,
    codec: Codec,
) -> Result<(), ServerError> {
    let splittable = matches!(&response.result, Value::Array(items) if items.len() > 1) && chunk_limit > 0;
    if !splittable {
        return quiet_on_close(socket.send(codec.encode(&response)?).await);
    }

    let Response {
        id,
        result,
        error,
        total,
        lookup_map,
        ..
    } = response;
    let json_len = serde_json::to_vec(&result).map_err(ProtocolError::Json)?.len();
    let Value::Array(mut items) = result else {
        return Ok(());
    };

    let ranges = chunk_ranges(json_len, items.len(), chunk_limit);
    let chunks = ranges.len();
    let mut lookup_map = lookup_map;
    for (i, range) in ranges.into_iter().enumerate() {
        if socket.is_closed() {
            log::debug!("Socket closed, dropping {} remaining chunks", chunks - i);
            return Ok(());
        }
        let is_final = i + 1 == chunks;
        let part: Vec<Value> = items.drain(..range.len()).collect();
        let frame = Response {
            id,
            result: Value::Array(part),
            error: error.clone(),
            chunk: Some(ChunkInfo {
                index: i as u32 + 1,
                is_final,
            }),
            total: is_final.then(|| total.unwrap_or(0)),
            lookup_map: if is_final { lookup_map.take() } else { None },
        };
        quiet_on_close(socket.send(codec.encode(&frame)?).await)?;
        if !is_final {
            tokio::task::yield_now().await;
        }
    }
    Ok(())
}

fn quiet_on_close(result: Result<(), ServerError>) -> Result<(), ServerError> {
    match result {
        Err(ServerError::Closed) => Ok(()),
        other => other,
    }
}
