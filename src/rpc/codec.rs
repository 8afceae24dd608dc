//! MessagePack framing
//!
//! A request is a map `{method, params, id}`; a response is whatever map the framework sends
//! back. Frames carry no length prefix, so a response is complete once the buffered bytes
//! decode as one whole value.

use rmpv::Value;
use serde::Serialize;
use std::io::{self, Cursor};

use crate::error::{ReconError, Result};

/// Refuse to buffer more than this while waiting for a frame to complete
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Serialize)]
struct RequestFrame<'a> {
    method: &'a str,
    params: &'a [Value],
    id: &'a str,
}

pub fn encode_request(method: &str, params: &[Value], id: &str) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(&RequestFrame { method, params, id })?)
}

pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value).map_err(|e| ReconError::codec(e.to_string()))?;
    Ok(buf)
}

/// Decode one value from the front of `buf`.
///
/// Returns the value and the number of bytes it used, or `None` when more bytes are needed.
pub fn try_decode_frame(buf: &[u8]) -> Result<Option<(Value, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf);
    match rmpv::decode::read_value(&mut cursor) {
        Ok(value) => Ok(Some((value, cursor.position() as usize))),
        Err(rmpv::decode::Error::InvalidMarkerRead(e) | rmpv::decode::Error::InvalidDataRead(e))
            if e.kind() == io::ErrorKind::UnexpectedEof =>
        {
            if buf.len() > MAX_FRAME_BYTES {
                Err(ReconError::codec(format!("frame exceeds {} bytes", MAX_FRAME_BYTES)))
            } else {
                Ok(None)
            }
        }
        Err(e) => Err(ReconError::codec(e.to_string())),
    }
}

/// Walks MessagePack headers to find where the first value in a growing buffer ends.
///
/// State carries over between calls, so each byte is examined once no matter how many reads
/// it takes for the frame to arrive. The buffer may only grow at the end between calls.
#[derive(Debug, Default)]
pub struct FrameScanner {
    pos: usize,
    /// Elements still owed by each open array or map, innermost last
    pending: Vec<u64>,
    started: bool,
}

impl FrameScanner {
    /// Length of the first complete value, or `None` while more bytes are needed
    pub fn scan(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        loop {
            if self.started && self.pending.is_empty() {
                return Ok(Some(self.pos));
            }
            let Some((header, payload, children)) = element_header(&buf[self.pos.min(buf.len())..])? else {
                return Ok(None);
            };
            let end = self.pos as u64 + header as u64 + payload;
            if end > MAX_FRAME_BYTES as u64 {
                return Err(ReconError::codec(format!("frame exceeds {} bytes", MAX_FRAME_BYTES)));
            }
            if (buf.len() as u64) < end {
                return Ok(None);
            }

            self.pos = end as usize;
            self.started = true;
            if let Some(owed) = self.pending.last_mut() {
                *owed -= 1;
            }
            if children > 0 {
                self.pending.push(children);
            }
            while self.pending.last() == Some(&0) {
                self.pending.pop();
            }
        }
    }
}

/// Header length, payload length and child count of the element starting `rest`
fn element_header(rest: &[u8]) -> Result<Option<(usize, u64, u64)>> {
    let Some(&marker) = rest.first() else {
        return Ok(None);
    };
    let sized = |header: usize| -> Option<u64> {
        let bytes = rest.get(1..header)?;
        Some(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    };

    let (header, payload, children) = match marker {
        0x00..=0x7f | 0xc0 | 0xc2 | 0xc3 | 0xe0..=0xff => (1, 0, 0),
        0x80..=0x8f => (1, 0, 2 * u64::from(marker & 0x0f)),
        0x90..=0x9f => (1, 0, u64::from(marker & 0x0f)),
        0xa0..=0xbf => (1, u64::from(marker & 0x1f), 0),
        0xc1 => return Err(ReconError::codec("reserved marker 0xc1")),
        0xc4 | 0xd9 => match sized(2) {
            Some(len) => (2, len, 0),
            None => return Ok(None),
        },
        0xc5 | 0xda => match sized(3) {
            Some(len) => (3, len, 0),
            None => return Ok(None),
        },
        0xc6 | 0xdb => match sized(5) {
            Some(len) => (5, len, 0),
            None => return Ok(None),
        },
        // ext 8/16/32: length, then one type byte
        0xc7 => match sized(2) {
            Some(len) => (3, len, 0),
            None => return Ok(None),
        },
        0xc8 => match sized(3) {
            Some(len) => (4, len, 0),
            None => return Ok(None),
        },
        0xc9 => match sized(5) {
            Some(len) => (6, len, 0),
            None => return Ok(None),
        },
        0xca => (1, 4, 0),
        0xcb => (1, 8, 0),
        0xcc | 0xd0 => (1, 1, 0),
        0xcd | 0xd1 => (1, 2, 0),
        0xce | 0xd2 => (1, 4, 0),
        0xcf | 0xd3 => (1, 8, 0),
        0xd4 => (2, 1, 0),
        0xd5 => (2, 2, 0),
        0xd6 => (2, 4, 0),
        0xd7 => (2, 8, 0),
        0xd8 => (2, 16, 0),
        0xdc => match sized(3) {
            Some(count) => (3, 0, count),
            None => return Ok(None),
        },
        0xdd => match sized(5) {
            Some(count) => (5, 0, count),
            None => return Ok(None),
        },
        0xde => match sized(3) {
            Some(count) => (3, 0, 2 * count),
            None => return Ok(None),
        },
        0xdf => match sized(5) {
            Some(count) => (5, 0, 2 * count),
            None => return Ok(None),
        },
    };
    if rest.len() < header {
        return Ok(None);
    }
    Ok(Some((header, payload, children)))
}

/// Look up a map entry whose key is `key`, sent either as a string or as raw bytes
pub fn map_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.as_map()?.iter().find_map(|(k, v)| {
        let matches = match k {
            Value::String(s) => s.as_str() == Some(key),
            Value::Binary(b) => b.as_slice() == key.as_bytes(),
            _ => false,
        };
        matches.then_some(v)
    })
}

/// Text content of a string or binary value
pub fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.as_str().map(str::to_string).unwrap_or_else(|| {
            String::from_utf8_lossy(s.as_bytes()).into_owned()
        })),
        Value::Binary(b) => Some(String::from_utf8_lossy(b).into_owned()),
        _ => None,
    }
}

pub fn get_string(value: &Value, key: &str) -> Option<String> {
    map_get(value, key).and_then(value_as_string)
}

pub fn get_bool(value: &Value, key: &str) -> Option<bool> {
    map_get(value, key).and_then(Value::as_bool)
}

/// Message of an error response, `None` for a successful one
pub fn error_message(response: &Value) -> Option<String> {
    let flag = map_get(response, "error")?;
    if matches!(flag, Value::Nil | Value::Boolean(false)) {
        return None;
    }
    Some(
        get_string(response, "error_message")
            .or_else(|| get_string(response, "error_string"))
            .or_else(|| get_string(flag, "message"))
            .or_else(|| get_string(flag, "error_message"))
            .or_else(|| value_as_string(flag))
            .unwrap_or_else(|| "unknown error".to_string()),
    )
}

/// Payload of a successful response.
///
/// An enveloped answer `{id, result}` yields its `result`, as does any response whose `result`
/// is itself a map. Bare answers such as `{result: "success", token}` come back whole.
pub fn unwrap_result(response: Value) -> Value {
    let enveloped = map_get(&response, "result").is_some_and(|result| {
        result.is_map() || map_get(&response, "id").is_some()
    });
    if !enveloped {
        return response;
    }
    match response {
        Value::Map(entries) => entries
            .into_iter()
            .find_map(|(k, v)| (value_as_string(&k).as_deref() == Some("result")).then_some(v))
            .unwrap_or(Value::Nil),
        other => other,
    }
}

/// Build a map value from string keys
pub fn map<I, K>(entries: I) -> Value
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::from(k.into()), v))
            .collect(),
    )
}

/// Convert a decoded value into JSON for the HTTP surface
pub fn to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;
    match value {
        Value::Nil => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::Integer(i) => i
            .as_i64()
            .map(Json::from)
            .or_else(|| i.as_u64().map(Json::from))
            .unwrap_or(Json::Null),
        Value::F32(f) => serde_json::Number::from_f64(f64::from(*f)).map_or(Json::Null, Json::Number),
        Value::F64(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
        Value::String(_) | Value::Binary(_) => value_as_string(value).map_or(Json::Null, Json::String),
        Value::Array(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Map(entries) => Json::Object(
            entries
                .iter()
                .map(|(k, v)| {
                    let key = value_as_string(k).unwrap_or_else(|| k.to_string());
                    (key, to_json(v))
                })
                .collect(),
        ),
        Value::Ext(_, _) => Json::Null,
    }
}

/// Convert JSON request data into a value for an RPC parameter
pub fn from_json(json: &serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match json {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                Value::F64(n.as_f64().unwrap_or_default())
            }
        }
        Json::String(s) => Value::from(s.as_str()),
        Json::Array(items) => Value::Array(items.iter().map(from_json).collect()),
        Json::Object(entries) => map(entries.iter().map(|(k, v)| (k.clone(), from_json(v)))),
    }
}
