//! Control-channel message model.
//!
//! Every object on the control channel is a single JSON object followed by
//! the two-byte separator CR LF. An object is either a request (has `name`)
//! or a response (has `status`); both carry a `rid` correlating them.
//!
//! Framing is intentionally dumb: [`split_frames`] slices a read buffer on
//! the separator and hands the trailing partial chunk back to the caller so
//! it can be pushed into the stream's unrecv buffer. In *single* mode at
//! most one frame is extracted per call; used before registration succeeds,
//! when the remaining bytes may belong to a raw-mode session and must be
//! left untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::SEPARATOR;

/// Session role carried in `register` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Agent,
    Terminal,
    Shell,
    File,
    Forward,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Mode::Agent => "agent",
            Mode::Terminal => "terminal",
            Mode::Shell => "shell",
            Mode::File => "file",
            Mode::Forward => "forward",
        };
        write!(f, "{name}")
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failed,
}

/// A request: `{rid, timeout, name, payload}`.
///
/// `timeout` is in seconds; a negative value marks the request
/// fire-and-forget (the sender never tracks it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub rid: String,
    pub timeout: i64,
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

/// A response: `{rid, status, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub rid: String,
    pub status: Status,
    #[serde(default)]
    pub payload: Value,
}

impl Response {
    /// Build the response to `request` with the given status and payload.
    pub fn to(request: &Request, status: Status, payload: Value) -> Self {
        Self {
            rid: request.rid.clone(),
            status,
            payload,
        }
    }

    /// Build a failed response carrying `{"error": <message>}`.
    pub fn error(request: &Request, message: impl Into<String>) -> Self {
        Self::to(
            request,
            Status::Failed,
            serde_json::json!({ "error": message.into() }),
        )
    }
}

/// Any control-channel object. Discriminated by field presence: requests
/// carry `name`, responses carry `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

/// Serialize a message and append the separator.
pub fn encode(msg: &Message) -> Vec<u8> {
    // Serialization of these types cannot fail: all payloads are Value.
    let mut out = serde_json::to_vec(msg).unwrap_or_default();
    out.extend_from_slice(SEPARATOR);
    out
}

/// Split `buf` into complete frames.
///
/// Returns the frame slices and the index of the first byte that was *not*
/// consumed (the start of the trailing partial frame, which the caller must
/// unrecv). With `single` set, at most one frame is consumed.
pub fn split_frames(buf: &[u8], single: bool) -> (Vec<&[u8]>, usize) {
    let mut frames = Vec::new();
    let mut pos = 0;
    while let Some(idx) = find_separator(&buf[pos..]) {
        frames.push(&buf[pos..pos + idx]);
        pos += idx + SEPARATOR.len();
        if single {
            break;
        }
    }
    (frames, pos)
}

fn find_separator(buf: &[u8]) -> Option<usize> {
    buf.windows(SEPARATOR.len()).position(|w| w == SEPARATOR)
}

/// Parse one frame, or `None` for malformed input (logged and skipped; the
/// stream stays open).
pub fn decode_frame(frame: &[u8]) -> Option<Message> {
    if frame.is_empty() {
        return None;
    }
    match serde_json::from_slice::<Message>(frame) {
        Ok(msg) => Some(msg),
        Err(err) => {
            log::error!("mal-formed control message, ignored: {err}");
            None
        }
    }
}
