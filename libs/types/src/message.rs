//! Request/Response Message Model
//!
//! JSON-shaped envelopes exchanged between containers. A `Request` carries a
//! correlation id, source and target actor ids, an absolute deadline
//! (`date + timeout`), and whether the sender awaits a response. A
//! `Response` echoes the request id back to the originator.
//!
//! Both envelopes serialize with serde so the same struct is the in-process
//! representation and the wire payload; unknown fields from newer peers are
//! ignored on deserialization.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Validation or internal error.
pub const TECHERR: &str = "TECHERR";
/// The per-request deadline passed before a response arrived.
pub const TIMEOUT: &str = "TIMEOUT";
/// Actor search exhausted without a hit.
pub const NOTFOUND: &str = "NOTFOUND";
/// The peer dropped the request and the deadline has passed.
pub const DROPPED: &str = "DROPPED";

/// Message headers, an open string-keyed map.
pub type Headers = serde_json::Map<String, Value>;

/// Milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Error payload surfaced to callers and carried on response envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Value>,
}

impl ErrorInfo {
    pub fn new(code: &str) -> Self {
        Self {
            code: code.to_string(),
            cause: None,
        }
    }

    pub fn with_cause(code: &str, cause: impl Into<Value>) -> Self {
        Self {
            code: code.to_string(),
            cause: Some(cause.into()),
        }
    }

    pub fn techerr(cause: impl Into<Value>) -> Self {
        Self::with_cause(TECHERR, cause)
    }

    pub fn timeout() -> Self {
        Self::new(TIMEOUT)
    }

    pub fn notfound(aid: &str) -> Self {
        Self::with_cause(NOTFOUND, aid)
    }

    pub fn dropped() -> Self {
        Self::new(DROPPED)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{} ({})", self.code, cause),
            None => f.write_str(&self.code),
        }
    }
}

impl std::error::Error for ErrorInfo {}

/// Middleware station a message is passing through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Outgoing request, before transport dispatch.
    ReqOut,
    /// Incoming request, before handler dispatch.
    ReqIn,
    /// Outgoing response, before transport return.
    ResOut,
    /// Incoming response, before caller completion.
    ResIn,
}

/// A point-to-point request.
///
/// `id` is unique per send attempt. `date + timeout` is the absolute
/// deadline and does not change across drop-retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub headers: Headers,
    /// Send time, ms since epoch.
    pub date: u64,
    /// Time-to-deadline in ms, relative to `date`.
    pub timeout: u64,
    /// Whether the sender awaits a response.
    #[serde(default)]
    pub cb: bool,
}

impl Request {
    /// Absolute deadline in ms since epoch.
    pub fn deadline(&self) -> u64 {
        self.date.saturating_add(self.timeout)
    }

    /// True once the deadline has passed.
    pub fn expired(&self, now: u64) -> bool {
        now >= self.deadline()
    }
}

/// Response to a request; `id` equals the request id and `to` the
/// original `from`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<ErrorInfo>,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub headers: Headers,
    pub date: u64,
}

impl Response {
    /// Response carrying the handler's payload back to the requester.
    pub fn to_request(req: &Request, result: Result<Value, ErrorInfo>) -> Self {
        let (content, err) = match result {
            Ok(content) => (content, None),
            Err(e) => (Value::Null, Some(e)),
        };
        Self {
            id: req.id.clone(),
            from: req.to.clone(),
            to: req.from.clone(),
            err,
            content,
            headers: Headers::new(),
            date: req.date,
        }
    }

    /// Synthetic error response for a request that never completed.
    pub fn synthetic(req: &Request, err: ErrorInfo) -> Self {
        Self {
            id: req.id.clone(),
            from: req.to.clone(),
            to: req.from.clone(),
            err: Some(err),
            content: Value::Null,
            headers: Headers::new(),
            date: req.date,
        }
    }
}

/// Network identity of a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetInfo {
    /// Container id, generated at start.
    pub id: String,
    pub ip: IpAddr,
    pub pid: u32,
    /// Remote transport bind port.
    pub port: u16,
}
