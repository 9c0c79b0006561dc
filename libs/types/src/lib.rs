//! Core Types for the Colony Actor Container
//!
//! Shared vocabulary of the colony runtime: actor identifiers, the
//! request/response message model, container network identity, and the
//! wire-shape validation applied at the container boundary.
//!
//! Everything here is plain data. Routing, transports and the container
//! facade live in `colony-network` and `colony-container`; both speak in
//! terms of these types.

pub mod actor_id;
pub mod message;
pub mod validation;

pub use actor_id::{ActorId, AidError};
pub use message::{
    now_ms, ErrorInfo, Headers, MessageKind, NetInfo, Request, Response, DROPPED, NOTFOUND,
    TECHERR, TIMEOUT,
};
pub use validation::{validate_request, StartOptions, StatsToggle, ValidationError};

/// Default per-request timeout when the sender awaits a response.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 30_000;

/// Upper bound used for fire-and-forget requests that carry no timeout.
pub const MAX_SEND_TIMEOUT_MS: u64 = 60_000;

/// Delay before re-submitting a request after a transport drop.
pub const RETRY_DELAY_MS: u64 = 10;

/// How long an actor search may run before it is abandoned with NOTFOUND.
pub const RESEARCH_TIMEOUT_MS: u64 = 5_000;
