//! Colony Network Layer
//!
//! Everything that crosses a process boundary: the framed TCP transport that
//! carries requests and responses between containers, and the UDP multicast
//! discovery protocol that answers "who hosts actor X?".
//!
//! Both transports surface the same event contract (`TransportEvent`):
//! incoming request with a reply capability, incoming response, and
//! outgoing-request-dropped. The container crate owns the receiving end and
//! drives routing off it; nothing in this crate touches registry or
//! correlation state directly.

pub mod discovery;
pub mod error;
pub mod event;
pub mod frame;
pub mod ip;
pub mod remote;

pub use discovery::{Discovery, DiscoveryEvent, DiscoveryMessage, HostedLookup};
pub use error::{Result, TransportError};
pub use event::{EventSender, Responder, TransportEvent};
pub use frame::Frame;
pub use ip::resolve_local_ip;
pub use remote::RemoteTransport;

/// Frame size cap for the remote transport.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024; // 16MB

/// Datagram size cap for discovery messages.
pub const MAX_DATAGRAM_BYTES: usize = 60 * 1024;

/// Timeout applied to outbound peer connects.
pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default discovery rendezvous.
pub const DEFAULT_DISCOVERY_ADDR: &str = "224.0.0.1";
pub const DEFAULT_DISCOVERY_PORT: u16 = 5555;
