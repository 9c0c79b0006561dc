//! Colony Actor Container
//!
//! A process-local runtime hosting named message handlers ("actors") and
//! routing point-to-point requests between them, whether the peer actor
//! lives in this process, in another container on this host, or on a
//! remote host found over discovery.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────┐     ┌──────────────────────────┐
//! │         Container           │     │       colony-network     │
//! │                             │     │                          │
//! │  registry ── correlation    │     │  remote (framed TCP)     │
//! │      │            │         │◀────│  discovery (multicast)   │
//! │  middleware   send/call     │     │                          │
//! │      │            │         │     └──────────────────────────┘
//! │  inproc transport           │
//! └─────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use colony_container::{BehaviorFn, Container, Delivery, SendOptions};
//! use colony_types::StartOptions;
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), colony_types::ErrorInfo> {
//! let container = Container::new();
//! container.add_actor("pong", BehaviorFn(|_ctx, delivery: Delivery| {
//!     delivery.reply_ok("pong");
//!     Ok(())
//! }))?;
//! container.start(StartOptions::default()).await?;
//!
//! let res = container
//!     .call("ping", "pong", json!("ping"), SendOptions::default())
//!     .await?;
//! assert_eq!(res.content, json!("pong"));
//! # Ok(())
//! # }
//! ```

pub mod behavior;
pub mod container;
pub mod correlation;
pub mod inproc;
pub mod metrics;
pub mod middleware;
pub mod registry;

pub use behavior::{ActorBehavior, BehaviorFn, Delivery};
pub use container::{
    ActorContext, Container, SendOptions, PROP_DEFAULT_SEND_TIMEOUT, PROP_DISCOVERY_ADDRS,
    PROP_MAX_SEND_TIMEOUT, PROP_RESEARCH_TIMEOUT, PROP_RETRY_DELAY,
};
pub use metrics::ContainerStats;
pub use middleware::{Flow, Middleware, MiddlewareFn, PipelineMessage, ReplySlot};
pub use registry::{ActorEntry, ContainerEvent, Registry, Scope};

// The shared vocabulary is re-exported so most users only need this crate.
pub use colony_types::{
    ActorId, ErrorInfo, Headers, MessageKind, NetInfo, Request, Response, StartOptions,
};
