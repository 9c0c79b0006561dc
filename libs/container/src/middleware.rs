//! Middleware Pipeline
//!
//! A chain applied at four stations: outgoing request, incoming request,
//! outgoing response, incoming response. Each middleware inspects or
//! mutates the message and decides whether the chain continues; returning
//! `Flow::Halt` without replying drops the message silently, which is the
//! intended policy-enforcement behavior.
//!
//! At the incoming-request and outgoing-response stations a reply slot is
//! available so a middleware can short-circuit by answering the request
//! itself. The slot is a parameter, never a field smuggled onto the
//! message, and it is consumed by the first reply.

use async_trait::async_trait;
use colony_types::{ErrorInfo, MessageKind, Request, Response};
use serde_json::Value;

/// Whether the chain continues past a middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Halt,
}

/// The message passing through the chain.
#[derive(Debug)]
pub enum PipelineMessage {
    Request(Request),
    Response(Response),
}

impl PipelineMessage {
    pub fn as_request(&self) -> Option<&Request> {
        match self {
            PipelineMessage::Request(req) => Some(req),
            PipelineMessage::Response(_) => None,
        }
    }

    pub fn as_request_mut(&mut self) -> Option<&mut Request> {
        match self {
            PipelineMessage::Request(req) => Some(req),
            PipelineMessage::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            PipelineMessage::Request(_) => None,
            PipelineMessage::Response(res) => Some(res),
        }
    }

    pub fn as_response_mut(&mut self) -> Option<&mut Response> {
        match self {
            PipelineMessage::Request(_) => None,
            PipelineMessage::Response(res) => Some(res),
        }
    }
}

type ReplyFn = Box<dyn FnOnce(Result<Value, ErrorInfo>) + Send>;

/// Reply capability exposed to middleware at the ReqIn and ResOut
/// stations. Empty at the other two.
pub struct ReplySlot {
    reply: Option<ReplyFn>,
}

impl ReplySlot {
    /// Slot with no reply capability (ReqOut and ResIn stations).
    pub fn empty() -> Self {
        Self { reply: None }
    }

    pub(crate) fn with(reply: ReplyFn) -> Self {
        Self { reply: Some(reply) }
    }

    /// True when this station allows replying.
    pub fn can_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Answer the request directly, short-circuiting normal dispatch.
    /// Returns false when the station carries no reply capability or the
    /// request was already answered.
    pub fn reply(&mut self, result: Result<Value, ErrorInfo>) -> bool {
        match self.reply.take() {
            Some(reply) => {
                reply(result);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ReplySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplySlot")
            .field("can_reply", &self.can_reply())
            .finish()
    }
}

/// One stage of the message pipeline.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn apply(
        &self,
        kind: MessageKind,
        msg: &mut PipelineMessage,
        reply: &mut ReplySlot,
    ) -> Flow;
}

/// Adapter turning a plain closure into a middleware.
pub struct MiddlewareFn<F>(pub F);

#[async_trait]
impl<F> Middleware for MiddlewareFn<F>
where
    F: Fn(MessageKind, &mut PipelineMessage, &mut ReplySlot) -> Flow + Send + Sync + 'static,
{
    async fn apply(
        &self,
        kind: MessageKind,
        msg: &mut PipelineMessage,
        reply: &mut ReplySlot,
    ) -> Flow {
        (self.0)(kind, msg, reply)
    }
}

/// Run a chain over a message in registration order. Returns the message
/// when every stage continued, `None` when a stage halted.
pub(crate) async fn run_chain(
    chain: &[std::sync::Arc<dyn Middleware>],
    kind: MessageKind,
    mut msg: PipelineMessage,
    reply: &mut ReplySlot,
) -> Option<PipelineMessage> {
    for middleware in chain {
        if middleware.apply(kind, &mut msg, reply).await == Flow::Halt {
            return None;
        }
    }
    Some(msg)
}
