//! Actor Behavior
//!
//! The handler contract for hosted actors. A behavior receives each
//! delivered request together with an `ActorContext` carrying the actor's
//! own identity and a send capability back into the container, so an actor
//! can reach other actors without owning its container.
//!
//! Replying is optional and at-most-once: the delivery's reply capability
//! is consumed by the first use, whether a middleware answered at the
//! incoming-request station or the handler answered here.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use colony_types::{ErrorInfo, Request};
use serde_json::Value;

use crate::container::ActorContext;

pub(crate) type ReplyClosure = Arc<dyn Fn(Result<Value, ErrorInfo>) + Send + Sync>;

/// A request delivered to a hosted actor, with its reply capability.
#[derive(Clone)]
pub struct Delivery {
    pub request: Request,
    reply: ReplyClosure,
}

impl Delivery {
    pub(crate) fn new(request: Request, reply: ReplyClosure) -> Self {
        Self { request, reply }
    }

    /// The request payload.
    pub fn content(&self) -> &Value {
        &self.request.content
    }

    /// Whether the sender awaits a response.
    pub fn expects_reply(&self) -> bool {
        self.request.cb
    }

    /// Answer the request. Later replies to the same request are ignored.
    pub fn reply(&self, result: Result<Value, ErrorInfo>) {
        (self.reply.as_ref())(result)
    }

    pub fn reply_ok(&self, content: impl Into<Value>) {
        self.reply(Ok(content.into()))
    }

    pub fn reply_err(&self, err: ErrorInfo) {
        self.reply(Err(err))
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("request", &self.request.id)
            .field("from", &self.request.from)
            .field("to", &self.request.to)
            .finish()
    }
}

/// Message handler of a hosted actor.
///
/// Errors are caught by the container and logged; they never produce a
/// response on their own.
#[async_trait]
pub trait ActorBehavior: Send + Sync + 'static {
    async fn on_message(&self, ctx: ActorContext, delivery: Delivery) -> Result<(), ErrorInfo>;
}

/// Adapter turning a plain closure into a behavior.
pub struct BehaviorFn<F>(pub F);

#[async_trait]
impl<F> ActorBehavior for BehaviorFn<F>
where
    F: Fn(ActorContext, Delivery) -> Result<(), ErrorInfo> + Send + Sync + 'static,
{
    async fn on_message(&self, ctx: ActorContext, delivery: Delivery) -> Result<(), ErrorInfo> {
        (self.0)(ctx, delivery)
    }
}
