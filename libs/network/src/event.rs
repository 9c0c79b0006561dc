//! Transport Event Surface
//!
//! The single contract both transports expose to the container loop:
//! an incoming request (with a reply capability), an incoming response for
//! a request this container sent, or a drop notice for an outgoing request
//! that could not be delivered.
//!
//! A `Responder` is consumed by `reply`, so a request is answered at most
//! once no matter how many layers saw it.

use colony_types::{Request, Response};
use tokio::sync::mpsc;
use tracing::warn;

use crate::frame::Frame;

/// Sender half used by transports to push events into the container loop.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// What a transport tells the container.
#[derive(Debug)]
pub enum TransportEvent {
    /// A request arrived for an actor hosted here.
    Request {
        request: Request,
        responder: Responder,
    },
    /// A response arrived for a request this container sent.
    Response(Response),
    /// An outgoing request could not be delivered; the router may retry.
    Dropped(Request),
}

/// One-shot reply capability attached to an incoming request.
#[derive(Debug)]
pub struct Responder {
    route: ReplyRoute,
}

#[derive(Debug)]
enum ReplyRoute {
    /// The request came from this very container; the response re-enters
    /// the container loop directly.
    Loop(EventSender),
    /// The request came over a peer connection; the response goes back as
    /// a frame on that connection.
    Connection(mpsc::UnboundedSender<Frame>),
}

impl Responder {
    /// Responder for in-process requests.
    pub fn for_loop(events: EventSender) -> Self {
        Self {
            route: ReplyRoute::Loop(events),
        }
    }

    /// Responder bound to a peer connection's writer.
    pub(crate) fn for_connection(writer: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            route: ReplyRoute::Connection(writer),
        }
    }

    /// Deliver the response back to the request's origin. Consumes the
    /// responder.
    pub fn reply(self, response: Response) {
        match self.route {
            ReplyRoute::Loop(events) => {
                if events.send(TransportEvent::Response(response)).is_err() {
                    warn!("container loop gone, in-process response discarded");
                }
            }
            ReplyRoute::Connection(writer) => {
                let id = response.id.clone();
                if writer.send(Frame::Res { response }).is_err() {
                    warn!(request_id = %id, "peer connection gone, response discarded");
                }
            }
        }
    }
}
