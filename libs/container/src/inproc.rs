//! In-Process Transport
//!
//! Direct dispatch between actors hosted by the same container. A send is
//! deferred one scheduling tick and re-enters the container loop as an
//! incoming request whose responder loops the response straight back.
//! This transport never drops.

use colony_network::{EventSender, Responder, TransportEvent};
use colony_types::Request;
use tracing::warn;

/// Loopback peer of the remote transport, same event surface.
pub struct InprocTransport {
    events: EventSender,
}

impl InprocTransport {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }

    /// Dispatch a request to a hosted actor.
    ///
    /// The event channel is the deferral: the container loop picks the
    /// request up after the current task yields, never reentrantly, and
    /// requests from one sender keep their order.
    pub fn send(&self, request: Request) {
        let responder = Responder::for_loop(self.events.clone());
        let event = TransportEvent::Request { request, responder };
        if self.events.send(event).is_err() {
            warn!("container loop gone, in-process request discarded");
        }
    }
}
