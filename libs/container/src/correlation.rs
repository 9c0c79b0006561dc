//! Request Correlation
//!
//! Typed waiter tables replacing string-keyed event emitters: one-shot
//! response waiters keyed by request id, multi-shot drop waiters keyed by
//! request id (they stay armed across retries), and a pub/sub table of
//! search waiters keyed by the id being searched.
//!
//! A response waiter can be completed exactly once; whichever of the real
//! response or the synthesized timeout arrives first wins, and the entry is
//! gone before the loser looks.

use std::collections::HashMap;

use colony_types::{ActorId, Response};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

/// Correlation state of all in-flight requests.
#[derive(Default)]
pub struct Correlation {
    responses: Mutex<HashMap<String, oneshot::Sender<Response>>>,
    drops: Mutex<HashMap<String, mpsc::UnboundedSender<()>>>,
    found: Mutex<HashMap<String, Vec<oneshot::Sender<ActorId>>>>,
}

impl Correlation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the one-shot response waiter for a request id.
    pub fn await_response(&self, id: &str) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.responses.lock().insert(id.to_string(), tx);
        rx
    }

    /// Complete the response waiter for `response.id`, if still armed.
    /// Returns whether a waiter consumed the response.
    pub fn complete_response(&self, response: Response) -> bool {
        let Some(tx) = self.responses.lock().remove(&response.id) else {
            return false;
        };
        tx.send(response).is_ok()
    }

    /// Arm the multi-shot drop waiter for a request id.
    pub fn arm_drop(&self, id: &str) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.drops.lock().insert(id.to_string(), tx);
        rx
    }

    /// Signal a drop to the request's waiter. Returns whether one was armed.
    pub fn notify_drop(&self, id: &str) -> bool {
        self.drops
            .lock()
            .get(id)
            .is_some_and(|tx| tx.send(()).is_ok())
    }

    /// Release all correlation state held for a request id.
    pub fn release(&self, id: &str) {
        self.responses.lock().remove(id);
        self.drops.lock().remove(id);
    }

    /// Arm a search waiter under the searched id (bare or full).
    pub fn await_found(&self, key: &str) -> oneshot::Receiver<ActorId> {
        let (tx, rx) = oneshot::channel();
        self.found.lock().entry(key.to_string()).or_default().push(tx);
        rx
    }

    /// Fulfil search waiters registered under an exact key.
    pub fn notify_found_key(&self, key: &str, found: &ActorId) {
        let waiters = self.found.lock().remove(key);
        if let Some(waiters) = waiters {
            for tx in waiters {
                let _ = tx.send(found.clone());
            }
        }
    }

    /// Fulfil search waiters that a newly known actor satisfies: those
    /// waiting on its full id and those waiting on its bare id.
    pub fn notify_found_entry(&self, found: &ActorId) {
        self.notify_found_key(&found.to_string(), found);
        if !found.is_bare() {
            self.notify_found_key(found.bare(), found);
        }
    }

    /// Drop search waiters whose receivers went away (abandoned searches).
    pub fn prune_found(&self, key: &str) {
        let mut found = self.found.lock();
        if let Some(waiters) = found.get_mut(key) {
            waiters.retain(|tx| !tx.is_closed());
            if waiters.is_empty() {
                found.remove(key);
            }
        }
    }
}
