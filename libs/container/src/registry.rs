//! Actor Registry
//!
//! Three-scope table of every actor this container knows about: PROCESS
//! actors are hosted here, LOCAL actors live in another container on this
//! host, REMOTE actors on another host. Discovery populates the non-PROCESS
//! scopes; `add_actor` populates PROCESS.
//!
//! Changes are broadcast as `ContainerEvent`s; any number of subscribers
//! may listen.

use std::collections::HashMap;
use std::fmt;

use colony_types::{ActorId, NetInfo};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::behavior::Delivery;
use crate::container::ActorContext;

/// Mailbox of a hosted actor; deliveries through it stay in order and are
/// consumed one at a time by the actor's task.
pub type Mailbox = mpsc::UnboundedSender<(ActorContext, Delivery)>;

/// Where an actor lives relative to this container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Hosted by this container.
    Process,
    /// Another container on this host.
    Local,
    /// A container on another host.
    Remote,
}

impl Scope {
    /// Lookup preference when no scope is given.
    pub const PREFERENCE: [Scope; 3] = [Scope::Process, Scope::Local, Scope::Remote];

    fn index(self) -> usize {
        match self {
            Scope::Process => 0,
            Scope::Local => 1,
            Scope::Remote => 2,
        }
    }
}

/// Registry change notifications emitted from the container facade.
#[derive(Debug, Clone)]
pub enum ContainerEvent {
    ActorAdded { aid: String, scope: Scope },
    ActorRemoved { aid: String },
}

/// One known actor.
#[derive(Clone)]
pub struct ActorEntry {
    pub id: ActorId,
    /// Identity of the container hosting the actor.
    pub container: NetInfo,
    pub scope: Scope,
    /// Present only for PROCESS actors.
    pub mailbox: Option<Mailbox>,
}

impl fmt::Debug for ActorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorEntry")
            .field("id", &self.id.to_string())
            .field("container", &self.container.id)
            .field("scope", &self.scope)
            .field("hosted", &self.mailbox.is_some())
            .finish()
    }
}

/// Scope-partitioned actor table with round-robin bare-group picking.
pub struct Registry {
    scopes: RwLock<[HashMap<String, ActorEntry>; 3]>,
    /// Round-robin cursor per bare group.
    cursors: Mutex<HashMap<String, usize>>,
    events: broadcast::Sender<ContainerEvent>,
}

impl Registry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            scopes: RwLock::new(Default::default()),
            cursors: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to registry change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.events.subscribe()
    }

    /// Insert an actor, replacing any entry with the identical full id in
    /// the same scope. Emits `ActorAdded` once per call.
    pub fn add(&self, entry: ActorEntry) {
        let aid = entry.id.to_string();
        let scope = entry.scope;
        {
            let mut scopes = self.scopes.write();
            let replaced = scopes[scope.index()].insert(aid.clone(), entry);
            if replaced.is_some() {
                debug!(aid = %aid, ?scope, "replaced existing registry entry");
            }
        }
        let _ = self.events.send(ContainerEvent::ActorAdded { aid, scope });
    }

    /// Remove an actor from a scope. Idempotent; emits `ActorRemoved` only
    /// when an entry actually went away.
    pub fn remove(&self, aid: &ActorId, scope: Scope) -> Option<ActorEntry> {
        let key = aid.to_string();
        let removed = self.scopes.write()[scope.index()].remove(&key);
        if removed.is_some() {
            let _ = self.events.send(ContainerEvent::ActorRemoved { aid: key });
        }
        removed
    }

    /// Remove every entry owned by a departed container. Only non-PROCESS
    /// scopes can hold foreign entries.
    pub fn remove_container(&self, container_id: &str) {
        let mut removed_ids = Vec::new();
        {
            let mut scopes = self.scopes.write();
            for scope in [Scope::Local, Scope::Remote] {
                scopes[scope.index()].retain(|aid, entry| {
                    if entry.container.id == container_id {
                        removed_ids.push(aid.clone());
                        false
                    } else {
                        true
                    }
                });
            }
        }
        for aid in removed_ids {
            let _ = self.events.send(ContainerEvent::ActorRemoved { aid });
        }
    }

    /// Exact full-id lookup. With no scope, PROCESS is preferred, then
    /// LOCAL, then REMOTE.
    pub fn get(&self, aid: &ActorId, scope: Option<Scope>) -> Option<ActorEntry> {
        let key = aid.to_string();
        let scopes = self.scopes.read();
        match scope {
            Some(s) => scopes[s.index()].get(&key).cloned(),
            None => Scope::PREFERENCE
                .iter()
                .find_map(|s| scopes[s.index()].get(&key).cloned()),
        }
    }

    /// Resolve an id to a concrete known actor id.
    ///
    /// An exact id resolves to itself if any scope knows it. A bare id
    /// resolves round-robin within its bare group, scanning scopes in
    /// PROCESS, LOCAL, REMOTE order and rotating inside the first scope
    /// that has members; members are visited in sorted id order so the
    /// rotation is deterministic.
    pub fn pick(&self, aid: &ActorId) -> Option<ActorId> {
        let scopes = self.scopes.read();

        if !aid.is_bare() {
            let key = aid.to_string();
            return Scope::PREFERENCE
                .iter()
                .any(|s| scopes[s.index()].contains_key(&key))
                .then(|| aid.clone());
        }

        for scope in Scope::PREFERENCE {
            let mut members: Vec<&ActorId> = scopes[scope.index()]
                .values()
                .filter(|e| e.id.bare() == aid.bare())
                .map(|e| &e.id)
                .collect();
            if members.is_empty() {
                continue;
            }
            members.sort();

            let mut cursors = self.cursors.lock();
            let cursor = cursors.entry(aid.bare().to_string()).or_insert(0);
            let picked = members[*cursor % members.len()].clone();
            *cursor = cursor.wrapping_add(1);
            return Some(picked);
        }
        None
    }

    /// Resolve an incoming request target against hosted actors only.
    pub fn resolve_process(&self, aid: &ActorId) -> Option<ActorEntry> {
        if let Some(entry) = self.get(aid, Some(Scope::Process)) {
            return Some(entry);
        }
        if !aid.is_bare() {
            return None;
        }
        let scopes = self.scopes.read();
        let mut members: Vec<&ActorEntry> = scopes[Scope::Process.index()]
            .values()
            .filter(|e| e.id.bare() == aid.bare())
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members.first().map(|e| (*e).clone())
    }

    /// Answer a discovery search: the full id of a hosted actor matching
    /// `aid` (exact or bare), if any.
    pub fn hosted_answer(&self, aid: &str) -> Option<String> {
        let aid = ActorId::parse(aid).ok()?;
        self.resolve_process(&aid).map(|e| e.id.to_string())
    }

    /// Bare ids of all hosted actors, for discovery announcements.
    pub fn hosted_bare_ids(&self) -> Vec<String> {
        let scopes = self.scopes.read();
        let mut bares: Vec<String> = scopes[Scope::Process.index()]
            .values()
            .map(|e| e.id.bare().to_string())
            .collect();
        bares.sort();
        bares.dedup();
        bares
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
