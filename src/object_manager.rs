//! The object manager collaborator: inventory-to-request planning, object
//! validation, and storage. Out of scope for this engine; consumed here
//! only through the [`ObjectManager`] trait.

use std::sync::{Arc, Mutex};

use crate::peer::Peer;
use crate::wire::{InvVect, ObjectPayload};

pub trait ObjectManager: Send + Sync {
    /// Called once a peer's handshake completes.
    fn new_peer(&self, peer: &Arc<Peer>);

    /// Called when a peer's dispatcher exits, provided its handshake ever
    /// completed.
    fn done_peer(&self, peer: &Arc<Peer>);

    /// Called with an inbound `Inv`, after its entries have been recorded in
    /// the peer's known-inventory cache. The manager decides what (if
    /// anything) to request back via `Peer::push_getdata`.
    fn queue_inv(&self, inv: &[InvVect], peer: &Arc<Peer>);

    /// Called with a solicited, decoded `Object` payload.
    fn handle_object_msg(&self, payload: ObjectPayload, peer: &Arc<Peer>);
}

/// An in-memory object manager used by tests and the integration harness.
/// It requests every inventory vector it doesn't already know about and
/// stores whatever objects arrive, without attempting any validation.
#[derive(Default)]
pub struct InMemoryObjectManager {
    known: Mutex<std::collections::HashSet<InvVect>>,
}

impl InMemoryObjectManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn knows(&self, hash: &InvVect) -> bool {
        self.known.lock().unwrap().contains(hash)
    }
}

impl ObjectManager for InMemoryObjectManager {
    fn new_peer(&self, peer: &Arc<Peer>) {
        log::info!(target: "peer", "{peer}: registered with object manager");
    }

    fn done_peer(&self, peer: &Arc<Peer>) {
        log::info!(target: "peer", "{peer}: unregistered from object manager");
    }

    fn queue_inv(&self, inv: &[InvVect], peer: &Arc<Peer>) {
        let mut unknown = Vec::new();
        {
            let known = self.known.lock().unwrap();
            for hash in inv {
                if !known.contains(hash) {
                    unknown.push(*hash);
                }
            }
        }
        if !unknown.is_empty() {
            let _ = peer.push_getdata(&unknown);
        }
    }

    fn handle_object_msg(&self, payload: ObjectPayload, _peer: &Arc<Peer>) {
        self.known.lock().unwrap().insert(payload.hash());
    }
}
