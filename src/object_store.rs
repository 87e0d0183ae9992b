//! The object store collaborator: hash-to-bytes lookup and random inventory
//! sampling, used to answer `GetData` and to seed the bootstrap `Inv` sent
//! on handshake completion.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::wire::{object_hash, Hash, ObjectPayload};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("object not found")]
    NotFound,
}

pub trait ObjectStore: Send + Sync {
    fn fetch_object_by_hash(&self, hash: &Hash) -> Result<ObjectPayload, Error>;

    /// Samples up to `n` hashes at random, excluding any for which `filter`
    /// returns `true` (typically "already in the peer's known-inventory
    /// cache").
    fn fetch_random_inv_hashes(&self, n: usize, filter: &dyn Fn(&Hash) -> bool) -> Vec<Hash>;
}

/// An in-memory object store, used by tests and the integration harness.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<Hash, ObjectPayload>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, payload: ObjectPayload) -> Hash {
        let hash = payload.hash();
        self.objects.lock().unwrap().insert(hash, payload);
        hash
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn fetch_object_by_hash(&self, hash: &Hash) -> Result<ObjectPayload, Error> {
        self.objects
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn fetch_random_inv_hashes(&self, n: usize, filter: &dyn Fn(&Hash) -> bool) -> Vec<Hash> {
        let objects = self.objects.lock().unwrap();
        let mut candidates: Vec<Hash> = objects.keys().filter(|h| !filter(h)).copied().collect();

        // Fisher-Yates partial shuffle: enough randomness for sampling
        // without pulling in a shuffle helper for a handful of entries.
        let len = candidates.len();
        let take = n.min(len);
        for i in 0..take {
            let j = i + fastrand::usize(..len - i);
            candidates.swap(i, j);
        }
        candidates.truncate(take);
        candidates
    }
}

/// Computes the hash the store would use to key `payload`, for callers that
/// need it before insertion.
pub fn hash_of(payload: &ObjectPayload) -> Hash {
    object_hash(&crate::wire::serialize(payload))
}
