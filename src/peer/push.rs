//! Protocol helpers that build and enqueue outbound messages: `Version`,
//! `Addr`, `Inv`, `GetData`, and `Object`. `VerAck` is simple enough that the
//! dispatcher enqueues it directly rather than routing it through here.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel as chan;

use crate::config::{MAX_ADDR_PER_MSG, MAX_INV_PER_MSG};
use crate::wire::{self, Hash, InvVect, Message, NetAddress};

use super::{done_pair, DoneSignal, Error, Peer};

impl Peer {
    /// Builds our `Version`, advertising the best local address for the
    /// peer's `net_address`, our nonce, and the default stream list.
    fn version_message(self: &Arc<Self>) -> Message {
        let na = self.net_address().unwrap_or_default();
        let addr_from = self
            .address_manager
            .best_local_address(&na)
            .unwrap_or_default();

        Message::Version {
            protocol_version: wire::PROTOCOL_VERSION,
            services: wire::NODE_NETWORK,
            timestamp: localtime::LocalTime::now().as_secs() as i64,
            addr_recv: na,
            addr_from,
            nonce: self.server_nonce,
            user_agent: user_agent(),
            streams: vec![1],
        }
    }

    /// Builds and enqueues our `Version` through the multiplexer. Used by
    /// the dispatcher to answer an inbound `Version` with our own; enqueued
    /// with no done-signal. Marks `version_sent`.
    pub(super) fn push_version(self: &Arc<Self>) -> Result<(), Error> {
        let message = self.version_message();
        self.queue_message(message, None);
        self.handshake.lock().unwrap().version_sent = true;
        Ok(())
    }

    /// Writes our `Version` straight to the transport, bypassing the
    /// multiplexer and writer threads entirely. Used only by `start` for
    /// outbound peers, before those threads exist, so that a failure to
    /// write the very first message can fail `start` itself rather than be
    /// silently swallowed by a queue.
    pub(super) fn send_initial_version(self: &Arc<Self>) -> Result<(), Error> {
        let message = self.version_message();
        let n = wire::serialize(&message).len();
        self.transport.write_message(&message)?;
        self.record_bytes_out(n);
        self.handshake.lock().unwrap().version_sent = true;
        Ok(())
    }

    /// Requests objects by hash, partitioned into runs of at most
    /// `MAX_INV_PER_MSG`. Skips hashes already outstanding in
    /// `requested_objects` and hashes this peer hasn't advertised having (not
    /// present in `known_inventory`). Accepted hashes are recorded with the
    /// current time before the `GetData` is sent.
    pub fn push_getdata(self: &Arc<Self>, hashes: &[InvVect]) -> Result<(), Error> {
        let accepted = {
            let mut requested = self.requested_objects.lock().unwrap();
            let known = self.known_inventory.lock().unwrap();
            let now = Instant::now();

            let mut accepted = Vec::with_capacity(hashes.len());
            for hash in hashes {
                if requested.contains_key(hash) || !known.contains(hash) {
                    continue;
                }
                requested.insert(*hash, now);
                accepted.push(*hash);
            }
            accepted
        };

        for run in accepted.chunks(MAX_INV_PER_MSG) {
            self.queue_message(Message::GetData(run.to_vec()), None);
        }
        Ok(())
    }

    /// Announces inventory, truncated to `MAX_INV_PER_MSG` entries. A no-op
    /// if there's nothing left to announce after truncation.
    pub fn push_inv(self: &Arc<Self>, hashes: &[InvVect]) -> Result<(), Error> {
        let truncated: Vec<InvVect> = hashes.iter().take(MAX_INV_PER_MSG).copied().collect();
        if truncated.is_empty() {
            return Ok(());
        }
        self.queue_message(Message::Inv(truncated), None);
        Ok(())
    }

    /// Fetches `hash` from the object store and enqueues the resulting
    /// `Object` message. `wait_on`, when given, is a predecessor's
    /// done-channel: we block on it before touching the store, so that a run
    /// of sends pipelines one send deep instead of racing the store and the
    /// transport against each other. If `hash` matches `continue_hash`, the
    /// done-signal fires immediately (the caller is about to send an `Inv`
    /// and doesn't need to wait on this particular write).
    pub fn push_object(
        self: &Arc<Self>,
        hash: &Hash,
        done: Option<DoneSignal>,
        wait_on: Option<chan::Receiver<()>>,
    ) -> Result<(), Error> {
        if let Some(wait_on) = wait_on {
            let _ = wait_on.recv();
        }

        let payload = match self.object_store.fetch_object_by_hash(hash) {
            Ok(payload) => payload,
            Err(err) => {
                let mut continue_hash = self.continue_hash.lock().unwrap();
                if *continue_hash == Some(*hash) {
                    *continue_hash = None;
                }
                drop(continue_hash);
                if let Some(done) = done {
                    done.fire();
                }
                return Err(Error::from(err));
            }
        };

        let done = {
            let mut continue_hash = self.continue_hash.lock().unwrap();
            if *continue_hash == Some(*hash) {
                *continue_hash = None;
                if let Some(done) = done {
                    done.fire();
                }
                None
            } else {
                done
            }
        };

        self.queue_message(Message::Object(payload), done);
        Ok(())
    }

    /// A version of [`Peer::push_object`] that hands back the receiver half
    /// of a fresh done-pair, for callers pipelining a run of sends.
    pub(super) fn push_object_pipelined(
        self: &Arc<Self>,
        hash: &Hash,
        wait_on: Option<chan::Receiver<()>>,
    ) -> (Result<(), Error>, chan::Receiver<()>) {
        let (done, rx) = done_pair();
        let result = self.push_object(hash, Some(done), wait_on);
        (result, rx)
    }

    /// Adds candidate addresses not already known to this peer to a single
    /// `Addr` message, using reservoir sampling once the message is full so
    /// that a long candidate list doesn't bias toward its head. A no-op if
    /// every candidate is already known.
    pub fn push_addr(self: &Arc<Self>, candidates: &[NetAddress]) -> Result<(), Error> {
        let mut known = self.known_addresses.lock().unwrap();
        let mut chosen: Vec<NetAddress> = Vec::new();
        let mut seen = 0usize;

        for addr in candidates {
            let key = addr.key();
            if known.contains(&key) {
                continue;
            }
            if chosen.len() < MAX_ADDR_PER_MSG {
                chosen.push(*addr);
            } else {
                let i = MAX_ADDR_PER_MSG + seen;
                let j = fastrand::usize(..=i);
                if j < MAX_ADDR_PER_MSG {
                    chosen[j] = *addr;
                }
                seen += 1;
            }
        }

        if chosen.is_empty() {
            return Ok(());
        }

        for addr in &chosen {
            known.insert(addr.key());
        }
        drop(known);

        self.queue_message(Message::Addr(chosen), None);
        Ok(())
    }
}

/// The `user-agent` string advertised in our `Version`: `"bmd"` plus the
/// crate's own version, matching the reference convention of naming the
/// node software and release in the handshake.
fn user_agent() -> String {
    format!("/bmd:{}/", env!("CARGO_PKG_VERSION"))
}
