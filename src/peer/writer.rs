//! The writer: the single activity allowed to write to the transport. Reads
//! one [`OutMessage`] at a time from the hand-off slot the multiplexer
//! feeds, writes it, and fires its done-signal. Terminates naturally once
//! the multiplexer drops its end of the slot channel — no separate quit
//! signal is needed.

use std::sync::Arc;

use crossbeam_channel as chan;

use crate::wire;

use super::{OutMessage, Peer};

pub(super) fn run(peer: Arc<Peer>, slot_rx: chan::Receiver<OutMessage>) {
    loop {
        let out = match slot_rx.recv() {
            Ok(out) => out,
            Err(_) => return,
        };

        let n = wire::serialize(&out.message).len();
        match peer.transport.write_message(&out.message) {
            Ok(()) => peer.record_bytes_out(n),
            Err(err) => {
                log::warn!(target: "peer::writer", "{peer}: write failed: {err}");
                peer.disconnect();
            }
        }

        out.fire_done();
    }
}
