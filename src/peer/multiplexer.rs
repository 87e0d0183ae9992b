//! The multiplexer: merges the controller-facing `queue_message` and
//! `queue_inventory` streams into the single hand-off slot the writer reads
//! from, and turns queued inventory hints into periodic trickled `Inv`
//! messages instead of one message per hint.

use std::sync::Arc;

use crossbeam_channel as chan;

use crate::wire::{InvVect, Message};

use super::{OutMessage, Peer};

pub(super) fn run(peer: Arc<Peer>, slot_tx: chan::Sender<OutMessage>) {
    let ticker = chan::tick(peer.config.trickle_interval);
    let mut pending_inv: Vec<InvVect> = Vec::new();

    loop {
        chan::select! {
            recv(peer.out_rx) -> out => match out {
                Ok(out) => {
                    if slot_tx.send(out).is_err() {
                        return;
                    }
                }
                Err(_) => break,
            },
            recv(peer.inv_rx) -> inv => match inv {
                Ok(inv) => {
                    if !pending_inv.contains(&inv) {
                        pending_inv.push(inv);
                        if pending_inv.len() >= peer.config.max_inv_trickle_size {
                            flush(&peer, &slot_tx, &mut pending_inv);
                        }
                    }
                }
                Err(_) => {}
            },
            recv(ticker) -> _ => {
                flush(&peer, &slot_tx, &mut pending_inv);
            },
            recv(peer.quit_multiplexer.1) -> _ => break,
        }
    }

    // Shutting down: flush whatever's pending, then drain anything already
    // queued on `out_rx` without blocking, firing done-signals for whatever
    // the writer can't take before we give up and drop `slot_tx`.
    flush(&peer, &slot_tx, &mut pending_inv);
    while let Ok(out) = peer.out_rx.try_recv() {
        if slot_tx.send(out).is_err() {
            break;
        }
    }
}

/// Drains `pending`, skipping any vector a concurrent caller has already
/// inserted into `known_inventory` and inserting every vector this flush
/// does emit, then hands the resulting `Inv` (capped at
/// `max_inv_trickle_size`) to the writer directly. Built by hand rather than
/// through [`Peer::push_inv`], which enqueues onto `out_rx` — the channel
/// this very loop is draining, so routing through it here would deadlock
/// against ourselves.
fn flush(peer: &Arc<Peer>, slot_tx: &chan::Sender<OutMessage>, pending: &mut Vec<InvVect>) {
    if pending.is_empty() {
        return;
    }
    let drained: Vec<InvVect> = pending.drain(..).collect();
    let batch: Vec<InvVect> = {
        let mut known = peer.known_inventory.lock().unwrap();
        let mut batch = Vec::new();
        for inv in drained {
            if batch.len() >= peer.config.max_inv_trickle_size {
                break;
            }
            if known.contains(&inv) {
                continue;
            }
            known.insert(inv);
            batch.push(inv);
        }
        batch
    };
    if batch.is_empty() {
        return;
    }
    let _ = slot_tx.send(OutMessage::new(Message::Inv(batch)));
}
