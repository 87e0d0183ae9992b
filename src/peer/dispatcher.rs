//! The dispatcher: owns the transport's read side, drives the handshake
//! state machine, and dispatches steady-state messages once the handshake
//! has completed. Runs until the transport closes or a protocol violation
//! disconnects the peer, then winds the other two activities down and
//! reports the peer done.

use std::sync::Arc;

use crossbeam_channel as chan;

use crate::address_manager::AddressSource;
use crate::config::MAX_INV_PER_MSG;
use crate::wire::{self, InvVect, Message, NetAddress, ObjectPayload};

use super::watchdog::Watchdog;
use super::{Error, Peer};

pub(super) fn run(peer: Arc<Peer>) {
    let watchdog = Watchdog::spawn(Arc::clone(&peer), peer.negotiate_or_idle_timeout());

    loop {
        let message = match peer.transport.read_message() {
            Ok(message) => message,
            Err(err) => {
                log::debug!(target: "peer::dispatcher", "{peer}: read failed: {err}");
                break;
            }
        };
        peer.record_bytes_in(wire::serialize(&message).len());

        if let Err(err) = dispatch(&peer, message) {
            log::warn!(target: "peer::dispatcher", "{peer}: {err}");
            peer.disconnect();
            break;
        }
        if peer.is_disconnected() {
            break;
        }
        watchdog.reset(peer.negotiate_or_idle_timeout());
    }

    watchdog.shutdown();
    peer.disconnect();
    if peer.handshake_state().handshake_complete {
        peer.object_manager.done_peer(&peer);
    }
    peer.report_done();
}

fn dispatch(peer: &Arc<Peer>, message: Message) -> Result<(), Error> {
    match message {
        Message::Version {
            protocol_version,
            services,
            addr_from,
            nonce,
            user_agent,
            streams,
            ..
        } => handle_version(
            peer,
            protocol_version,
            services,
            addr_from,
            nonce,
            user_agent,
            streams,
        ),
        Message::VerAck => handle_verack(peer),
        other => {
            if !peer.handshake_state().handshake_complete {
                return Err(Error::HandshakeNotComplete);
            }
            match other {
                Message::Addr(addrs) => handle_addr(peer, addrs),
                Message::Inv(invs) => handle_inv(peer, invs),
                Message::GetData(hashes) => handle_getdata(peer, hashes),
                Message::Object(payload) => handle_object(peer, payload),
                Message::Version { .. } | Message::VerAck => unreachable!(),
            }
        }
    }
}

/// Completes the version half of the handshake. A second `Version` is
/// rejected outright; a nonce matching our own reveals a self-connection.
/// Inbound peers have their `net_address` synthesized here from the
/// transport's observed remote address and the first stream the peer
/// advertised, since nothing upstream of the handshake ever supplies one.
/// Once both sides of the handshake have been observed, registers with the
/// object manager and sends the bootstrap `Addr`/`Inv`.
fn handle_version(
    peer: &Arc<Peer>,
    protocol_version: u32,
    services: u64,
    addr_from: NetAddress,
    nonce: u64,
    user_agent: String,
    streams: Vec<u32>,
) -> Result<(), Error> {
    {
        let handshake = peer.handshake.lock().unwrap();
        if handshake.version_known {
            return Err(Error::DuplicateVersion);
        }
    }
    if nonce == peer.server_nonce {
        return Err(Error::SelfConnection(nonce));
    }

    {
        let mut stats = peer.stats.lock().unwrap();
        stats.protocol_version = protocol_version;
        stats.services = services;
        stats.user_agent = user_agent;
    }

    if peer.direction == super::Direction::Inbound {
        let stream = *streams.first().ok_or(Error::NoStreams)?;
        let remote = peer.transport.remote_addr();
        let observed = peer
            .address_manager
            .host_to_net_address(remote.ip(), remote.port(), stream, services);
        *peer.net_address.lock().unwrap() = Some(observed);
    }

    let version_sent = {
        let mut handshake = peer.handshake.lock().unwrap();
        handshake.version_known = true;
        if handshake.verack_received {
            handshake.handshake_complete = true;
        }
        handshake.version_sent
    };

    if !version_sent {
        peer.push_version()?;
    }
    peer.queue_message(Message::VerAck, None);

    update_address_on_version(peer, addr_from);

    complete_handshake_if_ready(peer)
}

/// Spec step 6, "Address update": outbound peers vouch for the address they
/// dialed by announcing our own best local address to it (if routable) and
/// marking it good; inbound peers are only trusted to self-report their own
/// listening address when it matches what we actually observed the
/// connection originate from.
fn update_address_on_version(peer: &Arc<Peer>, addr_from: NetAddress) {
    match peer.direction {
        super::Direction::Outbound => {
            if let Some(na) = peer.net_address() {
                if let Some(local) = peer.address_manager.best_local_address(&na) {
                    if peer.address_manager.is_routable(&local) {
                        let _ = peer.push_addr(&[local]);
                    }
                }
                peer.address_manager.good(&na);
            }
        }
        super::Direction::Inbound => {
            if let Some(observed) = peer.net_address() {
                if addr_from.key() == observed.key() {
                    peer.address_manager
                        .add_address(addr_from, AddressSource::SelfReported);
                    peer.address_manager.good(&addr_from);
                }
            }
        }
    }
}

/// Completes the ack half of the handshake. An out-of-order `VerAck`
/// (arriving before we've sent our own `Version`) disconnects; a repeat
/// `VerAck` is a harmless no-op.
fn handle_verack(peer: &Arc<Peer>) -> Result<(), Error> {
    {
        let mut handshake = peer.handshake.lock().unwrap();
        if handshake.verack_received {
            return Ok(());
        }
        if !handshake.version_sent {
            return Err(Error::UnexpectedVerAck);
        }
        handshake.verack_received = true;
        if handshake.version_known {
            handshake.handshake_complete = true;
        }
    }
    complete_handshake_if_ready(peer)
}

/// Runs the handshake-completion side effects exactly once: the moment
/// both `version_known` and `verack_received` become true, whichever
/// handler observes that transition registers the peer with the object
/// manager and sends the bootstrap `Addr` (from the address cache) followed
/// by a bootstrap `Inv` of random object hashes from the store.
fn complete_handshake_if_ready(peer: &Arc<Peer>) -> Result<(), Error> {
    if !peer.handshake_state().handshake_complete {
        return Ok(());
    }
    peer.object_manager.new_peer(peer);
    peer.push_addr(&peer.address_manager.address_cache())?;
    sample_and_push_inv(peer, MAX_INV_PER_MSG)
}

/// Samples up to `cap` hashes from the object store that this peer isn't
/// already known to have, records them as known, and pushes them as an
/// `Inv`. A no-op if the store has nothing left to offer.
fn sample_and_push_inv(peer: &Arc<Peer>, cap: usize) -> Result<(), Error> {
    let hashes = {
        let mut known = peer.known_inventory.lock().unwrap();
        let sampled = peer
            .object_store
            .fetch_random_inv_hashes(cap, &|h| known.contains(h));
        for hash in &sampled {
            known.insert(*hash);
        }
        sampled
    };
    peer.push_inv(&hashes)
}

/// Ten minutes, the cutoff beyond which an advertised timestamp is treated
/// as bogus rather than merely optimistic clock skew.
const ADDR_TIMESTAMP_FUTURE_LIMIT_SECS: u64 = 10 * 60;
/// Five days in the past, the age an implausible timestamp is rewritten to,
/// matching the reference protocol's penalty for addresses that can't be
/// trusted to be fresh.
const ADDR_TIMESTAMP_PENALTY_SECS: u64 = 5 * 24 * 60 * 60;

fn handle_addr(peer: &Arc<Peer>, addrs: Vec<NetAddress>) -> Result<(), Error> {
    if addrs.is_empty() {
        return Err(Error::EmptyAddr);
    }

    let now = localtime::LocalTime::now().as_secs();
    let rewritten: Vec<NetAddress> = addrs
        .into_iter()
        .map(|addr| {
            if (addr.time as u64) > now + ADDR_TIMESTAMP_FUTURE_LIMIT_SECS {
                addr.with_time(now.saturating_sub(ADDR_TIMESTAMP_PENALTY_SECS) as u32)
            } else {
                addr
            }
        })
        .collect();

    {
        let mut known = peer.known_addresses.lock().unwrap();
        for addr in &rewritten {
            known.insert(addr.key());
        }
    }

    peer.address_manager
        .add_addresses(&rewritten, AddressSource::Gossiped);
    Ok(())
}

fn handle_inv(peer: &Arc<Peer>, invs: Vec<InvVect>) -> Result<(), Error> {
    if invs.len() > MAX_INV_PER_MSG {
        return Err(Error::InvTooLarge(invs.len()));
    }
    {
        let mut known = peer.known_inventory.lock().unwrap();
        for hash in &invs {
            known.insert(*hash);
        }
    }
    peer.object_manager.queue_inv(&invs, peer);
    Ok(())
}

/// Fetches and sends the requested objects one at a time, each send
/// pipelined behind the previous one's done-signal so the store and the
/// transport never race. The final entry carries the batch's one explicit
/// done-signal; this handler waits on it before returning, so the call
/// only completes once the last `Object` has actually reached the
/// transport.
fn handle_getdata(peer: &Arc<Peer>, hashes: Vec<InvVect>) -> Result<(), Error> {
    if hashes.len() > MAX_INV_PER_MSG {
        return Err(Error::InvTooLarge(hashes.len()));
    }
    if hashes.is_empty() {
        return Ok(());
    }

    let mut wait_on: Option<chan::Receiver<()>> = None;
    let mut final_rx: Option<chan::Receiver<()>> = None;

    for hash in &hashes {
        let (result, rx) = peer.push_object_pipelined(hash, wait_on.take());
        if let Err(err) = result {
            log::debug!(target: "peer::dispatcher", "{peer}: getdata {hash:02x?}: {err}");
        }
        wait_on = Some(rx.clone());
        final_rx = Some(rx);
    }

    if let Some(rx) = final_rx {
        let _ = rx.recv();
    }

    Ok(())
}

fn handle_object(peer: &Arc<Peer>, payload: ObjectPayload) -> Result<(), Error> {
    let hash = payload.hash();
    let was_requested = peer.requested_objects.lock().unwrap().remove(&hash).is_some();
    if !was_requested {
        return Err(Error::UnsolicitedObject);
    }
    peer.object_manager.handle_object_msg(payload, peer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc as StdArc;
    use std::time::{Duration, Instant};

    use crate::address_manager::InMemoryAddressManager;
    use crate::config::Config;
    use crate::object_manager::InMemoryObjectManager;
    use crate::object_store::InMemoryObjectStore;
    use crate::peer::Peer;
    use crate::transport::{ChannelTransport, Transport};
    use crate::wire::{Message, NetAddress};
    use crossbeam_channel as chan;

    fn spin_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    fn harness() -> (StdArc<Peer>, ChannelTransport, chan::Receiver<StdArc<Peer>>) {
        let (a, b) = ChannelTransport::pair(
            ([127, 0, 0, 1], 1).into(),
            ([127, 0, 0, 1], 2).into(),
        );
        let (done_tx, done_rx) = chan::unbounded();
        let peer = Peer::inbound(
            StdArc::new(a),
            StdArc::new(InMemoryAddressManager::new()),
            StdArc::new(InMemoryObjectManager::new()),
            StdArc::new(InMemoryObjectStore::new()),
            Config::default().with_trickle_interval(Duration::from_secs(60)),
            42,
            done_tx,
        );
        (peer, b, done_rx)
    }

    fn version(nonce: u64) -> Message {
        Message::Version {
            protocol_version: crate::wire::PROTOCOL_VERSION,
            services: crate::wire::NODE_NETWORK,
            timestamp: 0,
            addr_recv: NetAddress::default(),
            addr_from: NetAddress::default(),
            nonce,
            user_agent: "/test:0/".to_string(),
            streams: vec![1],
        }
    }

    #[test]
    fn completes_handshake_on_version_then_verack() {
        let (peer, remote, _done_rx) = harness();
        peer.start().unwrap();

        remote.write_message(&version(7)).unwrap();
        assert!(matches!(remote.read_message().unwrap(), Message::Version { .. }));
        assert!(matches!(remote.read_message().unwrap(), Message::VerAck));

        remote.write_message(&Message::VerAck).unwrap();

        assert!(spin_until(
            || peer.handshake_state().handshake_complete,
            Duration::from_secs(1)
        ));
        peer.disconnect();
    }

    #[test]
    fn rejects_self_connection() {
        let (peer, remote, _done_rx) = harness();
        peer.start().unwrap();

        remote.write_message(&version(42)).unwrap();

        assert!(spin_until(|| peer.is_disconnected(), Duration::from_secs(1)));
    }

    #[test]
    fn rejects_message_before_handshake() {
        let (peer, remote, _done_rx) = harness();
        peer.start().unwrap();

        remote.write_message(&Message::Addr(vec![])).unwrap();

        assert!(spin_until(|| peer.is_disconnected(), Duration::from_secs(1)));
    }

    #[test]
    fn disconnects_on_empty_addr_after_handshake() {
        let (peer, remote, _done_rx) = harness();
        peer.start().unwrap();

        remote.write_message(&version(7)).unwrap();
        let _ = remote.read_message().unwrap();
        let _ = remote.read_message().unwrap();
        remote.write_message(&Message::VerAck).unwrap();
        assert!(spin_until(
            || peer.handshake_state().handshake_complete,
            Duration::from_secs(1)
        ));

        remote.write_message(&Message::Addr(vec![])).unwrap();
        assert!(spin_until(|| peer.is_disconnected(), Duration::from_secs(1)));
    }

    #[test]
    fn disconnects_on_unsolicited_object() {
        let (peer, remote, _done_rx) = harness();
        peer.start().unwrap();

        remote.write_message(&version(7)).unwrap();
        let _ = remote.read_message().unwrap();
        let _ = remote.read_message().unwrap();
        remote.write_message(&Message::VerAck).unwrap();
        assert!(spin_until(
            || peer.handshake_state().handshake_complete,
            Duration::from_secs(1)
        ));

        let payload = crate::wire::ObjectPayload::GetPubKey {
            nonce: 1,
            expires: 0,
            ripe: [0u8; 20],
        };
        remote.write_message(&Message::Object(payload)).unwrap();
        assert!(spin_until(|| peer.is_disconnected(), Duration::from_secs(1)));
    }
}
