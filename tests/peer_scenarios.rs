//! End-to-end scenarios for the peer engine, driven entirely through the
//! public API over an in-process [`ChannelTransport`] pair. Each test plays
//! the role of the remote endpoint by reading and writing directly on the
//! transport's other half.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bmd_peer::address_manager::InMemoryAddressManager;
use bmd_peer::config::{Config, MAX_ADDR_PER_MSG};
use bmd_peer::object_manager::InMemoryObjectManager;
use bmd_peer::object_store::InMemoryObjectStore;
use bmd_peer::peer::Peer;
use bmd_peer::transport::{ChannelTransport, Transport};
use bmd_peer::wire::{Message, NetAddress, ObjectPayload};
use crossbeam_channel as chan;

const SERVER_NONCE: u64 = 0xC0FFEE;

fn spin_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return check();
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn remote_version(nonce: u64) -> Message {
    Message::Version {
        protocol_version: bmd_peer::wire::PROTOCOL_VERSION,
        services: bmd_peer::wire::NODE_NETWORK,
        timestamp: 0,
        addr_recv: NetAddress::default(),
        addr_from: NetAddress::default(),
        nonce,
        user_agent: "/remote:0/".to_string(),
        streams: vec![1],
    }
}

fn outbound_harness(config: Config) -> (Arc<Peer>, ChannelTransport, chan::Receiver<Arc<Peer>>) {
    let (local, remote) = ChannelTransport::pair(
        ([127, 0, 0, 1], 10).into(),
        ([127, 0, 0, 1], 20).into(),
    );
    let (done_tx, done_rx) = chan::unbounded();
    let peer = Peer::outbound(
        Arc::new(local),
        NetAddress::new([127, 0, 0, 1].into(), 20, 1, 0),
        false,
        0,
        Arc::new(InMemoryAddressManager::new()),
        Arc::new(InMemoryObjectManager::new()),
        Arc::new(InMemoryObjectStore::new()),
        config,
        SERVER_NONCE,
        done_tx,
    );
    (peer, remote, done_rx)
}

fn complete_handshake(peer: &Arc<Peer>, remote: &ChannelTransport) {
    // The outbound peer writes its Version synchronously before `start`
    // returns threads, so it's already on the wire once `start` succeeds.
    assert!(matches!(
        remote.read_message().unwrap(),
        Message::Version { .. }
    ));
    remote.write_message(&remote_version(1)).unwrap();
    remote.write_message(&Message::VerAck).unwrap();
    assert!(matches!(remote.read_message().unwrap(), Message::VerAck));

    assert!(spin_until(
        || peer.handshake_state().handshake_complete,
        Duration::from_secs(1)
    ));
}

#[test]
fn outbound_handshake_completes() {
    let (peer, remote, _done_rx) = outbound_harness(Config::default());
    peer.start().unwrap();
    complete_handshake(&peer, &remote);
    assert!(peer.connected());
    peer.disconnect();
}

#[test]
fn self_connection_is_rejected() {
    let (peer, remote, _done_rx) = outbound_harness(Config::default());
    peer.start().unwrap();

    assert!(matches!(
        remote.read_message().unwrap(),
        Message::Version { .. }
    ));
    remote.write_message(&remote_version(SERVER_NONCE)).unwrap();

    assert!(spin_until(|| peer.is_disconnected(), Duration::from_secs(1)));
}

#[test]
fn unsolicited_object_disconnects_the_peer() {
    let (peer, remote, _done_rx) = outbound_harness(Config::default());
    peer.start().unwrap();
    complete_handshake(&peer, &remote);

    let payload = ObjectPayload::Msg {
        nonce: 1,
        expires: 0,
        encrypted: vec![1, 2, 3],
    };
    remote.write_message(&Message::Object(payload)).unwrap();

    assert!(spin_until(|| peer.is_disconnected(), Duration::from_secs(1)));
}

#[test]
fn duplicate_inventory_trickles_once() {
    let config = Config::default().with_trickle_interval(Duration::from_millis(30));
    let (peer, remote, _done_rx) = outbound_harness(config);
    peer.start().unwrap();
    complete_handshake(&peer, &remote);

    let hash = [9u8; 32];
    peer.queue_inventory(hash);
    peer.queue_inventory(hash);

    let message = remote
        .read_message_timeout(Duration::from_secs(1))
        .expect("expected a trickled Inv");
    match message {
        Message::Inv(invs) => assert_eq!(invs, vec![hash]),
        other => panic!("expected Inv, got {other:?}"),
    }

    // Once trickled, the hash is in `known_inventory`: re-queueing it is a
    // no-op, so no further `Inv` is ever emitted for it.
    peer.queue_inventory(hash);
    assert!(remote
        .read_message_timeout(Duration::from_millis(200))
        .is_none());

    peer.disconnect();
}

#[test]
fn getdata_pipelines_multiple_objects_in_order() {
    // The store is left empty until after the handshake completes, so the
    // bootstrap `Inv` sampled at handshake-completion time (see
    // `dispatcher::complete_handshake_if_ready`) has nothing to offer and is
    // never sent; otherwise it would arrive on the wire ahead of the
    // `Object` messages this test is asserting on.
    let store = Arc::new(InMemoryObjectStore::new());

    let (local, remote) = ChannelTransport::pair(
        ([127, 0, 0, 1], 10).into(),
        ([127, 0, 0, 1], 20).into(),
    );
    let (done_tx, _done_rx) = chan::unbounded();
    let peer = Peer::outbound(
        Arc::new(local),
        NetAddress::new([127, 0, 0, 1].into(), 20, 1, 0),
        false,
        0,
        Arc::new(InMemoryAddressManager::new()),
        Arc::new(InMemoryObjectManager::new()),
        Arc::clone(&store),
        Config::default(),
        SERVER_NONCE,
        done_tx,
    );
    peer.start().unwrap();
    complete_handshake(&peer, &remote);

    let first = store.insert(ObjectPayload::Msg {
        nonce: 1,
        expires: 0,
        encrypted: vec![1],
    });
    let second = store.insert(ObjectPayload::Msg {
        nonce: 2,
        expires: 0,
        encrypted: vec![2],
    });

    remote
        .write_message(&Message::GetData(vec![first, second]))
        .unwrap();

    let m1 = remote.read_message_timeout(Duration::from_secs(1)).unwrap();
    let m2 = remote.read_message_timeout(Duration::from_secs(1)).unwrap();
    match (m1, m2) {
        (Message::Object(a), Message::Object(b)) => {
            assert_eq!(a.hash(), first);
            assert_eq!(b.hash(), second);
        }
        other => panic!("expected two Object messages, got {other:?}"),
    }

    peer.disconnect();
}

#[test]
fn addr_overflow_is_capped_by_reservoir_sampling() {
    let (peer, remote, _done_rx) = outbound_harness(Config::default());
    peer.start().unwrap();
    complete_handshake(&peer, &remote);

    let candidates: Vec<NetAddress> = (0..(MAX_ADDR_PER_MSG + 500) as u32)
        .map(|i| {
            let ip = [10, (i >> 16) as u8, (i >> 8) as u8, i as u8];
            NetAddress::new(ip.into(), 8444, 1, 0)
        })
        .collect();

    peer.push_addr(&candidates).unwrap();

    let message = remote.read_message_timeout(Duration::from_secs(1)).unwrap();
    match message {
        Message::Addr(addrs) => assert_eq!(addrs.len(), MAX_ADDR_PER_MSG),
        other => panic!("expected Addr, got {other:?}"),
    }

    peer.disconnect();
}
