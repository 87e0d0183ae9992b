//! The peer engine: one [`Peer`] per connection, composed of three
//! concurrent activities (dispatcher, multiplexer, writer) plus the push
//! helpers that build outbound messages. See the module-level design notes
//! in `SPEC_FULL.md` for the full component breakdown.

mod dispatcher;
mod multiplexer;
mod push;
mod watchdog;
mod writer;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel as chan;

use crate::address_manager::AddressManager;
use crate::config::Config;
use crate::inventory::KnownInventory;
use crate::object_manager::ObjectManager;
use crate::object_store::ObjectStore;
use crate::transport::Transport;
use crate::wire::{self, Hash, InvVect, Message, NetAddress};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("duplicate version message")]
    DuplicateVersion,
    #[error("verack received before version was sent")]
    UnexpectedVerAck,
    #[error("message received before handshake completed")]
    HandshakeNotComplete,
    #[error("connected to self (nonce {0:#x} matches our own)")]
    SelfConnection(u64),
    #[error("received unsolicited object")]
    UnsolicitedObject,
    #[error("inv message exceeds {0} entries")]
    InvTooLarge(usize),
    #[error("addr message was empty")]
    EmptyAddr,
    #[error("version message advertised no streams")]
    NoStreams,
    #[error("peer was idle past its deadline")]
    Idle,
    #[error(transparent)]
    Transport(#[from] crate::transport::Error),
    #[error(transparent)]
    Wire(#[from] wire::Error),
    #[error(transparent)]
    Store(#[from] crate::object_store::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn is_outbound(self) -> bool {
        matches!(self, Self::Outbound)
    }
}

/// Handshake progress. Every field is monotonic false -> true over a peer's
/// lifetime; nothing ever resets one back to false.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandshakeState {
    pub version_sent: bool,
    pub version_known: bool,
    pub verack_received: bool,
    pub handshake_complete: bool,
}

/// A point-in-time snapshot of a peer's negotiated properties and traffic
/// counters, copied out from behind the stats lock for logging and tests.
#[derive(Clone, Debug, Default)]
pub struct PeerStats {
    pub protocol_version: u32,
    pub services: u64,
    pub user_agent: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub time_connected: Option<Instant>,
    pub handshake: HandshakeState,
}

#[derive(Default)]
struct Stats {
    protocol_version: u32,
    services: u64,
    user_agent: String,
    bytes_in: u64,
    bytes_out: u64,
}

/// A single-shot completion notification attached to an [`OutMessage`].
/// Fired exactly once: when the message is written, when it's drained on
/// shutdown, or when it's rejected because the peer is already
/// disconnected.
pub struct DoneSignal(chan::Sender<()>);

impl DoneSignal {
    pub fn fire(self) {
        let _ = self.0.try_send(());
    }
}

/// Creates a done-signal/waiter pair. The waiter blocks until `fire` is
/// called on the paired signal, or returns immediately if the signal was
/// dropped without firing (treated the same as a fire, so a waiter never
/// hangs on a lost signal).
pub fn done_pair() -> (DoneSignal, chan::Receiver<()>) {
    let (tx, rx) = chan::bounded(1);
    (DoneSignal(tx), rx)
}

pub struct OutMessage {
    pub message: Message,
    pub done: Option<DoneSignal>,
}

impl OutMessage {
    pub fn new(message: Message) -> Self {
        Self { message, done: None }
    }

    pub fn with_done(message: Message, done: DoneSignal) -> Self {
        Self {
            message,
            done: Some(done),
        }
    }

    fn fire_done(self) {
        if let Some(done) = self.done {
            done.fire();
        }
    }
}

/// One connection's worth of protocol state, and the owner of the three
/// concurrent activities that serve it.
pub struct Peer {
    pub direction: Direction,
    pub persistent: bool,
    pub remote_address: String,
    net_address: Mutex<Option<NetAddress>>,

    transport: Arc<dyn Transport>,
    address_manager: Arc<dyn AddressManager>,
    object_manager: Arc<dyn ObjectManager>,
    object_store: Arc<dyn ObjectStore>,
    config: Config,
    server_nonce: u64,
    done_peers: chan::Sender<Arc<Peer>>,

    handshake: Mutex<HandshakeState>,
    stats: Mutex<Stats>,
    time_connected: Mutex<Option<Instant>>,

    started: AtomicBool,
    connected: AtomicBool,
    disconnect: AtomicBool,
    retry_count: AtomicU32,

    continue_hash: Mutex<Option<Hash>>,
    known_addresses: Mutex<std::collections::HashSet<(std::net::Ipv6Addr, u16)>>,
    known_inventory: Mutex<KnownInventory>,
    requested_objects: Mutex<std::collections::HashMap<Hash, Instant>>,

    out_tx: chan::Sender<OutMessage>,
    out_rx: chan::Receiver<OutMessage>,
    inv_tx: chan::Sender<InvVect>,
    inv_rx: chan::Receiver<InvVect>,
    /// Broadcasts disconnect to the multiplexer. The writer needs no
    /// separate quit signal: it terminates when its hand-off channel from
    /// the multiplexer closes, which happens once the multiplexer (the only
    /// activity that can be idle with no pending work) has observed this
    /// signal, drained its queues, and exited.
    quit_multiplexer: (chan::Sender<()>, chan::Receiver<()>),

    /// Join handles for the multiplexer and writer threads, taken and
    /// joined by the dispatcher on its way out so that both activities have
    /// fully wound down before this peer reports itself done.
    multiplexer_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    writer_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

#[allow(clippy::too_many_arguments)]
impl Peer {
    fn new(
        direction: Direction,
        persistent: bool,
        remote_address: String,
        net_address: Option<NetAddress>,
        transport: Arc<dyn Transport>,
        address_manager: Arc<dyn AddressManager>,
        object_manager: Arc<dyn ObjectManager>,
        object_store: Arc<dyn ObjectStore>,
        config: Config,
        server_nonce: u64,
        done_peers: chan::Sender<Arc<Peer>>,
    ) -> Arc<Self> {
        let (out_tx, out_rx) = chan::bounded(config.output_buffer_size);
        let (inv_tx, inv_rx) = chan::bounded(config.output_buffer_size);

        Arc::new(Self {
            direction,
            persistent,
            remote_address,
            net_address: Mutex::new(net_address),
            transport,
            address_manager,
            object_manager,
            object_store,
            known_inventory: Mutex::new(KnownInventory::new(config.max_known_inventory)),
            config,
            server_nonce,
            done_peers,
            handshake: Mutex::new(HandshakeState::default()),
            stats: Mutex::new(Stats::default()),
            time_connected: Mutex::new(None),
            started: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            disconnect: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            continue_hash: Mutex::new(None),
            known_addresses: Mutex::new(std::collections::HashSet::new()),
            requested_objects: Mutex::new(std::collections::HashMap::new()),
            out_tx,
            out_rx,
            inv_tx,
            inv_rx,
            quit_multiplexer: chan::bounded(1),
            multiplexer_handle: Mutex::new(None),
            writer_handle: Mutex::new(None),
        })
    }

    /// Constructs an inbound peer from an already-accepted transport.
    #[allow(clippy::too_many_arguments)]
    pub fn inbound(
        transport: Arc<dyn Transport>,
        address_manager: Arc<dyn AddressManager>,
        object_manager: Arc<dyn ObjectManager>,
        object_store: Arc<dyn ObjectStore>,
        config: Config,
        server_nonce: u64,
        done_peers: chan::Sender<Arc<Peer>>,
    ) -> Arc<Self> {
        let remote_address = transport.remote_addr().to_string();
        Self::new(
            Direction::Inbound,
            false,
            remote_address,
            None,
            transport,
            address_manager,
            object_manager,
            object_store,
            config,
            server_nonce,
            done_peers,
        )
    }

    /// Constructs an outbound peer for an address already connected to.
    #[allow(clippy::too_many_arguments)]
    pub fn outbound(
        transport: Arc<dyn Transport>,
        net_address: NetAddress,
        persistent: bool,
        retry_count: u32,
        address_manager: Arc<dyn AddressManager>,
        object_manager: Arc<dyn ObjectManager>,
        object_store: Arc<dyn ObjectStore>,
        config: Config,
        server_nonce: u64,
        done_peers: chan::Sender<Arc<Peer>>,
    ) -> Arc<Self> {
        let remote_address = net_address.socket_addr().to_string();
        let peer = Self::new(
            Direction::Outbound,
            persistent,
            remote_address,
            Some(net_address),
            transport,
            address_manager,
            object_manager,
            object_store,
            config,
            server_nonce,
            done_peers,
        );
        peer.retry_count.store(retry_count, Ordering::SeqCst);
        peer
    }

    pub fn net_address(&self) -> Option<NetAddress> {
        *self.net_address.lock().unwrap()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn handshake_state(&self) -> HandshakeState {
        *self.handshake.lock().unwrap()
    }

    pub fn stats(&self) -> PeerStats {
        let stats = self.stats.lock().unwrap();
        PeerStats {
            protocol_version: stats.protocol_version,
            services: stats.services,
            user_agent: stats.user_agent.clone(),
            bytes_in: stats.bytes_in,
            bytes_out: stats.bytes_out,
            time_connected: *self.time_connected.lock().unwrap(),
            handshake: self.handshake_state(),
        }
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.disconnect.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnect.load(Ordering::SeqCst)
    }

    /// Starts the three concurrent activities. Idempotent: a second call is
    /// a no-op. For outbound peers, the initial `Version` is pushed before
    /// the dispatcher starts reading, so the handshake always begins with
    /// our own greeting.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.time_connected.lock().unwrap() = Some(Instant::now());

        if self.direction.is_outbound() {
            self.send_initial_version()?;
        }

        let (slot_tx, slot_rx) = chan::bounded(1);

        let multiplexer_peer = Arc::clone(self);
        let multiplexer_handle =
            crate::thread::spawn(&self.remote_address, "peer-multiplexer", move || {
                multiplexer::run(multiplexer_peer, slot_tx);
            });
        *self.multiplexer_handle.lock().unwrap() = Some(multiplexer_handle);

        let writer_peer = Arc::clone(self);
        let writer_handle = crate::thread::spawn(&self.remote_address, "peer-writer", move || {
            writer::run(writer_peer, slot_rx);
        });
        *self.writer_handle.lock().unwrap() = Some(writer_handle);

        let dispatcher_peer = Arc::clone(self);
        crate::thread::spawn(&self.remote_address, "peer-dispatcher", move || {
            dispatcher::run(dispatcher_peer);
        });

        Ok(())
    }

    /// Joins the multiplexer and writer threads, in that order, so both
    /// activities have fully exited before the caller (the dispatcher, on
    /// its way out) reports this peer as done. A no-op if `start` was never
    /// called or this has already run once.
    fn join_worker_threads(&self) {
        if let Some(handle) = self.multiplexer_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.writer_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Idempotent disconnect: closes the transport and wakes the
    /// multiplexer and writer on their first call only.
    pub fn disconnect(self: &Arc<Self>) {
        if self.disconnect.swap(true, Ordering::SeqCst) {
            return;
        }
        log::warn!(target: "peer", "{self}: disconnecting");
        self.transport.close();
        let _ = self.quit_multiplexer.0.try_send(());
    }

    /// Reports this peer as done to the server. Called once, from the
    /// dispatcher, on its way out, after the multiplexer and writer have
    /// both been joined.
    fn report_done(self: &Arc<Self>) {
        self.join_worker_threads();
        let _ = self.done_peers.send(Arc::clone(self));
    }

    /// Enqueues an outbound message. If the peer is already disconnected,
    /// any done-signal is fired immediately so the caller never blocks
    /// waiting on a peer that will never write again.
    pub fn queue_message(self: &Arc<Self>, message: Message, done: Option<DoneSignal>) {
        if !self.connected() {
            if let Some(done) = done {
                done.fire();
            }
            return;
        }
        if let Err(chan::SendError(out)) = self.out_tx.send(OutMessage { message, done }) {
            out.fire_done();
        }
    }

    /// Queues an inventory vector for trickling, unless this peer is already
    /// known to have it or the handshake hasn't reached the point where
    /// `Version` has been observed.
    pub fn queue_inventory(self: &Arc<Self>, inv: InvVect) {
        if !self.connected() || !self.handshake_state().version_known {
            return;
        }
        if self.known_inventory.lock().unwrap().contains(&inv) {
            return;
        }
        let _ = self.inv_tx.send(inv);
    }

    fn negotiate_or_idle_timeout(&self) -> Duration {
        if self.handshake_state().handshake_complete {
            self.config.idle_timeout
        } else {
            self.config.negotiate_timeout
        }
    }

    fn record_bytes_in(&self, n: usize) {
        self.stats.lock().unwrap().bytes_in += n as u64;
    }

    fn record_bytes_out(&self, n: usize) {
        self.stats.lock().unwrap().bytes_out += n as u64;
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        };
        write!(f, "{dir}:{}", self.remote_address)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("direction", &self.direction)
            .field("remote_address", &self.remote_address)
            .field("handshake", &self.handshake_state())
            .finish()
    }
}
