//! The transport collaborator: framed message I/O over a connection, plus
//! the two concrete implementations this crate ships — a TCP transport for
//! production use and an in-process channel transport for tests.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;

use crossbeam_channel as chan;

use crate::wire::{self, Decode, Encode, Envelope, Message};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Wire(#[from] wire::Error),
    #[error("transport is closed")]
    Closed,
}

/// A framed connection to a single peer. Implementations own exactly one
/// reader and one writer; the peer engine serializes all reads through the
/// dispatcher and all writes through the writer, so implementations need
/// not be internally thread-safe for concurrent reads or concurrent writes
/// (though a single read concurrent with a single write must be safe).
pub trait Transport: Send + Sync {
    fn read_message(&self) -> Result<Message, Error>;
    fn write_message(&self, message: &Message) -> Result<(), Error>;
    fn remote_addr(&self) -> SocketAddr;
    fn close(&self);
}

/// A TCP-backed transport, framing messages with [`Envelope`].
pub struct TcpTransport {
    remote_addr: SocketAddr,
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<BufWriter<TcpStream>>,
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream.try_clone()?);

        Ok(Self {
            remote_addr,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            stream,
        })
    }

    pub fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        Self::new(TcpStream::connect(addr)?)
    }
}

impl Transport for TcpTransport {
    fn read_message(&self) -> Result<Message, Error> {
        let mut reader = self.reader.lock().unwrap();
        let envelope = Envelope::decode(&mut *reader)?;
        Ok(envelope.message)
    }

    fn write_message(&self, message: &Message) -> Result<(), Error> {
        let envelope = Envelope::new(message.clone());
        let mut writer = self.writer.lock().unwrap();
        envelope.encode(&mut *writer).map_err(wire::Error::from)?;
        writer.flush().map_err(wire::Error::from)?;
        Ok(())
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn close(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// An in-process transport backed by a pair of bounded channels, standing
/// in for a socket in tests. Construct a connected pair with
/// [`ChannelTransport::pair`].
pub struct ChannelTransport {
    remote_addr: SocketAddr,
    outbound: chan::Sender<Message>,
    inbound: chan::Receiver<Message>,
    closed: std::sync::atomic::AtomicBool,
}

/// Matches the node worker's channel size for a single peer's worth of
/// framed messages in flight.
const CHANNEL_TRANSPORT_BUFFER: usize = 64;

impl ChannelTransport {
    /// Reads with a deadline, for tests that need to assert "nothing
    /// arrives" without blocking forever. Not part of [`Transport`]: a real
    /// socket has no equivalent that doesn't also need a way to
    /// distinguish timeout from a genuine close, which no caller here needs
    /// outside tests.
    pub fn read_message_timeout(&self, timeout: std::time::Duration) -> Option<Message> {
        self.inbound.recv_timeout(timeout).ok()
    }

    /// Builds a connected pair: writes on one side arrive as reads on the
    /// other.
    pub fn pair(a_addr: SocketAddr, b_addr: SocketAddr) -> (Self, Self) {
        let (a_to_b, b_from_a) = chan::bounded(CHANNEL_TRANSPORT_BUFFER);
        let (b_to_a, a_from_b) = chan::bounded(CHANNEL_TRANSPORT_BUFFER);

        let a = Self {
            remote_addr: b_addr,
            outbound: a_to_b,
            inbound: a_from_b,
            closed: std::sync::atomic::AtomicBool::new(false),
        };
        let b = Self {
            remote_addr: a_addr,
            outbound: b_to_a,
            inbound: b_from_a,
            closed: std::sync::atomic::AtomicBool::new(false),
        };
        (a, b)
    }
}

impl Transport for ChannelTransport {
    fn read_message(&self) -> Result<Message, Error> {
        self.inbound.recv().map_err(|_| Error::Closed)
    }

    fn write_message(&self, message: &Message) -> Result<(), Error> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.outbound.send(message.clone()).map_err(|_| Error::Closed)
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}
