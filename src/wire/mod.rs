//! Binary wire codec: `Encode`/`Decode` traits, the message envelope, and
//! primitive encodings shared by every message type.

mod address;
mod message;

pub use address::NetAddress;
pub use message::{Hash, InvVect, Message, ObjectPayload};

use std::convert::TryFrom;
use std::string::FromUtf8Error;
use std::{io, mem};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha512};

/// The magic value prefixing every envelope on the wire, identifying the
/// network. Chosen arbitrarily; peers that don't share it are not speaking
/// the same protocol.
pub const MAGIC: u32 = 0xE9_BE_B4_D9;

/// The type we use to represent sizes on the wire. Two bytes is enough for
/// any message this engine sends or accepts; longer payloads are rejected
/// during decode rather than silently truncated.
pub type Size = u16;

/// Current protocol version advertised in `Version` messages.
pub const PROTOCOL_VERSION: u32 = 3;

/// `NODE_NETWORK` service bit: this node stores and serves the object pool.
pub const NODE_NETWORK: u64 = 1;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("UTF-8 error: {0}")]
    FromUtf8(#[from] FromUtf8Error),
    #[error("invalid size: expected at most {max}, got {actual}")]
    InvalidSize { max: usize, actual: usize },
    #[error("invalid magic `{0:x}`")]
    InvalidMagic(u32),
    #[error("checksum mismatch")]
    InvalidChecksum,
    #[error("unknown message command `{0}`")]
    UnknownCommand(String),
    #[error("unknown object type `{0}`")]
    UnknownObjectType(u32),
    #[error("unexpected trailing bytes")]
    UnexpectedBytes,
}

impl Error {
    /// Whether decoding failed because the stream ended early. Callers use
    /// this to tell a closed connection apart from a malformed one.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Things that can be encoded as binary.
pub trait Encode {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error>;
}

/// Things that can be decoded from binary.
pub trait Decode: Sized {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error>;
}

/// Encode an object into a byte vector.
///
/// # Panics
///
/// If the encoded object exceeds [`Size::MAX`].
pub fn serialize<T: Encode + ?Sized>(data: &T) -> Vec<u8> {
    let mut buffer = Vec::new();
    #[allow(clippy::unwrap_used)]
    let len = data.encode(&mut buffer).unwrap();

    debug_assert_eq!(len, buffer.len());
    buffer
}

/// Decode an object from a byte slice, rejecting any trailing bytes.
pub fn deserialize<T: Decode>(data: &[u8]) -> Result<T, Error> {
    let mut cursor = io::Cursor::new(data);
    let obj = T::decode(&mut cursor)?;

    if cursor.position() as usize != cursor.get_ref().len() {
        return Err(Error::UnexpectedBytes);
    }
    Ok(obj)
}

/// A length-prefixed envelope carrying one [`Message`] plus the network
/// magic, used by the TCP transport to frame messages.
pub struct Envelope {
    pub magic: u32,
    pub message: Message,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            magic: MAGIC,
            message,
        }
    }
}

impl Encode for Envelope {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let payload = serialize(&self.message);
        let checksum = checksum(&payload);

        let mut n = self.magic.encode(writer)?;
        n += (payload.len() as u32).encode(writer)?;
        n += checksum.encode(writer)?;
        writer.write_all(&payload)?;
        n += payload.len();

        Ok(n)
    }
}

impl Decode for Envelope {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let magic = u32::decode(reader)?;
        if magic != MAGIC {
            return Err(Error::InvalidMagic(magic));
        }
        let len = u32::decode(reader)? as usize;
        let expected_checksum: [u8; 4] = Decode::decode(reader)?;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        if checksum(&payload) != expected_checksum {
            return Err(Error::InvalidChecksum);
        }
        let message = deserialize(&payload)?;

        Ok(Self { magic, message })
    }
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Sha512::digest(payload);
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    out
}

/// Double-SHA512, truncated to 32 bytes: the canonical hash of an object's
/// payload, used as its inventory vector.
pub fn object_hash(payload: &[u8]) -> Hash {
    let first = Sha512::digest(payload);
    let second = Sha512::digest(first);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&second[..32]);
    hash
}

impl Encode for u8 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u8(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encode for u16 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u16::<NetworkEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encode for u32 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u32::<NetworkEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encode for u64 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u64::<NetworkEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encode for i64 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_i64::<NetworkEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encode for bool {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        (*self as u8).encode(writer)
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_all(self)?;
        Ok(N)
    }
}

impl Encode for &str {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let len = Size::try_from(self.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "string too long to encode")
        })?;
        let mut n = len.encode(writer)?;
        let bytes = self.as_bytes();
        writer.write_all(bytes)?;
        n += bytes.len();
        Ok(n)
    }
}

impl Encode for String {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_str().encode(writer)
    }
}

impl<T: Encode> Encode for &[T] {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let len = Size::try_from(self.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "sequence too long to encode")
        })?;
        let mut n = len.encode(writer)?;
        for item in self.iter() {
            n += item.encode(writer)?;
        }
        Ok(n)
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_slice().encode(writer)
    }
}

impl Decode for u8 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        reader.read_u8().map_err(Error::from)
    }
}

impl Decode for u16 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        reader.read_u16::<NetworkEndian>().map_err(Error::from)
    }
}

impl Decode for u32 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        reader.read_u32::<NetworkEndian>().map_err(Error::from)
    }
}

impl Decode for u64 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        reader.read_u64::<NetworkEndian>().map_err(Error::from)
    }
}

impl Decode for i64 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        reader.read_i64::<NetworkEndian>().map_err(Error::from)
    }
}

impl Decode for bool {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(u8::decode(reader)? != 0)
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let mut buf = [0; N];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl Decode for String {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let len = Size::decode(reader)? as usize;
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(Error::from)
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let len = Size::decode(reader)? as usize;
        let mut items = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            items.push(T::decode(reader)?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut buf = Vec::new();
        42u32.encode(&mut buf).unwrap();
        assert_eq!(u32::decode(&mut io::Cursor::new(&buf)).unwrap(), 42);
    }

    #[test]
    fn strings_round_trip() {
        let s = "bmd/0.1.0".to_string();
        let buf = serialize(&s);
        let decoded: String = deserialize(&buf).unwrap();
        assert_eq!(decoded, s);
    }

    #[test]
    fn vectors_round_trip() {
        let v: Vec<u32> = vec![1, 2, 3, 4, 5];
        let buf = serialize(&v);
        let decoded: Vec<u32> = deserialize(&buf).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn envelope_round_trips_a_verack() {
        let envelope = Envelope::new(Message::VerAck);
        let buf = serialize(&envelope);
        let decoded = Envelope::decode(&mut io::Cursor::new(&buf)).unwrap();

        assert_eq!(decoded.magic, MAGIC);
        assert!(matches!(decoded.message, Message::VerAck));
    }

    #[test]
    fn envelope_rejects_bad_magic() {
        let mut buf = serialize(&Envelope::new(Message::VerAck));
        buf[0] ^= 0xff;
        assert!(matches!(
            Envelope::decode(&mut io::Cursor::new(&buf)),
            Err(Error::InvalidMagic(_))
        ));
    }

    #[test]
    fn envelope_rejects_corrupted_payload() {
        let mut buf = serialize(&Envelope::new(Message::VerAck));
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(
            Envelope::decode(&mut io::Cursor::new(&buf)),
            Err(Error::InvalidChecksum)
        ));
    }

    #[qcheck_macros::quickcheck]
    fn prop_object_hash_is_deterministic(payload: Vec<u8>) -> bool {
        object_hash(&payload) == object_hash(&payload)
    }
}
