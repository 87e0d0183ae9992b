use std::io;

use super::{object_hash, Decode, Encode, Error, NetAddress};

/// A 32-byte object hash, used both as an inventory vector and as the key
/// into [`requested_objects`](crate::peer::Peer).
pub type Hash = [u8; 32];

/// An inventory vector: shorthand for "the object with this hash".
pub type InvVect = Hash;

/// The decoded body of an `Object` message. The concrete object kinds carry
/// no semantics at this layer beyond their wire shape; validating their
/// contents is the object manager's job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectPayload {
    GetPubKey {
        nonce: u64,
        expires: i64,
        ripe: [u8; 20],
    },
    PubKey {
        nonce: u64,
        expires: i64,
        stream: u32,
        data: Vec<u8>,
    },
    Msg {
        nonce: u64,
        expires: i64,
        encrypted: Vec<u8>,
    },
    Broadcast {
        nonce: u64,
        expires: i64,
        tag: [u8; 32],
        encrypted: Vec<u8>,
    },
    /// An object of a type this engine does not interpret. Carried opaquely
    /// so that the object manager, which may support more kinds than the
    /// peer engine does, can still store and relay it.
    Unknown {
        object_type: u32,
        nonce: u64,
        expires: i64,
        stream: u32,
        payload: Vec<u8>,
    },
}

impl ObjectPayload {
    /// The canonical hash used as this object's inventory vector.
    pub fn hash(&self) -> Hash {
        object_hash(&super::serialize(self))
    }
}

const OBJECT_TYPE_GETPUBKEY: u32 = 0;
const OBJECT_TYPE_PUBKEY: u32 = 1;
const OBJECT_TYPE_MSG: u32 = 2;
const OBJECT_TYPE_BROADCAST: u32 = 3;

impl Encode for ObjectPayload {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            Self::GetPubKey {
                nonce,
                expires,
                ripe,
            } => {
                let mut n = OBJECT_TYPE_GETPUBKEY.encode(writer)?;
                n += nonce.encode(writer)?;
                n += expires.encode(writer)?;
                n += ripe.encode(writer)?;
                Ok(n)
            }
            Self::PubKey {
                nonce,
                expires,
                stream,
                data,
            } => {
                let mut n = OBJECT_TYPE_PUBKEY.encode(writer)?;
                n += nonce.encode(writer)?;
                n += expires.encode(writer)?;
                n += stream.encode(writer)?;
                n += data.encode(writer)?;
                Ok(n)
            }
            Self::Msg {
                nonce,
                expires,
                encrypted,
            } => {
                let mut n = OBJECT_TYPE_MSG.encode(writer)?;
                n += nonce.encode(writer)?;
                n += expires.encode(writer)?;
                n += encrypted.encode(writer)?;
                Ok(n)
            }
            Self::Broadcast {
                nonce,
                expires,
                tag,
                encrypted,
            } => {
                let mut n = OBJECT_TYPE_BROADCAST.encode(writer)?;
                n += nonce.encode(writer)?;
                n += expires.encode(writer)?;
                n += tag.encode(writer)?;
                n += encrypted.encode(writer)?;
                Ok(n)
            }
            Self::Unknown {
                object_type,
                nonce,
                expires,
                stream,
                payload,
            } => {
                let mut n = object_type.encode(writer)?;
                n += nonce.encode(writer)?;
                n += expires.encode(writer)?;
                n += stream.encode(writer)?;
                n += payload.encode(writer)?;
                Ok(n)
            }
        }
    }
}

impl Decode for ObjectPayload {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let object_type = u32::decode(reader)?;
        let nonce = u64::decode(reader)?;
        let expires = i64::decode(reader)?;

        Ok(match object_type {
            OBJECT_TYPE_GETPUBKEY => {
                let ripe = Decode::decode(reader)?;
                Self::GetPubKey {
                    nonce,
                    expires,
                    ripe,
                }
            }
            OBJECT_TYPE_PUBKEY => {
                let stream = u32::decode(reader)?;
                let data = Decode::decode(reader)?;
                Self::PubKey {
                    nonce,
                    expires,
                    stream,
                    data,
                }
            }
            OBJECT_TYPE_MSG => {
                let encrypted = Decode::decode(reader)?;
                Self::Msg {
                    nonce,
                    expires,
                    encrypted,
                }
            }
            OBJECT_TYPE_BROADCAST => {
                let tag = Decode::decode(reader)?;
                let encrypted = Decode::decode(reader)?;
                Self::Broadcast {
                    nonce,
                    expires,
                    tag,
                    encrypted,
                }
            }
            other => {
                let stream = u32::decode(reader)?;
                let payload = Decode::decode(reader)?;
                Self::Unknown {
                    object_type: other,
                    nonce,
                    expires,
                    stream,
                    payload,
                }
            }
        })
    }
}

/// The node-to-node wire message. Every variant corresponds to one of the
/// component design operations: `Version`/`VerAck` drive the handshake,
/// `Addr`/`Inv`/`GetData`/`Object` drive the steady-state protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Version {
        protocol_version: u32,
        services: u64,
        timestamp: i64,
        addr_recv: NetAddress,
        addr_from: NetAddress,
        nonce: u64,
        user_agent: String,
        streams: Vec<u32>,
    },
    VerAck,
    Addr(Vec<NetAddress>),
    Inv(Vec<InvVect>),
    GetData(Vec<InvVect>),
    Object(ObjectPayload),
}

impl Message {
    /// Short command name, for logging; mirrors how the reference protocol
    /// names messages on the wire.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Version { .. } => "version",
            Self::VerAck => "verack",
            Self::Addr(_) => "addr",
            Self::Inv(_) => "inv",
            Self::GetData(_) => "getdata",
            Self::Object(_) => "object",
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Version {
                user_agent, nonce, ..
            } => write!(f, "version({user_agent}, nonce={nonce})"),
            Self::VerAck => write!(f, "verack"),
            Self::Addr(addrs) => write!(f, "addr({} entries)", addrs.len()),
            Self::Inv(inv) => write!(f, "inv({} entries)", inv.len()),
            Self::GetData(inv) => write!(f, "getdata({} entries)", inv.len()),
            Self::Object(payload) => write!(f, "object({})", payload.hash_hex_prefix()),
        }
    }
}

impl ObjectPayload {
    fn hash_hex_prefix(&self) -> String {
        let hash = self.hash();
        hash[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

const TAG_VERSION: u8 = 0;
const TAG_VERACK: u8 = 1;
const TAG_ADDR: u8 = 2;
const TAG_INV: u8 = 3;
const TAG_GETDATA: u8 = 4;
const TAG_OBJECT: u8 = 5;

impl Encode for Message {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            Self::Version {
                protocol_version,
                services,
                timestamp,
                addr_recv,
                addr_from,
                nonce,
                user_agent,
                streams,
            } => {
                let mut n = TAG_VERSION.encode(writer)?;
                n += protocol_version.encode(writer)?;
                n += services.encode(writer)?;
                n += timestamp.encode(writer)?;
                n += addr_recv.encode(writer)?;
                n += addr_from.encode(writer)?;
                n += nonce.encode(writer)?;
                n += user_agent.encode(writer)?;
                n += streams.encode(writer)?;
                Ok(n)
            }
            Self::VerAck => TAG_VERACK.encode(writer),
            Self::Addr(addrs) => {
                let mut n = TAG_ADDR.encode(writer)?;
                n += addrs.encode(writer)?;
                Ok(n)
            }
            Self::Inv(inv) => {
                let mut n = TAG_INV.encode(writer)?;
                n += inv.encode(writer)?;
                Ok(n)
            }
            Self::GetData(inv) => {
                let mut n = TAG_GETDATA.encode(writer)?;
                n += inv.encode(writer)?;
                Ok(n)
            }
            Self::Object(payload) => {
                let mut n = TAG_OBJECT.encode(writer)?;
                n += payload.encode(writer)?;
                Ok(n)
            }
        }
    }
}

impl Decode for Message {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let tag = u8::decode(reader)?;
        Ok(match tag {
            TAG_VERSION => Self::Version {
                protocol_version: u32::decode(reader)?,
                services: u64::decode(reader)?,
                timestamp: i64::decode(reader)?,
                addr_recv: NetAddress::decode(reader)?,
                addr_from: NetAddress::decode(reader)?,
                nonce: u64::decode(reader)?,
                user_agent: String::decode(reader)?,
                streams: Vec::decode(reader)?,
            },
            TAG_VERACK => Self::VerAck,
            TAG_ADDR => Self::Addr(Vec::decode(reader)?),
            TAG_INV => Self::Inv(Vec::decode(reader)?),
            TAG_GETDATA => Self::GetData(Vec::decode(reader)?),
            TAG_OBJECT => Self::Object(ObjectPayload::decode(reader)?),
            other => return Err(Error::UnknownCommand(other.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{deserialize, serialize};

    fn sample_net_address() -> NetAddress {
        NetAddress::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 8444, 1, 1)
    }

    #[test]
    fn version_round_trips() {
        let msg = Message::Version {
            protocol_version: 3,
            services: 1,
            timestamp: 1_700_000_000,
            addr_recv: sample_net_address(),
            addr_from: sample_net_address(),
            nonce: 0xdead_beef,
            user_agent: "/bmd:0.1.0/".to_string(),
            streams: vec![1],
        };
        let buf = serialize(&msg);
        let decoded: Message = deserialize(&buf).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn inv_round_trips() {
        let msg = Message::Inv(vec![[1u8; 32], [2u8; 32]]);
        let buf = serialize(&msg);
        let decoded: Message = deserialize(&buf).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn object_hash_matches_across_encodes() {
        let payload = ObjectPayload::Msg {
            nonce: 7,
            expires: 1_800_000_000,
            encrypted: vec![9, 9, 9],
        };
        assert_eq!(payload.hash(), payload.clone().hash());
    }

    #[test]
    fn unknown_object_type_round_trips_opaquely() {
        let payload = ObjectPayload::Unknown {
            object_type: 99,
            nonce: 1,
            expires: 2,
            stream: 1,
            payload: vec![1, 2, 3],
        };
        let buf = serialize(&payload);
        let decoded: ObjectPayload = deserialize(&buf).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn rejects_unknown_command_tag() {
        let buf = vec![0xffu8];
        assert!(matches!(
            deserialize::<Message>(&buf),
            Err(Error::UnknownCommand(_))
        ));
    }
}
