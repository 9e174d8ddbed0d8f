//! QUIC connection engine for the Quill HTTP toolkit
//!
//! This crate contains the per-connection protocol logic of Quill's QUIC
//! transport: connection ID management, transport parameter negotiation,
//! packet number spaces, packet and datagram assembly, incoming frame
//! dispatch, and stream data reassembly. It contains no networking code and
//! no cryptography; datagrams are exchanged through a channel owned by the
//! caller, and packet protection and the TLS handshake are performed by
//! external components implementing the traits in [`crypto`].
//!
//! The most important type is [`Connection`], which owns all of the above and
//! drives the incoming-packet processing loop for a single connection.

#![warn(missing_docs)]
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::too_many_arguments)]

use std::{fmt, ops};

mod cid_registry;
pub mod coding;
mod packet;
mod range_set;
mod varint;

pub use varint::{VarInt, VarIntBoundsExceeded};

pub mod crypto;
pub mod transport_parameters;

mod connection;
pub use crate::connection::{
    Connection, ConnectionConfig, ConnectionError, Event, IncomingPacket, StreamEvent,
};

mod frame;
pub use crate::frame::{ApplicationClose, ConnectionClose, FrameType};

pub use crate::packet::SpaceId;

mod shared;
pub use crate::shared::{ConnectionId, ConnectionIdentity, ResetToken, Transmit};

#[cfg(test)]
mod tests;

mod transport_error;
pub use crate::transport_error::{Code as TransportErrorCode, Error as TransportError};

/// The QUIC protocol version implemented
const VERSION: u32 = 0x0000_0001;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    /// Shorthand for `self == Side::Client`
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    /// Shorthand for `self == Side::Server`
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Bi => "bidirectional",
            Self::Uni => "unidirectional",
        })
    }
}

/// Identifier for a stream within a particular connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(#[doc(hidden)] pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        let dir = match self.dir() {
            Dir::Uni => "uni",
            Dir::Bi => "bi",
        };
        write!(f, "{} {}directional stream {}", initiator, dir, self.index())
    }
}

impl StreamId {
    /// Construct an identifier from its parts
    pub fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self(index << 2 | (dir as u64) << 1 | initiator as u64)
    }
    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }
    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 { Dir::Bi } else { Dir::Uni }
    }
    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl coding::Codec for StreamId {
    fn decode<B: bytes::Buf>(buf: &mut B) -> coding::Result<Self> {
        VarInt::decode(buf).map(|x| Self(x.into_inner()))
    }
    fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
        VarInt::from_u64(self.0).unwrap().encode(buf);
    }
}

//
// Useful internal constants
//

/// The maximum number of CIDs we bother to issue per connection
const LOC_CID_COUNT: u64 = 8;
const RESET_TOKEN_SIZE: usize = 16;
const MAX_CID_SIZE: usize = 20;
/// Minimum size of a datagram carrying an Initial packet
const MIN_INITIAL_SIZE: usize = 1200;
/// Maximum number of streams that can be uniquely identified by a stream ID
const MAX_STREAM_COUNT: u64 = 1 << 60;
