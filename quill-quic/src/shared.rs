use std::{fmt, net::SocketAddr, ops};

use bytes::{Buf, BufMut};
use rand::RngCore;

use crate::{MAX_CID_SIZE, RESET_TOKEN_SIZE};

/// Protocol-level identifier for a connection.
///
/// Mainly useful for identifying this connection's packets on the wire with tools like Wireshark.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Construct cid from byte array
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    /// Construct cid of length `len` from freshly generated random bytes
    pub fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut res.bytes[..len]);
        res
    }

    /// Constructs cid by reading `len` bytes from a `Buf`
    ///
    /// Callers need to assure that `buf.remaining() >= len`
    pub(crate) fn from_buf(buf: &mut impl Buf, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        buf.copy_to_slice(&mut res[..len]);
        res
    }

    /// Decode from long header format
    pub(crate) fn decode_long(buf: &mut impl Buf) -> Option<Self> {
        let len = if buf.has_remaining() {
            buf.get_u8() as usize
        } else {
            return None;
        };
        if len > MAX_CID_SIZE || buf.remaining() < len {
            return None;
        }
        Some(Self::from_buf(buf, len))
    }

    /// Encode in long header format
    pub(crate) fn encode_long(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.len() as u8);
        buf.put_slice(self);
    }
}

impl ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl ops::DerefMut for ConnectionId {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConnectionId {}

/// Stateless reset token
///
/// Used for an endpoint to securely communicate that it has lost state for a connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ResetToken([u8; RESET_TOKEN_SIZE]);

impl ResetToken {
    pub(crate) fn random<R: RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0; RESET_TOKEN_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl From<[u8; RESET_TOKEN_SIZE]> for ResetToken {
    fn from(x: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(x)
    }
}

impl ops::Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

/// An outgoing datagram, addressed and ready for the wire
#[derive(Debug)]
pub struct Transmit {
    /// The socket this datagram should be sent to
    pub destination: SocketAddr,
    /// Contents of the datagram
    pub contents: Box<[u8]>,
}

/// A connection's fixed identifiers, immutable for the connection's lifetime
#[derive(Debug, Clone)]
pub struct ConnectionIdentity {
    /// The CID this endpoint chose during the handshake
    pub local_cid: ConnectionId,
    /// The CID the peer chose during the handshake
    pub peer_cid: ConnectionId,
    /// Destination CID of the very first Initial packet, chosen by the client
    pub original_dst_cid: ConnectionId,
    /// Length of locally issued CIDs; zero disables CID-based routing for this endpoint
    pub local_cid_len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_coding() {
        let cid = ConnectionId::new(&[0xab; 9]);
        let mut buf = Vec::new();
        cid.encode_long(&mut buf);
        assert_eq!(buf.len(), 10);
        assert_eq!(ConnectionId::decode_long(&mut &buf[..]), Some(cid));

        // Length byte claiming more data than the buffer holds
        assert_eq!(ConnectionId::decode_long(&mut &buf[..5]), None);
    }

    #[test]
    fn cid_display() {
        let cid = ConnectionId::new(&[0x0f, 0xf0]);
        assert_eq!(cid.to_string(), "0ff0");
    }
}
