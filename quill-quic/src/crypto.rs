//! Interfaces to the cryptographic components backing a connection
//!
//! The connection engine is deliberately crypto-free: packet protection and
//! the TLS handshake live behind these traits. Implementations are expected
//! to be deterministic; a sealing failure indicates an internal bug or a
//! corrupted key schedule, both unrecoverable for the connection.

use bytes::Bytes;
use thiserror::Error;

use crate::{transport_parameters::TransportParameters, SpaceId, TransportError};

/// AEAD protection applied to finished packets
pub trait PacketProtection: Send + Sync {
    /// Bytes the seal operation appends to a payload
    fn tag_len(&self, space: SpaceId) -> usize;

    /// Protect `payload`, authenticating `header`, returning ciphertext plus tag
    fn seal(
        &self,
        space: SpaceId,
        packet_number: u64,
        header: &[u8],
        payload: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Reverse of [`Self::seal`]
    fn open(
        &self,
        space: SpaceId,
        packet_number: u64,
        header: &[u8],
        payload: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// The TLS state machine driving the handshake byte streams
///
/// Outbound handshake bytes are produced independently by the driver and
/// reach the engine through the [`HandshakeMessage`] channel given to
/// [`Connection::start`](crate::Connection::start); this trait covers the
/// calls the engine makes into the driver.
pub trait HandshakeDriver: Send + Sync {
    /// Feed reassembled peer CRYPTO payload at the given level
    ///
    /// Returns `true` once the handshake has completed.
    fn read_handshake(
        &self,
        space: SpaceId,
        data: &[u8],
        flush: bool,
    ) -> Result<bool, TransportError>;

    /// Called once the peer's transport parameters are known; returns the
    /// local parameter set, finalizing negotiation
    fn peer_params_received(&self, peer: &TransportParameters) -> TransportParameters;
}

/// An outbound handshake payload to be wrapped in CRYPTO frames
#[derive(Debug)]
pub struct HandshakeMessage {
    /// Encryption level the payload belongs to
    pub space: SpaceId,
    /// Opaque handshake bytes
    pub data: Bytes,
    /// Whether buffered packets should be flushed to the wire immediately
    pub flush: bool,
}

/// Error from the packet protection component
///
/// Always fatal to the connection; sealing is never retried.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[error("packet protection failed: {0}")]
pub struct CryptoError(pub &'static str);
