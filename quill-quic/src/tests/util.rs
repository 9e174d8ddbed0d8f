use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    coding::BufMutExt,
    crypto::{CryptoError, HandshakeDriver, HandshakeMessage, PacketProtection},
    shared::ConnectionId,
    transport_parameters::TransportParameters,
    Connection, ConnectionConfig, ConnectionError, ConnectionIdentity, Event, IncomingPacket,
    Side, SpaceId, Transmit, TransportError,
};

pub(super) const TAG: usize = 16;
pub(super) const CID_LEN: usize = 8;

/// Packet protection that appends a fixed tag; stands in for the TLS layer
pub(super) struct NullProtection;

impl PacketProtection for NullProtection {
    fn tag_len(&self, _space: SpaceId) -> usize {
        TAG
    }

    fn seal(
        &self,
        _space: SpaceId,
        _packet_number: u64,
        _header: &[u8],
        payload: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut out = payload.to_vec();
        out.extend_from_slice(&[0xa5; TAG]);
        Ok(out)
    }

    fn open(
        &self,
        _space: SpaceId,
        _packet_number: u64,
        _header: &[u8],
        payload: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if payload.len() < TAG {
            return Err(CryptoError("truncated payload"));
        }
        Ok(payload[..payload.len() - TAG].to_vec())
    }
}

/// Handshake driver scripted for tests: any flight ending in "fin" completes
pub(super) struct ScriptedHandshake;

impl HandshakeDriver for ScriptedHandshake {
    fn read_handshake(
        &self,
        _space: SpaceId,
        data: &[u8],
        _flush: bool,
    ) -> Result<bool, TransportError> {
        Ok(data.ends_with(b"fin"))
    }

    fn peer_params_received(&self, _peer: &TransportParameters) -> TransportParameters {
        params()
    }
}

pub(super) fn params() -> TransportParameters {
    TransportParameters {
        initial_max_data: 1_048_576u32.into(),
        initial_max_stream_data_bidi_local: 65_536u32.into(),
        initial_max_stream_data_bidi_remote: 65_536u32.into(),
        initial_max_stream_data_uni: 65_536u32.into(),
        initial_max_streams_bidi: 16u32.into(),
        initial_max_streams_uni: 16u32.into(),
        active_connection_id_limit: 4u32.into(),
        max_udp_payload_size: 1452u32.into(),
        ..TransportParameters::default()
    }
}

pub(super) fn client_cid() -> ConnectionId {
    ConnectionId::new(&[0xc1; CID_LEN])
}

pub(super) fn server_cid() -> ConnectionId {
    ConnectionId::new(&[0x5e; CID_LEN])
}

pub(super) struct Endpoint {
    pub(super) conn: Connection,
    local_cid: ConnectionId,
    pub(super) transmits: mpsc::UnboundedReceiver<Transmit>,
    pub(super) events: mpsc::UnboundedReceiver<Event>,
    pub(super) handshake_tx: mpsc::UnboundedSender<HandshakeMessage>,
    /// Packet numbers for frames injected as if sent by the peer
    peer_pn: [u64; 3],
}

impl Endpoint {
    pub(super) fn new(side: Side) -> Self {
        let (local_cid, peer_cid) = match side {
            Side::Client => (client_cid(), server_cid()),
            Side::Server => (server_cid(), client_cid()),
        };
        Self::new_with_cids(side, local_cid, peer_cid)
    }

    pub(super) fn new_with_cids(
        side: Side,
        local_cid: ConnectionId,
        peer_cid: ConnectionId,
    ) -> Self {
        let (conn, transmits, events) = Connection::new(ConnectionConfig {
            side,
            remote: "[::1]:4433".parse().unwrap(),
            identity: ConnectionIdentity {
                local_cid,
                peer_cid,
                original_dst_cid: server_cid(),
                local_cid_len: local_cid.len(),
            },
            protection: Arc::new(NullProtection),
            handshake: Arc::new(ScriptedHandshake),
        });
        let (handshake_tx, handshake_rx) = mpsc::unbounded_channel();
        conn.start(handshake_rx);
        Self {
            conn,
            local_cid,
            transmits,
            events,
            handshake_tx,
            peer_pn: [0; 3],
        }
    }

    /// Move injected packet numbers past those used during `connect`
    pub(super) fn skip_peer_packet_numbers(&mut self) {
        self.peer_pn = [16; 3];
    }

    /// Wait briefly for the next outgoing datagram
    pub(super) async fn next_transmit(&mut self) -> Option<Transmit> {
        tokio::time::timeout(Duration::from_millis(200), self.transmits.recv())
            .await
            .ok()
            .flatten()
    }

    pub(super) fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Inject already-"decrypted" frames as a packet from the peer
    pub(super) async fn inject(
        &mut self,
        space: SpaceId,
        payload: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        let dst_cid = self.local_cid();
        self.inject_to(space, dst_cid, payload).await
    }

    /// Same as [`Self::inject`] but addressed to an arbitrary CID
    pub(super) async fn inject_to(
        &mut self,
        space: SpaceId,
        dst_cid: ConnectionId,
        payload: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        let number = self.peer_pn[space as usize];
        self.peer_pn[space as usize] += 1;
        self.conn
            .handle_packet(IncomingPacket {
                space,
                number,
                dst_cid,
                payload: payload.into(),
            })
            .await
    }

    pub(super) fn local_cid(&self) -> ConnectionId {
        self.local_cid
    }
}

/// Run both sides through the scripted handshake and parameter negotiation
pub(super) async fn connect() -> (Endpoint, Endpoint) {
    let mut client = Endpoint::new(Side::Client);
    let mut server = Endpoint::new(Side::Server);

    // Client's first flight
    client
        .handshake_tx
        .send(HandshakeMessage {
            space: SpaceId::Initial,
            data: Bytes::from_static(b"client hello"),
            flush: true,
        })
        .unwrap();
    let flight = client.next_transmit().await.expect("client initial flight");
    server
        .conn
        .handle_datagram(Bytes::copy_from_slice(&flight.contents))
        .await
        .unwrap();

    // Server finishes at the handshake level
    server
        .handshake_tx
        .send(HandshakeMessage {
            space: SpaceId::Handshake,
            data: Bytes::from_static(b"server fin"),
            flush: true,
        })
        .unwrap();
    pump(&mut server, &mut client).await;

    // Client's finish completes the server too
    client
        .handshake_tx
        .send(HandshakeMessage {
            space: SpaceId::Handshake,
            data: Bytes::from_static(b"client fin"),
            flush: true,
        })
        .unwrap();
    pump(&mut client, &mut server).await;

    // Each side surfaces the other's transport parameters
    let mut raw = Vec::new();
    params().write(Side::Client, &mut raw);
    server.conn.peer_transport_parameters(&raw).await.unwrap();
    let mut raw = Vec::new();
    params().write(Side::Server, &mut raw);
    client.conn.peer_transport_parameters(&raw).await.unwrap();

    // Let queued protocol frames (CID issuance, HANDSHAKE_DONE) settle
    pump(&mut client, &mut server).await;
    pump(&mut server, &mut client).await;

    client.drain_events();
    server.drain_events();
    drain_transmits(&mut client).await;
    drain_transmits(&mut server).await;
    client.skip_peer_packet_numbers();
    server.skip_peer_packet_numbers();
    (client, server)
}

/// Deliver everything `from` has queued to `to`, dropping `to`'s replies
pub(super) async fn pump(from: &mut Endpoint, to: &mut Endpoint) {
    while let Some(transmit) = next_now(from).await {
        let _ = to
            .conn
            .handle_datagram(Bytes::copy_from_slice(&transmit.contents))
            .await;
    }
}

pub(super) async fn drain_transmits(endpoint: &mut Endpoint) {
    while next_now(endpoint).await.is_some() {}
}

async fn next_now(endpoint: &mut Endpoint) -> Option<Transmit> {
    tokio::time::timeout(Duration::from_millis(50), endpoint.transmits.recv())
        .await
        .ok()
        .flatten()
}

//
// Frame encoding helpers for injected packets
//

pub(super) fn ping_frame() -> Vec<u8> {
    vec![0x01]
}

pub(super) fn new_cid_frame(
    sequence: u64,
    retire_prior_to: u64,
    id: ConnectionId,
    token_byte: u8,
) -> Vec<u8> {
    let mut buf = Vec::new();
    crate::frame::NewConnectionId {
        sequence,
        retire_prior_to,
        id,
        reset_token: [token_byte; TAG].into(),
    }
    .encode(&mut buf);
    buf
}

pub(super) fn retire_cid_frame(sequence: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write(crate::frame::FrameType::RETIRE_CONNECTION_ID);
    buf.write_var(sequence);
    buf
}

pub(super) fn path_challenge_frame(token: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write(crate::frame::FrameType::PATH_CHALLENGE);
    buf.write(token);
    buf
}

pub(super) fn new_token_frame(token: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    crate::frame::NewToken {
        token: Bytes::copy_from_slice(token),
    }
    .encode(&mut buf);
    buf
}

pub(super) fn handshake_done_frame() -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write(crate::frame::FrameType::HANDSHAKE_DONE);
    buf
}

pub(super) fn stream_frame(id: crate::StreamId, offset: u64, data: &[u8], fin: bool) -> Vec<u8> {
    let mut buf = Vec::new();
    crate::frame::Stream {
        id,
        offset,
        fin,
        data: Bytes::copy_from_slice(data),
    }
    .encode(true, &mut buf);
    buf
}

/// Whether `haystack` contains `needle` as a contiguous byte run
pub(super) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
