use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, trace};

use crate::{
    cid_registry::{CidEntry, CidRegistry},
    coding::BufMutExt,
    crypto::{CryptoError, HandshakeDriver, HandshakeMessage, PacketProtection},
    frame::{self, ApplicationClose, Close, ConnectionClose, Frame},
    packet::{self, Header, PacketDecodeError, SpaceId},
    shared::{ConnectionId, ConnectionIdentity, ResetToken, Transmit},
    transport_parameters::TransportParameters,
    Dir, Side, StreamId, TransportError, VarInt, LOC_CID_COUNT, MAX_STREAM_COUNT,
};

mod assembler;
mod pipeline;
mod spaces;
mod state;
mod streams;

use pipeline::{DatagramBuffer, PacketAssembler};
use spaces::PacketSpace;
use state::State;
use streams::StreamsState;

/// A decrypted incoming packet, ready for frame dispatch
#[derive(Debug)]
pub struct IncomingPacket {
    /// Encryption level the packet arrived at
    pub space: SpaceId,
    /// Full (expanded) packet number
    pub number: u64,
    /// Destination CID the packet was addressed to
    pub dst_cid: ConnectionId,
    /// Decrypted frame bytes
    pub payload: Bytes,
}

/// Parameters for constructing a [`Connection`]
pub struct ConnectionConfig {
    /// Which end of the connection this endpoint is
    pub side: Side,
    /// Address datagrams are sent to
    pub remote: SocketAddr,
    /// The connection's fixed identifiers
    pub identity: ConnectionIdentity,
    /// Packet protection component
    pub protection: Arc<dyn PacketProtection>,
    /// TLS handshake component
    pub handshake: Arc<dyn HandshakeDriver>,
}

/// Events a connection reports to its owner
#[derive(Debug)]
pub enum Event {
    /// Transport parameters have been negotiated; the connection is established
    Established,
    /// The TLS handshake has completed
    HandshakeComplete,
    /// A stream-level event
    Stream(StreamEvent),
    /// The server supplied a token for use in future connections
    NewToken(Bytes),
    /// The connection was terminated
    ConnectionLost {
        /// Why the connection ended
        reason: ConnectionError,
    },
}

/// Application-visible stream activity
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamEvent {
    /// The peer referenced this stream id for the first time
    Opened {
        /// Affected stream
        id: StreamId,
    },
    /// In-order data is ready for reading
    Readable {
        /// Affected stream
        id: StreamId,
    },
    /// The peer finished or reset the stream; all data has been delivered
    Finished {
        /// Affected stream
        id: StreamId,
    },
}

/// Reasons why a connection is no longer usable
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConnectionError {
    /// The peer violated the QUIC specification as understood by this implementation
    #[error(transparent)]
    TransportError(#[from] TransportError),
    /// The peer closed the connection
    #[error("closed by peer: {0}")]
    ConnectionClosed(ConnectionClose),
    /// The peer's application closed the connection
    #[error("closed by peer application: {0}")]
    ApplicationClosed(ApplicationClose),
    /// The packet protection component failed; presumed unrecoverable
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// The connection was closed on this end
    #[error("connection closed locally")]
    LocallyClosed,
    /// The operation requires an established connection
    #[error("connection not yet established")]
    NotEstablished,
}

/// Protocol state for a single QUIC connection
///
/// Owns the connection ID registries, packet number spaces, transmission
/// pipelines and stream state, and drives the incoming-packet processing
/// loop. Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    side: Side,
    identity: ConnectionIdentity,
    remote: SocketAddr,
    protection: Arc<dyn PacketProtection>,
    handshake: Arc<dyn HandshakeDriver>,
    transmits: mpsc::UnboundedSender<Transmit>,
    events: mpsc::UnboundedSender<Event>,
    /// Peer-advertised ceiling on outgoing datagram size; 1200 until negotiated
    max_payload: AtomicUsize,
    /// Set once the connection reaches `Closed`; nothing is flushed after
    closed: AtomicBool,
    /// Per-encryption-level packet buffers; writers for different levels
    /// proceed independently
    assemblers: [AsyncMutex<PacketAssembler>; 3],
    datagram: StdMutex<DatagramBuffer>,
    state: StdMutex<ConnState>,
    /// Incoming-packet handling is strictly sequential
    recv_gate: AsyncMutex<()>,
    stream_tx: StdMutex<Option<mpsc::UnboundedSender<StreamWrite>>>,
}

struct ConnState {
    state: State,
    local_params: Option<TransportParameters>,
    peer_params: Option<TransportParameters>,
    spaces: [PacketSpace; 3],
    /// Highest encryption level with usable keys
    highest_space: SpaceId,
    /// IDs we issued for the peer to address us with
    loc_cids: CidRegistry,
    /// IDs the peer issued for us to address it with
    rem_cids: CidRegistry,
    /// Number of local connection IDs issued so far; sequence numbers at or
    /// past this were never issued
    cids_issued: u64,
    handshake_complete: bool,
    /// Token to include in Initial packets, learned from a Retry
    retry_token: Bytes,
    /// Source CID of a Retry packet, used until the peer issues CIDs
    retry_src_cid: Option<ConnectionId>,
    streams: StreamsState,
}

/// A queued application write, drained in order by the send loop
struct StreamWrite {
    id: StreamId,
    data: Bytes,
    fin: bool,
}

/// Synchronous outcomes of dispatching one packet's frames
#[derive(Default)]
struct Actions {
    /// Send an ACK for the packet's space without waiting for other data
    ack_now: bool,
    /// The peer closed the connection
    remote_close: Option<ConnectionError>,
}

impl Connection {
    /// Construct a connection, returning the datagram and event receivers
    ///
    /// Registries start at the protocol-default capacity of two; the real
    /// sizes are applied when [`Self::peer_transport_parameters`] fires.
    pub fn new(
        config: ConnectionConfig,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<Transmit>,
        mpsc::UnboundedReceiver<Event>,
    ) {
        let (transmit_tx, transmit_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let conn = Self {
            shared: Arc::new(Shared {
                side: config.side,
                identity: config.identity,
                remote: config.remote,
                protection: config.protection,
                handshake: config.handshake,
                transmits: transmit_tx,
                events: event_tx,
                max_payload: AtomicUsize::new(crate::MIN_INITIAL_SIZE),
                closed: AtomicBool::new(false),
                assemblers: [
                    AsyncMutex::new(PacketAssembler::new(SpaceId::Initial)),
                    AsyncMutex::new(PacketAssembler::new(SpaceId::Handshake)),
                    AsyncMutex::new(PacketAssembler::new(SpaceId::Data)),
                ],
                datagram: StdMutex::new(DatagramBuffer::default()),
                state: StdMutex::new(ConnState {
                    state: State::new(),
                    local_params: None,
                    peer_params: None,
                    spaces: [PacketSpace::new(), PacketSpace::new(), PacketSpace::new()],
                    highest_space: SpaceId::Initial,
                    loc_cids: CidRegistry::new(2),
                    rem_cids: CidRegistry::new(2),
                    cids_issued: 0,
                    handshake_complete: false,
                    retry_token: Bytes::new(),
                    retry_src_cid: None,
                    streams: StreamsState::new(config.side),
                }),
                recv_gate: AsyncMutex::new(()),
                stream_tx: StdMutex::new(None),
            }),
        };
        (conn, transmit_rx, event_rx)
    }

    /// Spawn the connection's worker loops on the current tokio runtime
    ///
    /// `handshake_rx` carries outbound handshake payloads emitted by the
    /// cryptographic component; the relay loop wraps them in CRYPTO frames.
    /// The stream send loop drains application writes in order. Both loops
    /// end cleanly when their queue closes.
    pub fn start(&self, mut handshake_rx: mpsc::UnboundedReceiver<HandshakeMessage>) {
        let (tx, mut stream_rx) = mpsc::unbounded_channel();
        {
            let mut slot = self.shared.stream_tx.lock().unwrap();
            assert!(slot.is_none(), "connection started twice");
            *slot = Some(tx);
        }

        let conn = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = handshake_rx.recv().await {
                if let Err(e) = conn.transmit_handshake(msg).await {
                    debug!("handshake relay stopped: {e}");
                    break;
                }
            }
            trace!("handshake relay closed");
        });

        let conn = self.clone();
        tokio::spawn(async move {
            while let Some(write) = stream_rx.recv().await {
                let flush_now = stream_rx.is_empty();
                if let Err(e) = conn.transmit_stream_write(write, flush_now).await {
                    debug!("stream send loop stopped: {e}");
                    break;
                }
            }
            trace!("stream send queue closed");
        });
    }

    /// Whether transport parameters have been negotiated
    pub fn is_established(&self) -> bool {
        self.shared.state.lock().unwrap().state.is_established()
    }

    /// Whether the connection has fully shut down
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().state.is_closed()
    }

    /// Whether packets sent at `space` remain unacknowledged
    pub fn outstanding_packets(&self, space: SpaceId) -> bool {
        self.shared.state.lock().unwrap().spaces[space].has_unacked()
    }

    /// The transport parameters received from the peer, if negotiated
    pub fn peer_parameters(&self) -> Option<TransportParameters> {
        self.shared.state.lock().unwrap().peer_params
    }

    /// This endpoint's own transport parameters, if negotiation has finished
    pub fn local_parameters(&self) -> Option<TransportParameters> {
        self.shared.state.lock().unwrap().local_params
    }

    /// Feed an incoming datagram from the datagram channel
    ///
    /// Splits coalesced packets, removes packet protection through the
    /// external component, and dispatches each packet. Undecryptable packets
    /// are dropped; malformed datagrams are ignored.
    pub async fn handle_datagram(&self, datagram: Bytes) -> Result<(), ConnectionError> {
        let packets =
            match packet::decode_datagram(datagram, self.shared.identity.local_cid_len) {
                Ok(packets) => packets,
                Err(PacketDecodeError::UnsupportedVersion {
                    source,
                    destination,
                }) => {
                    if self.shared.side.is_server() {
                        // Single-version endpoint: offer ours, header-only
                        self.send_header_only(&Header::VersionNegotiate {
                            src_cid: destination,
                            dst_cid: source,
                        });
                    }
                    return Ok(());
                }
                Err(e) => {
                    debug!("malformed datagram: {e}");
                    return Ok(());
                }
            };
        for proto in packets {
            match proto.header {
                Header::Retry { src_cid, token, .. } => self.on_retry(src_cid, token),
                Header::VersionNegotiate { .. } => {
                    trace!("ignoring version negotiation");
                }
                ref header => {
                    let space = header.space().expect("non-stateless packets have a space");
                    let number = {
                        let st = self.shared.state.lock().unwrap();
                        header
                            .number()
                            .expect("non-stateless packets are numbered")
                            .expand(st.spaces[space].rx_packet)
                    };
                    let payload = match self.shared.protection.open(
                        space,
                        number,
                        &proto.header_bytes,
                        &proto.payload,
                    ) {
                        Ok(x) => x,
                        Err(e) => {
                            debug!("discarding undecryptable packet: {e}");
                            continue;
                        }
                    };
                    self.handle_packet(IncomingPacket {
                        space,
                        number,
                        dst_cid: *header.dst_cid(),
                        payload: payload.into(),
                    })
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Process one decrypted packet
    ///
    /// Packets are handled strictly sequentially; a terminal error closes the
    /// connection and is also returned to the caller.
    pub async fn handle_packet(&self, packet: IncomingPacket) -> Result<(), ConnectionError> {
        let _gate = self.shared.recv_gate.lock().await;
        let mut events = Vec::new();
        let outcome = {
            let mut st = self.shared.state.lock().unwrap();
            if !st.state.is_active() {
                trace!("dropping packet for inactive connection");
                return Ok(());
            }
            self.process(&mut st, &packet, &mut events)
        };
        for event in events {
            let _ = self.shared.events.send(event);
        }
        match outcome {
            Ok(actions) => {
                if let Some(reason) = actions.remote_close {
                    self.on_remote_close(reason);
                    return Ok(());
                }
                self.flush_pending(packet.space, actions.ack_now).await
            }
            Err(error) => {
                self.fail(error.clone()).await;
                Err(ConnectionError::TransportError(error))
            }
        }
    }

    /// Hand the peer's raw transport parameters to the connection
    ///
    /// Called by the owner once the cryptographic component surfaces the
    /// peer's parameter extension. Decodes and validates the set, sizes and
    /// seeds both CID registries, snapshots the negotiated limits, and moves
    /// the connection to `Established`. Returns the peer's decoded set.
    pub async fn peer_transport_parameters(
        &self,
        mut raw: &[u8],
    ) -> Result<TransportParameters, ConnectionError> {
        let peer = match TransportParameters::read(self.shared.side, &mut raw) {
            Ok(peer) => peer,
            Err(e) => {
                let error = TransportError::from(e);
                self.fail(error.clone()).await;
                return Err(error.into());
            }
        };
        // Cross-field constraints are checked here, where the parameters
        // become effective, not during decode
        if let Err(error) = peer.validate() {
            self.fail(error.clone()).await;
            return Err(error.into());
        }
        let local = self.shared.handshake.peer_params_received(&peer);
        {
            let mut st = self.shared.state.lock().unwrap();
            self.apply_negotiated_parameters(&mut st, peer, local);
        }
        let _ = self.shared.events.send(Event::Established);
        // Newly issued CIDs shouldn't wait for the next incoming packet
        self.flush_pending(SpaceId::Data, false).await?;
        Ok(peer)
    }

    /// Queue application data for transmission on `id`
    ///
    /// Never blocks; the dedicated send loop drains writes in order. Writes
    /// are rejected once the connection is closing.
    pub fn write_stream(&self, id: StreamId, data: Bytes, fin: bool) -> Result<(), ConnectionError> {
        {
            let st = self.shared.state.lock().unwrap();
            if !st.state.is_established() {
                return Err(st
                    .state
                    .error()
                    .cloned()
                    .unwrap_or(ConnectionError::NotEstablished));
            }
            if id.dir() == Dir::Uni && id.initiator() != self.shared.side {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "writing to a receive-only stream",
                )
                .into());
            }
            if id.initiator() == self.shared.side && id.index() >= st.streams.max_streams(id.dir())
            {
                return Err(TransportError::STREAM_LIMIT_ERROR(
                    "stream index beyond peer's advertised limit",
                )
                .into());
            }
        }
        let tx = self.shared.stream_tx.lock().unwrap();
        tx.as_ref()
            .ok_or(ConnectionError::NotEstablished)?
            .send(StreamWrite { id, data, fin })
            .map_err(|_| ConnectionError::LocallyClosed)
    }

    /// Pop in-order data delivered on `id`, if any is buffered
    pub fn read_stream(&self, id: StreamId) -> Option<Bytes> {
        self.shared.state.lock().unwrap().streams.read(id)
    }

    /// Close the connection from the application's side
    ///
    /// Emits APPLICATION_CLOSE, flushes it, and stops all further output.
    pub async fn close(&self, error_code: VarInt, reason: Bytes) {
        let space_id = {
            let mut st = self.shared.state.lock().unwrap();
            if !st.state.move_to_closing(ConnectionError::LocallyClosed) {
                return;
            }
            st.highest_space
        };
        let close = Close::Application(ApplicationClose { error_code, reason });
        let max_len = self.max_frame_data(space_id);
        let _ = self
            .write_frame(space_id, |w| close.encode(w.buf, max_len))
            .await;
        let _ = self.finish(space_id).await;
        self.force_end_datagram();
        self.enter_closed(ConnectionError::LocallyClosed);
    }

    //
    // Frame dispatch
    //

    fn process(
        &self,
        st: &mut ConnState,
        packet: &IncomingPacket,
        events: &mut Vec<Event>,
    ) -> Result<Actions, TransportError> {
        let space_id = packet.space;
        if !st.spaces[space_id].receive_packet(packet.number, false) {
            trace!(number = packet.number, "duplicate packet");
            return Ok(Actions::default());
        }
        if space_id == SpaceId::Handshake && st.highest_space == SpaceId::Initial {
            st.highest_space = SpaceId::Handshake;
        }
        if st.state.is_established()
            && self.shared.identity.local_cid_len != 0
            && st.loc_cids.by_id(&packet.dst_cid).is_none()
        {
            trace!(dst_cid = %packet.dst_cid, "packet addressed to an unknown or retired CID");
        }

        let mut actions = Actions::default();
        let mut ack_eliciting = false;
        for result in frame::Iter::new(packet.payload.clone())? {
            let frame = result?;
            let ty = frame.ty();
            trace!(space = ?space_id, %ty, "got frame");
            ack_eliciting |= frame.is_ack_eliciting();
            self.handle_frame(st, packet, frame, events, &mut actions)
                .map_err(|mut e| {
                    if e.frame.is_none() {
                        e.frame = Some(ty);
                    }
                    e
                })?;
        }
        if ack_eliciting {
            st.spaces[space_id].note_ack_eliciting();
        }
        Ok(actions)
    }

    fn handle_frame(
        &self,
        st: &mut ConnState,
        packet: &IncomingPacket,
        frame: Frame,
        events: &mut Vec<Event>,
        actions: &mut Actions,
    ) -> Result<(), TransportError> {
        match frame {
            Frame::Padding => {}
            Frame::Ping => {
                // Nothing to do beyond acknowledging the packet, immediately
                actions.ack_now = true;
            }
            Frame::Ack(ack) => {
                st.spaces[packet.space].on_acks_received(&ack)?;
            }
            Frame::Crypto(crypto) => {
                self.read_crypto(st, packet.space, crypto, events, actions)?;
            }
            Frame::NewToken(frame) => {
                if self.shared.side.is_server() {
                    return Err(TransportError::PROTOCOL_VIOLATION("client sent NEW_TOKEN"));
                }
                if frame.token.is_empty() {
                    return Err(TransportError::FRAME_ENCODING_ERROR("empty token"));
                }
                events.push(Event::NewToken(frame.token));
            }
            Frame::Stream(stream) => {
                st.streams.received(stream, events)?;
            }
            Frame::MaxData(limit) => {
                st.streams.received_max_data(limit.into_inner());
            }
            Frame::MaxStreamData { id, offset } => {
                st.streams.received_max_stream_data(id, offset)?;
            }
            Frame::MaxStreams { dir, count } => {
                if count > MAX_STREAM_COUNT {
                    return Err(TransportError::FRAME_ENCODING_ERROR(
                        "unrepresentable stream limit",
                    ));
                }
                st.streams.received_max_streams(dir, count);
            }
            Frame::DataBlocked { offset } => {
                debug!(offset, "peer claims to be blocked at connection level");
            }
            Frame::StreamDataBlocked { id, offset } => {
                if id.initiator() == self.shared.side && id.dir() == Dir::Uni {
                    return Err(TransportError::STREAM_STATE_ERROR(
                        "STREAM_DATA_BLOCKED on send-only stream",
                    ));
                }
                debug!(%id, offset, "peer claims to be blocked at stream level");
            }
            Frame::StreamsBlocked { dir, limit } => {
                debug!(%dir, limit, "peer claims to be blocked at stream count");
            }
            Frame::NewConnectionId(frame) => {
                self.handle_new_cid(st, frame)?;
            }
            Frame::RetireConnectionId { sequence } => {
                self.handle_retire_cid(st, packet, sequence)?;
            }
            Frame::PathChallenge(token) => {
                // Answered with the identical payload, on the application level
                st.spaces[SpaceId::Data].pending.path_response = Some(token);
                actions.ack_now = true;
            }
            Frame::PathResponse(token) => {
                // Path validation beyond the echo is not performed
                trace!(token, "ignoring PATH_RESPONSE");
            }
            Frame::Close(close) => {
                actions.remote_close = Some(match close {
                    Close::Connection(reason) => ConnectionError::ConnectionClosed(reason),
                    Close::Application(reason) => ConnectionError::ApplicationClosed(reason),
                });
            }
            Frame::HandshakeDone => {
                if self.shared.side.is_server() {
                    return Err(TransportError::PROTOCOL_VIOLATION(
                        "client sent HANDSHAKE_DONE",
                    ));
                }
                trace!("handshake confirmed");
            }
            Frame::ResetStream(frame) => {
                st.streams.received_reset(frame, events)?;
            }
            Frame::StopSending(frame) => {
                trace!(id = %frame.id, "peer stopped reading");
            }
        }
        Ok(())
    }

    fn read_crypto(
        &self,
        st: &mut ConnState,
        space_id: SpaceId,
        crypto: frame::Crypto,
        events: &mut Vec<Event>,
        actions: &mut Actions,
    ) -> Result<(), TransportError> {
        if space_id == SpaceId::Data && st.handshake_complete {
            // Post-handshake CRYPTO (session tickets, key updates) is an
            // explicit gap; fail loudly rather than misbehave silently
            return Err(TransportError::INTERNAL_ERROR(
                "CRYPTO frames after handshake completion are not supported",
            ));
        }
        let space = &mut st.spaces[space_id];
        space.crypto_stream.insert(crypto.offset, crypto.data);
        let mut chunks = Vec::new();
        while let Some(chunk) = space.crypto_stream.read() {
            chunks.push(chunk);
        }
        for chunk in chunks {
            let complete = self
                .shared
                .handshake
                .read_handshake(space_id, &chunk, true)?;
            if complete && !st.handshake_complete {
                trace!("handshake complete");
                st.handshake_complete = true;
                st.highest_space = SpaceId::Data;
                if self.shared.side.is_server() {
                    st.spaces[SpaceId::Data].pending.handshake_done = true;
                }
                // The final handshake flight is acknowledged without delay
                actions.ack_now = true;
                events.push(Event::HandshakeComplete);
            }
        }
        Ok(())
    }

    fn handle_new_cid(
        &self,
        st: &mut ConnState,
        frame: frame::NewConnectionId,
    ) -> Result<(), TransportError> {
        trace!(sequence = frame.sequence, id = %frame.id, "got NEW_CONNECTION_ID");
        if self.shared.identity.peer_cid.is_empty() {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "NEW_CONNECTION_ID when CIDs aren't in use",
            ));
        }
        if st.rem_cids.is_retired(frame.sequence) {
            // Duplicate of a retired ID; silently ignored
            trace!("discarding already-retired CID");
            return Ok(());
        }
        if let Some(existing) = st.rem_cids.by_sequence(frame.sequence) {
            if existing.id != frame.id || existing.reset_token != Some(frame.reset_token) {
                return Err(TransportError::PROTOCOL_VIOLATION(
                    "NEW_CONNECTION_ID sequence number reused for a different ID",
                ));
            }
            // Exact duplicate: return before any other bookkeeping advances
            return Ok(());
        }

        // Newly retired IDs must be announced before the new one becomes usable
        let newly_retired = st.rem_cids.advance_retirement(frame.retire_prior_to);
        st.spaces[SpaceId::Data]
            .pending
            .retire_cids
            .extend(newly_retired);

        if frame.sequence < st.rem_cids.retire_prior_to() {
            // Came pre-retired due to reordering; retire it without use
            st.rem_cids.retire(frame.sequence);
            st.spaces[SpaceId::Data]
                .pending
                .retire_cids
                .push(frame.sequence);
            return Ok(());
        }

        let inserted = st.rem_cids.insert(CidEntry {
            id: frame.id,
            sequence: frame.sequence,
            reset_token: Some(frame.reset_token),
        });
        if !inserted {
            return Err(TransportError::CONNECTION_ID_LIMIT_ERROR(""));
        }
        Ok(())
    }

    fn handle_retire_cid(
        &self,
        st: &mut ConnState,
        packet: &IncomingPacket,
        sequence: u64,
    ) -> Result<(), TransportError> {
        if self.shared.identity.local_cid_len == 0 {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "RETIRE_CONNECTION_ID when CIDs aren't in use",
            ));
        }
        if sequence >= st.cids_issued {
            debug!(sequence, "got RETIRE_CONNECTION_ID for unissued sequence number");
            return Err(TransportError::PROTOCOL_VIOLATION(
                "RETIRE_CONNECTION_ID for unissued sequence number",
            ));
        }
        if let Some(entry) = st.loc_cids.by_sequence(sequence) {
            if entry.id == packet.dst_cid {
                return Err(TransportError::PROTOCOL_VIOLATION(
                    "RETIRE_CONNECTION_ID names the CID addressing the packet carrying it",
                ));
            }
        }
        st.loc_cids.retire(sequence);
        // Keep the peer's pool topped up
        self.issue_cids(st);
        Ok(())
    }

    //
    // Negotiation and CID issuance
    //

    fn apply_negotiated_parameters(
        &self,
        st: &mut ConnState,
        peer: TransportParameters,
        local: TransportParameters,
    ) {
        st.rem_cids
            .set_capacity(local.active_connection_id_limit.into_inner() as usize);
        st.loc_cids
            .set_capacity(peer.active_connection_id_limit.into_inner() as usize);

        // Seed both pools with the handshake-era identifiers
        if !self.shared.identity.peer_cid.is_empty() {
            let seeded = st.rem_cids.insert(CidEntry {
                id: self.shared.identity.peer_cid,
                sequence: 0,
                reset_token: peer.stateless_reset_token,
            });
            debug_assert!(seeded);
            if let Some(preferred) = peer.preferred_address {
                st.rem_cids.insert(CidEntry {
                    id: preferred.connection_id,
                    sequence: 1,
                    reset_token: Some(preferred.stateless_reset_token),
                });
            }
        }
        if self.shared.identity.local_cid_len > 0 {
            let seeded = st.loc_cids.insert(CidEntry {
                id: self.shared.identity.local_cid,
                sequence: 0,
                reset_token: local.stateless_reset_token,
            });
            debug_assert!(seeded);
            st.cids_issued = 1;
            if let Some(preferred) = local.preferred_address {
                st.loc_cids.insert(CidEntry {
                    id: preferred.connection_id,
                    sequence: 1,
                    reset_token: Some(preferred.stateless_reset_token),
                });
                st.cids_issued = 2;
            }
        }

        self.shared.max_payload.store(
            peer.max_udp_payload_size.into_inner().min(65527) as usize,
            Ordering::Relaxed,
        );
        st.streams.apply_peer_limits(
            peer.initial_max_data.into_inner(),
            peer.initial_max_streams_bidi.into_inner(),
            peer.initial_max_streams_uni.into_inner(),
        );

        st.peer_params = Some(peer);
        st.local_params = Some(local);
        st.state.move_to_established();
        self.issue_cids(st);
    }

    /// Issue fresh local CIDs until the peer's pool is full
    fn issue_cids(&self, st: &mut ConnState) {
        if self.shared.identity.local_cid_len == 0 {
            return;
        }
        let Some(peer_params) = st.peer_params else {
            return;
        };
        let limit = peer_params
            .active_connection_id_limit
            .into_inner()
            .min(LOC_CID_COUNT);
        let mut rng = rand::thread_rng();
        while (st.loc_cids.len() as u64) < limit {
            let entry = CidEntry {
                id: ConnectionId::random(&mut rng, self.shared.identity.local_cid_len),
                sequence: st.cids_issued,
                reset_token: Some(ResetToken::random(&mut rng)),
            };
            if !st.loc_cids.insert(entry) {
                break;
            }
            st.cids_issued += 1;
            trace!(sequence = entry.sequence, id = %entry.id, "issuing CID");
            st.spaces[SpaceId::Data]
                .pending
                .new_cids
                .push(frame::NewConnectionId {
                    sequence: entry.sequence,
                    retire_prior_to: 0,
                    id: entry.id,
                    reset_token: entry.reset_token.unwrap(),
                });
        }
    }

    fn on_retry(&self, src_cid: ConnectionId, token: Bytes) {
        if self.shared.side.is_server() {
            trace!("discarding Retry sent to a server");
            return;
        }
        let mut st = self.shared.state.lock().unwrap();
        if st.retry_src_cid.is_some() || st.handshake_complete {
            // At most one Retry is honored per connection attempt
            trace!("discarding extra Retry");
            return;
        }
        trace!(cid = %src_cid, "retrying");
        st.retry_src_cid = Some(src_cid);
        st.retry_token = token;
    }

    //
    // Output paths
    //

    /// Drain queued responses and owed ACKs after processing a packet
    async fn flush_pending(&self, space_id: SpaceId, ack_now: bool) -> Result<(), ConnectionError> {
        let mut wrote = false;

        // Application-level protocol responses wait for handshake keys
        let data_ready = {
            let st = self.shared.state.lock().unwrap();
            st.handshake_complete && !st.spaces[SpaceId::Data].pending.is_empty()
        };
        if data_ready {
            wrote |= self.flush_data_responses().await?;
        }

        // ACK for the packet's own space
        let ranges = {
            let mut st = self.shared.state.lock().unwrap();
            st.spaces[space_id].take_ack_ranges()
        };
        if let Some(ranges) = ranges {
            let largest = ranges.iter().next_back().map(|r| r.end - 1).unwrap();
            self.write_frame(space_id, move |w| {
                frame::Ack::encode(0, &ranges, w.buf);
                w.register_hook(Box::new(move |pn, space| space.ack_sent(pn, largest)));
            })
            .await?;
            wrote = true;
        }

        if wrote || ack_now {
            self.finish(space_id).await?;
            if space_id != SpaceId::Data && data_ready {
                self.finish(SpaceId::Data).await?;
            }
            self.force_end_datagram();
        }
        Ok(())
    }

    /// Write out everything queued at the application level
    async fn flush_data_responses(&self) -> Result<bool, ConnectionError> {
        let (handshake_done, path_response, retire_cids, new_cids) = {
            let mut st = self.shared.state.lock().unwrap();
            let pending = &mut st.spaces[SpaceId::Data].pending;
            (
                std::mem::take(&mut pending.handshake_done),
                pending.path_response.take(),
                std::mem::take(&mut pending.retire_cids),
                std::mem::take(&mut pending.new_cids),
            )
        };
        let mut wrote = false;
        if handshake_done {
            trace!("HANDSHAKE_DONE");
            self.write_frame(SpaceId::Data, |w| {
                w.buf.write(frame::FrameType::HANDSHAKE_DONE);
            })
            .await?;
            wrote = true;
        }
        if let Some(token) = path_response {
            trace!(token, "PATH_RESPONSE");
            self.write_frame(SpaceId::Data, move |w| {
                w.buf.write(frame::FrameType::PATH_RESPONSE);
                w.buf.write(token);
            })
            .await?;
            wrote = true;
        }
        for sequence in retire_cids {
            trace!(sequence, "RETIRE_CONNECTION_ID");
            self.write_frame(SpaceId::Data, move |w| {
                w.buf.write(frame::FrameType::RETIRE_CONNECTION_ID);
                w.buf.write_var(sequence);
            })
            .await?;
            wrote = true;
        }
        for cid in new_cids {
            trace!(sequence = cid.sequence, "NEW_CONNECTION_ID");
            self.write_frame(SpaceId::Data, move |w| cid.encode(w.buf)).await?;
            wrote = true;
        }
        Ok(wrote)
    }

    /// Wrap an outbound handshake payload in CRYPTO frames
    async fn transmit_handshake(&self, msg: HandshakeMessage) -> Result<(), ConnectionError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::LocallyClosed);
        }
        let space_id = msg.space;
        let mut offset = {
            let mut st = self.shared.state.lock().unwrap();
            let space = &mut st.spaces[space_id];
            let offset = space.crypto_offset;
            space.crypto_offset += msg.data.len() as u64;
            offset
        };
        let budget = self
            .max_frame_data(space_id)
            .saturating_sub(frame::Crypto::SIZE_BOUND);
        debug_assert!(budget > 0);
        let mut data = msg.data;
        loop {
            let chunk = data.split_to(data.len().min(budget));
            let last = data.is_empty();
            let frame = frame::Crypto {
                offset,
                data: chunk,
            };
            offset += frame.data.len() as u64;
            self.write_frame(space_id, move |w| frame.encode(w.buf)).await?;
            if last {
                break;
            }
        }
        if msg.flush {
            self.finish(space_id).await?;
            self.force_end_datagram();
        }
        Ok(())
    }

    /// Turn one queued application write into STREAM frames
    async fn transmit_stream_write(
        &self,
        write: StreamWrite,
        flush_now: bool,
    ) -> Result<(), ConnectionError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::LocallyClosed);
        }
        let StreamWrite { id, data, fin } = write;
        let mut offset = {
            let mut st = self.shared.state.lock().unwrap();
            st.streams.assign_send_offset(id, data.len() as u64)
        };
        let budget = self
            .max_frame_data(SpaceId::Data)
            .saturating_sub(frame::Stream::SIZE_BOUND);
        debug_assert!(budget > 0);
        let mut data = data;
        loop {
            let chunk = data.split_to(data.len().min(budget));
            let last = data.is_empty();
            let frame = frame::Stream {
                id,
                offset,
                fin: fin && last,
                data: chunk,
            };
            offset += frame.data.len() as u64;
            self.write_frame(SpaceId::Data, move |w| frame.encode(true, w.buf)).await?;
            if last {
                break;
            }
        }
        if fin || flush_now {
            // Flush immediately so stream completion isn't delayed
            self.finish(SpaceId::Data).await?;
            self.force_end_datagram();
        }
        Ok(())
    }

    //
    // Termination
    //

    /// Terminal handling for a local protocol error: emit CONNECTION_CLOSE,
    /// flush it, and stop the world. Never retried.
    async fn fail(&self, error: TransportError) {
        let space_id = {
            let mut st = self.shared.state.lock().unwrap();
            if !st
                .state
                .move_to_closing(ConnectionError::TransportError(error.clone()))
            {
                return;
            }
            st.highest_space
        };
        debug!(%error, "closing connection");
        let close = ConnectionClose::from(error.clone());
        let max_len = self.max_frame_data(space_id);
        let _ = self
            .write_frame(space_id, move |w| close.encode(w.buf, max_len))
            .await;
        let _ = self.finish(space_id).await;
        self.force_end_datagram();
        self.enter_closed(ConnectionError::TransportError(error));
    }

    /// The peer told us the connection is over; no reply is sent
    fn on_remote_close(&self, reason: ConnectionError) {
        {
            let mut st = self.shared.state.lock().unwrap();
            if !st.state.move_to_closing(reason.clone()) {
                return;
            }
        }
        self.enter_closed(reason);
    }

    fn enter_closed(&self, reason: ConnectionError) {
        {
            let mut st = self.shared.state.lock().unwrap();
            st.state.move_to_closed();
        }
        self.shared.closed.store(true, Ordering::Release);
        // Closing the queue lets the send loop observe end-of-stream rather
        // than being killed mid-operation
        self.shared.stream_tx.lock().unwrap().take();
        let _ = self.shared.events.send(Event::ConnectionLost { reason });
    }
}
