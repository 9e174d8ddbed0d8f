//! Outgoing packet and datagram assembly
//!
//! One [`PacketAssembler`] per encryption level accumulates frame bytes for
//! the packet under construction. All levels flush into a single shared
//! [`DatagramBuffer`], which is handed to the datagram channel when full or
//! when explicitly ended. The invariant enforced here: no finalized packet
//! may cause the owning datagram to exceed the peer's maximum UDP payload
//! size.

use std::{
    mem,
    sync::atomic::Ordering,
};

use tracing::trace;

use super::{Connection, ConnectionError};
use crate::{
    connection::spaces::PacketSpace,
    packet::{self, Header, LongType, PacketNumber, SpaceId},
    Transmit, MIN_INITIAL_SIZE,
};

/// Hook invoked once the packet number of the carrying packet is known
///
/// Registered by frames whose correctness depends on their own packet number;
/// fired during finalization, before the packet is sealed.
pub(super) type PacketHook = Box<dyn FnOnce(u64, &mut PacketSpace) + Send>;

/// Frame bytes accumulated for one packet at one encryption level
pub(super) struct PacketAssembler {
    pub(super) space_id: SpaceId,
    buf: Vec<u8>,
    hooks: Vec<PacketHook>,
}

impl PacketAssembler {
    pub(super) fn new(space_id: SpaceId) -> Self {
        Self {
            space_id,
            buf: Vec::new(),
            hooks: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Writer handed to frame-emitting closures
///
/// Frames append bytes through `buf` and may register packet-number hooks.
pub(super) struct FrameWriter<'a> {
    pub(super) buf: &'a mut Vec<u8>,
    hooks: &'a mut Vec<PacketHook>,
}

impl FrameWriter<'_> {
    pub(super) fn register_hook(&mut self, hook: PacketHook) {
        self.hooks.push(hook);
    }
}

/// The per-connection datagram under construction
#[derive(Default)]
pub(super) struct DatagramBuffer {
    pub(super) buf: Vec<u8>,
}

impl Connection {
    /// Serialize a frame into the pending packet at `space_id`
    ///
    /// Under exclusive access to the level's packet buffer, invokes `f` to
    /// append frame bytes and register hooks. If the hypothetical finalized
    /// size would overflow the datagram budget, the pending packet is
    /// finalized and the datagram flushed first, so the new frame opens a
    /// fresh packet.
    pub(super) async fn write_frame<F>(
        &self,
        space_id: SpaceId,
        f: F,
    ) -> Result<(), ConnectionError>
    where
        F: FnOnce(&mut FrameWriter<'_>),
    {
        let mut asm = self.shared.assemblers[space_id as usize].lock().await;

        let mut staged = Vec::new();
        let mut hooks = Vec::new();
        f(&mut FrameWriter {
            buf: &mut staged,
            hooks: &mut hooks,
        });
        if staged.is_empty() && hooks.is_empty() {
            return Ok(());
        }

        let max_payload = self.shared.max_payload.load(Ordering::Relaxed);
        let overhead = self.packet_overhead(space_id);
        let datagram_used = self.shared.datagram.lock().unwrap().buf.len();
        if datagram_used + asm.buf.len() + staged.len() + overhead > max_payload {
            // The staged frame starts a fresh packet in a fresh datagram
            self.finalize_packet(&mut asm)?;
            self.force_end_datagram();
        }
        debug_assert!(
            staged.len() + overhead <= max_payload,
            "frame larger than an empty datagram can hold"
        );

        asm.buf.extend_from_slice(&staged);
        asm.hooks.append(&mut hooks);
        Ok(())
    }

    /// Finalize the pending packet at `space_id`, if any, into the datagram buffer
    pub(super) async fn finish(&self, space_id: SpaceId) -> Result<(), ConnectionError> {
        let mut asm = self.shared.assemblers[space_id as usize].lock().await;
        self.finalize_packet(&mut asm)?;
        Ok(())
    }

    /// Largest frame payload writable into an empty datagram at `space_id`
    pub(super) fn max_frame_data(&self, space_id: SpaceId) -> usize {
        let max_payload = self.shared.max_payload.load(Ordering::Relaxed);
        max_payload.saturating_sub(self.packet_overhead(space_id))
    }

    /// Conservative header-plus-tag overhead for a packet at `space_id`
    fn packet_overhead(&self, space_id: SpaceId) -> usize {
        let token_len = match space_id {
            SpaceId::Initial => self.shared.state.lock().unwrap().retry_token.len(),
            _ => 0,
        };
        packet::max_header_size(space_id, token_len) + self.shared.protection.tag_len(space_id)
    }

    /// Build the header, fire hooks, seal the payload and append to the datagram
    ///
    /// Sealing failures are fatal to the connection and never retried.
    pub(super) fn finalize_packet(
        &self,
        asm: &mut PacketAssembler,
    ) -> Result<(), ConnectionError> {
        if asm.is_empty() {
            asm.hooks.clear();
            return Ok(());
        }
        let space_id = asm.space_id;
        let mut payload = mem::take(&mut asm.buf);
        let hooks = mem::take(&mut asm.hooks);

        let (number, exact_number, dst_cid, token) = {
            let mut st = self.shared.state.lock().unwrap();
            let dst_cid = st
                .rem_cids
                .next_active()
                .or(st.retry_src_cid)
                .unwrap_or(self.shared.identity.peer_cid);
            let token = st.retry_token.clone();
            let space = &mut st.spaces[space_id];
            let exact_number = space.get_tx_number();
            for hook in hooks {
                hook(exact_number, space);
            }
            space.packet_sent(exact_number);
            let number = PacketNumber::new(exact_number, space.largest_acked_packet.unwrap_or(0));
            (number, exact_number, dst_cid, token)
        };

        let src_cid = self.shared.identity.local_cid;
        let header = match space_id {
            SpaceId::Initial => Header::Initial {
                src_cid,
                dst_cid,
                token,
                number,
            },
            SpaceId::Handshake => Header::Long {
                ty: LongType::Handshake,
                src_cid,
                dst_cid,
                number,
            },
            SpaceId::Data => Header::Short { dst_cid, number },
        };
        let tag_len = self.shared.protection.tag_len(space_id);
        let mut header_buf = Vec::new();
        let partial = header.encode(&mut header_buf);

        let mut datagram = self.shared.datagram.lock().unwrap();
        if space_id == SpaceId::Initial {
            // Datagrams carrying Initial packets are padded to the 1200-byte
            // floor for amplification mitigation and path MTU discovery.
            let total = datagram.buf.len() + header_buf.len() + payload.len() + tag_len;
            if total < MIN_INITIAL_SIZE {
                payload.resize(payload.len() + MIN_INITIAL_SIZE - total, 0);
            }
        }
        partial.set_payload_length(&mut header_buf, payload.len(), tag_len);

        let sealed = self
            .shared
            .protection
            .seal(space_id, exact_number, &header_buf, &payload)
            .map_err(ConnectionError::Crypto)?;

        let max_payload = self.shared.max_payload.load(Ordering::Relaxed);
        debug_assert!(
            datagram.buf.len() + header_buf.len() + sealed.len() <= max_payload.max(MIN_INITIAL_SIZE),
            "finalized packet overflows the datagram budget"
        );
        datagram.buf.extend_from_slice(&header_buf);
        datagram.buf.extend_from_slice(&sealed);
        trace!(space = ?space_id, pn = exact_number, size = header_buf.len() + sealed.len(), "wrote packet");
        Ok(())
    }

    /// Emit a packet form that carries no payload (Retry, Version Negotiation)
    ///
    /// Header-only packets bypass payload encryption and occupy a datagram of
    /// their own.
    pub(super) fn send_header_only(&self, header: &Header) {
        debug_assert!(!header.has_payload());
        let mut buf = Vec::new();
        header.encode(&mut buf);
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.shared.transmits.send(Transmit {
            destination: self.shared.remote,
            contents: buf.into(),
        });
    }

    /// Flush the shared datagram buffer to the datagram channel immediately
    ///
    /// No-op once the connection is closed: nothing further leaves.
    pub(super) fn force_end_datagram(&self) {
        let contents = {
            let mut datagram = self.shared.datagram.lock().unwrap();
            if datagram.buf.is_empty() {
                return;
            }
            mem::take(&mut datagram.buf)
        };
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        trace!(size = contents.len(), "datagram out");
        let _ = self.shared.transmits.send(Transmit {
            destination: self.shared.remote,
            contents: contents.into(),
        });
    }
}
