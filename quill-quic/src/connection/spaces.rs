use std::{
    cmp, mem,
    ops::{Index, IndexMut},
};

use tinyvec::TinyVec;
use tracing::trace;

use super::assembler::Assembler;
use crate::{frame, packet::SpaceId, range_set::RangeSet, TransportError};

/// Per-encryption-level packet number state
pub(crate) struct PacketSpace {
    /// The packet number of the next packet that will be sent, if any
    pub(crate) next_packet_number: u64,
    /// The largest packet number the remote peer acknowledged in an ACK frame
    pub(crate) largest_acked_packet: Option<u64>,
    /// Packets we've sent but the peer hasn't acknowledged
    unacked: RangeSet,
    dedup: Dedup,
    /// Highest received packet number
    pub(crate) rx_packet: u64,
    /// Received packet numbers not yet covered by a confirmed ACK
    rx_ranges: RangeSet,
    /// Whether an ACK-eliciting packet arrived since the last ACK was sent
    pending_ack: bool,
    /// ACK frames in flight: carrier packet and the largest number it covered
    acks_in_flight: TinyVec<[(u64, u64); 4]>,

    /// Incoming cryptographic handshake stream
    pub(crate) crypto_stream: Assembler,
    /// Current offset of outgoing cryptographic handshake stream
    pub(crate) crypto_offset: u64,

    /// Frames queued for transmission at this level
    pub(crate) pending: PendingFrames,
}

impl PacketSpace {
    pub(crate) fn new() -> Self {
        Self {
            next_packet_number: 0,
            largest_acked_packet: None,
            unacked: RangeSet::new(),
            dedup: Dedup::new(),
            rx_packet: 0,
            rx_ranges: RangeSet::new(),
            pending_ack: false,
            acks_in_flight: TinyVec::default(),
            crypto_stream: Assembler::new(),
            crypto_offset: 0,
            pending: PendingFrames::default(),
        }
    }

    /// Get the next outgoing packet number in this space
    pub(crate) fn get_tx_number(&mut self) -> u64 {
        // TODO: Handle packet number overflow gracefully
        assert!(self.next_packet_number < 2u64.pow(62));
        let x = self.next_packet_number;
        self.next_packet_number += 1;
        x
    }

    /// Start tracking a freshly transmitted packet
    pub(crate) fn packet_sent(&mut self, number: u64) {
        self.unacked.insert_one(number);
    }

    /// Record receipt of a packet number
    ///
    /// Returns `false` for duplicates, which must not be dispatched.
    pub(crate) fn receive_packet(&mut self, number: u64, ack_eliciting: bool) -> bool {
        if self.dedup.insert(number) {
            return false;
        }
        self.rx_packet = cmp::max(self.rx_packet, number);
        self.rx_ranges.insert_one(number);
        if ack_eliciting {
            self.pending_ack = true;
        }
        true
    }

    /// Flag the most recent packet as requiring acknowledgment
    pub(crate) fn note_ack_eliciting(&mut self) {
        self.pending_ack = true;
    }

    /// Whether an ACK frame is owed to the peer
    pub(crate) fn can_send_ack(&self) -> bool {
        self.pending_ack && !self.rx_ranges.is_empty()
    }

    /// Ranges to encode into an outgoing ACK frame, most recent first
    ///
    /// Clears the pending flag; the caller must register a packet-number hook
    /// that reports the carrier packet via [`Self::ack_sent`] so future
    /// acknowledgment of that packet can retire the ranges.
    pub(crate) fn take_ack_ranges(&mut self) -> Option<RangeSet> {
        if !self.can_send_ack() {
            return None;
        }
        self.pending_ack = false;
        Some(self.rx_ranges.clone())
    }

    /// Note that an ACK covering everything up to `largest` rode in `carrier`
    pub(crate) fn ack_sent(&mut self, carrier: u64, largest: u64) {
        trace!(carrier, largest, "ACK in flight");
        self.acks_in_flight.push((carrier, largest));
    }

    /// Process an incoming ACK frame's ranges
    pub(crate) fn on_acks_received(&mut self, ack: &frame::Ack) -> Result<(), TransportError> {
        if ack.largest >= self.next_packet_number {
            return Err(TransportError::PROTOCOL_VIOLATION("unsent packet acked"));
        }
        for range in ack.iter() {
            self.unacked.remove(*range.start()..*range.end() + 1);
        }
        self.largest_acked_packet = Some(
            self.largest_acked_packet
                .map_or(ack.largest, |x| cmp::max(x, ack.largest)),
        );

        // Once the peer confirms receipt of an ACK we sent, the ranges it
        // covered no longer need to be reported.
        let mut covered = None;
        self.acks_in_flight.retain(|&(carrier, largest)| {
            let acked = ack.iter().any(|r| r.contains(&carrier));
            if acked {
                covered = cmp::max(covered, Some(largest));
            }
            !acked
        });
        if let Some(largest) = covered {
            self.rx_ranges.remove(0..largest + 1);
        }
        Ok(())
    }

    /// Whether packets remain sent-but-unacknowledged
    pub(crate) fn has_unacked(&self) -> bool {
        !self.unacked.is_empty()
    }
}

impl Index<SpaceId> for [PacketSpace; 3] {
    type Output = PacketSpace;
    fn index(&self, space: SpaceId) -> &PacketSpace {
        &self.as_ref()[space as usize]
    }
}

impl IndexMut<SpaceId> for [PacketSpace; 3] {
    fn index_mut(&mut self, space: SpaceId) -> &mut PacketSpace {
        &mut self.as_mut()[space as usize]
    }
}

/// Protocol responses queued for transmission
///
/// Frame handlers append here while a packet is dispatched; the transmission
/// pipeline drains it afterwards.
#[derive(Debug, Default)]
pub(crate) struct PendingFrames {
    pub(crate) handshake_done: bool,
    pub(crate) path_response: Option<u64>,
    pub(crate) new_cids: Vec<frame::NewConnectionId>,
    pub(crate) retire_cids: Vec<u64>,
}

impl PendingFrames {
    pub(crate) fn is_empty(&self) -> bool {
        !self.handshake_done
            && self.path_response.is_none()
            && self.new_cids.is_empty()
            && self.retire_cids.is_empty()
    }
}

/// RFC4303-style sliding window packet number deduplicator.
///
/// A contiguous bitfield, where each bit corresponds to a packet number and the rightmost bit is
/// always set. A set bit represents a packet that has been successfully authenticated. Bits left of
/// the window are assumed to be set.
///
/// ```text
/// ...xxxxxxxxx 1 0
///     ^        ^ ^
/// window highest next
/// ```
pub(crate) struct Dedup {
    window: Window,
    /// Lowest packet number higher than all yet authenticated.
    next: u64,
}

/// Inner bitfield type.
///
/// Because QUIC never reuses packet numbers, this only needs to be large enough to deal with
/// packets that are reordered but still delivered in a timely manner.
type Window = u128;

/// Number of packets tracked by `Dedup`.
const WINDOW_SIZE: u64 = 1 + mem::size_of::<Window>() as u64 * 8;

impl Dedup {
    /// Construct an empty window positioned at the start.
    fn new() -> Self {
        Self { window: 0, next: 0 }
    }

    /// Highest packet number authenticated.
    fn highest(&self) -> u64 {
        self.next - 1
    }

    /// Record a newly authenticated packet number.
    ///
    /// Returns whether the packet might be a duplicate.
    pub(crate) fn insert(&mut self, packet: u64) -> bool {
        if let Some(diff) = packet.checked_sub(self.next) {
            // Right of window
            self.window = ((self.window << 1) | 1)
                .checked_shl(cmp::min(diff, u64::from(u32::MAX)) as u32)
                .unwrap_or(0);
            self.next = packet + 1;
            false
        } else if self.highest() - packet < WINDOW_SIZE {
            // Within window
            if let Some(bit) = (self.highest() - packet).checked_sub(1) {
                // < highest
                let mask = 1 << bit;
                let duplicate = self.window & mask != 0;
                self.window |= mask;
                duplicate
            } else {
                // == highest
                true
            }
        } else {
            // Left of window
            true
        }
    }
}
