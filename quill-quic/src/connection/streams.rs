use std::collections::VecDeque;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use super::assembler::Assembler;
use super::{Event, StreamEvent};
use crate::{frame, Dir, Side, StreamId, TransportError};

/// Stream-level state for one connection
pub(super) struct StreamsState {
    side: Side,
    recv: FxHashMap<StreamId, Recv>,
    send: FxHashMap<StreamId, Send>,
    /// Connection-level flow control limit advertised by the peer
    max_data: u64,
    /// Stream count limits advertised by the peer, indexed by `Dir`
    max_streams: [u64; 2],
}

impl StreamsState {
    pub(super) fn new(side: Side) -> Self {
        Self {
            side,
            recv: FxHashMap::default(),
            send: FxHashMap::default(),
            max_data: 0,
            max_streams: [0, 0],
        }
    }

    /// Snapshot the peer's initial limits once transport parameters are known
    pub(super) fn apply_peer_limits(
        &mut self,
        max_data: u64,
        max_streams_bidi: u64,
        max_streams_uni: u64,
    ) {
        self.max_data = self.max_data.max(max_data);
        self.max_streams[Dir::Bi as usize] = self.max_streams[Dir::Bi as usize].max(max_streams_bidi);
        self.max_streams[Dir::Uni as usize] = self.max_streams[Dir::Uni as usize].max(max_streams_uni);
    }

    /// Process an incoming STREAM frame
    pub(super) fn received(
        &mut self,
        frame: frame::Stream,
        events: &mut Vec<Event>,
    ) -> Result<(), TransportError> {
        let id = frame.id;
        if id.initiator() == self.side && id.dir() == Dir::Uni {
            return Err(TransportError::STREAM_STATE_ERROR(
                "STREAM frame on send-only stream",
            ));
        }
        let end = frame.offset + frame.data.len() as u64;
        if end >= 2u64.pow(62) {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "maximum stream offset too large",
            ));
        }

        let fresh = !self.recv.contains_key(&id);
        let stream = self.recv.entry(id).or_default();
        if stream.closed {
            trace!(%id, "dropping data for closed stream");
            return Ok(());
        }

        if let Some(final_offset) = stream.final_offset {
            if end > final_offset || (frame.fin && end != final_offset) {
                debug!(end, final_offset, "final size error");
                return Err(TransportError::FINAL_SIZE_ERROR(""));
            }
        } else if frame.fin {
            if stream.assembler.end() > end {
                return Err(TransportError::FINAL_SIZE_ERROR(
                    "lower than high water mark",
                ));
            }
            stream.final_offset = Some(end);
        }

        if fresh {
            events.push(Event::Stream(StreamEvent::Opened { id }));
        }

        stream.assembler.insert(frame.offset, frame.data);
        let mut readable = false;
        while let Some(chunk) = stream.assembler.read() {
            stream.input.push_back(chunk);
            readable = true;
        }
        if readable {
            events.push(Event::Stream(StreamEvent::Readable { id }));
        }
        if stream.final_offset == Some(stream.assembler.bytes_read()) && !stream.fin_delivered {
            stream.fin_delivered = true;
            events.push(Event::Stream(StreamEvent::Finished { id }));
        }
        Ok(())
    }

    /// Process an incoming RESET_STREAM frame
    pub(super) fn received_reset(
        &mut self,
        frame: frame::ResetStream,
        events: &mut Vec<Event>,
    ) -> Result<(), TransportError> {
        let final_offset = frame.final_offset.into_inner();
        let stream = self.recv.entry(frame.id).or_default();
        if let Some(known) = stream.final_offset {
            if known != final_offset {
                return Err(TransportError::FINAL_SIZE_ERROR("inconsistent value"));
            }
        } else if stream.assembler.end() > final_offset {
            return Err(TransportError::FINAL_SIZE_ERROR(
                "lower than high water mark",
            ));
        }
        if !stream.closed {
            stream.closed = true;
            events.push(Event::Stream(StreamEvent::Finished { id: frame.id }));
        }
        Ok(())
    }

    /// Limits are monotonically non-decreasing; stale announcements are ignored
    pub(super) fn received_max_data(&mut self, limit: u64) {
        self.max_data = self.max_data.max(limit);
    }

    pub(super) fn received_max_stream_data(
        &mut self,
        id: StreamId,
        limit: u64,
    ) -> Result<(), TransportError> {
        if id.initiator() != self.side && id.dir() == Dir::Uni {
            return Err(TransportError::STREAM_STATE_ERROR(
                "MAX_STREAM_DATA on recv-only stream",
            ));
        }
        let send = self.send.entry(id).or_default();
        send.max_stream_data = send.max_stream_data.max(limit);
        Ok(())
    }

    pub(super) fn received_max_streams(&mut self, dir: Dir, count: u64) {
        let slot = &mut self.max_streams[dir as usize];
        *slot = (*slot).max(count);
    }

    /// Assign the wire offset for the next `len` bytes written to `id`
    pub(super) fn assign_send_offset(&mut self, id: StreamId, len: u64) -> u64 {
        let send = self.send.entry(id).or_default();
        let offset = send.next_offset;
        send.next_offset += len;
        if send.next_offset > send.max_stream_data {
            debug!(%id, end = send.next_offset, limit = send.max_stream_data,
                "write passes the peer's advertised stream limit");
        }
        offset
    }

    /// Pop buffered readable data for the application
    pub(super) fn read(&mut self, id: StreamId) -> Option<Bytes> {
        self.recv.get_mut(&id)?.input.pop_front()
    }

    pub(super) fn max_streams(&self, dir: Dir) -> u64 {
        self.max_streams[dir as usize]
    }
}

/// Receive half of a stream, created lazily on first reference
#[derive(Default)]
struct Recv {
    assembler: Assembler,
    /// Contiguous data ready for the application, in order
    input: VecDeque<Bytes>,
    final_offset: Option<u64>,
    fin_delivered: bool,
    closed: bool,
}

/// Send half of a stream
#[derive(Default)]
struct Send {
    next_offset: u64,
    max_stream_data: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_state() -> StreamsState {
        StreamsState::new(Side::Server)
    }

    fn stream_frame(offset: u64, data: &'static [u8], fin: bool) -> frame::Stream {
        frame::Stream {
            id: StreamId::new(Side::Client, Dir::Bi, 0),
            offset,
            fin,
            data: Bytes::from_static(data),
        }
    }

    fn drain(state: &mut StreamsState, id: StreamId) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = state.read(id) {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn out_of_order_reassembly() {
        let mut state = recv_state();
        let id = StreamId::new(Side::Client, Dir::Bi, 0);
        let mut events = Vec::new();
        state.received(stream_frame(0, b"ab", false), &mut events).unwrap();
        state.received(stream_frame(4, b"ef", false), &mut events).unwrap();
        state
            .received(stream_frame(2, b"cd", true), &mut events)
            .unwrap();

        assert_eq!(drain(&mut state, id), b"abcdef");
        let fins = events
            .iter()
            .filter(|e| matches!(e, Event::Stream(StreamEvent::Finished { .. })))
            .count();
        assert_eq!(fins, 1, "fin observed exactly once");
        let opens = events
            .iter()
            .filter(|e| matches!(e, Event::Stream(StreamEvent::Opened { .. })))
            .count();
        assert_eq!(opens, 1);
    }

    #[test]
    fn data_past_final_size_rejected() {
        let mut state = recv_state();
        let mut events = Vec::new();
        state.received(stream_frame(0, b"abcd", true), &mut events).unwrap();
        let err = state
            .received(stream_frame(4, b"ef", false), &mut events)
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FINAL_SIZE_ERROR);
    }

    #[test]
    fn conflicting_fin_rejected() {
        let mut state = recv_state();
        let mut events = Vec::new();
        state.received(stream_frame(0, b"abcd", true), &mut events).unwrap();
        let err = state
            .received(stream_frame(0, b"ab", true), &mut events)
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FINAL_SIZE_ERROR);
    }

    #[test]
    fn limits_are_monotone() {
        let mut state = recv_state();
        state.received_max_data(1000);
        state.received_max_data(500);
        assert_eq!(state.max_data, 1000);

        state.received_max_streams(Dir::Bi, 8);
        state.received_max_streams(Dir::Bi, 3);
        assert_eq!(state.max_streams(Dir::Bi), 8);
    }

    #[test]
    fn send_offsets_accumulate() {
        let mut state = recv_state();
        let id = StreamId::new(Side::Server, Dir::Bi, 0);
        assert_eq!(state.assign_send_offset(id, 10), 0);
        assert_eq!(state.assign_send_offset(id, 5), 10);
        assert_eq!(state.assign_send_offset(id, 0), 15);
    }

    #[test]
    fn stream_frame_on_send_only_rejected() {
        let mut state = recv_state();
        let mut events = Vec::new();
        let err = state
            .received(
                frame::Stream {
                    id: StreamId::new(Side::Server, Dir::Uni, 0),
                    offset: 0,
                    fin: false,
                    data: Bytes::from_static(b"x"),
                },
                &mut events,
            )
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::STREAM_STATE_ERROR);
    }
}
