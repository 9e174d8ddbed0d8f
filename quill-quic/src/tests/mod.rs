use assert_matches::assert_matches;
use bytes::Bytes;

use crate::{
    crypto::HandshakeMessage, shared::ConnectionId, ConnectionError, Dir, Event, IncomingPacket,
    Side, SpaceId, StreamEvent, StreamId, TransportErrorCode,
};

mod util;
use util::*;

/// Payload of a short-header packet sealed by [`util::NullProtection`]
fn short_packet_payload(contents: &[u8]) -> &[u8] {
    let pn_len = 1 + (contents[0] & 0x03) as usize;
    &contents[1 + CID_LEN + pn_len..contents.len() - TAG]
}

#[tokio::test]
async fn initial_exchange_pads_and_acks() {
    let mut client = Endpoint::new(Side::Client);
    let mut server = Endpoint::new(Side::Server);

    client
        .handshake_tx
        .send(HandshakeMessage {
            space: SpaceId::Initial,
            data: Bytes::from_static(b"client hello"),
            flush: true,
        })
        .unwrap();
    let flight = client.next_transmit().await.expect("client initial flight");
    assert!(
        flight.contents.len() >= 1200,
        "initial datagram below the size floor: {}",
        flight.contents.len()
    );

    server
        .conn
        .handle_datagram(Bytes::copy_from_slice(&flight.contents))
        .await
        .unwrap();
    let ack = server.next_transmit().await.expect("server acknowledges");
    assert!(ack.contents.len() >= 1200);

    assert!(client.conn.outstanding_packets(SpaceId::Initial));
    client
        .conn
        .handle_datagram(Bytes::copy_from_slice(&ack.contents))
        .await
        .unwrap();
    assert!(!client.conn.outstanding_packets(SpaceId::Initial));
}

#[tokio::test]
async fn connect_negotiates_parameters() {
    let (mut client, server) = connect().await;
    assert!(client.conn.is_established());
    assert!(server.conn.is_established());
    assert_eq!(client.conn.peer_parameters(), Some(params()));
    assert_eq!(server.conn.peer_parameters(), Some(params()));
    assert_eq!(client.conn.local_parameters(), Some(params()));

    // Sequence number 0 is occupied by the handshake-era CID on both sides:
    // repeating it with different contents is a protocol violation
    let err = client
        .inject(
            SpaceId::Data,
            new_cid_frame(0, 0, ConnectionId::new(&[0x99; CID_LEN]), 0xcc),
        )
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ConnectionError::TransportError(e) if e.code == TransportErrorCode::PROTOCOL_VIOLATION
    );
    assert!(client.conn.is_closed());
}

#[tokio::test]
async fn cid_limit_enforced() {
    // During connect the server issues CIDs up to the negotiated
    // active_connection_id_limit of 4; one more must be rejected
    let (mut client, _server) = connect().await;
    let err = client
        .inject(
            SpaceId::Data,
            new_cid_frame(7, 0, ConnectionId::new(&[0x77; CID_LEN]), 0x77),
        )
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ConnectionError::TransportError(e)
            if e.code == TransportErrorCode::CONNECTION_ID_LIMIT_ERROR
    );
    let events = client.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::ConnectionLost { .. })));
}

#[tokio::test]
async fn retired_cid_is_ignored() {
    let (mut client, mut server) = connect().await;

    // Push the retirement threshold past sequence 1; the retired IDs are
    // announced in RETIRE_CONNECTION_ID frames
    client
        .inject(
            SpaceId::Data,
            new_cid_frame(4, 2, ConnectionId::new(&[0x44; CID_LEN]), 0x44),
        )
        .await
        .unwrap();
    let out = client.next_transmit().await.expect("retirements flushed");
    let payload = short_packet_payload(&out.contents);
    assert!(contains(payload, &[0x19, 0x00]), "sequence 0 retired");
    assert!(contains(payload, &[0x19, 0x01]), "sequence 1 retired");

    // A stale NEW_CONNECTION_ID for a retired sequence number is a no-op
    client
        .inject(
            SpaceId::Data,
            new_cid_frame(1, 0, ConnectionId::new(&[0x11; CID_LEN]), 0x11),
        )
        .await
        .unwrap();
    assert!(!client.conn.is_closed());
    let _ = server.drain_events();
}

#[tokio::test]
async fn retire_unissued_sequence_is_violation() {
    let (_client, mut server) = connect().await;
    let err = server
        .inject(SpaceId::Data, retire_cid_frame(40))
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ConnectionError::TransportError(e) if e.code == TransportErrorCode::PROTOCOL_VIOLATION
    );
}

#[tokio::test]
async fn retiring_the_carrying_cid_is_violation() {
    let (_client, mut server) = connect().await;
    // Sequence 0 is the CID the injected packet itself is addressed to
    let err = server
        .inject(SpaceId::Data, retire_cid_frame(0))
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ConnectionError::TransportError(e) if e.code == TransportErrorCode::PROTOCOL_VIOLATION
    );
}

#[tokio::test]
async fn retirement_replenishes_the_pool() {
    let (_client, mut server) = connect().await;
    server
        .inject(SpaceId::Data, retire_cid_frame(1))
        .await
        .unwrap();
    let out = server.next_transmit().await.expect("replacement CID issued");
    let payload = short_packet_payload(&out.contents);
    // NEW_CONNECTION_ID for the next unissued sequence number, 4
    assert!(contains(payload, &[0x18, 0x04]));
}

#[tokio::test]
async fn server_rejects_client_only_frames() {
    for frame in [new_token_frame(b"tok"), handshake_done_frame()] {
        let mut server = Endpoint::new(Side::Server);
        let err = server.inject(SpaceId::Data, frame).await.unwrap_err();
        assert_matches!(
            err,
            ConnectionError::TransportError(e)
                if e.code == TransportErrorCode::PROTOCOL_VIOLATION
        );
        assert!(server.conn.is_closed());
    }
}

#[tokio::test]
async fn client_surfaces_new_token() {
    let mut client = Endpoint::new(Side::Client);
    client
        .inject(SpaceId::Data, new_token_frame(b"reconnect-me"))
        .await
        .unwrap();
    let events = client.drain_events();
    assert!(events.iter().any(
        |e| matches!(e, Event::NewToken(token) if &token[..] == b"reconnect-me")
    ));
}

#[tokio::test]
async fn path_challenge_is_echoed() {
    let (_client, mut server) = connect().await;
    server
        .inject(SpaceId::Data, path_challenge_frame(0xdead_beef_f00d_cafe))
        .await
        .unwrap();
    let out = server.next_transmit().await.expect("path response");
    let payload = short_packet_payload(&out.contents);
    let mut expected = vec![0x1b];
    expected.extend_from_slice(&0xdead_beef_f00d_cafeu64.to_be_bytes());
    assert!(contains(payload, &expected), "identical token echoed");
}

#[tokio::test]
async fn ping_triggers_immediate_ack() {
    let (_client, mut server) = connect().await;
    server.inject(SpaceId::Data, ping_frame()).await.unwrap();
    let out = server.next_transmit().await.expect("immediate ACK");
    let payload = short_packet_payload(&out.contents);
    assert_eq!(payload[0], 0x02, "ACK frame leads the payload");
}

#[tokio::test]
async fn stream_reassembly_delivers_in_order() {
    let (_client, mut server) = connect().await;
    let id = StreamId::new(Side::Client, Dir::Bi, 0);
    server
        .inject(SpaceId::Data, stream_frame(id, 0, b"ab", false))
        .await
        .unwrap();
    server
        .inject(SpaceId::Data, stream_frame(id, 4, b"ef", false))
        .await
        .unwrap();
    server
        .inject(SpaceId::Data, stream_frame(id, 2, b"cd", true))
        .await
        .unwrap();

    let mut delivered = Vec::new();
    while let Some(chunk) = server.conn.read_stream(id) {
        delivered.extend_from_slice(&chunk);
    }
    assert_eq!(delivered, b"abcdef");

    let events = server.drain_events();
    let opened = events
        .iter()
        .filter(|e| matches!(e, Event::Stream(StreamEvent::Opened { .. })))
        .count();
    let finished = events
        .iter()
        .filter(|e| matches!(e, Event::Stream(StreamEvent::Finished { .. })))
        .count();
    assert_eq!(opened, 1);
    assert_eq!(finished, 1, "fin observed exactly once");
}

#[tokio::test]
async fn duplicate_packets_are_dropped() {
    let (_client, mut server) = connect().await;
    let id = StreamId::new(Side::Client, Dir::Bi, 1);
    let packet = || IncomingPacket {
        space: SpaceId::Data,
        number: 90,
        dst_cid: server.local_cid(),
        payload: stream_frame(id, 0, b"once", false).into(),
    };
    server.conn.handle_packet(packet()).await.unwrap();
    server.conn.handle_packet(packet()).await.unwrap();

    assert_eq!(server.conn.read_stream(id).as_deref(), Some(&b"once"[..]));
    assert_eq!(server.conn.read_stream(id), None);
}

#[tokio::test]
async fn datagrams_respect_negotiated_ceiling() {
    let (mut client, _server) = connect().await;
    let id = StreamId::new(Side::Client, Dir::Bi, 0);
    client
        .conn
        .write_stream(id, Bytes::from(vec![0x42; 10_000]), true)
        .unwrap();

    let max = params().max_udp_payload_size.into_inner() as usize;
    let mut datagrams = 0;
    let mut total = 0;
    while let Some(out) = client.next_transmit().await {
        assert!(
            out.contents.len() <= max,
            "datagram of {} bytes exceeds the negotiated ceiling",
            out.contents.len()
        );
        datagrams += 1;
        total += out.contents.len();
    }
    assert!(datagrams > 1, "split across multiple datagrams");
    assert!(total >= 10_000);
}

#[tokio::test]
async fn writes_rejected_after_close() {
    let (mut client, _server) = connect().await;
    client.conn.close(0u32.into(), Bytes::from_static(b"done")).await;
    assert!(client.conn.is_closed());
    let err = client
        .conn
        .write_stream(
            StreamId::new(Side::Client, Dir::Bi, 0),
            Bytes::from_static(b"late"),
            false,
        )
        .unwrap_err();
    assert_matches!(err, ConnectionError::LocallyClosed);
}

#[tokio::test]
async fn zero_length_peer_cid_refuses_cid_frames() {
    let mut endpoint = Endpoint::new_with_cids(
        Side::Client,
        ConnectionId::new(&[0xc1; CID_LEN]),
        ConnectionId::new(&[]),
    );
    let err = endpoint
        .inject(
            SpaceId::Data,
            new_cid_frame(1, 0, ConnectionId::new(&[0x11; CID_LEN]), 0x11),
        )
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ConnectionError::TransportError(e) if e.code == TransportErrorCode::PROTOCOL_VIOLATION
    );
}

#[tokio::test]
async fn zero_length_local_cid_refuses_retirement() {
    let mut endpoint = Endpoint::new_with_cids(
        Side::Server,
        ConnectionId::new(&[]),
        ConnectionId::new(&[0xc1; CID_LEN]),
    );
    let err = endpoint
        .inject(SpaceId::Data, retire_cid_frame(0))
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ConnectionError::TransportError(e) if e.code == TransportErrorCode::PROTOCOL_VIOLATION
    );
}

#[tokio::test]
async fn peer_close_is_surfaced_without_reply() {
    let (mut client, _server) = connect().await;
    let mut payload = Vec::new();
    frame::close_frame(&mut payload);
    client.inject(SpaceId::Data, payload).await.unwrap();
    assert!(client.conn.is_closed());
    let events = client.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ConnectionLost {
            reason: ConnectionError::ApplicationClosed(_)
        }
    )));
    // Draining, not closing: no CONNECTION_CLOSE goes back
    assert!(client.next_transmit().await.is_none());
}

mod frame {
    use crate::coding::BufMutExt;

    pub(super) fn close_frame(buf: &mut Vec<u8>) {
        buf.write(crate::frame::FrameType::APPLICATION_CLOSE);
        buf.write_var(0); // error code
        buf.write_var(5);
        buf.extend_from_slice(b"bored");
    }
}
