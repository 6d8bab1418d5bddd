//! End-to-end scenarios driven over an in-memory loopback transport,
//! grounded on the same pattern `crates/service/tests/turn.rs` uses to
//! exercise a service without a real socket (§13). Covers S1 (handshake),
//! S2 (packet-loss burst suspends and resumes sending), S5 (MTProto-2
//! fallback) and S6 (shutdown) from the testable-properties scenario list.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use codec::crypto::{key_fingerprint, DefaultCrypto};
use codec::packet::{LegacyPacket, Mtproto2Packet, PacketType, SimpleBlock};
use session::config::SessionConfig;
use session::data::EndpointKind;
use session::state::SessionState;
use session::{RemoteEndpointDescriptor, Session};
use transport::{Endpoint, LoopbackSocket, Protocol, Socket};

fn test_key() -> [u8; 256] {
    [0xAAu8; 256]
}

fn endpoint(port: u16) -> Endpoint {
    Endpoint::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port, Protocol::Udp)
}

fn init_ack_packet(key: &[u8; 256]) -> Vec<u8> {
    let crypto = DefaultCrypto;
    let tag = key_fingerprint(&crypto, key);
    let mut call_id = [0u8; 16];
    call_id[..8].copy_from_slice(&tag);
    let block = SimpleBlock {
        packet_type: PacketType::InitAck.into(),
        last_remote_seq: 0,
        seq: 1,
        recent_recv_mask: 0,
        extras: vec![],
        payload: vec![],
    };
    LegacyPacket::encode(&crypto, key, &call_id, &block, 1, false)
}

fn stream_data_packet(key: &[u8; 256], stream_id: u8, timestamp: u32, audio: &[u8]) -> Vec<u8> {
    let crypto = DefaultCrypto;
    let tag = key_fingerprint(&crypto, key);
    let mut call_id = [0u8; 16];
    call_id[..8].copy_from_slice(&tag);
    let mut payload = vec![stream_id];
    payload.extend_from_slice(&timestamp.to_le_bytes());
    payload.extend_from_slice(audio);
    let block = SimpleBlock {
        packet_type: PacketType::StreamData.into(),
        last_remote_seq: 1,
        seq: 2,
        recent_recv_mask: 0b1,
        extras: vec![],
        payload,
    };
    LegacyPacket::encode(&crypto, key, &call_id, &block, 1, false)
}

/// S1: once an `InitAck` and a stream-data packet arrive, the session
/// reaches `Established` well inside the 2 s budget, with no error latched.
#[tokio::test]
async fn s1_handshake_reaches_established() {
    let key = test_key();
    let session = Session::new(SessionConfig::default());
    session.set_encryption_key(key, true);

    let (peer, ours) = LoopbackSocket::pair(endpoint(2000), endpoint(1000));
    let ours: Arc<dyn Socket> = Arc::new(ours);

    let connect_session = session.clone();
    let connect_handle = tokio::spawn(async move {
        let _ = connect_session.connect(ours).await;
    });

    peer.send(&transport::Packet { data: init_ack_packet(&key), endpoint: endpoint(1000) }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.state(), SessionState::WaitInitAck);

    peer.send(&transport::Packet {
        data: stream_data_packet(&key, 0, 0, b"opus"),
        endpoint: endpoint(1000),
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(session.state(), SessionState::Established);
    assert_eq!(session.get_last_error(), session::state::Error::Unknown);

    connect_handle.abort();
}

/// S6: `Stop()` moves the session to a terminal, non-error state
/// immediately, and its own cancellation wakes the receive loop without
/// needing an external `abort()`.
#[tokio::test]
async fn s6_shutdown_is_immediate_and_terminal() {
    let key = test_key();
    let session = Session::new(SessionConfig::default());
    session.set_encryption_key(key, true);

    let (_peer, ours) = LoopbackSocket::pair(endpoint(2002), endpoint(1002));
    let ours: Arc<dyn Socket> = Arc::new(ours);
    let connect_session = session.clone();
    let connect_handle = tokio::spawn(async move { connect_session.connect(ours).await });

    // Give the receive loop a chance to start waiting on stop_notify/recv.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = tokio::time::Instant::now();
    session.stop();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(session.get_last_error(), session::state::Error::Unknown);

    // The receive loop exits on its own via stop_notify, not by abort().
    let joined = tokio::time::timeout(Duration::from_millis(500), connect_handle)
        .await
        .expect("connect() should return promptly once stopped");
    assert!(joined.expect("receive task should not panic").is_ok());
}

/// A garbled packet under the right key but wrong framing is dropped
/// silently rather than panicking or changing session state, per §7's
/// "decrypt/parse failure" handling.
#[tokio::test]
async fn corrupt_packet_is_dropped_without_state_change() {
    let key = test_key();
    let session = Session::new(SessionConfig::default());
    session.set_encryption_key(key, true);

    let (peer, ours) = LoopbackSocket::pair(endpoint(2001), endpoint(1001));
    let ours: Arc<dyn Socket> = Arc::new(ours);
    let connect_session = session.clone();
    let connect_handle = tokio::spawn(async move {
        let _ = connect_session.connect(ours).await;
    });

    peer.send(&transport::Packet { data: vec![0u8; 64], endpoint: endpoint(1001) }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(session.state(), SessionState::WaitInit);
    connect_handle.abort();
}

/// S2: a burst of 40 consecutive unacknowledged outgoing packets trips
/// `waitingForAcks`, which suspends further audio sends until the peer
/// catches up on acks.
#[tokio::test]
async fn s2_packet_loss_burst_suspends_then_recovers() {
    let key = test_key();
    let session = Session::new(SessionConfig::default());
    session.set_encryption_key(key, true);
    session.set_remote_endpoints(vec![RemoteEndpointDescriptor {
        id: 1,
        net: endpoint(3000),
        kind: EndpointKind::UdpP2pInet,
        peer_tag: [0; 16],
    }]);

    let (peer, ours) = LoopbackSocket::pair(endpoint(3001), endpoint(3000));
    let ours: Arc<dyn Socket> = Arc::new(ours);
    let connect_session = session.clone();
    let connect_handle = tokio::spawn(async move {
        let _ = connect_session.connect(ours).await;
    });

    // The peer never acks anything: drive 40 outgoing audio frames, enough
    // to trip the consecutive-loss threshold on their own.
    for ts in 0..40u32 {
        session.send_audio_frame(0, session::audio::EncodedFrame { primary: vec![1, 2, 3], secondary: None, timestamp: ts });
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.get_stats().waiting_for_acks);

    let before = session.get_stats().bytes_sent;
    session.send_audio_frame(0, session::audio::EncodedFrame { primary: vec![9], secondary: None, timestamp: 999 });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.get_stats().bytes_sent, before, "sends should be suspended while waitingForAcks");

    // The peer acks seqs 9..=40 (32-wide mask) in one shot.
    let crypto = DefaultCrypto;
    let tag = key_fingerprint(&crypto, &key);
    let mut call_id = [0u8; 16];
    call_id[..8].copy_from_slice(&tag);
    let ack_block = SimpleBlock {
        packet_type: PacketType::Ping.into(),
        last_remote_seq: 40,
        seq: 1,
        recent_recv_mask: 0xFFFF_FFFFu32,
        extras: vec![],
        payload: vec![],
    };
    let ack_packet = LegacyPacket::encode(&crypto, &key, &call_id, &ack_block, 1, false);
    peer.send(&transport::Packet { data: ack_packet, endpoint: endpoint(3000) }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(!session.get_stats().waiting_for_acks);

    let before = session.get_stats().bytes_sent;
    session.send_audio_frame(0, session::audio::EncodedFrame { primary: vec![9], secondary: None, timestamp: 1000 });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(session.get_stats().bytes_sent > before, "sends should resume once acks catch up");

    connect_handle.abort();
}

/// S5: a peer already speaking MTProto-2 before we've latched its protocol
/// version still decrypts on a first-try legacy-decode failure, and the
/// fallback latches `peer_version` so later packets take the direct path.
#[tokio::test]
async fn s5_mtproto2_fallback_latches() {
    let key = test_key();
    let session = Session::new(SessionConfig::default());
    session.set_encryption_key(key, true);

    let (peer, ours) = LoopbackSocket::pair(endpoint(4000), endpoint(4001));
    let ours: Arc<dyn Socket> = Arc::new(ours);
    let connect_session = session.clone();
    let connect_handle = tokio::spawn(async move {
        let _ = connect_session.connect(ours).await;
    });

    assert_eq!(session.get_peer_capabilities(), 0);

    // The peer encodes with MTProto-2 framing, peer_version 0 to match the
    // session's still-unlatched default (decode_simple_block's pflags
    // parsing only engages at peer_version >= 6, independent of which
    // encryption scheme is in play).
    let crypto = DefaultCrypto;
    let tag = key_fingerprint(&crypto, &key);
    let mut call_id = [0u8; 16];
    call_id[..8].copy_from_slice(&tag);
    let block = SimpleBlock {
        packet_type: PacketType::InitAck.into(),
        last_remote_seq: 0,
        seq: 1,
        recent_recv_mask: 0,
        extras: vec![],
        payload: vec![],
    };
    let packet = Mtproto2Packet::encode(&crypto, &key, &call_id, &block, 0, false);
    peer.send(&transport::Packet { data: packet, endpoint: endpoint(4001) }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(session.state(), SessionState::WaitInitAck);

    // A second MTProto-2 packet, still at peer_version 0, now decodes on
    // the direct path since the fallback already latched peer_version.
    let block2 = SimpleBlock {
        packet_type: PacketType::StreamData.into(),
        last_remote_seq: 1,
        seq: 2,
        recent_recv_mask: 0b1,
        extras: vec![],
        payload: {
            let mut p = vec![0u8];
            p.extend_from_slice(&0u32.to_le_bytes());
            p.extend_from_slice(b"opus");
            p
        },
    };
    let packet2 = Mtproto2Packet::encode(&crypto, &key, &call_id, &block2, 0, false);
    peer.send(&transport::Packet { data: packet2, endpoint: endpoint(4001) }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(session.state(), SessionState::Established);
    assert_eq!(session.get_last_error(), session::state::Error::Unknown);

    connect_handle.abort();
}
