//! ## Call session
//!
//! Ties the wire codec (`codec`), transport sockets (`transport`),
//! congestion control (`congestion`), and jitter buffering (`jitter`)
//! crates together into the single `Session` object the embedding
//! application drives through the control surface described in §6.
//!
//! Submodules own one slice of the original monolith's state: `data` is
//! the record types, `ack` the sequence/ack window, `endpoint_select` the
//! relay/P2P switching hysteresis, `reliability` the pre-v6 reliable-send
//! queue, `extras` the inline extras channel, `shitty_internet` the
//! secondary-encoder hysteresis, `state` the connection state machine,
//! `audio` the encoder/decoder traits, `config` the session-scoped
//! tuneables, and `timer` the message/timer thread reimagined as a tokio
//! task.

pub mod ack;
pub mod audio;
pub mod config;
pub mod data;
pub mod endpoint_select;
pub mod extras;
pub mod reliability;
pub mod shitty_internet;
pub mod state;
pub mod timer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use codec::blocking_queue::BlockingQueue;
use codec::crypto::{self, CryptoProvider, DefaultCrypto};
use codec::packet::{Extra, PacketType, SimpleBlock};
use congestion::CongestionController;
use transport::{Endpoint as NetEndpoint, Packet as NetPacket, Socket};

use ack::{AckOutcome, AckWindow};
use audio::EncodedFrame;
use config::SessionConfig;
use data::{CallEndpoint, EndpointKind, RecentOutgoingPacket, Stream};
use endpoint_select::pick_switch_target;
use extras::ExtrasTracker;
use reliability::ReliabilityQueue;
use shitty_internet::ShittyInternetMode;
use state::{Error as LastError, SessionState, StateMachine};
use timer::TimerWheel;

/// Our own advertised protocol version and the lowest peer version we'll
/// still talk to (§4.9 "Init"/"handshake").
const OUR_PROTOCOL_VERSION: u8 = 7;
const MIN_PROTOCOL_VERSION: u8 = 3;
/// Peer versions at or above this use MTProto-2 framing; below it, legacy.
const MTPROTO2_MIN_PEER_VERSION: u8 = 5;
/// §8 S2: 40 consecutive unacked outgoing packets trips `waitingForAcks`.
const PACKET_LOSS_BURST_THRESHOLD: usize = 40;
const CAPABILITY_GROUP_CALLS: u32 = 1;
const SEND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug)]
pub enum Error {
    Transport(transport::Error),
    Codec(codec::Error),
    NotStarted,
    AlreadyStarted,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::Codec(e) => write!(f, "codec error: {e}"),
            Error::NotStarted => write!(f, "session not started"),
            Error::AlreadyStarted => write!(f, "session already started"),
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(value: transport::Error) -> Self {
        Error::Transport(value)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Error::Codec(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// One caller-supplied remote endpoint (§6 "Endpoint list").
#[derive(Debug, Clone)]
pub struct RemoteEndpointDescriptor {
    pub id: u64,
    pub net: NetEndpoint,
    pub kind: EndpointKind,
    pub peer_tag: [u8; 16],
}

/// `NetworkType` for `SetNetworkType`, used to gate data-saving behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    Wifi,
    Cellular,
    GprsOrEdge,
    Ethernet,
    Unknown,
}

/// Proxy configuration for `SetProxy`.
#[derive(Debug, Clone)]
pub enum ProxyConfig {
    None,
    Socks5 { host: String, port: u16, username: String, password: String },
}

/// Callback surface (§6 `SetCallbacks`). Default methods are no-ops so an
/// embedder only overrides what it cares about.
pub trait SessionObserver: Send + Sync {
    fn connection_state_changed(&self, _state: SessionState) {}
    fn signal_bar_count_changed(&self, _bars: u8) {}
    fn group_call_key_received(&self, _key: &[u8]) {}
    fn group_call_key_sent(&self) {}
    fn upgrade_to_group_call_requested(&self) {}
}

struct NoopObserver;
impl SessionObserver for NoopObserver {}

/// A stats snapshot for `GetStats` (§6).
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub bytes_sent: u64,
    pub bytes_recvd: u64,
    pub send_loss_count: u32,
    pub average_rtt: f64,
    pub congestion_window: usize,
    pub shitty_internet_mode: bool,
    pub waiting_for_acks: bool,
}

/// Locking discipline per §5: `endpoints` guards the endpoint set;
/// `queued` guards queued packets, recent-outgoing, and extras together
/// (they're always touched in the same ack-processing step); neither is
/// ever held across an `.await`.
struct EndpointsState {
    endpoints: Vec<CallEndpoint>,
    current: Option<u64>,
}

struct QueuedState {
    recent_outgoing: Vec<RecentOutgoingPacket>,
    reliability: ReliabilityQueue,
    extras: ExtrasTracker,
}

/// One block waiting to go out over the wire, still unencrypted so the send
/// task can resolve its destination endpoint right before encoding it.
struct PendingOutgoingPacket {
    block: SimpleBlock,
    target: Option<NetEndpoint>,
}

/// What the send task pulls off `Inner::send_queue`. `Stop` is the shutdown
/// sentinel described in §5: pushing it onto the queue is how `stop()` wakes
/// the blocking `get_blocking()` loop without it ever seeing a real packet.
enum SendItem {
    Packet(PendingOutgoingPacket),
    Stop,
}

/// The call session. Cheap to clone (wraps an `Arc`); clones share the same
/// underlying state and are how the receive/send/timer tasks each get a
/// handle without unsafe lifetime tricks.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    config: Mutex<SessionConfig>,
    observer: Arc<dyn SessionObserver>,
    crypto: Box<dyn CryptoProvider>,

    key: Mutex<Option<[u8; 256]>>,
    key_fingerprint: Mutex<Option<[u8; 8]>>,
    call_id: Mutex<Option<[u8; 16]>>,

    state: Mutex<StateMachine>,
    endpoints: Mutex<EndpointsState>,
    queued: Mutex<QueuedState>,
    ack_window: Mutex<AckWindow>,
    congestion: CongestionController,
    shitty_internet: Mutex<ShittyInternetMode>,
    streams: Mutex<Vec<Stream>>,

    peer_version: AtomicU32,
    peer_capabilities: AtomicU32,
    is_outgoing: AtomicBool,
    out_seq: AtomicU32,
    mic_muted: AtomicBool,
    network_type: Mutex<NetworkType>,
    proxy: Mutex<ProxyConfig>,

    send_queue: Arc<BlockingQueue<SendItem>>,
    send_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stop_notify: Notify,
    waiting_for_acks: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_recvd: AtomicU64,

    timer: TimerWheel,
    stats: Mutex<Stats>,
    debug_log: Mutex<Vec<String>>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(NoopObserver))
    }

    pub fn with_observer(config: SessionConfig, observer: Arc<dyn SessionObserver>) -> Self {
        let inner = Inner {
            config: Mutex::new(config),
            observer,
            crypto: Box::new(DefaultCrypto),
            key: Mutex::new(None),
            key_fingerprint: Mutex::new(None),
            call_id: Mutex::new(None),
            state: Mutex::new(StateMachine::new()),
            endpoints: Mutex::new(EndpointsState { endpoints: Vec::new(), current: None }),
            queued: Mutex::new(QueuedState {
                recent_outgoing: Vec::new(),
                reliability: ReliabilityQueue::new(),
                extras: ExtrasTracker::new(),
            }),
            ack_window: Mutex::new(AckWindow::new()),
            congestion: CongestionController::new(1024),
            shitty_internet: Mutex::new(ShittyInternetMode::new()),
            streams: Mutex::new(Vec::new()),
            peer_version: AtomicU32::new(0),
            peer_capabilities: AtomicU32::new(0),
            is_outgoing: AtomicBool::new(false),
            out_seq: AtomicU32::new(1),
            mic_muted: AtomicBool::new(false),
            network_type: Mutex::new(NetworkType::Unknown),
            proxy: Mutex::new(ProxyConfig::None),
            send_queue: Arc::new(BlockingQueue::with_overflow_callback(SEND_QUEUE_CAPACITY, |item: SendItem| {
                if let SendItem::Packet(pending) = item {
                    log::warn!("send queue overflow: dropping outgoing packet seq={}", pending.block.seq);
                }
            })),
            send_task: Mutex::new(None),
            stop_notify: Notify::new(),
            waiting_for_acks: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_recvd: AtomicU64::new(0),
            timer: TimerWheel::new(),
            stats: Mutex::new(Stats::default()),
            debug_log: Mutex::new(Vec::new()),
        };
        Self { inner: Arc::new(inner) }
    }

    /// `SetEncryptionKey(key, isOutgoing)`. Derives `keyFingerprint` and
    /// `callID` immediately per §6; `is_outgoing` picks which side of the
    /// KDF1/KDF2 `x` offset this session uses, so the two ends of a call
    /// derive complementary keys for every packet encoded or decoded from
    /// here on (§4.9).
    pub fn set_encryption_key(&self, key: [u8; 256], is_outgoing: bool) {
        *self.inner.key_fingerprint.lock() = Some(crypto::key_fingerprint(self.inner.crypto.as_ref(), &key));
        *self.inner.call_id.lock() = Some(crypto::call_id(self.inner.crypto.as_ref(), &key));
        self.inner.is_outgoing.store(is_outgoing, AtomicOrdering::Relaxed);
        *self.inner.key.lock() = Some(key);
    }

    /// `SetRemoteEndpoints`. The first relay in the list becomes
    /// `currentEndpoint` until a better path is selected (§4.9).
    pub fn set_remote_endpoints(&self, descriptors: Vec<RemoteEndpointDescriptor>) {
        let mut guard = self.inner.endpoints.lock();
        guard.endpoints = descriptors
            .into_iter()
            .map(|d| CallEndpoint::new(d.id, d.kind, d.net, d.peer_tag))
            .collect();
        guard.current = guard
            .endpoints
            .iter()
            .find(|e| matches!(e.kind, EndpointKind::UdpRelay | EndpointKind::TcpRelay))
            .or_else(|| guard.endpoints.first())
            .map(|e| e.id);
    }

    pub fn set_mic_mute(&self, muted: bool) {
        self.inner.mic_muted.store(muted, AtomicOrdering::Relaxed);
    }

    pub fn set_network_type(&self, network_type: NetworkType) {
        *self.inner.network_type.lock() = network_type;
    }

    pub fn set_proxy(&self, proxy: ProxyConfig) {
        *self.inner.proxy.lock() = proxy;
    }

    pub fn set_config(&self, apply: impl FnOnce(&mut SessionConfig)) {
        apply(&mut self.inner.config.lock());
    }

    /// Applies the server-pushed config dictionary, layered beneath any
    /// later explicit `set_config` call per §6.
    pub fn apply_server_config(&self, dict: &HashMap<String, String>) {
        self.inner.config.lock().apply_server_dictionary(dict);
    }

    /// `Start`: spins up the timer task, the `Init` retransmit sweep (every
    /// 0.5s until `InitAck` or `initTimeout`), and the endpoint ping sweep
    /// (every 2s). Socket I/O is driven separately by `connect`, matching
    /// §5's split between the always-on timer task and the receive/send
    /// tasks that only exist once a transport is attached.
    pub fn start(&self) {
        self.inner.timer.spawn_driver();

        let session = self.clone();
        let init_timeout = self.inner.config.lock().init_timeout;
        let started_at = Instant::now();
        self.inner.timer.post(
            move || {
                let elapsed = started_at.elapsed();
                if elapsed >= init_timeout {
                    session.fail(LastError::Timeout);
                    return;
                }
                if matches!(session.state(), SessionState::WaitInit) {
                    session.log(format!("init retransmit after {elapsed:?}"));
                    session.send_init();
                }
            },
            Duration::from_millis(500),
            Some(Duration::from_millis(500)),
        );

        let session = self.clone();
        self.inner.timer.post(
            move || session.tick(),
            Duration::from_millis(100),
            Some(Duration::from_millis(100)),
        );

        let session = self.clone();
        self.inner.timer.post(
            move || session.ping_sweep(),
            Duration::from_secs(2),
            Some(Duration::from_secs(2)),
        );
    }

    /// `Connect`: attaches a transport, spawns the send task, and drives the
    /// receive loop until `stop()` fires `stop_notify` or the socket errors
    /// out. Runs for the life of the session; the caller typically
    /// `tokio::spawn`s this.
    pub async fn connect(&self, socket: Arc<dyn Socket>) -> Result<()> {
        self.spawn_send_task(socket.clone());
        self.log("connect: entering receive loop".to_string());
        loop {
            tokio::select! {
                _ = self.inner.stop_notify.notified() => {
                    self.log("connect: stop requested, exiting receive loop".to_string());
                    break;
                }
                received = socket.recv() => {
                    let packet = received?;
                    self.handle_incoming(&packet.data, packet.endpoint);
                }
            }
        }
        Ok(())
    }

    /// Spawns the dedicated blocking thread that drains `send_queue` and
    /// performs the actual (async) socket writes, per §5's "background
    /// thread pulls `PendingOutgoingPacket` from the send queue" design.
    /// The `tokio::runtime::Handle` is captured here, in the calling async
    /// context, so the blocking thread can still drive the socket's async
    /// `send` via `block_on`.
    fn spawn_send_task(&self, socket: Arc<dyn Socket>) {
        let rt = tokio::runtime::Handle::current();
        let session = self.clone();
        let queue = self.inner.send_queue.clone();
        let join = tokio::task::spawn_blocking(move || loop {
            match queue.get_blocking() {
                SendItem::Stop => break,
                SendItem::Packet(pending) => {
                    let Some(endpoint) = pending.target.or_else(|| session.current_endpoint_net()) else {
                        continue;
                    };
                    let Some(data) = session.encode_outgoing(&pending.block) else {
                        continue;
                    };
                    let len = data.len();
                    let packet = NetPacket { data, endpoint };
                    match rt.block_on(socket.send(&packet)) {
                        Ok(()) => {
                            session.inner.congestion.packet_sent(pending.block.seq, len);
                            session.inner.bytes_sent.fetch_add(len as u64, AtomicOrdering::Relaxed);
                        }
                        Err(e) => session.log(format!("send failed: {e}")),
                    }
                }
            }
        });
        *self.inner.send_task.lock() = Some(join);
    }

    /// Processes one decrypted-and-framed incoming datagram. Decrypt
    /// failures are dropped silently per §7; below `MTPROTO2_MIN_PEER_VERSION`
    /// framing is attempted as legacy first, falling back to MTProto-2 once
    /// (§7, §8 S5) — a successful fallback latches `peer_version` so later
    /// packets take the MTProto-2 path directly.
    fn handle_incoming(&self, bytes: &[u8], from: NetEndpoint) {
        if !self.is_active() {
            return;
        }
        let Some(key) = *self.inner.key.lock() else { return };
        let peer_version = self.inner.peer_version.load(AtomicOrdering::Relaxed) as u8;
        // We decode what the peer encoded as "its own outgoing", i.e. the
        // complement of our own outgoing direction.
        let is_outgoing = !self.inner.is_outgoing.load(AtomicOrdering::Relaxed);
        let crypto = self.inner.crypto.as_ref();

        let decoded = if peer_version >= MTPROTO2_MIN_PEER_VERSION {
            codec::packet::Mtproto2Packet::decode(crypto, &key, bytes, peer_version, is_outgoing)
                .or_else(|_| codec::packet::LegacyPacket::decode(crypto, &key, bytes, peer_version, is_outgoing))
        } else {
            match codec::packet::LegacyPacket::decode(crypto, &key, bytes, peer_version, is_outgoing) {
                Ok(block) => Ok(block),
                Err(_) => {
                    let fallback = codec::packet::Mtproto2Packet::decode(crypto, &key, bytes, peer_version, is_outgoing);
                    if fallback.is_ok() {
                        self.inner.peer_version.store(MTPROTO2_MIN_PEER_VERSION as u32, AtomicOrdering::Relaxed);
                        self.log("mtproto2 fallback latched after a successful decrypt".to_string());
                    }
                    fallback
                }
            }
        };

        let Ok(block) = decoded else {
            return;
        };

        self.inner.bytes_recvd.fetch_add(bytes.len() as u64, AtomicOrdering::Relaxed);
        self.handle_block(block, from);
    }

    fn handle_block(&self, block: SimpleBlock, from: NetEndpoint) {
        let now = Instant::now();
        let outcome = self.inner.ack_window.lock().on_received(block.seq, now);
        if matches!(outcome, AckOutcome::Duplicate | AckOutcome::OutOfOrder) {
            return;
        }

        {
            let acked = AckWindow::acked_sequences(block.last_remote_seq, block.recent_recv_mask);
            let mut queued = self.inner.queued.lock();
            for seq in &acked {
                self.inner.congestion.packet_acknowledged(*seq);
                if let Some(p) = queued.recent_outgoing.iter_mut().find(|p| p.seq == *seq) {
                    p.ack_time = Some(now);
                }
            }
            queued.reliability.retire_acked(&acked);
            queued.extras.retire_acked(block.last_remote_seq);
            self.update_waiting_for_acks(&queued.recent_outgoing);
        }

        let mut state = self.inner.state.lock();
        state.valid_packet_received(now);
        let packet_type = PacketType::try_from(block.packet_type).ok();
        match packet_type {
            Some(PacketType::Init) => {
                drop(state);
                self.handle_init(&block.payload);
            }
            Some(PacketType::InitAck) => state.init_ack_received(now),
            Some(PacketType::StreamData | PacketType::StreamDataX2 | PacketType::StreamDataX3) => {
                state.stream_data_received(now);
                drop(state);
                self.handle_stream_data(&block.payload, now);
            }
            Some(PacketType::Ping) => {
                drop(state);
                self.send_pong(from);
            }
            Some(PacketType::Pong) => self.handle_pong(from, now),
            _ => {}
        }

        for extra in &block.extras {
            let mut queued = self.inner.queued.lock();
            if queued.extras.should_apply(extra.kind, &extra.data) {
                self.apply_extra(extra);
            }
        }
    }

    fn handle_stream_data(&self, payload: &[u8], _now: Instant) {
        if payload.len() < 5 {
            return;
        }
        let stream_id = payload[0];
        let timestamp = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
        let data = &payload[5..];
        let mut streams = self.inner.streams.lock();
        if let Some(stream) = streams.iter_mut().find(|s| s.id == stream_id) {
            if let Some(jb) = &stream.jitter_buffer {
                jb.put(data, timestamp, false);
            }
        }
    }

    fn handle_pong(&self, from: NetEndpoint, now: Instant) {
        let mut endpoints = self.inner.endpoints.lock();
        if let Some(endpoint) = endpoints.endpoints.iter_mut().find(|e| e.net == from) {
            endpoint.pong_count += 1;
            if let Some(sent_at) = endpoint.last_ping_send_time.take() {
                endpoint.record_rtt(now.duration_since(sent_at).as_secs_f64());
            }
        }
    }

    fn apply_extra(&self, extra: &Extra) {
        self.log(format!("applied extra kind={} len={}", extra.kind, extra.data.len()));
    }

    /// Parses `[version, min_version, capability_flags (u32 LE)]` from an
    /// incoming `Init` payload (§4.9, §6). A peer whose version is below
    /// our floor, or whose floor is above our own version, can never agree
    /// on a wire format with us: that's a hard `Failed(Incompatible)`, not
    /// a retryable condition.
    fn handle_init(&self, payload: &[u8]) {
        if payload.len() < 6 {
            return;
        }
        let version = payload[0];
        let min_version = payload[1];
        let capability_flags = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]);
        if version < MIN_PROTOCOL_VERSION || min_version > OUR_PROTOCOL_VERSION {
            self.fail(LastError::Incompatible);
            return;
        }
        self.inner.peer_version.store(version as u32, AtomicOrdering::Relaxed);
        self.inner.peer_capabilities.store(capability_flags, AtomicOrdering::Relaxed);
        self.send_init_ack();
    }

    fn send_init(&self) {
        let mut payload = vec![OUR_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION];
        payload.extend_from_slice(&CAPABILITY_GROUP_CALLS.to_le_bytes());
        self.enqueue_block(PacketType::Init, payload);
    }

    fn send_init_ack(&self) {
        self.enqueue_block(PacketType::InitAck, Vec::new());
    }

    fn send_pong(&self, to: NetEndpoint) {
        self.enqueue_block_to(PacketType::Pong, Vec::new(), Some(to));
    }

    /// Pings every known candidate endpoint once (§4.9 "Endpoint switching",
    /// "UDP connectivity probing"): stamps each endpoint's `last_ping_*`
    /// bookkeeping synchronously, then enqueues the wire ping.
    fn ping_sweep(&self) {
        if !self.is_active() {
            return;
        }
        let now = Instant::now();
        let targets: Vec<NetEndpoint> = {
            let mut endpoints = self.inner.endpoints.lock();
            for endpoint in endpoints.endpoints.iter_mut() {
                endpoint.last_ping_seq = endpoint.last_ping_seq.wrapping_add(1);
                endpoint.last_ping_send_time = Some(now);
            }
            endpoints.endpoints.iter().map(|e| e.net).collect()
        };
        for net in targets {
            self.enqueue_block_to(PacketType::Ping, Vec::new(), Some(net));
        }
    }

    fn current_endpoint_net(&self) -> Option<NetEndpoint> {
        let endpoints = self.inner.endpoints.lock();
        let id = endpoints.current?;
        endpoints.endpoints.iter().find(|e| e.id == id).map(|e| e.net)
    }

    /// Encodes `block` for the wire using whichever framing matches the
    /// peer's negotiated protocol version.
    fn encode_outgoing(&self, block: &SimpleBlock) -> Option<Vec<u8>> {
        let key = (*self.inner.key.lock())?;
        let call_id = (*self.inner.call_id.lock())?;
        let peer_version = self.inner.peer_version.load(AtomicOrdering::Relaxed) as u8;
        let is_outgoing = self.inner.is_outgoing.load(AtomicOrdering::Relaxed);
        let crypto = self.inner.crypto.as_ref();
        Some(if peer_version >= MTPROTO2_MIN_PEER_VERSION {
            codec::packet::Mtproto2Packet::encode(crypto, &key, &call_id, block, peer_version, is_outgoing)
        } else {
            codec::packet::LegacyPacket::encode(crypto, &key, &call_id, block, peer_version, is_outgoing)
        })
    }

    fn enqueue_block(&self, packet_type: PacketType, payload: Vec<u8>) {
        self.enqueue_block_to(packet_type, payload, None);
    }

    fn enqueue_block_to(&self, packet_type: PacketType, payload: Vec<u8>, target: Option<NetEndpoint>) {
        if self.inner.key.lock().is_none() {
            return;
        }
        let seq = self.inner.out_seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.enqueue_block_with_seq(seq, packet_type, payload, target);
    }

    /// Builds a `SimpleBlock` out of `payload` with the current ack/extras
    /// bookkeeping, records it as a recent outgoing packet (for loss-burst
    /// detection), and hands it to the send queue. `seq` is taken as given
    /// rather than assigned here so reliability retries can reuse the
    /// sequence they already recorded.
    fn enqueue_block_with_seq(&self, seq: u32, packet_type: PacketType, payload: Vec<u8>, target: Option<NetEndpoint>) {
        if !self.is_active() {
            return;
        }
        let (last_remote_seq, recent_recv_mask) = {
            let ack = self.inner.ack_window.lock();
            (ack.last_remote_seq, ack.recent_recv_mask())
        };
        let extras: Vec<Extra> = self
            .inner
            .queued
            .lock()
            .extras
            .pending()
            .iter()
            .map(|e| Extra { kind: e.kind, data: e.payload.clone() })
            .collect();
        let size = payload.len();
        let block = SimpleBlock { packet_type: packet_type.into(), last_remote_seq, seq, recent_recv_mask, extras, payload };
        {
            let mut queued = self.inner.queued.lock();
            queued.recent_outgoing.push(RecentOutgoingPacket { seq, send_time: Instant::now(), ack_time: None, size });
            if queued.recent_outgoing.len() > data::RECENT_OUTGOING_CAPACITY {
                queued.recent_outgoing.remove(0);
            }
            self.update_waiting_for_acks(&queued.recent_outgoing);
        }
        self.inner.send_queue.put(SendItem::Packet(PendingOutgoingPacket { block, target }));
    }

    /// §8 S2: a run of `PACKET_LOSS_BURST_THRESHOLD` consecutive unacked
    /// outgoing packets (counted from the newest backwards) trips
    /// `waitingForAcks`; it clears again as soon as a newer packet is
    /// acked, which is exactly what happens once losses stop.
    fn update_waiting_for_acks(&self, recent_outgoing: &[RecentOutgoingPacket]) {
        let trailing_unacked = recent_outgoing.iter().rev().take_while(|p| p.ack_time.is_none()).count();
        let now_waiting = trailing_unacked >= PACKET_LOSS_BURST_THRESHOLD;
        let was_waiting = self.inner.waiting_for_acks.swap(now_waiting, AtomicOrdering::Relaxed);
        if was_waiting != now_waiting {
            self.log(format!(
                "waitingForAcks {} ({trailing_unacked} consecutive unacked outgoing packets)",
                if now_waiting { "engaged" } else { "cleared" }
            ));
        }
    }

    fn is_active(&self) -> bool {
        !matches!(self.inner.state.lock().state(), SessionState::Stopped | SessionState::Failed)
    }

    /// Pushes one encoder output out as a `StreamData` (and, under shitty
    /// internet mode, a companion `StreamEc`) packet. A no-op while
    /// `waitingForAcks` is engaged (§8 S2: "suspend sending").
    pub fn send_audio_frame(&self, stream_id: u8, frame: EncodedFrame) {
        if self.inner.waiting_for_acks.load(AtomicOrdering::Relaxed) {
            return;
        }

        let mut payload = vec![stream_id];
        payload.extend_from_slice(&frame.timestamp.to_le_bytes());
        payload.extend_from_slice(&frame.primary);
        self.enqueue_block(PacketType::StreamData, payload);

        if let Some(secondary) = frame.secondary {
            if self.inner.shitty_internet.lock().is_enabled() {
                let mut ec_payload = vec![stream_id];
                ec_payload.extend_from_slice(&frame.timestamp.to_le_bytes());
                ec_payload.extend_from_slice(&secondary);
                self.enqueue_block(PacketType::StreamEc, ec_payload);
            }
        }
    }

    /// Runs on every timer tick: state-machine watchdog, endpoint
    /// reselection, shitty-internet-mode reevaluation, and congestion/ack
    /// housekeeping, mirroring the set of periodic tasks in §4.10.
    fn tick(&self) {
        if !self.is_active() {
            return;
        }
        let now = Instant::now();
        let changed = self.inner.state.lock().tick(now);
        if changed {
            let current = self.inner.state.lock().state();
            self.inner.observer.connection_state_changed(current);
        }

        self.inner.congestion.tick();
        self.inner.shitty_internet.lock().update(self.inner.congestion.send_loss_ratio());

        let due = {
            let mut queued = self.inner.queued.lock();
            let expired = queued.reliability.drop_expired(now);
            for packet in &expired {
                self.log(format!("reliable send of kind {} timed out", packet.kind));
            }
            queued.reliability.due_for_retry(now, || self.inner.out_seq.fetch_add(1, AtomicOrdering::Relaxed))
        };
        for (kind, payload, seq) in due {
            if let Ok(packet_type) = PacketType::try_from(kind) {
                self.enqueue_block_with_seq(seq, packet_type, payload, None);
            }
        }

        let candidates: Vec<CallEndpoint> = self.inner.endpoints.lock().endpoints.clone();
        let mut endpoints = self.inner.endpoints.lock();
        if let Some(current_id) = endpoints.current {
            if let Some(current) = candidates.iter().find(|e| e.id == current_id) {
                if let Some(target) = pick_switch_target(current, &candidates) {
                    endpoints.current = Some(target.id);
                }
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.lock().state()
    }

    pub fn get_last_error(&self) -> LastError {
        self.inner.state.lock().last_error()
    }

    fn fail(&self, cause: LastError) {
        self.inner.state.lock().fail(cause);
        self.inner.observer.connection_state_changed(SessionState::Failed);
    }

    /// `SendGroupCallKey`: queued as an extra so it rides along with the
    /// next outgoing packets until acked (§4.9 "Extras").
    pub fn send_group_call_key(&self, key: &[u8]) {
        let seq = self.inner.out_seq.load(AtomicOrdering::Relaxed);
        self.inner.queued.lock().extras.queue_outgoing(codec::packet::ExtraType::GroupCallKey as u8, key.to_vec(), seq);
        self.inner.observer.group_call_key_sent();
    }

    pub fn request_call_upgrade(&self) {
        let seq = self.inner.out_seq.load(AtomicOrdering::Relaxed);
        self.inner.queued.lock().extras.queue_outgoing(codec::packet::ExtraType::RequestGroup as u8, Vec::new(), seq);
    }

    pub fn get_stats(&self) -> Stats {
        let mut stats = self.inner.stats.lock().clone();
        stats.send_loss_count = self.inner.congestion.send_loss_count();
        stats.average_rtt = self.inner.congestion.average_rtt();
        stats.congestion_window = self.inner.congestion.congestion_window();
        stats.shitty_internet_mode = self.inner.shitty_internet.lock().is_enabled();
        stats.waiting_for_acks = self.inner.waiting_for_acks.load(AtomicOrdering::Relaxed);
        stats.bytes_sent = self.inner.bytes_sent.load(AtomicOrdering::Relaxed);
        stats.bytes_recvd = self.inner.bytes_recvd.load(AtomicOrdering::Relaxed);
        stats
    }

    pub fn get_debug_log(&self) -> Vec<String> {
        self.inner.debug_log.lock().clone()
    }

    pub fn get_signal_bars_count(&self) -> u8 {
        let rtt = self.inner.congestion.average_rtt();
        match rtt {
            r if r <= 0.0 => 0,
            r if r < 0.15 => 4,
            r if r < 0.3 => 3,
            r if r < 0.6 => 2,
            _ => 1,
        }
    }

    pub fn get_peer_capabilities(&self) -> u32 {
        self.inner.peer_capabilities.load(AtomicOrdering::Relaxed)
    }

    fn log(&self, message: String) {
        log::debug!("{message}");
        let mut debug_log = self.inner.debug_log.lock();
        debug_log.push(message);
        if debug_log.len() > 1000 {
            debug_log.remove(0);
        }
    }

    /// `Stop`: moves to the terminal, non-error `Stopped` state, wakes the
    /// receive loop via `stop_notify`, and pushes the shutdown sentinel
    /// onto the send queue so the send task's blocking loop exits too
    /// (§5's cancellation sequence). `is_active()` going false also stops
    /// `enqueue_block*`/`handle_incoming`/`tick` from doing anything
    /// further, so no packet goes out and no incoming packet is processed
    /// after this returns, even though the spawned tasks wind down
    /// asynchronously in the background rather than being joined here.
    pub fn stop(&self) {
        self.inner.state.lock().stop();
        self.inner.observer.connection_state_changed(SessionState::Stopped);
        self.inner.send_queue.put(SendItem::Stop);
        self.inner.stop_notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use transport::Protocol;

    #[test]
    fn set_remote_endpoints_picks_relay_as_current() {
        let session = Session::new(SessionConfig::default());
        session.set_remote_endpoints(vec![
            RemoteEndpointDescriptor {
                id: 1,
                net: NetEndpoint::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 1000, Protocol::Udp),
                kind: EndpointKind::UdpRelay,
                peer_tag: [0; 16],
            },
            RemoteEndpointDescriptor {
                id: 2,
                net: NetEndpoint::new(IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2)), 2000, Protocol::Udp),
                kind: EndpointKind::UdpP2pInet,
                peer_tag: [0; 16],
            },
        ]);
        assert_eq!(session.inner.endpoints.lock().current, Some(1));
    }

    #[test]
    fn set_encryption_key_derives_fingerprint_and_call_id() {
        let session = Session::new(SessionConfig::default());
        session.set_encryption_key([7u8; 256], true);
        assert!(session.inner.key_fingerprint.lock().is_some());
        assert!(session.inner.call_id.lock().is_some());
    }

    #[test]
    fn fresh_session_starts_in_wait_init_with_no_error() {
        let session = Session::new(SessionConfig::default());
        assert_eq!(session.state(), SessionState::WaitInit);
        assert_eq!(session.get_last_error(), LastError::Unknown);
    }

    #[test]
    fn stop_moves_to_stopped_without_error() {
        let session = Session::new(SessionConfig::default());
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.get_last_error(), LastError::Unknown);
    }

    #[test]
    fn stopped_session_drops_further_enqueued_packets() {
        let session = Session::new(SessionConfig::default());
        session.set_encryption_key([3u8; 256], true);
        session.stop();
        session.send_audio_frame(0, audio::EncodedFrame { primary: vec![1, 2, 3], secondary: None, timestamp: 10 });
        assert!(session.inner.queued.lock().recent_outgoing.is_empty());
    }
}
