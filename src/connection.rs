//! A virtual PRUDP connection: one client address talking to one endpoint through one stream
//!  type / stream ID pair.
//!
//! ```ascii
//!   SYN          CONNECT                     DISCONNECT / ping timeout / resend exhaustion
//!  ─────► Connecting ─────► Connected ─────────────────────────────────► Disconnecting | Faulty
//!   ▲
//!   └ NotConnected (new connection, or reset by a SYN)
//! ```
//!
//! A connection owns the outbound [SlidingWindow] and the inbound reordering state of each
//!  reliable substream, the keys negotiated in the handshake and the heartbeat timer. It is
//!  owned by its [PrudpEndPoint], which is the only place that removes it.
//!
//! Packets of the same connection are processed concurrently. Inbound reliable packets take
//!  the connection's reassembly lock, so dispatch order and fragment reassembly stay consistent.

pub mod packet_dispatch_queue;
pub mod resend_scheduler;
pub mod rtt;
pub mod sliding_window;

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use async_trait::async_trait;
use md5::{Digest, Md5};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, Notify};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use crate::config::{PrudpServerConfig, StreamSettings};
use crate::connection::packet_dispatch_queue::PacketDispatchQueue;
use crate::connection::resend_scheduler::{PacketOutcome, RetransmissionTarget};
use crate::connection::rtt::Rtt;
use crate::connection::sliding_window::SlidingWindow;
use crate::encryption::rc4::Rc4;
use crate::end_point::PrudpEndPoint;
use crate::packet::{PacketFlags, PacketType, PrudpPacket, PrudpVersion, VirtualPort};
use crate::send_pipeline::SendPipeline;
use crate::socket::SocketConnection;
use crate::types::Pid;
use crate::util::counter::Counter;
use crate::util::mutex_map::MutexMap;

const UNRELIABLE_KEY_SALT_1: [u8; 8] = [0x18, 0xD8, 0x23, 0x34, 0x37, 0xE4, 0xE3, 0xFE];
const UNRELIABLE_KEY_SALT_2: [u8; 8] = [0x23, 0x3E, 0x60, 0x01, 0x23, 0xCD, 0xAB, 0x80];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
    Disconnecting,
    Faulty,
}

/// Cipher key of a reliable substream. Substream 0 uses the session key, every further
///  substream modifies the first half of the previous substream's key.
pub fn substream_key(session_key: &[u8], substream_id: u8) -> Vec<u8> {
    let mut key = session_key.to_vec();
    let half = key.len() / 2;
    for _ in 0..substream_id {
        let modifier = half + 1;
        for (i, b) in key.iter_mut().take(half).enumerate() {
            *b = b.wrapping_add((modifier - i) as u8);
        }
    }
    key
}

/// 32 byte key from which the keystream of every unreliable DATA packet is derived
pub fn unreliable_base_key(session_key: &[u8]) -> Vec<u8> {
    let mut first = Md5::new();
    first.update(session_key);
    first.update(UNRELIABLE_KEY_SALT_1);

    let mut second = Md5::new();
    second.update(session_key);
    second.update(UNRELIABLE_KEY_SALT_2);

    let mut key = first.finalize().to_vec();
    key.extend_from_slice(&second.finalize());
    key
}


#[derive(Default, Clone)]
struct ConnectionKeys {
    /// the signature the client sent in CONNECT, outgoing packets are signed with it
    client_connection_signature: Vec<u8>,
    /// the signature the server sent in the SYN-ACK, incoming packets are signed with it
    server_connection_signature: Vec<u8>,
    session_key: Vec<u8>,
    unreliable_base_key: Vec<u8>,
    client_session_id: u8,
    server_session_id: u8,
    pid: Pid,
    max_substream_id: u8,
    minor_version: u32,
    supported_functions: u32,
}

/// Inbound state of a reliable substream
pub(crate) struct ReliableSubstream {
    pub(crate) queue: PacketDispatchQueue,
    pub(crate) fragments: Vec<u8>,
}

impl ReliableSubstream {
    pub(crate) fn new(settings: &StreamSettings) -> ReliableSubstream {
        ReliableSubstream {
            queue: PacketDispatchQueue::new(settings.reorder_window),
            fragments: Vec::new(),
        }
    }
}


pub struct PrudpConnection {
    self_ref: Weak<PrudpConnection>,
    id: u32,
    socket: Arc<SocketConnection>,
    end_point: Weak<PrudpEndPoint>,
    pipeline: Arc<SendPipeline>,
    stream_settings: Arc<StreamSettings>,
    version: PrudpVersion,
    client_port: VirtualPort,
    server_port: VirtualPort,
    discriminator: String,

    state: RwLock<ConnectionState>,
    keys: RwLock<ConnectionKeys>,
    rtt: Arc<Rtt>,
    sliding_windows: MutexMap<u8, Arc<SlidingWindow>>,
    reliable_inbound: tokio::sync::Mutex<FxHashMap<u8, ReliableSubstream>>,
    unreliable_sequence_id_counter: Counter<u16>,
    ping_sequence_id_counter: Counter<u16>,

    /// present until the connection is closed, taking it out makes closing one-shot
    lifetime: Mutex<Option<CancellationToken>>,
    heartbeat_token: Mutex<Option<CancellationToken>>,
    heartbeat: Arc<Notify>,
}

impl PrudpConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        socket: Arc<SocketConnection>,
        end_point: Weak<PrudpEndPoint>,
        pipeline: Arc<SendPipeline>,
        stream_settings: Arc<StreamSettings>,
        version: PrudpVersion,
        client_port: VirtualPort,
        server_port: VirtualPort,
    ) -> Arc<PrudpConnection> {
        let discriminator = Self::discriminator_for(socket.address(), client_port);
        Arc::new_cyclic(|self_ref| PrudpConnection {
            self_ref: self_ref.clone(),
            id,
            socket,
            end_point,
            pipeline,
            stream_settings,
            version,
            client_port,
            server_port,
            discriminator,
            state: RwLock::new(ConnectionState::NotConnected),
            keys: Default::default(),
            rtt: Arc::new(Rtt::new()),
            sliding_windows: MutexMap::new(),
            reliable_inbound: Default::default(),
            unreliable_sequence_id_counter: Counter::new(1),
            ping_sequence_id_counter: Counter::new(0),
            lifetime: Mutex::new(Some(CancellationToken::new())),
            heartbeat_token: Mutex::new(None),
            heartbeat: Arc::new(Notify::new()),
        })
    }

    /// key of a connection in its endpoint's connection table
    pub fn discriminator_for(address: SocketAddr, client_port: VirtualPort) -> String {
        format!("{}-{}-{}", address, client_port.stream_type, client_port.stream_id)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.socket.address()
    }

    pub fn discriminator(&self) -> &str {
        &self.discriminator
    }

    pub fn version(&self) -> PrudpVersion {
        self.version
    }

    pub fn client_port(&self) -> VirtualPort {
        self.client_port
    }

    pub fn server_port(&self) -> VirtualPort {
        self.server_port
    }

    pub fn socket(&self) -> &Arc<SocketConnection> {
        &self.socket
    }

    pub fn config(&self) -> &PrudpServerConfig {
        self.pipeline.config()
    }

    pub fn stream_settings(&self) -> &Arc<StreamSettings> {
        &self.stream_settings
    }

    pub fn rtt(&self) -> &Arc<Rtt> {
        &self.rtt
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        if *current != state {
            trace!("connection {}: {:?} -> {:?}", self.discriminator, *current, state);
            *current = state;
        }
    }

    pub fn pid(&self) -> Pid {
        self.keys.read().pid
    }

    pub fn set_pid(&self, pid: Pid) {
        self.keys.write().pid = pid;
    }

    pub fn session_key(&self) -> Vec<u8> {
        self.keys.read().session_key.clone()
    }

    /// Stores the session key from a Kerberos ticket and re-keys all substreams with it
    pub fn set_session_key(&self, session_key: &[u8]) -> anyhow::Result<()> {
        {
            let mut keys = self.keys.write();
            keys.session_key = session_key.to_vec();
            keys.unreliable_base_key = unreliable_base_key(session_key);
        }

        for window in self.sliding_windows.values() {
            window.set_cipher_key(&substream_key(session_key, window.substream_id()))?;
        }
        Ok(())
    }

    pub fn unreliable_base_key(&self) -> Vec<u8> {
        self.keys.read().unreliable_base_key.clone()
    }

    pub fn client_connection_signature(&self) -> Vec<u8> {
        self.keys.read().client_connection_signature.clone()
    }

    pub fn set_client_connection_signature(&self, signature: Vec<u8>) {
        self.keys.write().client_connection_signature = signature;
    }

    pub fn server_connection_signature(&self) -> Vec<u8> {
        self.keys.read().server_connection_signature.clone()
    }

    pub fn set_server_connection_signature(&self, signature: Vec<u8>) {
        self.keys.write().server_connection_signature = signature;
    }

    pub fn client_session_id(&self) -> u8 {
        self.keys.read().client_session_id
    }

    pub fn server_session_id(&self) -> u8 {
        self.keys.read().server_session_id
    }

    pub fn set_session_ids(&self, client_session_id: u8, server_session_id: u8) {
        let mut keys = self.keys.write();
        keys.client_session_id = client_session_id;
        keys.server_session_id = server_session_id;
    }

    /// the v1 / Lite parameters agreed on in the SYN handshake
    pub fn set_negotiated(&self, max_substream_id: u8, minor_version: u32, supported_functions: u32) {
        let mut keys = self.keys.write();
        keys.max_substream_id = max_substream_id;
        keys.minor_version = minor_version;
        keys.supported_functions = supported_functions;
    }

    pub fn max_substream_id(&self) -> u8 {
        self.keys.read().max_substream_id
    }

    pub fn minor_version(&self) -> u32 {
        self.keys.read().minor_version
    }

    pub fn supported_functions(&self) -> u32 {
        self.keys.read().supported_functions
    }

    /// Creates the outbound and inbound state of substreams `0..=max_substream_id`
    pub async fn init_substreams(&self, max_substream_id: u8) {
        let mut inbound = self.reliable_inbound.lock().await;
        for substream_id in 0..=max_substream_id {
            self.sliding_window(substream_id);
            inbound.entry(substream_id).or_insert_with(|| ReliableSubstream::new(&self.stream_settings));
        }
    }

    /// The outbound state of a substream. Substreams are created when the connection is
    ///  established, and on demand if a packet for an unknown one shows up.
    pub fn sliding_window(&self, substream_id: u8) -> Arc<SlidingWindow> {
        let (window, created) = self.sliding_windows.get_or_insert_with(substream_id, || {
            let target: Weak<dyn RetransmissionTarget> = self.self_ref.clone();
            Arc::new(SlidingWindow::new(substream_id, self.stream_settings.clone(), self.rtt.clone(), target))
        });

        if created {
            let session_key = self.session_key();
            if !session_key.is_empty() {
                if let Err(e) = window.set_cipher_key(&substream_key(&session_key, substream_id)) {
                    warn!("connection {}: could not key substream {}: {}", self.discriminator, substream_id, e);
                }
            }
        }
        window
    }

    pub(crate) fn reliable_inbound(&self) -> &tokio::sync::Mutex<FxHashMap<u8, ReliableSubstream>> {
        &self.reliable_inbound
    }

    /// 2, 3, ... for unreliable DATA packets
    pub fn next_unreliable_sequence_id(&self) -> u16 {
        self.unreliable_sequence_id_counter.next()
    }

    /// 1, 2, ... for PING packets
    pub fn next_ping_sequence_id(&self) -> u16 {
        self.ping_sequence_id_counter.next()
    }

    /// RC4 key of a single unreliable DATA packet
    pub fn unreliable_packet_key(&self, sequence_id: u16, session_id: u8) -> Vec<u8> {
        let mut key = self.unreliable_base_key();
        if key.len() < 32 {
            key = unreliable_base_key(&[]);
        }
        key[0] = (key[0] as u16).wrapping_add(sequence_id) as u8;
        key[1] = ((key[1] as u16).wrapping_add(sequence_id) >> 8) as u8;
        key[31] = key[31].wrapping_add(session_id);
        key
    }

    /// Encrypts or decrypts the payload of an unreliable DATA packet. The keystream depends
    ///  on the packet's sequence and session IDs only, so packets can be processed in any order.
    pub fn process_unreliable_crypto(&self, packet: &PrudpPacket) -> anyhow::Result<Vec<u8>> {
        let key = self.unreliable_packet_key(packet.sequence_id, packet.session_id);
        Ok(Rc4::new(&key)?.process(&packet.payload))
    }

    /// Sends a packet through the connection's send pipeline, fragmenting the payload as
    ///  needed. One outcome receiver is returned per fragment that waits for an acknowledgement.
    pub async fn send(&self, packet: PrudpPacket) -> anyhow::Result<Vec<oneshot::Receiver<PacketOutcome>>> {
        self.pipeline.send(self, packet).await
    }

    pub async fn send_ping(&self) {
        let mut ping = PrudpPacket::new(self.version, PacketType::Ping);
        ping.source = self.server_port;
        ping.destination = self.client_port;
        ping.add_flag(PacketFlags::NEEDS_ACK);

        if let Err(e) = self.pipeline.finalize_and_send_packet(self, ping).await {
            warn!("connection {}: error sending PING: {}", self.discriminator, e);
        }
    }

    /// Drops all substream state and keys. The connection is back in `NotConnected`, the
    ///  heartbeat keeps running.
    pub async fn reset(&self) {
        for window in self.sliding_windows.values() {
            window.resend_scheduler().stop();
        }
        self.sliding_windows.clear(|_, _| {});
        self.reliable_inbound.lock().await.clear();

        *self.keys.write() = ConnectionKeys::default();
        self.unreliable_sequence_id_counter.reset(1);
        self.ping_sequence_id_counter.reset(0);
        self.rtt.reset();
        self.set_state(ConnectionState::NotConnected);
    }

    /// (Re)starts the heartbeat: after `ping_timeout` without inbound packets a PING is sent,
    ///  after another `ping_timeout` without reaction the connection is dropped.
    pub fn start_heartbeat(&self) {
        let Some(lifetime) = self.lifetime.lock().clone() else {
            return;
        };

        let token = lifetime.child_token();
        if let Some(previous) = self.heartbeat_token.lock().replace(token.clone()) {
            previous.cancel();
        }

        tokio::spawn(run_heartbeat(
            self.self_ref.clone(),
            self.heartbeat.clone(),
            token,
            self.config().ping_timeout,
        ));
    }

    /// called for every packet received from the client
    pub fn reset_heartbeat(&self) {
        self.heartbeat.notify_one();
    }

    pub fn stop_heartbeat(&self) {
        if let Some(token) = self.heartbeat_token.lock().take() {
            token.cancel();
        }
    }

    /// Ends the connection: stops all timers and moves to the final state. Only the first call
    ///  has an effect and returns `true`.
    pub fn close(&self, final_state: ConnectionState) -> bool {
        let Some(lifetime) = self.lifetime.lock().take() else {
            return false;
        };
        lifetime.cancel();
        self.heartbeat_token.lock().take();

        for window in self.sliding_windows.values() {
            window.resend_scheduler().stop();
        }
        self.set_state(final_state);
        debug!("connection {} closed ({:?})", self.discriminator, final_state);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.lifetime.lock().is_none()
    }

    /// removes the connection from its endpoint, or just closes it if there is none
    async fn terminate(&self, final_state: ConnectionState) {
        match (self.end_point.upgrade(), self.self_ref.upgrade()) {
            (Some(end_point), Some(connection)) => {
                end_point.cleanup_connection(&connection, final_state).await;
            }
            _ => {
                self.close(final_state);
            }
        }
    }
}

async fn run_heartbeat(connection: Weak<PrudpConnection>, heartbeat: Arc<Notify>, token: CancellationToken, ping_timeout: Duration) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = heartbeat.notified() => continue,
            _ = sleep(ping_timeout) => {}
        }

        match connection.upgrade() {
            Some(connection) => {
                debug!("connection {}: no packets for {:?}, sending PING", connection.discriminator, ping_timeout);
                connection.send_ping().await;
            }
            None => return,
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = heartbeat.notified() => continue,
            _ = sleep(ping_timeout) => {}
        }

        if let Some(connection) = connection.upgrade() {
            info!("connection {} timed out", connection.discriminator);
            connection.terminate(ConnectionState::Faulty).await;
        }
        return;
    }
}

#[async_trait]
impl RetransmissionTarget for PrudpConnection {
    fn can_retransmit(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    async fn retransmit(&self, packet: &PrudpPacket) {
        self.socket.send(&packet.encode(self.config())).await;
    }

    async fn on_retransmissions_exhausted(&self) {
        info!("connection {}: reliable packet was never acknowledged, dropping the connection", self.discriminator);
        self.terminate(ConnectionState::Faulty).await;
    }
}


#[cfg(test)]
mod tests {
    use tokio::runtime::Builder;
    use super::*;
    use crate::config::PrudpServerConfig;
    use crate::packet::StreamType;
    use crate::packet::tests::test_config;
    use crate::test_util::TrackingPacketSocket;

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    fn connection_with(config: PrudpServerConfig, socket: Arc<TrackingPacketSocket>) -> Arc<PrudpConnection> {
        let address = SocketAddr::from(([10, 0, 0, 1], 5000));
        PrudpConnection::new(
            7,
            Arc::new(SocketConnection::new(address, socket)),
            Weak::new(),
            Arc::new(SendPipeline::new(Arc::new(config))),
            Arc::new(StreamSettings::default()),
            PrudpVersion::V1,
            VirtualPort::new(StreamType::RVSecure, 15),
            VirtualPort::new(StreamType::RVSecure, 1),
        )
    }

    fn connection() -> Arc<PrudpConnection> {
        connection_with(test_config("6f599f81"), Arc::new(TrackingPacketSocket::new()))
    }

    #[test]
    fn test_discriminator() {
        assert_eq!(connection().discriminator(), "10.0.0.1:5000-10-15");
    }

    #[test]
    fn test_substream_key() {
        let session_key = [0u8, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(substream_key(&session_key, 0), session_key.to_vec());
        assert_eq!(substream_key(&session_key, 1), vec![5, 4, 3, 2, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(substream_key(&session_key, 2), vec![10, 8, 6, 4, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_unreliable_base_key() {
        let key = unreliable_base_key(b"session key");
        assert_eq!(key.len(), 32);

        let mut first = b"session key".to_vec();
        first.extend_from_slice(&UNRELIABLE_KEY_SALT_1);
        assert_eq!(&key[..16], Md5::digest(&first).as_slice());
    }

    #[test]
    fn test_unreliable_packet_key() {
        let connection = connection();
        paused_runtime().block_on(async {
            connection.set_session_key(&[1; 32]).unwrap();
        });
        let base = connection.unreliable_base_key();

        let key = connection.unreliable_packet_key(0x0102, 0x85);
        assert_eq!(key[0], (base[0] as u16 + 0x0102) as u8);
        assert_eq!(key[1], ((base[1] as u16 + 0x0102) >> 8) as u8);
        assert_eq!(&key[2..31], &base[2..31]);
        assert_eq!(key[31], base[31].wrapping_add(0x85));
    }

    #[test]
    fn test_unreliable_crypto_is_symmetric() {
        let connection = connection();
        let mut packet = PrudpPacket::new(PrudpVersion::V1, PacketType::Data);
        packet.sequence_id = 9;
        packet.session_id = 3;
        packet.payload = b"unreliable".to_vec();

        let encrypted = connection.process_unreliable_crypto(&packet).unwrap();
        assert_ne!(encrypted, packet.payload);

        packet.payload = encrypted;
        assert_eq!(connection.process_unreliable_crypto(&packet).unwrap(), b"unreliable");
    }

    #[test]
    fn test_session_key_fans_out_to_substreams() {
        let connection = connection();
        paused_runtime().block_on(async {
            connection.init_substreams(2).await;
            connection.set_session_key(&[7; 32]).unwrap();

            assert_eq!(connection.sliding_window(0).cipher_key(), vec![7; 32]);
            assert_eq!(connection.sliding_window(1).cipher_key(), substream_key(&[7; 32], 1));
            assert_eq!(connection.sliding_window(2).cipher_key(), substream_key(&[7; 32], 2));

            // created on demand after the session key is known
            assert_eq!(connection.sliding_window(3).cipher_key(), substream_key(&[7; 32], 3));
        });
    }

    #[test]
    fn test_counters() {
        let connection = connection();
        assert_eq!(connection.next_unreliable_sequence_id(), 2);
        assert_eq!(connection.next_unreliable_sequence_id(), 3);
        assert_eq!(connection.next_ping_sequence_id(), 1);
        assert_eq!(connection.next_ping_sequence_id(), 2);

        paused_runtime().block_on(connection.reset());
        assert_eq!(connection.next_unreliable_sequence_id(), 2);
        assert_eq!(connection.next_ping_sequence_id(), 1);
    }

    #[test]
    fn test_close_is_one_shot() {
        let connection = connection();
        connection.set_state(ConnectionState::Connected);
        assert!(!connection.is_closed());

        assert!(connection.close(ConnectionState::Disconnecting));
        assert!(!connection.close(ConnectionState::Faulty));
        assert!(connection.is_closed());
        assert_eq!(connection.state(), ConnectionState::Disconnecting);
    }

    #[test]
    fn test_reset() {
        let connection = connection();
        paused_runtime().block_on(async {
            connection.set_state(ConnectionState::Connected);
            connection.set_pid(Pid(5));
            connection.init_substreams(1).await;
            connection.set_session_key(&[7; 32]).unwrap();

            connection.reset().await;
            assert_eq!(connection.state(), ConnectionState::NotConnected);
            assert_eq!(connection.pid(), Pid(0));
            assert!(connection.session_key().is_empty());
            assert!(connection.reliable_inbound().lock().await.is_empty());
            assert_eq!(connection.sliding_window(0).cipher_key(), b"CD&ML");
        });
    }

    #[test]
    fn test_heartbeat_pings_then_times_out() {
        let mut config = test_config("6f599f81");
        config.ping_timeout = Duration::from_secs(5);
        let socket = Arc::new(TrackingPacketSocket::new());
        let connection = connection_with(config, socket.clone());

        paused_runtime().block_on(async move {
            connection.set_state(ConnectionState::Connected);
            connection.start_heartbeat();

            sleep(Duration::from_secs(3)).await;
            connection.reset_heartbeat();
            sleep(Duration::from_secs(3)).await;
            assert!(socket.sent().is_empty());

            sleep(Duration::from_secs(3)).await;
            let sent = socket.decode_sent(connection.config());
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].packet_type, PacketType::Ping);
            assert_eq!(sent[0].flags, PacketFlags::NEEDS_ACK);
            assert_eq!(sent[0].sequence_id, 1);
            assert!(!connection.is_closed());

            sleep(Duration::from_secs(6)).await;
            assert!(connection.is_closed());
            assert_eq!(connection.state(), ConnectionState::Faulty);
        });
    }

    #[test]
    fn test_heartbeat_survives_with_traffic() {
        let mut config = test_config("6f599f81");
        config.ping_timeout = Duration::from_secs(5);
        let socket = Arc::new(TrackingPacketSocket::new());
        let connection = connection_with(config, socket.clone());

        paused_runtime().block_on(async move {
            connection.start_heartbeat();
            sleep(Duration::from_secs(6)).await;
            assert_eq!(socket.sent().len(), 1);

            // the client acknowledges the PING
            connection.reset_heartbeat();
            sleep(Duration::from_secs(4)).await;
            assert!(!connection.is_closed());

            connection.close(ConnectionState::Disconnecting);
            sleep(Duration::from_secs(60)).await;
            assert!(socket.sent().is_empty());
        });
    }
}
