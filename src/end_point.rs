//! One PRUDP endpoint per stream ID: the connection table and the packet state machine.
//!
//! Every inbound packet is processed on its own task, so several packets of the same connection
//!  may be in flight at once. Handshake packets are guarded by the connection state. Reliable
//!  DATA and PING packets go through the substream's dispatch queue under the connection's
//!  reassembly lock, which restores sequence order and keeps fragment buffers consistent.

pub mod events;

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use anyhow::{anyhow, bail};
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};
use crate::config::{EndPointConfig, PrudpServerConfig, StreamSettings};
use crate::connection::{ConnectionState, PrudpConnection, ReliableSubstream};
use crate::connection::resend_scheduler::PacketOutcome;
use crate::end_point::events::{AccountLookup, EndPointEvents};
use crate::kerberos::{derive_kerberos_key, read_connect_request};
use crate::packet::{PacketFlags, PacketOptions, PacketType, PrudpPacket, PrudpVersion, VirtualPort};
use crate::result_code::codes;
use crate::rmc::RmcMessage;
use crate::send_pipeline::SendPipeline;
use crate::socket::SocketConnection;
use crate::types::Pid;
use crate::util::byte_stream::{ByteStreamIn, ByteStreamOut};
use crate::util::counter::Counter;
use crate::util::mutex_map::MutexMap;
use crate::util::mutex_slice::MutexSlice;
use crate::util::random::{Random, RngRandom};

/// number of times the ACK for a DISCONNECT is sent, since the client will not retransmit
const DISCONNECT_ACK_REPETITIONS: usize = 3;

pub struct PrudpEndPoint {
    self_ref: Weak<PrudpEndPoint>,
    config: EndPointConfig,
    stream_settings: Arc<StreamSettings>,
    pipeline: Arc<SendPipeline>,
    /// by discriminator
    connections: MutexMap<String, Arc<PrudpConnection>>,
    /// the server's client address table, shared by all endpoints
    sockets: Arc<MutexMap<SocketAddr, Arc<SocketConnection>>>,
    connection_id_counter: Counter<u32>,
    handlers: MutexSlice<Arc<dyn EndPointEvents>>,
    account_lookup: RwLock<Option<Arc<dyn AccountLookup>>>,
}

impl PrudpEndPoint {
    pub fn new(config: EndPointConfig, pipeline: Arc<SendPipeline>, sockets: Arc<MutexMap<SocketAddr, Arc<SocketConnection>>>) -> Arc<PrudpEndPoint> {
        let stream_settings = Arc::new(config.stream_settings.clone());
        Arc::new_cyclic(|self_ref| PrudpEndPoint {
            self_ref: self_ref.clone(),
            config,
            stream_settings,
            pipeline,
            connections: MutexMap::new(),
            sockets,
            connection_id_counter: Counter::new(0),
            handlers: MutexSlice::new(),
            account_lookup: RwLock::new(None),
        })
    }

    pub fn stream_id(&self) -> u8 {
        self.config.stream_id
    }

    pub fn config(&self) -> &EndPointConfig {
        &self.config
    }

    fn server_config(&self) -> &PrudpServerConfig {
        self.pipeline.config()
    }

    pub fn add_handler(&self, handler: Arc<dyn EndPointEvents>) {
        self.handlers.add(handler);
    }

    pub fn set_account_lookup(&self, account_lookup: Arc<dyn AccountLookup>) {
        *self.account_lookup.write() = Some(account_lookup);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// a snapshot of all current connections, e.g. for broadcasting
    pub fn connections(&self) -> Vec<Arc<PrudpConnection>> {
        self.connections.values()
    }

    pub fn find_connection_by_pid(&self, pid: Pid) -> Option<Arc<PrudpConnection>> {
        self.connections.find(|c| c.pid() == pid)
    }

    pub fn find_connection(&self, address: SocketAddr, port: VirtualPort) -> Option<Arc<PrudpConnection>> {
        self.connections.get(&PrudpConnection::discriminator_for(address, port))
    }

    /// Wraps the message in a reliable DATA packet on substream 0 and sends it
    pub async fn send_rmc(&self, connection: &PrudpConnection, message: &RmcMessage) -> anyhow::Result<Vec<oneshot::Receiver<PacketOutcome>>> {
        let mut packet = PrudpPacket::new(connection.version(), PacketType::Data);
        packet.source = connection.server_port();
        packet.destination = connection.client_port();
        packet.flags = PacketFlags::RELIABLE | PacketFlags::NEEDS_ACK;
        packet.payload = message.to_bytes(self.config.use_verbose_rmc, self.server_config().byte_stream_settings);
        connection.send(packet).await
    }

    pub async fn send(&self, connection: &PrudpConnection, packet: PrudpPacket) -> anyhow::Result<Vec<oneshot::Receiver<PacketOutcome>>> {
        connection.send(packet).await
    }

    /// Entry point for all packets addressed to this endpoint's stream ID
    pub async fn process_packet(&self, socket: Arc<SocketConnection>, packet: PrudpPacket) {
        let Some(connection) = self.connection_for(&socket, &packet) else {
            return;
        };
        connection.reset_heartbeat();

        if self.server_config().verify_signatures && !self.has_valid_signature(&connection, &packet) {
            debug!("packet {:?} from {:?} has an invalid signature - dropping", packet.packet_type, socket.address());
            return;
        }

        if packet.has_flag(PacketFlags::ACK) || packet.has_flag(PacketFlags::MULTI_ACK) {
            self.handle_acknowledgment(&connection, &packet);
            return;
        }

        let result = match packet.packet_type {
            PacketType::Syn => self.handle_syn(&connection, packet).await,
            PacketType::Connect => self.handle_connect(&connection, packet).await,
            PacketType::Data => self.handle_data(&connection, packet).await,
            PacketType::Disconnect => self.handle_disconnect(&connection, packet).await,
            PacketType::Ping => self.handle_ping(&connection, packet).await,
        };

        if let Err(e) = result {
            warn!("error processing packet from connection {}: {}", connection.discriminator(), e);
        }
    }

    /// The connection a packet belongs to. Only a SYN creates a connection, anything else for
    ///  an unknown connection is dropped.
    fn connection_for(&self, socket: &Arc<SocketConnection>, packet: &PrudpPacket) -> Option<Arc<PrudpConnection>> {
        let discriminator = PrudpConnection::discriminator_for(socket.address(), packet.source);
        if let Some(connection) = self.connections.get(&discriminator) {
            if connection.is_closed() {
                debug!("packet for closed connection {} - dropping", discriminator);
                return None;
            }
            return Some(connection);
        }

        if packet.packet_type != PacketType::Syn || packet.has_flag(PacketFlags::ACK) {
            debug!("{:?} packet for unknown connection {} - dropping", packet.packet_type, discriminator);
            return None;
        }

        let (connection, created) = self.connections.get_or_insert_with(discriminator.clone(), || PrudpConnection::new(
            self.connection_id_counter.next(),
            socket.clone(),
            self.self_ref.clone(),
            self.pipeline.clone(),
            self.stream_settings.clone(),
            packet.version,
            packet.source,
            packet.destination,
        ));
        if created {
            debug!("new connection {} with id {}", discriminator, connection.id());
            socket.register(self.stream_id(), &discriminator, connection.id());
            connection.start_heartbeat();
        }
        Some(connection)
    }

    fn has_valid_signature(&self, connection: &PrudpConnection, packet: &PrudpPacket) -> bool {
        let is_checked = packet.version == PrudpVersion::V1
            && matches!(packet.packet_type, PacketType::Data | PacketType::Ping | PacketType::Disconnect)
            && connection.state() == ConnectionState::Connected;
        if !is_checked {
            return true;
        }

        packet.verify_signature(self.server_config(), &connection.session_key(), &connection.server_connection_signature())
            .unwrap_or_else(|e| {
                warn!("could not calculate signature: {}", e);
                false
            })
    }

    async fn handle_syn(&self, connection: &Arc<PrudpConnection>, packet: PrudpPacket) -> anyhow::Result<()> {
        if connection.state() != ConnectionState::NotConnected {
            debug!("SYN for connection {} in state {:?} - dropping", connection.discriminator(), connection.state());
            return Ok(());
        }

        connection.reset().await;

        let config = self.server_config();
        let signature = PrudpPacket::calculate_connection_signature(packet.version, config, connection.address())?;
        connection.set_server_connection_signature(signature.clone());

        let mut ack = packet.reply(PacketType::Syn);
        ack.flags = PacketFlags::ACK | PacketFlags::HAS_SIZE;
        ack.connection_signature = signature;

        if packet.version != PrudpVersion::V0 {
            let max_substream_id = packet.options.maximum_substream_id.min(config.max_substream_id);
            let minor_version = packet.options.minor_version.min(config.minor_version);
            let supported_functions = packet.options.supported_functions & config.supported_functions;
            connection.set_negotiated(max_substream_id, minor_version, supported_functions);

            ack.options = PacketOptions {
                supported_functions,
                minor_version,
                maximum_substream_id: max_substream_id,
                ..Default::default()
            };
        }

        connection.set_state(ConnectionState::Connecting);
        self.pipeline.finalize_and_send_packet(connection, ack).await?;
        Ok(())
    }

    async fn handle_connect(&self, connection: &Arc<PrudpConnection>, packet: PrudpPacket) -> anyhow::Result<()> {
        if connection.state() != ConnectionState::Connecting {
            debug!("CONNECT for connection {} in state {:?} - dropping", connection.discriminator(), connection.state());
            return Ok(());
        }

        let client_signature = if packet.version == PrudpVersion::Lite {
            packet.options.lite_signature.clone()
        }
        else {
            packet.connection_signature.clone()
        };
        connection.set_client_connection_signature(client_signature.clone());
        connection.set_session_ids(packet.session_id, RngRandom::next_u8());
        connection.init_substreams(connection.max_substream_id()).await;

        let payload = if self.config.is_secure_endpoint {
            self.redeem_kerberos_ticket(connection, &packet)?
        }
        else {
            Vec::new()
        };

        let mut ack = packet.reply(PacketType::Connect);
        ack.flags = PacketFlags::ACK | PacketFlags::HAS_SIZE;
        ack.connection_signature = vec![0; client_signature.len()];
        ack.sequence_id = 1;
        ack.options = packet.options.clone();
        ack.payload = payload;

        connection.set_state(ConnectionState::Connected);
        self.pipeline.finalize_and_send_packet(connection, ack).await?;
        connection.start_heartbeat();
        info!("connection {} established (pid {})", connection.discriminator(), connection.pid());

        for handler in self.handlers.snapshot() {
            handler.on_connect(connection).await;
        }
        Ok(())
    }

    /// Validates the Kerberos ticket in a CONNECT payload and keys the connection with its
    ///  session key. Returns the CONNECT-ACK payload proving that the server could read it.
    fn redeem_kerberos_ticket(&self, connection: &PrudpConnection, packet: &PrudpPacket) -> anyhow::Result<Vec<u8>> {
        let config = self.server_config();
        let settings = config.byte_stream_settings;
        let encrypted_connect = packet.version == PrudpVersion::V0 && config.prudp_v0.encrypted_connect;

        let mut payload = packet.payload.clone();
        if encrypted_connect {
            payload = self.stream_settings.encryption_algorithm.box_clone().decrypt(&payload)?;
        }
        let payload = self.stream_settings.compression_algorithm.decompress(&payload)?;

        let Some(server_account) = &self.config.server_account else {
            error!("secure endpoint {} has no server account configured", self.config.stream_id);
            bail!("no server account");
        };
        let Some(account_lookup) = self.account_lookup.read().clone() else {
            error!("secure endpoint {} has no account lookup", self.config.stream_id);
            bail!("no account lookup");
        };

        let account = account_lookup.account_details_by_username(&server_account.username)
            .map_err(|code| anyhow!("lookup of server account {} failed: {}", server_account.username, code))?;
        if account.password != server_account.password {
            error!("password of server account {} does not match account storage", server_account.username);
            bail!("server account password mismatch");
        }

        let server_key = derive_kerberos_key(account.pid, account.password.as_bytes());
        let request = read_connect_request(&payload, &server_key, config.kerberos_ticket_version, config.session_key_length, settings)?;

        connection.set_pid(request.pid);
        connection.set_session_key(&request.session_key)?;

        let mut check_value = ByteStreamOut::new(settings);
        check_value.write_u32_le(request.check_value.wrapping_add(1));
        let mut response = ByteStreamOut::new(settings);
        response.write_buffer(check_value.as_slice());

        let mut response = self.stream_settings.compression_algorithm.compress(response.as_slice())?;
        if encrypted_connect {
            response = self.stream_settings.encryption_algorithm.box_clone().encrypt(&response)?;
        }
        Ok(response)
    }

    async fn handle_data(&self, connection: &Arc<PrudpConnection>, packet: PrudpPacket) -> anyhow::Result<()> {
        if connection.state() != ConnectionState::Connected {
            debug!("DATA for connection {} in state {:?} - dropping", connection.discriminator(), connection.state());
            return Ok(());
        }

        if packet.has_flag(PacketFlags::NEEDS_ACK) {
            self.acknowledge_packet(connection, &packet).await?;
        }

        if packet.has_flag(PacketFlags::RELIABLE) {
            self.dispatch_reliable(connection, packet).await;
            return Ok(());
        }

        if packet.fragment_id != 0 {
            warn!("fragmented unreliable DATA packet from connection {} - dropping", connection.discriminator());
            return Ok(());
        }

        let payload = if packet.version == PrudpVersion::Lite {
            packet.payload.clone()
        }
        else {
            connection.process_unreliable_crypto(&packet)?
        };
        let payload = self.stream_settings.compression_algorithm.decompress(&payload)?;
        let message = RmcMessage::from_bytes(&payload, self.config.use_verbose_rmc, self.server_config().byte_stream_settings)?;
        self.emit_data(connection, message).await
    }

    /// Queues a reliable packet and processes all packets of its substream that are now in
    ///  sequence. Complete messages are emitted while the reassembly lock is held, so they reach
    ///  the handlers in order.
    async fn dispatch_reliable(&self, connection: &Arc<PrudpConnection>, packet: PrudpPacket) {
        let mut inbound = connection.reliable_inbound().lock().await;
        let substream = inbound.entry(packet.substream_id)
            .or_insert_with(|| ReliableSubstream::new(connection.stream_settings()));
        substream.queue.queue(packet);

        while let Some(next) = substream.queue.get_next_to_dispatch() {
            substream.queue.dispatched(&next);
            if next.packet_type != PacketType::Data {
                continue;
            }

            match self.decode_reliable_payload(connection, &next) {
                Ok(payload) => substream.fragments.extend_from_slice(&payload),
                Err(e) => {
                    warn!("could not decode reliable payload {} of connection {}: {}", next.sequence_id, connection.discriminator(), e);
                    substream.fragments.clear();
                    continue;
                }
            }

            if next.fragment_id != 0 {
                trace!("buffered fragment {} of connection {}", next.fragment_id, connection.discriminator());
                continue;
            }

            let data = std::mem::take(&mut substream.fragments);
            let result = match RmcMessage::from_bytes(&data, self.config.use_verbose_rmc, self.server_config().byte_stream_settings) {
                Ok(message) => self.emit_data(connection, message).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("could not process message from connection {}: {}", connection.discriminator(), e);
            }
        }
    }

    fn decode_reliable_payload(&self, connection: &PrudpConnection, packet: &PrudpPacket) -> anyhow::Result<Vec<u8>> {
        let payload = if packet.version == PrudpVersion::Lite {
            packet.payload.clone()
        }
        else {
            connection.sliding_window(packet.substream_id).decrypt(&packet.payload)?
        };
        self.stream_settings.compression_algorithm.decompress(&payload)
    }

    async fn emit_data(&self, connection: &Arc<PrudpConnection>, message: RmcMessage) -> anyhow::Result<()> {
        let mut handled = false;
        for handler in self.handlers.snapshot() {
            if handler.on_data(connection, &message).await {
                handled = true;
            }
        }

        if !handled {
            debug!("no handler for protocol {} method {}", message.protocol_id, message.method_id);
            if self.config.respond_not_implemented && message.is_request {
                self.send_rmc(connection, &message.error_response(codes::Core::NotImplemented)).await?;
            }
        }
        Ok(())
    }

    async fn handle_disconnect(&self, connection: &Arc<PrudpConnection>, packet: PrudpPacket) -> anyhow::Result<()> {
        if packet.has_flag(PacketFlags::NEEDS_ACK) {
            for _ in 0..DISCONNECT_ACK_REPETITIONS {
                self.acknowledge_packet(connection, &packet).await?;
            }
        }

        if self.cleanup_connection(connection, ConnectionState::Disconnecting).await {
            for handler in self.handlers.snapshot() {
                handler.on_disconnect(connection).await;
            }
        }
        Ok(())
    }

    async fn handle_ping(&self, connection: &Arc<PrudpConnection>, packet: PrudpPacket) -> anyhow::Result<()> {
        if connection.state() != ConnectionState::Connected {
            debug!("PING for connection {} in state {:?} - dropping", connection.discriminator(), connection.state());
            return Ok(());
        }

        if packet.has_flag(PacketFlags::NEEDS_ACK) {
            self.acknowledge_packet(connection, &packet).await?;
        }
        if packet.has_flag(PacketFlags::RELIABLE) {
            self.dispatch_reliable(connection, packet).await;
        }
        Ok(())
    }

    async fn acknowledge_packet(&self, connection: &PrudpConnection, packet: &PrudpPacket) -> anyhow::Result<()> {
        let mut ack = packet.reply(packet.packet_type);
        ack.flags = PacketFlags::ACK;
        ack.sequence_id = packet.sequence_id;
        ack.fragment_id = packet.fragment_id;
        self.pipeline.finalize_and_send_packet(connection, ack).await?;
        Ok(())
    }

    fn handle_acknowledgment(&self, connection: &PrudpConnection, packet: &PrudpPacket) {
        if connection.state() != ConnectionState::Connected {
            return;
        }

        if packet.has_flag(PacketFlags::MULTI_ACK) {
            if let Err(e) = self.handle_multi_ack(connection, packet) {
                warn!("malformed aggregate ACK from connection {}: {}", connection.discriminator(), e);
            }
            return;
        }

        if !connection.sliding_window(packet.substream_id).resend_scheduler().acknowledge(packet.sequence_id) {
            trace!("ACK for packet {} that is not pending", packet.sequence_id);
        }
    }

    /// Aggregate ACKs come in two layouts. Packets on substream 1 carry the substream, the
    ///  base sequence ID and the additional IDs in the payload. Otherwise the payload is a plain
    ///  list of additional IDs for substream 0, and the packet's sequence ID is the base.
    fn handle_multi_ack(&self, connection: &PrudpConnection, packet: &PrudpPacket) -> anyhow::Result<()> {
        let mut stream = ByteStreamIn::new(&packet.payload, self.server_config().byte_stream_settings);
        let mut additional_ids = Vec::new();

        let (substream_id, base_sequence_id) = if packet.substream_id == 1 {
            let substream_id = stream.read_u8()?;
            let count = stream.read_u8()?;
            let base_sequence_id = stream.read_u16_le()?;
            for _ in 0..count {
                additional_ids.push(stream.read_u16_le()?);
            }
            (substream_id, base_sequence_id)
        }
        else {
            while stream.remaining() >= 2 {
                additional_ids.push(stream.read_u16_le()?);
            }
            (0, packet.sequence_id)
        };

        let window = connection.sliding_window(substream_id);
        window.resend_scheduler().acknowledge_up_to(base_sequence_id);
        window.resend_scheduler().acknowledge_many(&additional_ids);
        Ok(())
    }

    /// Removes the connection from the endpoint and the server and closes it. Returns `true`
    ///  for the call that actually ended the connection, which is also the only one that emits
    ///  `on_connection_ended`.
    pub async fn cleanup_connection(&self, connection: &Arc<PrudpConnection>, final_state: ConnectionState) -> bool {
        let discriminator = connection.discriminator().to_string();
        self.connections.delete_if(&discriminator, |c| c.id() == connection.id());

        let socket = connection.socket();
        socket.unregister(self.stream_id(), &discriminator, connection.id());
        self.sockets.delete_if(&socket.address(), |s| Arc::ptr_eq(s, socket) && s.virtual_connection_count() == 0);

        if !connection.close(final_state) {
            return false;
        }

        info!("connection {} ended ({:?})", discriminator, final_state);
        for handler in self.handlers.snapshot() {
            handler.on_connection_ended(connection).await;
        }
        true
    }

    /// cleans up all connections
    pub async fn shutdown(&self) {
        for connection in self.connections.values() {
            self.cleanup_connection(&connection, ConnectionState::Disconnecting).await;
        }
    }
}
