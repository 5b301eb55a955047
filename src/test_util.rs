use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::Mutex;
use crate::config::PrudpServerConfig;
use crate::connection::PrudpConnection;
use crate::encryption::{EncryptionAlgorithm, Rc4Encryption};
use crate::end_point::events::EndPointEvents;
use crate::packet::{PacketFlags, PacketType, PrudpPacket, PrudpVersion, StreamType, VirtualPort};
use crate::rmc::RmcMessage;
use crate::socket::PacketSocket;
use crate::util::byte_stream::{ByteStreamOut, ByteStreamSettings};
use crate::util::counter::Counter;

/// [PacketSocket] that records all datagrams instead of sending them
pub struct TrackingPacketSocket {
    local_addr: SocketAddr,
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}
impl TrackingPacketSocket {
    pub fn new() -> Self {
        TrackingPacketSocket {
            local_addr: SocketAddr::from(([127, 0, 0, 1], 60000)),
            sent: Default::default(),
        }
    }

    /// returns sent datagrams, clearing the internal buffer
    pub fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// returns the packets in all sent datagrams, clearing the internal buffer
    pub fn decode_sent(&self, config: &PrudpServerConfig) -> Vec<PrudpPacket> {
        self.sent().into_iter()
            .flat_map(|(_, data)| PrudpPacket::decode_datagram(&data, config))
            .map(|p| p.unwrap())
            .collect()
    }
}

#[async_trait]
impl PacketSocket for TrackingPacketSocket {
    async fn send_to(&self, to: SocketAddr, data: &[u8]) {
        self.sent.lock().push((to, data.to_vec()));
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}


/// Records the RMC messages it receives
pub struct RecordingHandler {
    handles: bool,
    messages: Mutex<Vec<RmcMessage>>,
}
impl RecordingHandler {
    pub fn new(handles: bool) -> Self {
        RecordingHandler {
            handles,
            messages: Default::default(),
        }
    }

    pub fn messages(&self) -> Vec<RmcMessage> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl EndPointEvents for RecordingHandler {
    async fn on_data(&self, _connection: &Arc<PrudpConnection>, message: &RmcMessage) -> bool {
        self.messages.lock().push(message.clone());
        self.handles
    }
}


/// The client side of a v1 connection to stream RVSecure:1, just enough to drive an endpoint
///  through handshake and data exchange
pub struct TestClient {
    pub address: SocketAddr,
    pub port: VirtualPort,
    pub server_port: VirtualPort,
    pub session_id: u8,
    pub connection_signature: Vec<u8>,
    pub server_connection_signature: Vec<u8>,
    pub server_session_id: u8,
    session_key: Vec<u8>,
    /// CONNECT is sequence 1, reliable DATA starts at 2
    sequence_id_counter: Counter<u16>,
    unreliable_sequence_id_counter: Counter<u16>,
    cipher: Rc4Encryption,
    config: Arc<PrudpServerConfig>,
}

impl TestClient {
    pub fn new(address: SocketAddr, config: Arc<PrudpServerConfig>) -> TestClient {
        TestClient {
            address,
            port: VirtualPort::new(StreamType::RVSecure, 15),
            server_port: VirtualPort::new(StreamType::RVSecure, 1),
            session_id: 0x21,
            connection_signature: vec![0xC5; 16],
            server_connection_signature: Vec::new(),
            server_session_id: 0,
            session_key: Vec::new(),
            sequence_id_counter: Counter::new(1),
            unreliable_sequence_id_counter: Counter::new(1),
            cipher: Rc4Encryption::with_default_key(),
            config,
        }
    }

    fn packet(&self, packet_type: PacketType, flags: PacketFlags) -> PrudpPacket {
        let mut packet = PrudpPacket::new(PrudpVersion::V1, packet_type);
        packet.source = self.port;
        packet.destination = self.server_port;
        packet.flags = flags;
        packet.session_id = self.session_id;
        packet
    }

    fn sign(&self, mut packet: PrudpPacket) -> PrudpPacket {
        packet.signature = packet.calculate_signature(&self.config, &self.session_key, &self.server_connection_signature).unwrap();
        packet
    }

    pub fn syn(&self) -> PrudpPacket {
        let mut packet = self.packet(PacketType::Syn, PacketFlags::NEEDS_ACK);
        packet.options.supported_functions = 0x04;
        packet.options.minor_version = 3;
        packet.signature = packet.calculate_signature(&self.config, &[], &[]).unwrap();
        packet
    }

    pub fn accept_syn_ack(&mut self, ack: &PrudpPacket) {
        assert_eq!(ack.packet_type, PacketType::Syn);
        self.server_connection_signature = ack.connection_signature.clone();
    }

    pub fn connect(&self, payload: Vec<u8>) -> PrudpPacket {
        let mut packet = self.packet(PacketType::Connect, PacketFlags::RELIABLE | PacketFlags::NEEDS_ACK);
        packet.sequence_id = 1;
        packet.connection_signature = self.connection_signature.clone();
        packet.options.supported_functions = 0x04;
        packet.options.minor_version = 3;
        packet.options.initial_unreliable_sequence_id = 2;
        packet.payload = payload;
        self.sign(packet)
    }

    pub fn accept_connect_ack(&mut self, ack: &PrudpPacket) {
        assert_eq!(ack.packet_type, PacketType::Connect);
        self.server_session_id = ack.session_id;
    }

    pub fn set_session_key(&mut self, session_key: &[u8]) {
        self.session_key = session_key.to_vec();
        self.cipher.set_key(session_key).unwrap();
    }

    /// a reliable DATA packet with the next sequence ID, encrypted on substream 0
    pub fn reliable_data(&mut self, payload: &[u8], fragment_id: u8) -> PrudpPacket {
        let mut packet = self.packet(PacketType::Data, PacketFlags::RELIABLE | PacketFlags::NEEDS_ACK);
        packet.sequence_id = self.sequence_id_counter.next();
        packet.fragment_id = fragment_id;
        packet.payload = self.cipher.encrypt(payload).unwrap();
        self.sign(packet)
    }

    pub fn rmc_request(&mut self, message: &RmcMessage) -> PrudpPacket {
        let data = message.to_bytes(false, self.config.byte_stream_settings);
        self.reliable_data(&data, 0)
    }

    /// fragments `1, 2, ..., 0` in sequence order
    pub fn fragments(&mut self, data: &[u8], fragment_size: usize) -> Vec<PrudpPacket> {
        let chunks = data.chunks(fragment_size).collect::<Vec<_>>();
        let count = chunks.len();
        chunks.into_iter()
            .enumerate()
            .map(|(idx, chunk)| {
                let fragment_id = if idx + 1 == count { 0 } else { (idx + 1) as u8 };
                self.reliable_data(chunk, fragment_id)
            })
            .collect()
    }

    /// unreliable DATA with a plain payload, the caller applies the per-packet encryption
    pub fn unreliable_data(&mut self, payload: &[u8]) -> PrudpPacket {
        let mut packet = self.packet(PacketType::Data, PacketFlags::NEEDS_ACK);
        packet.sequence_id = self.unreliable_sequence_id_counter.next();
        packet.payload = payload.to_vec();
        self.sign(packet)
    }

    /// decrypts a reliable DATA packet from the server on substream 0
    pub fn decrypt(&mut self, packet: &PrudpPacket) -> Vec<u8> {
        self.cipher.decrypt(&packet.payload).unwrap()
    }

    pub fn ack(&self, packet: &PrudpPacket) -> PrudpPacket {
        let mut ack = self.packet(packet.packet_type, PacketFlags::ACK);
        ack.sequence_id = packet.sequence_id;
        ack.substream_id = packet.substream_id;
        self.sign(ack)
    }

    /// aggregate ACK for substream 0: everything up to `base_sequence_id` plus `additional_ids`
    pub fn multi_ack(&self, new_style: bool, base_sequence_id: u16, additional_ids: &[u16]) -> PrudpPacket {
        let mut packet = self.packet(PacketType::Data, PacketFlags::MULTI_ACK);
        let mut payload = ByteStreamOut::new(ByteStreamSettings::default());
        if new_style {
            packet.substream_id = 1;
            payload.write_u8(0);
            payload.write_u8(additional_ids.len() as u8);
            payload.write_u16_le(base_sequence_id);
        }
        else {
            packet.sequence_id = base_sequence_id;
        }
        for &id in additional_ids {
            payload.write_u16_le(id);
        }
        packet.payload = payload.into_vec();
        self.sign(packet)
    }

    pub fn ping(&self) -> PrudpPacket {
        self.sign(self.packet(PacketType::Ping, PacketFlags::NEEDS_ACK))
    }

    pub fn reliable_ping(&mut self) -> PrudpPacket {
        let mut packet = self.packet(PacketType::Ping, PacketFlags::RELIABLE | PacketFlags::NEEDS_ACK);
        packet.sequence_id = self.sequence_id_counter.next();
        self.sign(packet)
    }

    pub fn disconnect(&self) -> PrudpPacket {
        self.sign(self.packet(PacketType::Disconnect, PacketFlags::NEEDS_ACK))
    }
}
