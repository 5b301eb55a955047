//! The PRUDP packet model and its three wire formats.
//!
//! All versions share the same logical packet: virtual ports, a packet type with flags, a
//!  session ID, a sequence ID, signatures and a payload. The version tag selects the codec in
//!  [v0], [v1] or [lite]. v1 and Lite datagrams may carry several packets back to back, v0
//!  packets are only concatenated if they carry an explicit size.

pub mod lite;
pub mod options;
pub mod v0;
pub mod v1;

use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};
use anyhow::{anyhow, bail};
use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::config::PrudpServerConfig;
use crate::util::byte_stream::ByteStreamIn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PrudpVersion {
    V0 = 0,
    V1 = 1,
    Lite = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum PacketType {
    Syn = 0,
    Connect = 1,
    Data = 2,
    Disconnect = 3,
    Ping = 4,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u16 {
        const ACK = 0x001;
        const RELIABLE = 0x002;
        const NEEDS_ACK = 0x004;
        const HAS_SIZE = 0x008;
        const MULTI_ACK = 0x200;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StreamType {
    DO = 1,
    RV = 2,
    OldRVSec = 3,
    SBMGMT = 4,
    NAT = 5,
    SessionDiscovery = 6,
    NATEcho = 7,
    Routing = 8,
    Game = 9,
    RVSecure = 10,
    Relay = 11,
}

/// Stream type and stream ID of one side of a connection. v0 / v1 pack both into a single byte
///  (`type << 4 | id`), Lite transmits them separately.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VirtualPort {
    pub stream_type: u8,
    pub stream_id: u8,
}

impl VirtualPort {
    pub fn new(stream_type: StreamType, stream_id: u8) -> VirtualPort {
        VirtualPort {
            stream_type: stream_type.into(),
            stream_id,
        }
    }

    pub fn from_byte(value: u8) -> VirtualPort {
        VirtualPort {
            stream_type: value >> 4,
            stream_id: value & 0xF,
        }
    }

    pub fn to_byte(&self) -> u8 {
        (self.stream_type << 4) | (self.stream_id & 0xF)
    }

    pub fn stream_type(&self) -> anyhow::Result<StreamType> {
        StreamType::try_from(self.stream_type)
            .map_err(|_| anyhow!("invalid stream type {}", self.stream_type))
    }
}

impl Debug for VirtualPort {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.stream_type, self.stream_id)
    }
}


/// Values carried in the option list of v1 / Lite packets. v0 packets negotiate nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PacketOptions {
    pub supported_functions: u32,
    pub minor_version: u32,
    pub maximum_substream_id: u8,
    pub initial_unreliable_sequence_id: u16,
    pub lite_signature: Vec<u8>,
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrudpPacket {
    pub version: PrudpVersion,
    pub source: VirtualPort,
    pub destination: VirtualPort,
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    pub session_id: u8,
    pub substream_id: u8,
    pub sequence_id: u16,
    pub signature: Vec<u8>,
    pub connection_signature: Vec<u8>,
    pub fragment_id: u8,
    pub payload: Vec<u8>,
    pub options: PacketOptions,
}

impl PrudpPacket {
    pub fn new(version: PrudpVersion, packet_type: PacketType) -> PrudpPacket {
        PrudpPacket {
            version,
            source: VirtualPort::default(),
            destination: VirtualPort::default(),
            packet_type,
            flags: PacketFlags::empty(),
            session_id: 0,
            substream_id: 0,
            sequence_id: 0,
            signature: Vec::new(),
            connection_signature: Vec::new(),
            fragment_id: 0,
            payload: Vec::new(),
            options: PacketOptions::default(),
        }
    }

    /// A packet of the given type travelling in the opposite direction on the same substream
    pub fn reply(&self, packet_type: PacketType) -> PrudpPacket {
        let mut reply = PrudpPacket::new(self.version, packet_type);
        reply.source = self.destination;
        reply.destination = self.source;
        reply.substream_id = self.substream_id;
        reply
    }

    pub fn has_flag(&self, flag: PacketFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn add_flag(&mut self, flag: PacketFlags) {
        self.flags.insert(flag);
    }

    pub fn remove_flag(&mut self, flag: PacketFlags) {
        self.flags.remove(flag);
    }

    /// Decodes all packets in a datagram. Decoding stops at the first packet that fails, since
    ///  there is no way to find the start of the next one.
    pub fn decode_datagram(data: &[u8], config: &PrudpServerConfig) -> Vec<anyhow::Result<PrudpPacket>> {
        let mut stream = ByteStreamIn::new(data, config.byte_stream_settings);
        let mut result = Vec::new();

        while stream.has_remaining() {
            let decoded = if config.lite_enabled && stream.peek_bytes(1) == Some(&[lite::MAGIC][..]) {
                lite::decode(&mut stream)
            }
            else if stream.peek_bytes(2) == Some(&v1::MAGIC[..]) {
                v1::decode(&mut stream)
            }
            else {
                v0::decode(&mut stream, config)
            };

            let failed = decoded.is_err();
            result.push(decoded);
            if failed {
                break;
            }
        }
        result
    }

    pub fn encode(&self, config: &PrudpServerConfig) -> Vec<u8> {
        match self.version {
            PrudpVersion::V0 => v0::encode(self, config),
            PrudpVersion::V1 => v1::encode(self),
            PrudpVersion::Lite => lite::encode(self),
        }
    }

    pub fn calculate_signature(&self, config: &PrudpServerConfig, session_key: &[u8], connection_signature: &[u8]) -> anyhow::Result<Vec<u8>> {
        match self.version {
            PrudpVersion::V0 => v0::calculate_signature(self, config, session_key, connection_signature),
            PrudpVersion::V1 => v1::calculate_signature(self, config, session_key, connection_signature),
            PrudpVersion::Lite => Ok(Vec::new()),
        }
    }

    pub fn calculate_connection_signature(version: PrudpVersion, config: &PrudpServerConfig, addr: SocketAddr) -> anyhow::Result<Vec<u8>> {
        match version {
            PrudpVersion::V0 => Ok(v0::calculate_connection_signature(addr)),
            PrudpVersion::V1 | PrudpVersion::Lite => v1::calculate_connection_signature(config, addr),
        }
    }

    /// does the transmitted signature match the expected one? Only v1 signatures can be checked
    ///  on receipt, other versions always pass.
    pub fn verify_signature(&self, config: &PrudpServerConfig, session_key: &[u8], connection_signature: &[u8]) -> anyhow::Result<bool> {
        match self.version {
            PrudpVersion::V1 => Ok(self.signature == v1::calculate_signature(self, config, session_key, connection_signature)?),
            PrudpVersion::V0 | PrudpVersion::Lite => Ok(true),
        }
    }
}


fn validate_ports(source: VirtualPort, destination: VirtualPort) -> anyhow::Result<()> {
    source.stream_type()?;
    destination.stream_type()?;
    if source.stream_type != destination.stream_type {
        bail!("source stream type {} does not match destination stream type {}", source.stream_type, destination.stream_type);
    }
    Ok(())
}

fn decode_type_and_flags(type_raw: u16, flags_raw: u16) -> anyhow::Result<(PacketType, PacketFlags)> {
    let packet_type = PacketType::try_from(type_raw)
        .map_err(|_| anyhow!("invalid packet type {}", type_raw))?;
    Ok((packet_type, PacketFlags::from_bits_retain(flags_raw)))
}

/// `data` truncated or zero padded to exactly `len` bytes
fn fixed_size(data: &[u8], len: usize) -> Vec<u8> {
    let mut result = data.iter().copied().take(len).collect::<Vec<_>>();
    result.resize(len, 0);
    result
}

/// IP address bytes followed by the big-endian port
fn address_bytes(addr: SocketAddr) -> Vec<u8> {
    let mut result = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => v4.octets().to_vec(),
            None => ip.octets().to_vec(),
        },
    };
    result.extend_from_slice(&addr.port().to_be_bytes());
    result
}

fn access_key_sum(config: &PrudpServerConfig) -> u32 {
    config.access_key.bytes()
        .map(|b| b as u32)
        .sum()
}


#[cfg(test)]
pub mod tests {
    use super::*;
    use rstest::rstest;

    pub fn test_config(access_key: &str) -> PrudpServerConfig {
        let mut config = PrudpServerConfig::default_ipv4(60000);
        config.access_key = access_key.to_string();
        config.connection_signature_key = vec![0x42; 16];
        config
    }

    #[rstest]
    #[case::rv_secure(0xA1, StreamType::RVSecure, 1)]
    #[case::rv(0x2F, StreamType::RV, 15)]
    fn test_virtual_port(#[case] byte: u8, #[case] stream_type: StreamType, #[case] stream_id: u8) {
        let port = VirtualPort::from_byte(byte);
        assert_eq!(port, VirtualPort::new(stream_type, stream_id));
        assert_eq!(port.stream_type().unwrap(), stream_type);
        assert_eq!(port.to_byte(), byte);
    }

    #[rstest]
    #[case::same(0xA1, 0xAF, true)]
    #[case::mismatch(0xA1, 0x9F, false)]
    #[case::beyond_relay(0xC1, 0xCF, false)]
    #[case::zero(0x01, 0x0F, false)]
    fn test_validate_ports(#[case] source: u8, #[case] destination: u8, #[case] expected_ok: bool) {
        assert_eq!(validate_ports(VirtualPort::from_byte(source), VirtualPort::from_byte(destination)).is_ok(), expected_ok);
    }

    #[test]
    fn test_reply() {
        let mut packet = PrudpPacket::new(PrudpVersion::V1, PacketType::Data);
        packet.source = VirtualPort::new(StreamType::RVSecure, 15);
        packet.destination = VirtualPort::new(StreamType::RVSecure, 1);
        packet.substream_id = 1;
        packet.flags = PacketFlags::RELIABLE | PacketFlags::NEEDS_ACK;

        let reply = packet.reply(PacketType::Data);
        assert_eq!(reply.source, packet.destination);
        assert_eq!(reply.destination, packet.source);
        assert_eq!(reply.substream_id, 1);
        assert_eq!(reply.flags, PacketFlags::empty());
    }

    #[test]
    fn test_address_bytes() {
        assert_eq!(address_bytes(SocketAddr::from(([1, 2, 3, 4], 0x1234))), vec![1, 2, 3, 4, 0x12, 0x34]);
        let mapped: SocketAddr = "[::ffff:1.2.3.4]:4660".parse().unwrap();
        assert_eq!(address_bytes(mapped), vec![1, 2, 3, 4, 0x12, 0x34]);
    }

    #[rstest]
    #[case::shorter(vec![1, 2], vec![1, 2, 0, 0])]
    #[case::longer(vec![1, 2, 3, 4, 5], vec![1, 2, 3, 4])]
    fn test_fixed_size(#[case] data: Vec<u8>, #[case] expected: Vec<u8>) {
        assert_eq!(fixed_size(&data, 4), expected);
    }

    #[test]
    fn test_decode_datagram_stops_at_garbage() {
        let config = test_config("6f599f81");

        let mut packet = PrudpPacket::new(PrudpVersion::V1, PacketType::Ping);
        packet.source = VirtualPort::new(StreamType::RVSecure, 15);
        packet.destination = VirtualPort::new(StreamType::RVSecure, 1);
        packet.signature = vec![7; 16];

        let mut datagram = packet.encode(&config);
        datagram.extend_from_slice(&packet.encode(&config));
        datagram.extend_from_slice(&[0xEA, 0xD0, 1]);

        let decoded = PrudpPacket::decode_datagram(&datagram, &config);
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].as_ref().unwrap(), &packet);
        assert_eq!(decoded[1].as_ref().unwrap(), &packet);
        assert!(decoded[2].is_err());
    }
}
