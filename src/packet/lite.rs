//! PRUDP Lite, the variant spoken over WebSockets by Switch titles. It carries no signatures
//!  and no checksum, since the transport underneath is already reliable and authenticated.
//!
//! ```ascii
//!  0: magic 0x80
//!  1: options length (u8)
//!  2: payload length (u16)
//!  4: source stream type << 4 | destination stream type (u8)
//!  5: source stream id (u8)
//!  6: destination stream id (u8)
//!  7: fragment id (u8)
//!  8: type | flags << 4 (u16)
//! 10: sequence id (u16)
//! 12: options
//!  *: payload
//! ```

use anyhow::bail;
use crate::packet::options::{decode_options, encode_options};
use crate::packet::{decode_type_and_flags, validate_ports, PrudpPacket, PrudpVersion, VirtualPort};
use crate::util::byte_stream::{ByteStreamIn, ByteStreamOut, ByteStreamSettings};
use crate::util::safe_converter::PrecheckedCast;

pub const MAGIC: u8 = 0x80;

pub(crate) fn decode(stream: &mut ByteStreamIn) -> anyhow::Result<PrudpPacket> {
    let magic = stream.read_u8()?;
    if magic != MAGIC {
        bail!("invalid Lite magic {:#04x}", magic);
    }

    let options_len = stream.read_u8()? as usize;
    let payload_len = stream.read_u16_le()? as usize;

    let stream_types = stream.read_u8()?;
    let source = VirtualPort {
        stream_type: stream_types >> 4,
        stream_id: stream.read_u8()?,
    };
    let destination = VirtualPort {
        stream_type: stream_types & 0xF,
        stream_id: stream.read_u8()?,
    };
    validate_ports(source, destination)?;

    let fragment_id = stream.read_u8()?;
    let type_flags = stream.read_u16_le()?;
    let (packet_type, flags) = decode_type_and_flags(type_flags & 0xF, type_flags >> 4)?;

    let mut packet = PrudpPacket::new(PrudpVersion::Lite, packet_type);
    packet.source = source;
    packet.destination = destination;
    packet.flags = flags;
    packet.fragment_id = fragment_id;
    packet.sequence_id = stream.read_u16_le()?;

    let options = stream.read_bytes(options_len)?;
    decode_options(&mut packet, options)?;

    packet.payload = stream.read_bytes(payload_len)?.to_vec();
    Ok(packet)
}

pub(crate) fn encode(packet: &PrudpPacket) -> Vec<u8> {
    let options = encode_options(packet);

    let mut out = ByteStreamOut::with_capacity(12 + options.len() + packet.payload.len(), ByteStreamSettings::default());
    out.write_u8(MAGIC);
    out.write_u8(options.len().prechecked_cast());
    out.write_u16_le(packet.payload.len().prechecked_cast());
    out.write_u8((packet.source.stream_type << 4) | (packet.destination.stream_type & 0xF));
    out.write_u8(packet.source.stream_id);
    out.write_u8(packet.destination.stream_id);
    out.write_u8(packet.fragment_id);
    out.write_u16_le(u16::from(packet.packet_type) | (packet.flags.bits() << 4));
    out.write_u16_le(packet.sequence_id);
    out.write_bytes(&options);
    out.write_bytes(&packet.payload);
    out.into_vec()
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::packet::{PacketFlags, PacketType, StreamType};
    use crate::packet::tests::test_config;

    fn sample_packet(packet_type: PacketType, flags: PacketFlags) -> PrudpPacket {
        let mut packet = PrudpPacket::new(PrudpVersion::Lite, packet_type);
        packet.source = VirtualPort::new(StreamType::RVSecure, 0x30);
        packet.destination = VirtualPort::new(StreamType::RVSecure, 1);
        packet.flags = flags;
        packet.sequence_id = 0x0203;
        packet.payload = vec![1, 2, 3];
        packet
    }

    #[test]
    fn test_layout() {
        let mut packet = sample_packet(PacketType::Data, PacketFlags::RELIABLE | PacketFlags::NEEDS_ACK);
        packet.fragment_id = 5;
        assert_eq!(encode(&packet), vec![
            0x80, 0, 3, 0,
            0xAA, 0x30, 1,
            5,
            0x62, 0,
            3, 2,
            1, 2, 3,
        ]);
    }

    #[rstest]
    fn test_encode_decode(
        #[values(PacketType::Syn, PacketType::Connect, PacketType::Data, PacketType::Disconnect, PacketType::Ping)] packet_type: PacketType,
        #[values(PacketFlags::ACK, PacketFlags::RELIABLE | PacketFlags::NEEDS_ACK, PacketFlags::MULTI_ACK)] flags: PacketFlags,
    ) {
        let mut packet = sample_packet(packet_type, flags);
        packet.fragment_id = 4;
        if matches!(packet_type, PacketType::Syn | PacketType::Connect) {
            packet.options.minor_version = 1;
            packet.options.supported_functions = 0x4;
            packet.options.maximum_substream_id = 1;
        }
        if packet_type == PacketType::Syn && packet.has_flag(PacketFlags::ACK) {
            packet.connection_signature = vec![0x5A; 16];
        }
        if packet_type == PacketType::Connect && !packet.has_flag(PacketFlags::ACK) {
            packet.options.lite_signature = vec![0xAB; 16];
        }

        let encoded = encode(&packet);
        let mut stream = ByteStreamIn::new(&encoded, ByteStreamSettings::default());
        assert_eq!(decode(&mut stream).unwrap(), packet);
        assert!(!stream.has_remaining());
    }

    #[test]
    fn test_datagram_detection() {
        let mut config = test_config("6f599f81");
        config.lite_enabled = true;

        let packet = sample_packet(PacketType::Ping, PacketFlags::NEEDS_ACK);
        let mut datagram = encode(&packet);
        datagram.extend_from_slice(&encode(&packet));

        let decoded = PrudpPacket::decode_datagram(&datagram, &config);
        assert_eq!(decoded.len(), 2);
        assert!(decoded.iter().all(|p| p.as_ref().unwrap() == &packet));

        config.lite_enabled = false;
        assert!(PrudpPacket::decode_datagram(&datagram, &config)[0].is_err());
    }

    #[test]
    fn test_no_signature() {
        let config = test_config("6f599f81");
        let packet = sample_packet(PacketType::Data, PacketFlags::RELIABLE);
        assert!(packet.calculate_signature(&config, b"key", b"sig").unwrap().is_empty());
    }
}
