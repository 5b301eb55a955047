//! PRUDP v0, used by the 3DS / Wii U generation and by Quazal titles.
//!
//! ```ascii
//! 0: source port (u8)
//! 1: destination port (u8)
//! 2: type | flags << 3 (u8, Quazal mode) or type | flags << 4 (u16)
//! *: session id (u8)
//! *: signature (4 bytes)
//! *: sequence id (u16)
//! *: connection signature (4 bytes), SYN and CONNECT only
//! *: fragment id (u8), DATA only
//! *: payload size (u16), if HAS_SIZE is set
//! *: payload, running up to the checksum if HAS_SIZE is not set
//! *: checksum (u8, or u32 with enhanced checksums)
//! ```

use anyhow::{anyhow, bail};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use crate::config::PrudpServerConfig;
use crate::packet::{access_key_sum, address_bytes, decode_type_and_flags, fixed_size, validate_ports, PacketFlags, PacketType, PrudpPacket, PrudpVersion, VirtualPort};
use crate::util::byte_stream::{ByteStreamIn, ByteStreamOut};
use crate::util::safe_converter::PrecheckedCast;

const SIGNATURE_SIZE: usize = 4;

/// access key for which the data signature covers only the payload
const PAYLOAD_ONLY_SIGNATURE_ACCESS_KEY: &str = "ridfebb9";

/// data signature of an empty payload with the payload-only signature
const EMPTY_DATA_SIGNATURE: [u8; 4] = [0x78, 0x56, 0x34, 0x12];

fn checksum_size(config: &PrudpServerConfig) -> usize {
    if config.prudp_v0.use_enhanced_checksum { 4 } else { 1 }
}

pub(crate) fn calculate_checksum(config: &PrudpServerConfig, data: &[u8]) -> u32 {
    let base = access_key_sum(config);

    let result = if config.prudp_v0.is_quazal_mode {
        let word_sum = data.chunks(4)
            .map(|chunk| {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                u32::from_le_bytes(word)
            })
            .fold(0u32, u32::wrapping_add);
        (base & 0xFF).wrapping_add(word_sum)
    }
    else {
        let full_words = data.len() / 4 * 4;
        let word_sum = data[..full_words].chunks(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .fold(0u32, u32::wrapping_add);
        let tail_sum = data[full_words..].iter()
            .map(|&b| b as u32)
            .sum::<u32>();
        let word_byte_sum = word_sum.to_le_bytes().iter()
            .map(|&b| b as u32)
            .sum::<u32>();
        base.wrapping_add(tail_sum).wrapping_add(word_byte_sum)
    };

    if config.prudp_v0.use_enhanced_checksum {
        result
    }
    else {
        result & 0xFF
    }
}

pub(crate) fn decode(stream: &mut ByteStreamIn, config: &PrudpServerConfig) -> anyhow::Result<PrudpPacket> {
    let start = stream.position();
    let checksum_size = checksum_size(config);

    let source = VirtualPort::from_byte(stream.read_u8()?);
    let destination = VirtualPort::from_byte(stream.read_u8()?);
    validate_ports(source, destination)?;

    let (packet_type, flags) = if config.prudp_v0.is_quazal_mode {
        let raw = stream.read_u8()? as u16;
        decode_type_and_flags(raw & 0x7, raw >> 3)?
    }
    else {
        let raw = stream.read_u16_le()?;
        decode_type_and_flags(raw & 0xF, raw >> 4)?
    };

    let mut packet = PrudpPacket::new(PrudpVersion::V0, packet_type);
    packet.source = source;
    packet.destination = destination;
    packet.flags = flags;
    packet.session_id = stream.read_u8()?;
    packet.signature = stream.read_bytes(SIGNATURE_SIZE)?.to_vec();
    packet.sequence_id = stream.read_u16_le()?;

    if matches!(packet_type, PacketType::Syn | PacketType::Connect) {
        packet.connection_signature = stream.read_bytes(SIGNATURE_SIZE)?.to_vec();
    }
    if packet_type == PacketType::Data {
        packet.fragment_id = stream.read_u8()?;
    }

    let payload_len = if packet.has_flag(PacketFlags::HAS_SIZE) {
        stream.read_u16_le()? as usize
    }
    else {
        stream.remaining().checked_sub(checksum_size)
            .ok_or_else(|| anyhow!("v0 packet is too short for its checksum"))?
    };
    packet.payload = stream.read_bytes(payload_len)?.to_vec();

    let checked = stream.slice(start, stream.position())?;
    let checksum = if checksum_size == 4 {
        stream.read_u32_le()?
    }
    else {
        stream.read_u8()? as u32
    };

    let expected = calculate_checksum(config, checked);
    if checksum != expected {
        bail!("invalid v0 checksum {:#x}, expected {:#x}", checksum, expected);
    }

    Ok(packet)
}

pub(crate) fn encode(packet: &PrudpPacket, config: &PrudpServerConfig) -> Vec<u8> {
    let mut out = ByteStreamOut::with_capacity(packet.payload.len() + 20, config.byte_stream_settings);

    out.write_u8(packet.source.to_byte());
    out.write_u8(packet.destination.to_byte());

    let packet_type = u16::from(packet.packet_type);
    if config.prudp_v0.is_quazal_mode {
        out.write_u8((packet_type | (packet.flags.bits() << 3)) as u8);
    }
    else {
        out.write_u16_le(packet_type | (packet.flags.bits() << 4));
    }

    out.write_u8(packet.session_id);
    out.write_bytes(&fixed_size(&packet.signature, SIGNATURE_SIZE));
    out.write_u16_le(packet.sequence_id);

    if matches!(packet.packet_type, PacketType::Syn | PacketType::Connect) {
        out.write_bytes(&fixed_size(&packet.connection_signature, SIGNATURE_SIZE));
    }
    if packet.packet_type == PacketType::Data {
        out.write_u8(packet.fragment_id);
    }
    if packet.has_flag(PacketFlags::HAS_SIZE) {
        out.write_u16_le(packet.payload.len().prechecked_cast());
    }
    out.write_bytes(&packet.payload);

    let checksum = calculate_checksum(config, out.as_slice());
    if config.prudp_v0.use_enhanced_checksum {
        out.write_u32_le(checksum);
    }
    else {
        out.write_u8(checksum as u8);
    }

    out.into_vec()
}

/// first four bytes of MD5(address), reversed
pub(crate) fn calculate_connection_signature(addr: std::net::SocketAddr) -> Vec<u8> {
    let mut signature = Md5::digest(address_bytes(addr))[..SIGNATURE_SIZE].to_vec();
    signature.reverse();
    signature
}

fn calculate_data_signature(packet: &PrudpPacket, config: &PrudpServerConfig, session_key: &[u8]) -> anyhow::Result<Vec<u8>> {
    let data = if config.access_key == PAYLOAD_ONLY_SIGNATURE_ACCESS_KEY {
        packet.payload.clone()
    }
    else {
        let mut data = session_key.to_vec();
        data.extend_from_slice(&packet.sequence_id.to_le_bytes());
        data.push(packet.fragment_id);
        data.extend_from_slice(&packet.payload);
        data
    };

    if data.is_empty() {
        return Ok(EMPTY_DATA_SIGNATURE.to_vec());
    }

    let key = Md5::digest(config.access_key.as_bytes());
    let mut mac = Hmac::<Md5>::new_from_slice(&key)
        .map_err(|e| anyhow!("invalid HMAC key: {}", e))?;
    mac.update(&data);
    Ok(mac.finalize().into_bytes()[..SIGNATURE_SIZE].to_vec())
}

pub(crate) fn calculate_signature(packet: &PrudpPacket, config: &PrudpServerConfig, session_key: &[u8], connection_signature: &[u8]) -> anyhow::Result<Vec<u8>> {
    let is_data_signed = match packet.packet_type {
        PacketType::Data => true,
        PacketType::Disconnect => config.access_key != PAYLOAD_ONLY_SIGNATURE_ACCESS_KEY,
        _ => false,
    };

    if is_data_signed {
        calculate_data_signature(packet, config, session_key)
    }
    else if !connection_signature.is_empty() {
        Ok(connection_signature.to_vec())
    }
    else {
        Ok(vec![0; SIGNATURE_SIZE])
    }
}
