//! PRUDP v1, used by Nintendo's Wii U / Switch era titles.
//!
//! ```ascii
//!  0: magic EA D0
//!  2: version (u8) = 1
//!  3: options length (u8)
//!  4: payload length (u16)
//!  6: source port (u8)
//!  7: destination port (u8)
//!  8: type | flags << 4 (u16)
//! 10: session id (u8)
//! 11: substream id (u8)
//! 12: sequence id (u16)
//! 14: signature (16 bytes)
//! 30: options
//!  *: payload
//! ```

use std::net::SocketAddr;
use anyhow::{anyhow, bail};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use crate::config::PrudpServerConfig;
use crate::packet::options::{decode_options, encode_options};
use crate::packet::{access_key_sum, address_bytes, decode_type_and_flags, fixed_size, validate_ports, PrudpPacket, PrudpVersion, VirtualPort};
use crate::util::byte_stream::{ByteStreamIn, ByteStreamOut, ByteStreamSettings};
use crate::util::safe_converter::PrecheckedCast;

pub const MAGIC: [u8; 2] = [0xEA, 0xD0];
const VERSION: u8 = 1;
const SIGNATURE_SIZE: usize = 16;

type HmacMd5 = Hmac<Md5>;

/// the 12 header bytes after the magic
fn encode_header(packet: &PrudpPacket, options_len: usize) -> Vec<u8> {
    let mut out = ByteStreamOut::with_capacity(12, ByteStreamSettings::default());
    out.write_u8(VERSION);
    out.write_u8(options_len.prechecked_cast());
    out.write_u16_le(packet.payload.len().prechecked_cast());
    out.write_u8(packet.source.to_byte());
    out.write_u8(packet.destination.to_byte());
    out.write_u16_le(u16::from(packet.packet_type) | (packet.flags.bits() << 4));
    out.write_u8(packet.session_id);
    out.write_u8(packet.substream_id);
    out.write_u16_le(packet.sequence_id);
    out.into_vec()
}

pub(crate) fn decode(stream: &mut ByteStreamIn) -> anyhow::Result<PrudpPacket> {
    let magic = stream.read_bytes(2)?;
    if magic != MAGIC {
        bail!("invalid v1 magic {:02x?}", magic);
    }
    let version = stream.read_u8()?;
    if version != VERSION {
        bail!("invalid v1 version {}", version);
    }

    let options_len = stream.read_u8()? as usize;
    let payload_len = stream.read_u16_le()? as usize;

    let source = VirtualPort::from_byte(stream.read_u8()?);
    let destination = VirtualPort::from_byte(stream.read_u8()?);
    validate_ports(source, destination)?;

    let type_flags = stream.read_u16_le()?;
    let (packet_type, flags) = decode_type_and_flags(type_flags & 0xF, type_flags >> 4)?;

    let mut packet = PrudpPacket::new(PrudpVersion::V1, packet_type);
    packet.source = source;
    packet.destination = destination;
    packet.flags = flags;
    packet.session_id = stream.read_u8()?;
    packet.substream_id = stream.read_u8()?;
    packet.sequence_id = stream.read_u16_le()?;
    packet.signature = stream.read_bytes(SIGNATURE_SIZE)?.to_vec();

    let options = stream.read_bytes(options_len)?;
    decode_options(&mut packet, options)?;

    packet.payload = stream.read_bytes(payload_len)?.to_vec();
    Ok(packet)
}

pub(crate) fn encode(packet: &PrudpPacket) -> Vec<u8> {
    let options = encode_options(packet);
    let header = encode_header(packet, options.len());

    let mut out = ByteStreamOut::with_capacity(2 + header.len() + SIGNATURE_SIZE + options.len() + packet.payload.len(), ByteStreamSettings::default());
    out.write_bytes(&MAGIC);
    out.write_bytes(&header);
    out.write_bytes(&fixed_size(&packet.signature, SIGNATURE_SIZE));
    out.write_bytes(&options);
    out.write_bytes(&packet.payload);
    out.into_vec()
}

/// HMAC-MD5 keyed with MD5(access key) over the header from the source port on, the session
///  key, the access key's byte sum, the connection signature, the options and the payload
pub(crate) fn calculate_signature(packet: &PrudpPacket, config: &PrudpServerConfig, session_key: &[u8], connection_signature: &[u8]) -> anyhow::Result<Vec<u8>> {
    let options = encode_options(packet);
    let header = encode_header(packet, options.len());

    let key = Md5::digest(config.access_key.as_bytes());
    let mut mac = HmacMd5::new_from_slice(&key)
        .map_err(|e| anyhow!("invalid HMAC key: {}", e))?;
    mac.update(&header[4..]);
    mac.update(session_key);
    mac.update(&access_key_sum(config).to_le_bytes());
    mac.update(connection_signature);
    mac.update(&options);
    mac.update(&packet.payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// HMAC-MD5 of the client address with the server's random connection signature key
pub(crate) fn calculate_connection_signature(config: &PrudpServerConfig, addr: SocketAddr) -> anyhow::Result<Vec<u8>> {
    let mut mac = HmacMd5::new_from_slice(&config.connection_signature_key)
        .map_err(|e| anyhow!("invalid connection signature key: {}", e))?;
    mac.update(&address_bytes(addr));
    Ok(mac.finalize().into_bytes().to_vec())
}
