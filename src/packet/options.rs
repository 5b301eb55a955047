use anyhow::bail;
use tracing::trace;
use crate::packet::{fixed_size, PacketFlags, PacketType, PrudpPacket, PrudpVersion};
use crate::util::byte_stream::{ByteStreamIn, ByteStreamOut, ByteStreamSettings};
use crate::util::safe_converter::PrecheckedCast;

// option IDs, each option is encoded as `id: u8, size: u8, value`
pub const OPTION_SUPPORTED_FUNCTIONS: u8 = 0;
pub const OPTION_CONNECTION_SIGNATURE: u8 = 1;
pub const OPTION_FRAGMENT_ID: u8 = 2;
pub const OPTION_INITIAL_UNRELIABLE_SEQUENCE_ID: u8 = 3;
pub const OPTION_MAX_SUBSTREAM_ID: u8 = 4;
pub const OPTION_LITE_SIGNATURE: u8 = 0x80;

pub const CONNECTION_SIGNATURE_SIZE: usize = 16;

fn expect_size(id: u8, actual: usize, expected: usize) -> anyhow::Result<()> {
    if actual != expected {
        bail!("option {} has size {}, expected {}", id, actual, expected);
    }
    Ok(())
}

/// Applies the options in `data` to the packet. Unknown options are skipped.
pub fn decode_options(packet: &mut PrudpPacket, data: &[u8]) -> anyhow::Result<()> {
    let mut stream = ByteStreamIn::new(data, ByteStreamSettings::default());

    while stream.has_remaining() {
        let id = stream.read_u8()?;
        let size = stream.read_u8()? as usize;
        let mut value = ByteStreamIn::new(stream.read_bytes(size)?, ByteStreamSettings::default());

        match id {
            OPTION_SUPPORTED_FUNCTIONS => {
                expect_size(id, size, 4)?;
                let raw = value.read_u32_le()?;
                packet.options.minor_version = raw & 0xFF;
                packet.options.supported_functions = raw >> 8;
            }
            OPTION_CONNECTION_SIGNATURE => {
                expect_size(id, size, CONNECTION_SIGNATURE_SIZE)?;
                packet.connection_signature = value.read_remaining().to_vec();
            }
            OPTION_FRAGMENT_ID => {
                expect_size(id, size, 1)?;
                packet.fragment_id = value.read_u8()?;
            }
            OPTION_INITIAL_UNRELIABLE_SEQUENCE_ID => {
                expect_size(id, size, 2)?;
                packet.options.initial_unreliable_sequence_id = value.read_u16_le()?;
            }
            OPTION_MAX_SUBSTREAM_ID => {
                expect_size(id, size, 1)?;
                packet.options.maximum_substream_id = value.read_u8()?;
            }
            OPTION_LITE_SIGNATURE => {
                packet.options.lite_signature = value.read_remaining().to_vec();
            }
            _ => {
                trace!("skipping unknown packet option {} with size {}", id, size);
            }
        }
    }
    Ok(())
}

fn write_option(out: &mut ByteStreamOut, id: u8, value: &[u8]) {
    out.write_u8(id);
    out.write_u8(value.len().prechecked_cast());
    out.write_bytes(value);
}

/// The options a packet of this version, type and flags carries on the wire
pub fn encode_options(packet: &PrudpPacket) -> Vec<u8> {
    let mut out = ByteStreamOut::new(ByteStreamSettings::default());
    let is_handshake = matches!(packet.packet_type, PacketType::Syn | PacketType::Connect);
    let functions = packet.options.minor_version | (packet.options.supported_functions << 8);

    match packet.version {
        PrudpVersion::V0 => {}
        PrudpVersion::V1 => {
            if is_handshake {
                write_option(&mut out, OPTION_SUPPORTED_FUNCTIONS, &functions.to_le_bytes());
                write_option(&mut out, OPTION_CONNECTION_SIGNATURE, &fixed_size(&packet.connection_signature, CONNECTION_SIGNATURE_SIZE));
                if packet.packet_type == PacketType::Connect {
                    write_option(&mut out, OPTION_INITIAL_UNRELIABLE_SEQUENCE_ID, &packet.options.initial_unreliable_sequence_id.to_le_bytes());
                }
                write_option(&mut out, OPTION_MAX_SUBSTREAM_ID, &[packet.options.maximum_substream_id]);
            }
            else if packet.packet_type == PacketType::Data {
                write_option(&mut out, OPTION_FRAGMENT_ID, &[packet.fragment_id]);
            }
        }
        PrudpVersion::Lite => {
            if is_handshake {
                write_option(&mut out, OPTION_SUPPORTED_FUNCTIONS, &functions.to_le_bytes());
                if packet.packet_type == PacketType::Syn && packet.has_flag(PacketFlags::ACK) {
                    write_option(&mut out, OPTION_CONNECTION_SIGNATURE, &fixed_size(&packet.connection_signature, CONNECTION_SIGNATURE_SIZE));
                }
                if packet.packet_type == PacketType::Connect && !packet.has_flag(PacketFlags::ACK) {
                    write_option(&mut out, OPTION_LITE_SIGNATURE, &packet.options.lite_signature);
                }
                write_option(&mut out, OPTION_MAX_SUBSTREAM_ID, &[packet.options.maximum_substream_id]);
            }
        }
    }
    out.into_vec()
}
