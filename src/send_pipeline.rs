use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::trace;
use crate::config::PrudpServerConfig;
use crate::connection::PrudpConnection;
use crate::connection::resend_scheduler::PacketOutcome;
use crate::packet::{PacketFlags, PacketType, PrudpPacket, PrudpVersion};

/// The last step before a packet goes on the wire: fragmentation, sequence IDs, payload
///  compression and encryption, the signature and registration for retransmission.
pub struct SendPipeline {
    config: Arc<PrudpServerConfig>,
}

impl SendPipeline {
    pub fn new(config: Arc<PrudpServerConfig>) -> SendPipeline {
        SendPipeline { config }
    }

    pub fn config(&self) -> &PrudpServerConfig {
        &self.config
    }

    /// Splits DATA payloads that exceed the fragment size into fragments `1, 2, ...`, the
    ///  last fragment carrying ID 0, and sends each of them.
    pub async fn send(&self, connection: &PrudpConnection, packet: PrudpPacket) -> anyhow::Result<Vec<oneshot::Receiver<PacketOutcome>>> {
        let fragment_size = self.config.fragment_size;
        if packet.packet_type != PacketType::Data || packet.payload.len() <= fragment_size {
            return Ok(self.finalize_and_send_packet(connection, packet).await?
                .into_iter()
                .collect());
        }

        let chunks = packet.payload.chunks(fragment_size).collect::<Vec<_>>();
        trace!("splitting {} byte payload into {} fragments", packet.payload.len(), chunks.len());

        let mut outcomes = Vec::with_capacity(chunks.len());
        for (idx, chunk) in chunks.iter().enumerate() {
            let mut fragment = packet.clone();
            fragment.payload = chunk.to_vec();
            fragment.fragment_id = if idx + 1 == chunks.len() { 0 } else { (idx + 1) as u8 };

            if let Some(outcome) = self.finalize_and_send_packet(connection, fragment).await? {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    /// Finalizes a single packet and sends it. Reliable packets that need an acknowledgement
    ///  are handed to their substream's resend scheduler, and the returned receiver reports
    ///  how that ended.
    pub async fn finalize_and_send_packet(&self, connection: &PrudpConnection, mut packet: PrudpPacket) -> anyhow::Result<Option<oneshot::Receiver<PacketOutcome>>> {
        packet.session_id = connection.server_session_id();

        let is_ack = packet.has_flag(PacketFlags::ACK) || packet.has_flag(PacketFlags::MULTI_ACK);
        let is_data = packet.packet_type == PacketType::Data;
        let encrypts = packet.version != PrudpVersion::Lite;

        if !is_ack {
            if is_data {
                packet.payload = connection.stream_settings().compression_algorithm.compress(&packet.payload)?;
            }

            if packet.has_flag(PacketFlags::RELIABLE) {
                connection.sliding_window(packet.substream_id)
                    .sequence_and_encrypt(&mut packet, is_data && encrypts)?;
            }
            else if is_data {
                packet.sequence_id = connection.next_unreliable_sequence_id();
                if encrypts {
                    packet.payload = connection.process_unreliable_crypto(&packet)?;
                }
            }
            else if packet.packet_type == PacketType::Ping {
                packet.sequence_id = connection.next_ping_sequence_id();
            }
            else {
                packet.sequence_id = 0;
            }
        }

        packet.signature = if self.config.legacy_connection_signature {
            packet.calculate_signature(&self.config, &[], &[])?
        }
        else {
            packet.calculate_signature(&self.config, &connection.session_key(), &connection.client_connection_signature())?
        };

        let outcome = if packet.has_flag(PacketFlags::RELIABLE) && packet.has_flag(PacketFlags::NEEDS_ACK) {
            Some(connection.sliding_window(packet.substream_id)
                .resend_scheduler()
                .add_packet(packet.clone()))
        }
        else {
            None
        };

        trace!("sending {:?} {:?} seq {} to {:?}", packet.packet_type, packet.flags, packet.sequence_id, connection.address());
        connection.socket().send(&packet.encode(&self.config)).await;
        Ok(outcome)
    }
}
