use std::sync::{Arc, Weak};
use parking_lot::Mutex;
use crate::config::StreamSettings;
use crate::connection::resend_scheduler::{ResendScheduler, RetransmissionTarget};
use crate::connection::rtt::Rtt;
use crate::encryption::EncryptionAlgorithm;
use crate::packet::PrudpPacket;
use crate::util::counter::Counter;

/// Outbound state of one reliable substream: the sequence counter, the substream's cipher and
///  the scheduler that resends its packets.
///
/// Sequence IDs and keystream position must advance together, so both happen under the cipher
///  lock. Inbound payloads of the substream are decrypted with the same cipher instance, which
///  keeps a separate keystream per direction.
pub struct SlidingWindow {
    substream_id: u8,
    sequence_id_counter: Counter<u16>,
    cipher: Mutex<Box<dyn EncryptionAlgorithm>>,
    resend_scheduler: ResendScheduler,
}

impl SlidingWindow {
    pub fn new(substream_id: u8, settings: Arc<StreamSettings>, rtt: Arc<Rtt>, target: Weak<dyn RetransmissionTarget>) -> SlidingWindow {
        let cipher = settings.encryption_algorithm.box_clone();
        SlidingWindow {
            substream_id,
            sequence_id_counter: Counter::new(0),
            cipher: Mutex::new(cipher),
            resend_scheduler: ResendScheduler::new(settings, rtt, target),
        }
    }

    pub fn substream_id(&self) -> u8 {
        self.substream_id
    }

    pub fn resend_scheduler(&self) -> &ResendScheduler {
        &self.resend_scheduler
    }

    pub fn set_cipher_key(&self, key: &[u8]) -> anyhow::Result<()> {
        self.cipher.lock().set_key(key)
    }

    pub fn cipher_key(&self) -> Vec<u8> {
        self.cipher.lock().key().to_vec()
    }

    /// Assigns the next sequence ID (1, 2, ...) and, if requested, encrypts the payload in place
    pub fn sequence_and_encrypt(&self, packet: &mut PrudpPacket, encrypt: bool) -> anyhow::Result<()> {
        let mut cipher = self.cipher.lock();
        packet.sequence_id = self.sequence_id_counter.next();
        packet.substream_id = self.substream_id;
        if encrypt {
            packet.payload = cipher.encrypt(&packet.payload)?;
        }
        Ok(())
    }

    pub fn decrypt(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.cipher.lock().decrypt(payload)
    }
}
