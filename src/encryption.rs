//! Payload encryption for PRUDP DATA packets.
//!
//! The algorithms are stateful where the protocol requires it: reliable substreams run a single
//!  RC4 keystream per direction for the lifetime of the substream, so the order of calls matters.

pub mod rc4;

use anyhow::bail;
use tracing::trace;
use crate::encryption::rc4::Rc4;

pub const DEFAULT_RC4_KEY: &[u8] = b"CD&ML";

/// Encrypts and decrypts payloads. Implementations are cloned per substream via
///  [EncryptionAlgorithm::box_clone], which yields an instance with the same key and a fresh
///  cipher state.
pub trait EncryptionAlgorithm: Send + Sync + 'static {
    fn key(&self) -> &[u8];
    fn set_key(&mut self, key: &[u8]) -> anyhow::Result<()>;
    fn encrypt(&mut self, payload: &[u8]) -> anyhow::Result<Vec<u8>>;
    fn decrypt(&mut self, payload: &[u8]) -> anyhow::Result<Vec<u8>>;
    fn box_clone(&self) -> Box<dyn EncryptionAlgorithm>;
}


/// pass-through
#[derive(Clone, Default)]
pub struct DummyEncryption {
    key: Vec<u8>,
}
impl EncryptionAlgorithm for DummyEncryption {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn set_key(&mut self, key: &[u8]) -> anyhow::Result<()> {
        self.key = key.to_vec();
        Ok(())
    }

    fn encrypt(&mut self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(payload.to_vec())
    }

    fn decrypt(&mut self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(payload.to_vec())
    }

    fn box_clone(&self) -> Box<dyn EncryptionAlgorithm> {
        Box::new(self.clone())
    }
}


/// RC4 with one continuous keystream for each direction
pub struct Rc4Encryption {
    key: Vec<u8>,
    /// cipher state right after key scheduling, the starting point of both directions
    keyed: Rc4,
    cipher: Rc4,
    decipher: Rc4,
}

impl Rc4Encryption {
    pub fn new(key: &[u8]) -> anyhow::Result<Rc4Encryption> {
        Ok(Self::from_keyed(key, Rc4::new(key)?))
    }

    pub fn with_default_key() -> Rc4Encryption {
        Self::from_keyed(DEFAULT_RC4_KEY, Rc4::schedule(DEFAULT_RC4_KEY))
    }

    fn from_keyed(key: &[u8], keyed: Rc4) -> Rc4Encryption {
        Rc4Encryption {
            key: key.to_vec(),
            cipher: keyed.clone(),
            decipher: keyed.clone(),
            keyed,
        }
    }
}

impl EncryptionAlgorithm for Rc4Encryption {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn set_key(&mut self, key: &[u8]) -> anyhow::Result<()> {
        trace!("re-keying RC4 cipher with a {} byte key", key.len());
        *self = Self::from_keyed(key, Rc4::new(key)?);
        Ok(())
    }

    fn encrypt(&mut self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(self.cipher.process(payload))
    }

    fn decrypt(&mut self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(self.decipher.process(payload))
    }

    fn box_clone(&self) -> Box<dyn EncryptionAlgorithm> {
        Box::new(Self::from_keyed(&self.key, self.keyed.clone()))
    }
}


/// RC4 variant used by Quazal titles: every payload is processed with a freshly keyed cipher
#[derive(Clone)]
pub struct QuazalRc4Encryption {
    key: Vec<u8>,
}

impl QuazalRc4Encryption {
    pub fn new(key: &[u8]) -> anyhow::Result<QuazalRc4Encryption> {
        Rc4::new(key)?;
        Ok(QuazalRc4Encryption { key: key.to_vec() })
    }
}

impl Default for QuazalRc4Encryption {
    fn default() -> Self {
        QuazalRc4Encryption { key: DEFAULT_RC4_KEY.to_vec() }
    }
}

impl EncryptionAlgorithm for QuazalRc4Encryption {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn set_key(&mut self, key: &[u8]) -> anyhow::Result<()> {
        if key.is_empty() {
            bail!("empty RC4 key");
        }
        self.key = key.to_vec();
        Ok(())
    }

    fn encrypt(&mut self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(Rc4::new(&self.key)?.process(payload))
    }

    fn decrypt(&mut self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(Rc4::new(&self.key)?.process(payload))
    }

    fn box_clone(&self) -> Box<dyn EncryptionAlgorithm> {
        Box::new(self.clone())
    }
}
