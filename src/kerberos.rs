//! Kerberos-style tickets as issued by a NEX authentication server and redeemed in the CONNECT
//!  packet of a secure server.
//!
//! Encrypted blobs are `RC4(key, data) ‖ HMAC-MD5(key, RC4(key, data))`.

use std::time::Duration;
use anyhow::{anyhow, bail};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use tracing::debug;
use crate::encryption::rc4::Rc4;
use crate::types::{DateTime, Pid};
use crate::util::byte_stream::{ByteStreamIn, ByteStreamOut, ByteStreamSettings};
use crate::util::random::{Random, RngRandom};

type HmacMd5 = Hmac<Md5>;

const HMAC_SIZE: usize = 16;

/// Tickets older than this are rejected when redeemed
pub const MAX_TICKET_AGE: Duration = Duration::from_secs(120);

/// Account data needed to authenticate a user or a server principal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub pid: Pid,
    pub username: String,
    pub password: String,
}

/// `password` hashed with MD5 `65000 + pid % 1024` times
pub fn derive_kerberos_key(pid: Pid, password: &[u8]) -> Vec<u8> {
    let iterations = 65000 + (pid.0 % 1024);

    let mut key = password.to_vec();
    for _ in 0..iterations {
        key = Md5::digest(&key).to_vec();
    }
    key
}

pub fn md5_hash(data: &[u8]) -> Vec<u8> {
    Md5::digest(data).to_vec()
}


pub struct KerberosEncryption {
    key: Vec<u8>,
}

impl KerberosEncryption {
    pub fn new(key: &[u8]) -> KerberosEncryption {
        KerberosEncryption { key: key.to_vec() }
    }

    fn mac(&self) -> anyhow::Result<HmacMd5> {
        HmacMd5::new_from_slice(&self.key)
            .map_err(|e| anyhow!("invalid HMAC key: {}", e))
    }

    pub fn validate(&self, buffer: &[u8]) -> anyhow::Result<bool> {
        if buffer.len() < HMAC_SIZE {
            return Ok(false);
        }
        let (data, checksum) = buffer.split_at(buffer.len() - HMAC_SIZE);
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.verify_slice(checksum).is_ok())
    }

    pub fn encrypt(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut encrypted = Rc4::new(&self.key)?.process(data);

        let mut mac = self.mac()?;
        mac.update(&encrypted);
        encrypted.extend_from_slice(&mac.finalize().into_bytes());
        Ok(encrypted)
    }

    pub fn decrypt(&self, buffer: &[u8]) -> anyhow::Result<Vec<u8>> {
        if !self.validate(buffer)? {
            bail!("Kerberos HMAC validation failed");
        }
        let data = &buffer[..buffer.len() - HMAC_SIZE];
        Ok(Rc4::new(&self.key)?.process(data))
    }
}


/// The ticket as handed to the client by the authentication server, encrypted with the user's
///  Kerberos key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KerberosTicket {
    pub session_key: Vec<u8>,
    pub target_pid: Pid,
    pub internal_data: Vec<u8>,
}

impl KerberosTicket {
    pub fn encrypt(&self, key: &[u8], settings: ByteStreamSettings) -> anyhow::Result<Vec<u8>> {
        let mut stream = ByteStreamOut::new(settings);
        stream.write_bytes(&self.session_key);
        self.target_pid.write(&mut stream);
        stream.write_buffer(&self.internal_data);

        KerberosEncryption::new(key).encrypt(stream.as_slice())
    }

    pub fn decrypt(data: &[u8], key: &[u8], session_key_length: usize, settings: ByteStreamSettings) -> anyhow::Result<KerberosTicket> {
        let decrypted = KerberosEncryption::new(key).decrypt(data)?;
        let mut stream = ByteStreamIn::new(&decrypted, settings);

        Ok(KerberosTicket {
            session_key: stream.read_bytes(session_key_length)?.to_vec(),
            target_pid: Pid::read(&mut stream)?,
            internal_data: stream.read_buffer()?,
        })
    }
}


/// The part of the ticket that only the target server can read: it is encrypted with the
///  server principal's key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KerberosTicketInternalData {
    pub issued: DateTime,
    pub source_pid: Pid,
    pub session_key: Vec<u8>,
}

impl KerberosTicketInternalData {
    pub fn encrypt(&self, key: &[u8], ticket_version: u32, settings: ByteStreamSettings) -> anyhow::Result<Vec<u8>> {
        let mut data = ByteStreamOut::new(settings);
        self.issued.write(&mut data);
        self.source_pid.write(&mut data);
        data.write_bytes(&self.session_key);

        if ticket_version != 1 {
            return KerberosEncryption::new(key).encrypt(data.as_slice());
        }

        let ticket_key = RngRandom::bytes(16);
        let final_key = md5_hash(&[key, ticket_key.as_slice()].concat());
        let encrypted = KerberosEncryption::new(&final_key).encrypt(data.as_slice())?;

        let mut result = ByteStreamOut::new(settings);
        result.write_buffer(&ticket_key);
        result.write_buffer(&encrypted);
        Ok(result.into_vec())
    }

    pub fn decrypt(data: &[u8], key: &[u8], ticket_version: u32, session_key_length: usize, settings: ByteStreamSettings) -> anyhow::Result<KerberosTicketInternalData> {
        let decrypted = if ticket_version == 1 {
            let mut stream = ByteStreamIn::new(data, settings);
            let ticket_key = stream.read_buffer()?;
            let encrypted = stream.read_buffer()?;
            let final_key = md5_hash(&[key, ticket_key.as_slice()].concat());
            KerberosEncryption::new(&final_key).decrypt(&encrypted)?
        }
        else {
            KerberosEncryption::new(key).decrypt(data)?
        };

        let mut stream = ByteStreamIn::new(&decrypted, settings);
        Ok(KerberosTicketInternalData {
            issued: DateTime::read(&mut stream)?,
            source_pid: Pid::read(&mut stream)?,
            session_key: stream.read_bytes(session_key_length)?.to_vec(),
        })
    }
}


/// What a client proves in its CONNECT payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub session_key: Vec<u8>,
    pub pid: Pid,
    pub connection_id: u32,
    pub check_value: u32,
}

/// Parses a CONNECT payload: `Buffer(ticket internal data) ‖ Buffer(request data)`, where the
///  request data is encrypted with the session key from the ticket
pub fn read_connect_request(
    payload: &[u8],
    server_key: &[u8],
    ticket_version: u32,
    session_key_length: usize,
    settings: ByteStreamSettings,
) -> anyhow::Result<ConnectRequest> {
    let mut stream = ByteStreamIn::new(payload, settings);
    let ticket_data = stream.read_buffer()?;
    let request_data = stream.read_buffer()?;

    let internal = KerberosTicketInternalData::decrypt(&ticket_data, server_key, ticket_version, session_key_length, settings)?;

    let issued = internal.issued.to_utc()
        .ok_or_else(|| anyhow!("Kerberos ticket has an invalid issue timestamp"))?;
    let age = chrono::Utc::now().signed_duration_since(issued);
    if age.to_std().is_ok_and(|age| age > MAX_TICKET_AGE) {
        bail!("Kerberos ticket expired: issued {}", issued);
    }

    let decrypted = KerberosEncryption::new(&internal.session_key).decrypt(&request_data)?;
    let mut request = ByteStreamIn::new(&decrypted, settings);
    let pid = Pid::read(&mut request)?;
    let connection_id = request.read_u32_le()?;
    let check_value = request.read_u32_le()?;

    if pid != internal.source_pid {
        bail!("Kerberos request PID {} does not match ticket PID {}", pid, internal.source_pid);
    }

    debug!("redeemed Kerberos ticket for PID {}", pid);
    Ok(ConnectRequest {
        session_key: internal.session_key,
        pid,
        connection_id,
        check_value,
    })
}
