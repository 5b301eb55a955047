use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::compression::{CompressionAlgorithm, DummyCompression};
use crate::encryption::{EncryptionAlgorithm, Rc4Encryption};
use crate::kerberos::Account;
use crate::util::byte_stream::ByteStreamSettings;
use crate::util::random::{Random, RngRandom};

/// Settings that only apply to PRUDP v0 packets
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrudpV0Settings {
    /// Quazal titles pack type and flags into one byte each and pad the checksum input to a
    ///  multiple of 4
    pub is_quazal_mode: bool,
    /// CONNECT payloads and the CONNECT-ACK reply are encrypted with the stream's default
    ///  algorithm
    pub encrypted_connect: bool,
    /// 4 byte instead of 1 byte checksums
    pub use_enhanced_checksum: bool,
}


pub struct PrudpServerConfig {
    pub bind_address: SocketAddr,

    /// Game specific key that goes into all packet checksums and signatures. A server only
    ///  understands clients of the title the key belongs to.
    pub access_key: String,

    pub prudp_v0: PrudpV0Settings,

    /// Accept PRUDP Lite datagrams (magic byte 0x80) in addition to v0 / v1
    pub lite_enabled: bool,

    /// Payloads are split into fragments of at most this many bytes
    pub fragment_size: usize,

    pub byte_stream_settings: ByteStreamSettings,

    pub kerberos_ticket_version: u32,
    pub session_key_length: usize,

    /// key for the HMAC that derives v1 / Lite connection signatures from the client address
    pub connection_signature_key: Vec<u8>,

    /// upper bound for the substream count a client can negotiate
    pub max_substream_id: u8,
    pub minor_version: u32,
    pub supported_functions: u32,

    /// Silence after which the server sends a PING, and after which a connection that does not
    ///  react to the PING is dropped
    pub ping_timeout: Duration,

    /// Verify the signature of incoming v1 packets and drop mismatches
    pub verify_signatures: bool,

    /// sign outgoing packets without session key and connection signature, for titles that
    ///  predate keyed signatures
    pub legacy_connection_signature: bool,

    /// Number of tasks receiving on the UDP socket concurrently
    pub listener_count: usize,
}

impl PrudpServerConfig {
    /// Defaults for a v1 server on all IPv4 interfaces; `access_key` must be set before use
    pub fn default_ipv4(port: u16) -> PrudpServerConfig {
        PrudpServerConfig {
            bind_address: SocketAddr::from(([0, 0, 0, 0], port)),
            access_key: String::new(),
            prudp_v0: PrudpV0Settings::default(),
            lite_enabled: false,
            fragment_size: 1300,
            byte_stream_settings: ByteStreamSettings::default(),
            kerberos_ticket_version: 0,
            session_key_length: 32,
            connection_signature_key: RngRandom::bytes(16),
            max_substream_id: 0,
            minor_version: 0,
            supported_functions: 0,
            ping_timeout: Duration::from_secs(15),
            verify_signatures: false,
            legacy_connection_signature: false,
            listener_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.access_key.is_empty() {
            bail!("access key is not set");
        }
        if self.fragment_size == 0 || self.fragment_size > u16::MAX as usize {
            bail!("fragment size must be between 1 and {}", u16::MAX);
        }
        if self.session_key_length == 0 {
            bail!("session key length must not be 0");
        }
        if self.kerberos_ticket_version > 1 {
            bail!("unsupported Kerberos ticket version {}", self.kerberos_ticket_version);
        }
        if self.connection_signature_key.is_empty() {
            bail!("connection signature key is empty");
        }
        if self.listener_count == 0 {
            bail!("listener count must not be 0");
        }
        if self.ping_timeout.is_zero() {
            bail!("ping timeout must not be 0");
        }
        self.byte_stream_settings.validate()
    }
}


/// Reliability and payload processing parameters of a connection's substreams
pub struct StreamSettings {
    /// number of sends after which `extra_retransmit_timeout_multiplier` kicks in
    pub extra_retransmit_timeout_trigger: u32,
    /// total number of sends of a reliable packet, including the first one
    pub max_packet_retransmissions: u32,
    /// RTO used until the first round trip was measured
    pub initial_rtt: Duration,
    /// only packets acknowledged within this many sends feed the RTT estimate
    pub rtt_retransmit: u32,
    pub retransmit_timeout_multiplier: f64,
    pub extra_retransmit_timeout_multiplier: f64,
    pub max_retransmit_timeout: Duration,
    /// inbound reliable packets at least this far ahead of the next expected sequence ID are
    ///  dropped instead of buffered
    pub reorder_window: u16,
    pub encryption_algorithm: Box<dyn EncryptionAlgorithm>,
    pub compression_algorithm: Box<dyn CompressionAlgorithm>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        StreamSettings {
            extra_retransmit_timeout_trigger: 0x32,
            max_packet_retransmissions: 20,
            initial_rtt: Duration::from_millis(1000),
            rtt_retransmit: 2,
            retransmit_timeout_multiplier: 1.25,
            extra_retransmit_timeout_multiplier: 1.0,
            max_retransmit_timeout: Duration::from_secs(20),
            reorder_window: 256,
            encryption_algorithm: Box::new(Rc4Encryption::with_default_key()),
            compression_algorithm: Box::new(DummyCompression::default()),
        }
    }
}

impl Clone for StreamSettings {
    fn clone(&self) -> Self {
        StreamSettings {
            extra_retransmit_timeout_trigger: self.extra_retransmit_timeout_trigger,
            max_packet_retransmissions: self.max_packet_retransmissions,
            initial_rtt: self.initial_rtt,
            rtt_retransmit: self.rtt_retransmit,
            retransmit_timeout_multiplier: self.retransmit_timeout_multiplier,
            extra_retransmit_timeout_multiplier: self.extra_retransmit_timeout_multiplier,
            max_retransmit_timeout: self.max_retransmit_timeout,
            reorder_window: self.reorder_window,
            encryption_algorithm: self.encryption_algorithm.box_clone(),
            compression_algorithm: self.compression_algorithm.box_clone(),
        }
    }
}

impl StreamSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_retransmissions == 0 {
            bail!("max packet retransmissions must be at least 1");
        }
        if self.retransmit_timeout_multiplier < 1.0 || self.extra_retransmit_timeout_multiplier < 1.0 {
            bail!("retransmit timeout multipliers must not be below 1.0");
        }
        if self.initial_rtt.is_zero() {
            bail!("initial RTT must not be 0");
        }
        if self.max_retransmit_timeout < self.initial_rtt {
            bail!("max retransmit timeout is below the initial RTT");
        }
        if self.reorder_window == 0 || self.reorder_window > 0x8000 {
            bail!("reorder window must be between 1 and {}", 0x8000);
        }
        Ok(())
    }
}


pub struct EndPointConfig {
    /// the stream ID that incoming packets' destination port must carry
    pub stream_id: u8,
    /// secure endpoints require a Kerberos ticket in CONNECT and key the substreams with the
    ///  session key from it
    pub is_secure_endpoint: bool,
    /// the server principal whose key decrypts Kerberos tickets. Its password is checked
    ///  against the account lookup before a ticket is redeemed.
    pub server_account: Option<Account>,
    /// answer RMC requests that no handler accepts with `Core::NotImplemented`
    pub respond_not_implemented: bool,
    /// RMC messages carry method and protocol names instead of IDs
    pub use_verbose_rmc: bool,
    pub stream_settings: StreamSettings,
}

impl EndPointConfig {
    pub fn new(stream_id: u8) -> EndPointConfig {
        EndPointConfig {
            stream_id,
            is_secure_endpoint: false,
            server_account: None,
            respond_not_implemented: false,
            use_verbose_rmc: false,
            stream_settings: StreamSettings::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(account) = &self.server_account {
            if account.username.is_empty() {
                bail!("server account without a username");
            }
        }
        self.stream_settings.validate()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pid;

    fn valid_config() -> PrudpServerConfig {
        let mut config = PrudpServerConfig::default_ipv4(60000);
        config.access_key = "ridfebb9".to_string();
        config
    }

    #[test]
    fn test_default_is_valid_with_access_key() {
        assert!(PrudpServerConfig::default_ipv4(60000).validate().is_err());
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_invalid_server_config() {
        let mut config = valid_config();
        config.fragment_size = 70000;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.kerberos_ticket_version = 2;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.byte_stream_settings.pid_size = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stream_settings() {
        assert!(StreamSettings::default().validate().is_ok());

        let settings = StreamSettings {
            retransmit_timeout_multiplier: 0.5,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        for reorder_window in [0, 0x8001] {
            let settings = StreamSettings { reorder_window, ..Default::default() };
            assert!(settings.validate().is_err());
        }

        let cloned = StreamSettings { reorder_window: 16, ..Default::default() }.clone();
        assert_eq!(cloned.encryption_algorithm.key(), b"CD&ML");
        assert_eq!(cloned.reorder_window, 16);
    }

    #[test]
    fn test_end_point_config() {
        assert!(EndPointConfig::new(1).validate().is_ok());

        let mut config = EndPointConfig::new(1);
        config.is_secure_endpoint = true;
        config.server_account = Some(Account {
            pid: Pid(2),
            username: String::new(),
            password: "password".to_string(),
        });
        assert!(config.validate().is_err());
    }
}
