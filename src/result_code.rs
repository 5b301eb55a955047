use std::fmt::{Debug, Display, Formatter};
use std::sync::OnceLock;
use rustc_hash::FxHashMap;

/// A NEX result code: category in the upper and code in the lower 16 bits, with bit 31 set for
///  errors
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(u32);

const ERROR_MASK: u32 = 0x8000_0000;

macro_rules! result_codes {
    ($($category:ident = $category_id:literal { $($name:ident = $code:literal),* $(,)? })*) => {
        #[allow(non_snake_case, non_upper_case_globals)]
        pub mod codes {
            use super::ResultCode;
            $(
                pub mod $category {
                    use super::ResultCode;
                    $(pub const $name: ResultCode = ResultCode::error($category_id, $code);)*
                }
            )*
        }

        fn registry() -> &'static FxHashMap<u32, &'static str> {
            static NAMES: OnceLock<FxHashMap<u32, &'static str>> = OnceLock::new();
            NAMES.get_or_init(|| {
                let mut names = FxHashMap::default();
                $($(
                    names.insert(codes::$category::$name.0, concat!(stringify!($category), "::", stringify!($name)));
                )*)*
                names
            })
        }
    }
}

result_codes! {
    Core = 0x0001 {
        Unknown = 0x0001,
        NotImplemented = 0x0002,
        InvalidPointer = 0x0003,
        OperationAborted = 0x0004,
        Exception = 0x0005,
        AccessDenied = 0x0006,
        InvalidHandle = 0x0007,
        InvalidIndex = 0x0008,
        OutOfMemory = 0x0009,
        InvalidArgument = 0x000A,
        Timeout = 0x000B,
        InitializationFailure = 0x000C,
        CallInitiationFailure = 0x000D,
        RegistrationError = 0x000E,
        BufferOverflow = 0x000F,
        InvalidLockState = 0x0010,
        InvalidSequence = 0x0011,
        SystemError = 0x0012,
        Cancelled = 0x0013,
    }
    DDL = 0x0002 {
        InvalidSignature = 0x0001,
        IncorrectVersion = 0x0002,
    }
    RendezVous = 0x0003 {
        ConnectionFailure = 0x0001,
        NotAuthenticated = 0x0002,
        InvalidUsername = 0x0064,
        InvalidPassword = 0x0065,
        UsernameAlreadyExists = 0x0066,
        AccountDisabled = 0x0067,
        AccountExpired = 0x0068,
        ConcurrentLoginDenied = 0x0069,
        EncryptionFailure = 0x006A,
        InvalidPID = 0x006B,
        MaxConnectionsReached = 0x006C,
        InvalidGID = 0x006D,
        InvalidControlScriptID = 0x006E,
        InvalidOperationInLiveEnvironment = 0x006F,
        DuplicateEntry = 0x0070,
        ControlScriptFailure = 0x0071,
        ClassNotFound = 0x0072,
        SessionVoid = 0x0073,
        DDLMismatch = 0x0075,
        InvalidConfiguration = 0x0076,
        SessionFull = 0x00C8,
        InvalidGatheringPassword = 0x00C9,
        WithoutParticipationPeriod = 0x00CA,
        PersistentGatheringCreationMax = 0x00CB,
        PersistentGatheringParticipationMax = 0x00CC,
        DeniedByParticipants = 0x00CD,
        ParticipantInBlackList = 0x00CE,
        GameServerMaintenance = 0x00CF,
        OperationPostpone = 0x00D0,
        OutOfRatingRange = 0x00D1,
        ConnectionDisconnected = 0x00D2,
        InvalidOperation = 0x00D3,
        NotParticipatedGathering = 0x00D4,
        MatchmakeSessionUserPasswordUnmatch = 0x00D5,
        MatchmakeSessionSystemPasswordUnmatch = 0x00D6,
        UserIsOffline = 0x00D7,
        AlreadyParticipatedGathering = 0x00D8,
        PermissionDenied = 0x00D9,
        NotFriend = 0x00DA,
        SessionClosed = 0x00DB,
        DatabaseTemporarilyUnavailable = 0x00DC,
        InvalidUniqueId = 0x00DD,
        MatchmakingWithdrawn = 0x00DE,
        LimitExceeded = 0x00DF,
        AccountTemporarilyDisabled = 0x00E0,
        PartiallyServiceClosed = 0x00E1,
        ConnectionDisconnectedForConcurrentLogin = 0x00E2,
    }
    PythonCore = 0x0004 {
        Exception = 0x0001,
        TypeError = 0x0002,
        IndexError = 0x0003,
        InvalidReference = 0x0004,
        CallFailure = 0x0005,
        MemoryError = 0x0006,
        KeyError = 0x0007,
        OperationError = 0x0008,
        ConversionError = 0x0009,
        ValidationError = 0x000A,
    }
    Transport = 0x0005 {
        Unknown = 0x0001,
        ConnectionFailure = 0x0002,
        InvalidUrl = 0x0003,
        InvalidKey = 0x0004,
        InvalidURLType = 0x0005,
        DuplicateEndpoint = 0x0006,
        IOError = 0x0007,
        Timeout = 0x0008,
        ConnectionReset = 0x0009,
        IncorrectRemoteAuthentication = 0x000A,
        ServerRequestError = 0x000B,
        DecompressionFailure = 0x000C,
        ReliableSendBufferFullFatal = 0x000D,
        UPnPCannotInit = 0x000E,
        UPnPCannotAddMapping = 0x000F,
        NatPMPCannotInit = 0x0010,
        NatPMPCannotAddMapping = 0x0011,
        UnsupportedNAT = 0x0013,
        DnsError = 0x0014,
        ProxyError = 0x0015,
        DataRemaining = 0x0016,
        NoBuffer = 0x0017,
        NotFound = 0x0018,
        TemporaryServerError = 0x0019,
        PermanentServerError = 0x001A,
        ServiceUnavailable = 0x001B,
        ReliableSendBufferFull = 0x001C,
        InvalidStation = 0x001D,
        InvalidSubStreamID = 0x001E,
        PacketBufferFull = 0x001F,
        NatCheckError = 0x0020,
        FirewallCheckError = 0x0021,
        MtuCheckError = 0x0022,
        InvalidPacketSize = 0x0023,
    }
    Authentication = 0x0068 {
        NASAuthenticateError = 0x0001,
        TokenParseError = 0x0002,
        HttpConnectionError = 0x0003,
        HttpDNSError = 0x0004,
        HttpGetProxySetting = 0x0005,
        TokenExpired = 0x0006,
        ValidationFailed = 0x0007,
        InvalidParam = 0x0008,
        PrincipalIdUnmatched = 0x0009,
        MoveCountUnmatch = 0x000A,
        UnderMaintenance = 0x000B,
        UnsupportedVersion = 0x000C,
        ServerVersionIsOld = 0x000D,
        Unknown = 0x000E,
        ClientVersionIsOld = 0x000F,
        AccountLibraryError = 0x0010,
        ServiceNoLongerAvailable = 0x0011,
        UnknownApplication = 0x0012,
        ApplicationVersionIsOld = 0x0013,
        OutOfService = 0x0014,
        NetworkServiceLicenseRequired = 0x0015,
        NetworkServiceLicenseSystemError = 0x0016,
        NetworkServiceLicenseError3 = 0x0017,
        NetworkServiceLicenseError4 = 0x0018,
    }
}

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0x0001_0001);

    pub const fn error(category: u16, code: u16) -> ResultCode {
        ResultCode(ERROR_MASK | ((category as u32) << 16) | code as u32)
    }

    /// the raw value as it appears on the wire, including the error bit
    pub const fn from_raw(raw: u32) -> ResultCode {
        ResultCode(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub const fn is_error(&self) -> bool {
        self.0 & ERROR_MASK != 0
    }

    pub const fn category(&self) -> u16 {
        ((self.0 & !ERROR_MASK) >> 16) as u16
    }

    pub const fn code(&self) -> u16 {
        self.0 as u16
    }

    pub fn name(&self) -> &'static str {
        if *self == Self::SUCCESS {
            return "Success";
        }
        registry().get(&self.0)
            .copied()
            .unwrap_or("Unknown")
    }
}

impl Display for ResultCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:08X})", self.name(), self.0 & !ERROR_MASK)
    }
}

impl Debug for ResultCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResultCode({}, 0x{:08X})", self.name(), self.0)
    }
}

impl std::error::Error for ResultCode {}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::not_implemented(codes::Core::NotImplemented, 0x8001_0002, "Core::NotImplemented")]
    #[case::invalid_username(codes::RendezVous::InvalidUsername, 0x8003_0064, "RendezVous::InvalidUsername")]
    #[case::validation_error(codes::PythonCore::ValidationError, 0x8004_000A, "PythonCore::ValidationError")]
    #[case::unregistered(ResultCode::from_raw(0x8077_0001), 0x8077_0001, "Unknown")]
    fn test_names(#[case] code: ResultCode, #[case] raw: u32, #[case] name: &str) {
        assert_eq!(code.raw(), raw);
        assert!(code.is_error());
        assert_eq!(code.name(), name);
    }

    #[test]
    fn test_display_masks_error_bit() {
        assert_eq!(codes::Core::AccessDenied.to_string(), "Core::AccessDenied (0x00010006)");
        assert_eq!(codes::Core::AccessDenied.category(), 1);
        assert_eq!(codes::Core::AccessDenied.code(), 6);
    }

    #[test]
    fn test_success() {
        assert!(!ResultCode::SUCCESS.is_error());
        assert_eq!(ResultCode::SUCCESS.name(), "Success");
    }
}
