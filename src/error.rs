// Licensed under the MIT license.

//! The engine's unified error / result-code taxonomy.

use custom_error::custom_error;

custom_error! {
    #[derive(Clone, PartialEq)]
    pub Error

    // Generic
    Error{details: &'static str} = "{details}",
    ParErr{details: &'static str} = "invalid argument: {details}",
    NoMem = "allocation failed",
    NoDevice = "device not attached",
    BlockingNotAllowed = "blocking submit() called from callback context",
    Timeout = "command timed out",
    CommandNotSupported = "ERR CODE:0x01090000",
    Config{details: &'static str} = "invalid configuration: {details}",
    Io{details: String} = "i/o error: {details}",

    // Connection family
    ConnFail = "connection failed",
    ConnTimeout = "connection attempt timed out",
    ConnAlreadyActive = "connection slot already active",
    NoFreeConn = "no free connection slot",
    Closed = "connection is closed",
    NoIp = "no station ip address",

    // Wi-Fi join family
    Pass = "wrong ap password",
    NoAp = "access point not found",
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// `true` for outcomes that represent a protocol/hardware failure rather
    /// than a caller programming error (`ParErr`) or local resource
    /// exhaustion (`NoMem`) — used by the dispatcher to decide whether a
    /// `ResetDetected` recovery cycle applies.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            Error::Error { .. }
                | Error::ConnFail
                | Error::ConnTimeout
                | Error::Closed
                | Error::Pass
                | Error::NoAp
                | Error::CommandNotSupported
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io { details: e.to_string() }
    }
}
