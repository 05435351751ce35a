//! Error types for the VeloGuard data plane

use std::io;
use thiserror::Error;

/// Result type alias for data plane operations
pub type Result<T> = std::result::Result<T, DataPlaneError>;

/// Per-packet decode failure. Never fatal: the engine counts it and drops the packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Packet truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("Unsupported IP version: {0}")]
    UnsupportedVersion(u8),

    #[error("Malformed packet: {0}")]
    Malformed(&'static str),
}

/// Per-flow SOCKS5 failure. Terminates that flow's relay attempt only.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("SOCKS5 handshake rejected (version {version:#04x}, method {method:#04x})")]
    HandshakeRejected { version: u8, method: u8 },

    #[error("SOCKS5 upstream rejected request: {} ({code:#04x})", reply_reason(.code))]
    UpstreamRejected { code: u8 },

    #[error("SOCKS5 reply truncated")]
    Truncated,

    #[error("SOCKS5 connect timed out")]
    Timeout,

    #[error("Domain name too long: {0} bytes")]
    DomainTooLong(usize),

    #[error("Unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("Connect cancelled")]
    Cancelled,

    #[error("SOCKS5 I/O error: {0}")]
    Io(#[source] io::Error),
}

fn reply_reason(code: &u8) -> &'static str {
    crate::socks5::reply_message(*code)
}

impl ConnectError {
    pub(crate) fn from_io(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ConnectError::Truncated
        } else {
            ConnectError::Io(e)
        }
    }
}

/// Invalid engine configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("MTU {0} out of range")]
    MtuOutOfRange(usize),

    #[error("Proxy host is empty")]
    EmptyProxyHost,

    #[error("Proxy port must not be zero")]
    ZeroProxyPort,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),

    #[error("Invalid log directive: {0}")]
    LogDirective(String),
}

/// Main error type for the data plane
#[derive(Error, Debug)]
pub enum DataPlaneError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Proxy error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device closed")]
    DeviceClosed,
}

impl DataPlaneError {
    /// Short code used in log lines
    pub fn code(&self) -> &'static str {
        match self {
            DataPlaneError::Io(_) => "IO",
            DataPlaneError::Decode(_) => "DECODE",
            DataPlaneError::Connect(_) => "CONNECT",
            DataPlaneError::Config(_) => "CONFIG",
            DataPlaneError::DeviceClosed => "DEVICE",
        }
    }
}
