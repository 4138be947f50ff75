use std::io;

use thiserror::Error;

/// Result type used across this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The RMCP+ bring-up step that rejected us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Get Channel Authentication Capabilities (IPMI 1.5 framing).
    AuthCapabilities,
    /// RMCP+ Open Session Request/Response.
    OpenSession,
    /// RAKP messages 1 and 2.
    Rakp12,
    /// RAKP messages 3 and 4.
    Rakp34,
    /// Set Session Privilege Level.
    SetPrivilege,
}

impl std::fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HandshakeStep::AuthCapabilities => "auth capabilities",
            HandshakeStep::OpenSession => "open session",
            HandshakeStep::Rakp12 => "RAKP 1/2",
            HandshakeStep::Rakp34 => "RAKP 3/4",
            HandshakeStep::SetPrivilege => "set privilege",
        };
        f.write_str(name)
    }
}

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket, OS, filesystem).
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Operation timed out.
    #[error("timeout waiting for response")]
    Timeout,

    /// Peer responded with an unexpected or invalid packet.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// Peer responded with an unexpected or invalid packet.
    #[error("protocol error: {0}")]
    ProtocolOwned(String),

    /// Declared length exceeds the available bytes.
    #[error("truncated input: {0}")]
    TruncatedInput(&'static str),

    /// An IPMI message checksum did not verify.
    #[error("bad checksum: {0}")]
    BadChecksum(&'static str),

    /// Malformed confidentiality or integrity padding.
    #[error("bad pad: {0}")]
    BadPad(&'static str),

    /// An IPMI command completed with a non-zero completion code.
    #[error("ipmi completion code: {completion_code:#04x}")]
    BadCompletionCode {
        /// Raw completion code returned by the BMC.
        completion_code: u8,
    },

    /// The BMC rejected a session bring-up step with a non-zero status.
    #[error("handshake rejected at {step}: status {status:#04x}")]
    HandshakeRejected {
        /// Which bring-up step failed.
        step: HandshakeStep,
        /// Status or completion code returned by the BMC.
        status: u8,
    },

    /// ActivatePayload kept returning 0x80 after the full retry ladder.
    #[error("SOL payload activation busy (0x80 after retries)")]
    ActivationBusy,

    /// ActivatePayload returned a fatal completion code.
    #[error("SOL payload activation failed: completion code {cc:#04x}")]
    ActivationFailed {
        /// Completion code from the activate response.
        cc: u8,
    },

    /// No BMC datagram arrived within the inactivity window.
    #[error("SOL inactivity timeout")]
    InactivityTimeout,

    /// Authentication or integrity verification failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(&'static str),

    /// Cryptographic failure (invalid key sizes, decrypt failure, etc.).
    #[error("crypto error: {0}")]
    Crypto(&'static str),

    /// Unsupported configuration or protocol feature.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Invalid caller-supplied argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(String),

    /// A write was submitted after the transport closed.
    #[error("write on closed session")]
    WriteWhileClosed,

    /// Subscription requested for a server this process knows nothing about.
    #[error("no such server: {0}")]
    SubscribeNotFound(String),

    /// Command submitted for a server without an established session.
    #[error("server not connected: {0}")]
    NotConnected(String),
}

impl Error {
    pub(crate) fn protocol_owned(msg: impl Into<String>) -> Self {
        Self::ProtocolOwned(msg.into())
    }
}
