//! Error taxonomy for the protocol core (§7).

use derive_more::Display;
use std::error::Error;

/// Errors surfaced by the transport, command channel, device identifier, and
/// controllers. Never a panic in non-test code; every fallible path returns
/// one of these.
#[derive(Debug, Display)]
pub enum CoreError {
    /// Serial open failure, permission, device gone, unexpected EOF.
    #[display(fmt = "transport error: {}", _0)]
    Transport(String),

    /// No response arrived within the caller's deadline.
    #[display(fmt = "timed out waiting for response (seq={})", seq)]
    Timeout { seq: u16 },

    /// Trailer checksum did not match the line's computed checksum.
    #[display(
        fmt = "checksum mismatch: expected {:02X}, computed {:02X}",
        claimed,
        computed
    )]
    ChecksumMismatch { claimed: u8, computed: u8 },

    /// Response payload did not match the expected discriminator for the
    /// command issued (e.g. `TX` expected `PANELX:`, received `ERROR:...`).
    #[display(fmt = "protocol error: expected {:?}, got {:?}", expected, got)]
    Protocol { expected: String, got: String },

    /// Caller-provided input rejected before transmission.
    #[display(fmt = "validation error: {}", _0)]
    Validation(String),

    /// Device responded `ERROR:TEST_IN_PROGRESS`; caller must back off.
    #[display(fmt = "device busy")]
    DeviceBusy,

    /// No device matched any identification probe.
    #[display(fmt = "identification failed: {}", _0)]
    IdentificationFailed(String),

    /// Cooperative cancellation was honored.
    #[display(fmt = "cancelled")]
    Cancelled,
}

impl Error for CoreError {}

impl From<std::io::Error> for CoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

impl From<serialport::Error> for CoreError {
    fn from(value: serialport::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

/// An error produced during test orchestration, carrying the function and
/// relay group that failed alongside the underlying [`CoreError`].
#[derive(Debug, Display)]
#[display(fmt = "function {:?} (relays {:?}): {}", function, relays, source)]
pub struct OrchestratorError {
    pub function: String,
    pub relays: Vec<u8>,
    pub source: CoreError,
}

impl Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

impl OrchestratorError {
    pub fn new(function: impl Into<String>, relays: Vec<u8>, source: CoreError) -> Self {
        Self {
            function: function.into(),
            relays,
            source,
        }
    }
}
