//! Error types for the DFU core.
//!
//! These cover failures of the machinery around the protocol (flash, settings
//! storage, transports, configuration). Protocol outcomes themselves are
//! reported as result codes, see `rescode`.

use thiserror::Error;

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Errors that can occur inside the DFU core.
#[derive(Debug, Error)]
pub enum DfuError {
    /// Serial port error from the serialport crate.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error for the configuration file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid SLIP escape sequence encountered during decoding.
    #[error("Invalid SLIP escape sequence")]
    InvalidSlipEscape,

    /// SLIP frame is incomplete (no END delimiter found).
    #[error("Incomplete SLIP frame")]
    IncompleteSlipFrame,

    /// SLIP frame grew past the decoder limit.
    #[error("SLIP frame of {size} bytes exceeds maximum {max_size}")]
    SlipBufferOverflow { size: usize, max_size: usize },

    /// Flash access outside the device.
    #[error("Flash access at 0x{address:08X} (+{len}) is out of bounds")]
    FlashOutOfBounds { address: u32, len: usize },

    /// Erase address not on a page boundary.
    #[error("Flash address 0x{address:08X} is not page aligned")]
    FlashMisaligned { address: u32 },

    /// Underlying flash device reported a failure.
    #[error("Flash operation at 0x{address:08X} failed: {reason}")]
    FlashFailed { address: u32, reason: String },

    /// Another flash operation is still queued.
    #[error("Flash is busy")]
    FlashBusy,

    /// Settings slot is blank.
    #[error("Settings slot is erased")]
    SettingsErased,

    /// Settings slot carries an unknown schema version.
    #[error("Unsupported settings version {found}")]
    SettingsVersion { found: u32 },

    /// Settings slot CRC does not match its contents.
    #[error("Settings CRC mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    SettingsCrcMismatch { expected: u32, actual: u32 },

    /// Configuration rejected by validation.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Timeout waiting on a transport.
    #[error("Timeout waiting for transport")]
    Timeout,

    /// Serial port is busy (in use by another process).
    #[error("Port '{port}' is busy or in use by another application")]
    PortBusy { port: String },

    /// Permission denied accessing serial port.
    #[error("Permission denied for port '{port}'")]
    PortPermissionDenied { port: String },

    /// Serial port does not exist.
    #[error("Port '{port}' not found")]
    PortNotFound { port: String },

    /// Transport used after it was closed.
    #[error("Transport '{name}' is closed")]
    TransportClosed { name: String },
}

impl DfuError {
    /// Check if this error is retriable (transient errors that may succeed on retry).
    pub fn is_retriable(&self) -> bool {
        matches!(self, DfuError::Timeout | DfuError::FlashBusy)
    }

    /// Get a stable error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            DfuError::Serial(_) => "DFU-001",
            DfuError::Io(_) => "DFU-002",
            DfuError::Json(_) => "DFU-004",
            DfuError::InvalidSlipEscape => "DFU-010",
            DfuError::IncompleteSlipFrame => "DFU-011",
            DfuError::SlipBufferOverflow { .. } => "DFU-012",
            DfuError::FlashOutOfBounds { .. } => "DFU-030",
            DfuError::FlashMisaligned { .. } => "DFU-031",
            DfuError::FlashFailed { .. } => "DFU-032",
            DfuError::FlashBusy => "DFU-033",
            DfuError::SettingsErased => "DFU-040",
            DfuError::SettingsVersion { .. } => "DFU-041",
            DfuError::SettingsCrcMismatch { .. } => "DFU-042",
            DfuError::InvalidConfig { .. } => "DFU-045",
            DfuError::Timeout => "DFU-021",
            DfuError::PortBusy { .. } => "DFU-052",
            DfuError::PortPermissionDenied { .. } => "DFU-053",
            DfuError::PortNotFound { .. } => "DFU-050",
            DfuError::TransportClosed { .. } => "DFU-055",
        }
    }
}
