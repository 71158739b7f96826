//! Two-level result codes returned to the transport.
//!
//! Every request ends in a [`ResultCode`]. When that code is
//! [`ResultCode::ExtError`] an [`ExtError`] names the init command check that
//! failed.

use super::error::DfuError;

/// First-level result of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Invalid = 0x00,
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
    ExtError = 0x0B,
}

impl ResultCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ResultCode::Invalid),
            0x01 => Some(ResultCode::Success),
            0x02 => Some(ResultCode::OpCodeNotSupported),
            0x03 => Some(ResultCode::InvalidParameter),
            0x04 => Some(ResultCode::InsufficientResources),
            0x05 => Some(ResultCode::InvalidObject),
            0x07 => Some(ResultCode::UnsupportedType),
            0x08 => Some(ResultCode::OperationNotPermitted),
            0x0A => Some(ResultCode::OperationFailed),
            0x0B => Some(ResultCode::ExtError),
            _ => None,
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            ResultCode::Invalid => "Invalid result",
            ResultCode::Success => "Operation successful",
            ResultCode::OpCodeNotSupported => "Op-code not supported",
            ResultCode::InvalidParameter => "Invalid parameter",
            ResultCode::InsufficientResources => "Insufficient resources",
            ResultCode::InvalidObject => "Invalid object",
            ResultCode::UnsupportedType => "Unsupported object type",
            ResultCode::OperationNotPermitted => "Operation not permitted in this state",
            ResultCode::OperationFailed => "Operation failed",
            ResultCode::ExtError => "Extended error",
        }
    }
}

impl From<&DfuError> for ResultCode {
    fn from(err: &DfuError) -> Self {
        match err {
            DfuError::FlashBusy => ResultCode::InsufficientResources,
            _ => ResultCode::OperationFailed,
        }
    }
}

/// Second-level code explaining an init command rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ExtError {
    #[default]
    NoError = 0x00,
    InvalidErrorCode = 0x01,
    WrongCommandFormat = 0x02,
    UnknownCommand = 0x03,
    InitCommandInvalid = 0x04,
    FwVersionFailure = 0x05,
    HwVersionFailure = 0x06,
    SdVersionFailure = 0x07,
    SignatureMissing = 0x08,
    WrongHashType = 0x09,
    HashFailed = 0x0A,
    WrongSignatureType = 0x0B,
    VerificationFailed = 0x0C,
    InsufficientSpace = 0x0D,
}

impl ExtError {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ExtError::NoError),
            0x01 => Some(ExtError::InvalidErrorCode),
            0x02 => Some(ExtError::WrongCommandFormat),
            0x03 => Some(ExtError::UnknownCommand),
            0x04 => Some(ExtError::InitCommandInvalid),
            0x05 => Some(ExtError::FwVersionFailure),
            0x06 => Some(ExtError::HwVersionFailure),
            0x07 => Some(ExtError::SdVersionFailure),
            0x08 => Some(ExtError::SignatureMissing),
            0x09 => Some(ExtError::WrongHashType),
            0x0A => Some(ExtError::HashFailed),
            0x0B => Some(ExtError::WrongSignatureType),
            0x0C => Some(ExtError::VerificationFailed),
            0x0D => Some(ExtError::InsufficientSpace),
            _ => None,
        }
    }

    /// Decode a persisted code. Anything unknown reads back as `InvalidErrorCode`.
    pub fn from_u32(value: u32) -> Self {
        u8::try_from(value)
            .ok()
            .and_then(Self::from_byte)
            .unwrap_or(ExtError::InvalidErrorCode)
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            ExtError::NoError => "No extended error",
            ExtError::InvalidErrorCode => "Invalid extended error code",
            ExtError::WrongCommandFormat => "Init command is malformed",
            ExtError::UnknownCommand => "Init command op-code is unknown",
            ExtError::InitCommandInvalid => "Init command is missing required fields",
            ExtError::FwVersionFailure => "Firmware version is too low",
            ExtError::HwVersionFailure => "Hardware version does not match",
            ExtError::SdVersionFailure => "Required soft-device is not present",
            ExtError::SignatureMissing => "Init command is not signed",
            ExtError::WrongHashType => "Hash type is not supported",
            ExtError::HashFailed => "Hash could not be checked",
            ExtError::WrongSignatureType => "Signature type is not supported",
            ExtError::VerificationFailed => "Verification failed",
            ExtError::InsufficientSpace => "Not enough flash for the image",
        }
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Plain result code.
    Code(ResultCode),
    /// `ExtError` with the failing check.
    Ext(ExtError),
}

impl Rejection {
    /// Result code sent in the response frame.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Rejection::Code(code) => *code,
            Rejection::Ext(_) => ResultCode::ExtError,
        }
    }

    pub fn ext_error(&self) -> Option<ExtError> {
        match self {
            Rejection::Code(_) => None,
            Rejection::Ext(ext) => Some(*ext),
        }
    }

    /// Most specific description: the extended code when there is one.
    pub fn description(&self) -> &'static str {
        match self {
            Rejection::Code(code) => code.description(),
            Rejection::Ext(ext) => ext.description(),
        }
    }
}

impl From<ResultCode> for Rejection {
    fn from(code: ResultCode) -> Self {
        Rejection::Code(code)
    }
}

impl From<ExtError> for Rejection {
    fn from(ext: ExtError) -> Self {
        Rejection::Ext(ext)
    }
}

impl From<&DfuError> for Rejection {
    fn from(err: &DfuError) -> Self {
        Rejection::Code(ResultCode::from(err))
    }
}

/// Outcome of a request handler operation.
pub type ReqResult<T> = Result<T, Rejection>;
