//! Init command decoding and validation.
//!
//! The Command object carries a protocol-buffer encoded packet describing the
//! firmware that is about to be sent: type, versions, sizes, image hash and an
//! optional signature. Only the handful of messages the bootloader needs are
//! decoded here, with a small hand-written wire reader.

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use super::bank::{BankCode, BankManager, CacheLocation};
use super::config::DfuConfig;
use super::rescode::{ExtError, ReqResult, ResultCode};
use super::settings::SettingsRecord;
use crate::traits::SignatureVerifier;

/// `Command.op_code` value for an init command.
pub const INIT_OP_CODE: u32 = 1;

/// Errors from the protobuf wire reader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Input ended inside a field")]
    Truncated,

    #[error("Varint longer than 10 bytes")]
    VarintOverflow,

    #[error("Unsupported wire type {0}")]
    WireType(u8),

    #[error("Packet contains no command")]
    Empty,
}

// ============================================================================
// Enumerations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwType {
    Application = 0,
    SoftDevice = 1,
    Bootloader = 2,
    SoftDeviceBootloader = 3,
}

impl FwType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(FwType::Application),
            1 => Some(FwType::SoftDevice),
            2 => Some(FwType::Bootloader),
            3 => Some(FwType::SoftDeviceBootloader),
            _ => None,
        }
    }

    /// Bank code recorded once an image of this type has been verified.
    pub fn bank_code(self) -> BankCode {
        match self {
            FwType::Application => BankCode::ValidApp,
            FwType::SoftDevice => BankCode::ValidSd,
            FwType::Bootloader => BankCode::ValidBl,
            FwType::SoftDeviceBootloader => BankCode::ValidSdBl,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    NoHash = 0,
    Crc = 1,
    Sha128 = 2,
    Sha256 = 3,
    Sha512 = 4,
}

impl HashType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(HashType::NoHash),
            1 => Some(HashType::Crc),
            2 => Some(HashType::Sha128),
            3 => Some(HashType::Sha256),
            4 => Some(HashType::Sha512),
            _ => None,
        }
    }

    /// Digest length for the hash types the bootloader can check.
    pub fn supported_len(self) -> Option<usize> {
        match self {
            HashType::Crc => Some(4),
            HashType::Sha256 => Some(32),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    EcdsaP256Sha256 = 0,
    Ed25519 = 1,
}

impl SignatureType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(SignatureType::EcdsaP256Sha256),
            1 => Some(SignatureType::Ed25519),
            _ => None,
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageHash {
    pub hash_type: u32,
    pub hash: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitCommand {
    pub fw_version: Option<u32>,
    pub hw_version: Option<u32>,
    pub sd_req: Vec<u32>,
    pub fw_type: Option<u32>,
    pub sd_size: Option<u32>,
    pub bl_size: Option<u32>,
    pub app_size: Option<u32>,
    pub hash: Option<ImageHash>,
    pub is_debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Command {
    pub op_code: Option<u32>,
    pub init: Option<InitCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignedCommand {
    pub command: Command,
    /// Encoded `command` exactly as received. This is what the signature covers.
    pub command_bytes: Vec<u8>,
    pub signature_type: Option<u32>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Unsigned(Command),
    Signed(SignedCommand),
}

// ============================================================================
// Wire reader
// ============================================================================

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn varint(&mut self) -> Result<u64, DecodeError> {
        let mut value = 0u64;
        for shift in (0..70).step_by(7) {
            let byte = *self.buf.get(self.pos).ok_or(DecodeError::Truncated)?;
            self.pos += 1;
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(DecodeError::VarintOverflow)
    }

    fn key(&mut self) -> Result<(u64, u8), DecodeError> {
        let key = self.varint()?;
        Ok((key >> 3, (key & 0x07) as u8))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(DecodeError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = usize::try_from(self.varint()?).map_err(|_| DecodeError::Truncated)?;
        self.take(len)
    }

    fn skip(&mut self, wire_type: u8) -> Result<(), DecodeError> {
        match wire_type {
            WIRE_VARINT => self.varint().map(|_| ()),
            WIRE_FIXED64 => self.take(8).map(|_| ()),
            WIRE_LEN => self.bytes().map(|_| ()),
            WIRE_FIXED32 => self.take(4).map(|_| ()),
            other => Err(DecodeError::WireType(other)),
        }
    }

    /// Varint field truncated to 32 bits, as protobuf does for uint32/enum.
    fn u32_field(&mut self, wire_type: u8) -> Result<u32, DecodeError> {
        if wire_type != WIRE_VARINT {
            return Err(DecodeError::WireType(wire_type));
        }
        Ok(self.varint()? as u32)
    }

    fn len_field(&mut self, wire_type: u8) -> Result<&'a [u8], DecodeError> {
        if wire_type != WIRE_LEN {
            return Err(DecodeError::WireType(wire_type));
        }
        self.bytes()
    }
}

impl ImageHash {
    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        let mut hash = ImageHash::default();
        while !r.is_empty() {
            match r.key()? {
                (1, wt) => hash.hash_type = r.u32_field(wt)?,
                (2, wt) => hash.hash = r.len_field(wt)?.to_vec(),
                (_, wt) => r.skip(wt)?,
            }
        }
        Ok(hash)
    }
}

impl InitCommand {
    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        let mut init = InitCommand::default();
        while !r.is_empty() {
            match r.key()? {
                (1, wt) => init.fw_version = Some(r.u32_field(wt)?),
                (2, wt) => init.hw_version = Some(r.u32_field(wt)?),
                (3, WIRE_LEN) => {
                    let mut packed = WireReader::new(r.bytes()?);
                    while !packed.is_empty() {
                        init.sd_req.push(packed.varint()? as u32);
                    }
                }
                (3, wt) => init.sd_req.push(r.u32_field(wt)?),
                (4, wt) => init.fw_type = Some(r.u32_field(wt)?),
                (5, wt) => init.sd_size = Some(r.u32_field(wt)?),
                (6, wt) => init.bl_size = Some(r.u32_field(wt)?),
                (7, wt) => init.app_size = Some(r.u32_field(wt)?),
                (8, wt) => init.hash = Some(ImageHash::decode(r.len_field(wt)?)?),
                (9, wt) => init.is_debug = r.u32_field(wt)? != 0,
                (_, wt) => r.skip(wt)?,
            }
        }
        Ok(init)
    }

    /// Firmware type, if present and known.
    pub fn firmware_type(&self) -> Option<FwType> {
        self.fw_type.and_then(FwType::from_u32)
    }

    /// Total bytes the Data objects will carry.
    pub fn image_size(&self) -> u32 {
        [self.sd_size, self.bl_size, self.app_size]
            .iter()
            .map(|s| s.unwrap_or(0))
            .fold(0u32, u32::saturating_add)
    }
}

impl Command {
    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        let mut command = Command::default();
        while !r.is_empty() {
            match r.key()? {
                (1, wt) => command.op_code = Some(r.u32_field(wt)?),
                (2, wt) => command.init = Some(InitCommand::decode(r.len_field(wt)?)?),
                (_, wt) => r.skip(wt)?,
            }
        }
        Ok(command)
    }
}

impl SignedCommand {
    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        let mut signed = SignedCommand::default();
        while !r.is_empty() {
            match r.key()? {
                (1, wt) => {
                    let bytes = r.len_field(wt)?;
                    signed.command = Command::decode(bytes)?;
                    signed.command_bytes = bytes.to_vec();
                }
                (2, wt) => signed.signature_type = Some(r.u32_field(wt)?),
                (3, wt) => signed.signature = r.len_field(wt)?.to_vec(),
                (_, wt) => r.skip(wt)?,
            }
        }
        Ok(signed)
    }
}

impl Packet {
    /// Decode the outer packet. A signed command wins if both are present.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        let mut unsigned = None;
        let mut signed = None;
        while !r.is_empty() {
            match r.key()? {
                (1, wt) => unsigned = Some(Command::decode(r.len_field(wt)?)?),
                (2, wt) => signed = Some(SignedCommand::decode(r.len_field(wt)?)?),
                (_, wt) => r.skip(wt)?,
            }
        }
        match (signed, unsigned) {
            (Some(s), _) => Ok(Packet::Signed(s)),
            (None, Some(c)) => Ok(Packet::Unsigned(c)),
            (None, None) => Err(DecodeError::Empty),
        }
    }

    pub fn command(&self) -> &Command {
        match self {
            Packet::Unsigned(command) => command,
            Packet::Signed(signed) => &signed.command,
        }
    }

    pub fn init(&self) -> Option<&InitCommand> {
        self.command().init.as_ref()
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Everything the validation pipeline reads.
pub struct ValidationContext<'a, V: ?Sized> {
    pub config: &'a DfuConfig,
    pub record: &'a SettingsRecord,
    pub banks: &'a BankManager,
    pub verifier: &'a V,
}

/// A command that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedCommand {
    pub init: InitCommand,
    pub fw_type: FwType,
    pub hash_type: HashType,
    pub image_size: u32,
    pub location: CacheLocation,
}

/// Decode and validate a received init command.
///
/// Checks run in a fixed order and the first failure is returned: format,
/// hash type, signature type, signature, versions, then flash space.
pub fn validate<V: SignatureVerifier + ?Sized>(
    raw: &[u8],
    ctx: &ValidationContext<'_, V>,
) -> ReqResult<AcceptedCommand> {
    let packet = Packet::decode(raw).map_err(|e| {
        warn!(error = %e, "init command does not decode");
        ExtError::WrongCommandFormat
    })?;

    // Structure
    if packet.command().op_code != Some(INIT_OP_CODE) {
        return Err(ExtError::UnknownCommand.into());
    }
    let init = packet.init().ok_or(ExtError::InitCommandInvalid)?;
    let fw_type = init.firmware_type().ok_or(ExtError::InitCommandInvalid)?;
    if init.hw_version.is_none() {
        return Err(ExtError::InitCommandInvalid.into());
    }
    let size_present = match fw_type {
        FwType::Application => init.app_size.is_some(),
        FwType::SoftDevice => init.sd_size.is_some(),
        FwType::Bootloader => init.bl_size.is_some(),
        FwType::SoftDeviceBootloader => init.sd_size.is_some() && init.bl_size.is_some(),
    };
    if !size_present {
        return Err(ExtError::InitCommandInvalid.into());
    }
    if fw_type != FwType::SoftDevice && init.fw_version.is_none() {
        return Err(ExtError::InitCommandInvalid.into());
    }
    if fw_type == FwType::SoftDeviceBootloader
        && (init.sd_size == Some(0) || init.bl_size == Some(0))
    {
        return Err(ResultCode::InvalidParameter.into());
    }
    let image_size = init.image_size();
    if image_size == 0 {
        return Err(ResultCode::InvalidParameter.into());
    }
    let hash = init.hash.as_ref().ok_or(ExtError::InitCommandInvalid)?;

    // Hash type
    let hash_type = HashType::from_u32(hash.hash_type).ok_or(ExtError::WrongHashType)?;
    let expected_len = hash_type.supported_len().ok_or(ExtError::WrongHashType)?;
    if hash.hash.len() != expected_len {
        warn!(len = hash.hash.len(), expected_len, "image hash has wrong length");
        return Err(ExtError::HashFailed.into());
    }

    // Signature type, then the signature itself
    match &packet {
        Packet::Signed(signed) => {
            let signature_type = signed
                .signature_type
                .and_then(SignatureType::from_u32)
                .ok_or(ExtError::WrongSignatureType)?;
            if signed.signature.is_empty() {
                return Err(ExtError::SignatureMissing.into());
            }
            let digest: [u8; 32] = Sha256::digest(&signed.command_bytes).into();
            if !ctx
                .verifier
                .verify(signature_type, &digest, &signed.signature)
            {
                warn!(?signature_type, "init command signature rejected");
                return Err(ExtError::VerificationFailed.into());
            }
        }
        Packet::Unsigned(_) if ctx.config.require_signed_command => {
            return Err(ExtError::SignatureMissing.into());
        }
        Packet::Unsigned(_) => {}
    }

    // Versions
    if init.is_debug {
        if !ctx.config.allow_debug_packages {
            warn!("debug init command rejected");
            return Err(ResultCode::OperationFailed.into());
        }
        debug!("debug init command, skipping version checks");
    } else {
        check_versions(init, fw_type, ctx)?;
    }

    // Space
    let bootloader_size = match fw_type {
        FwType::Bootloader | FwType::SoftDeviceBootloader => init.bl_size,
        _ => None,
    };
    let location = ctx
        .banks
        .find_cache(ctx.record, image_size, bootloader_size)?;

    Ok(AcceptedCommand {
        init: init.clone(),
        fw_type,
        hash_type,
        image_size,
        location,
    })
}

fn check_versions<V: ?Sized>(
    init: &InitCommand,
    fw_type: FwType,
    ctx: &ValidationContext<'_, V>,
) -> ReqResult<()> {
    if init.hw_version != Some(ctx.config.hw_version) {
        warn!(
            got = ?init.hw_version,
            expected = ctx.config.hw_version,
            "hardware version mismatch"
        );
        return Err(ExtError::HwVersionFailure.into());
    }

    if let Some(fwid) = ctx.config.softdevice_fwid {
        if !init.sd_req.contains(&fwid) {
            warn!(fwid, sd_req = ?init.sd_req, "soft-device requirement not met");
            return Err(ExtError::SdVersionFailure.into());
        }
    }

    let installed = match fw_type {
        FwType::Application => Some(ctx.record.app_version),
        FwType::Bootloader | FwType::SoftDeviceBootloader => Some(ctx.record.bootloader_version),
        FwType::SoftDevice => None,
    };
    if let (Some(installed), Some(requested)) = (installed, init.fw_version) {
        if requested < installed {
            warn!(requested, installed, "firmware version too low");
            return Err(ExtError::FwVersionFailure.into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfu::bank::BankId;
    use crate::dfu::rescode::Rejection;
    use crate::test_helpers::fixtures::{test_config, InitCommandBuilder};
    use crate::traits::verifier::MockSignatureVerifier;

    fn run(
        raw: &[u8],
        config: &DfuConfig,
        record: &SettingsRecord,
        verifier: &MockSignatureVerifier,
    ) -> ReqResult<AcceptedCommand> {
        let banks = BankManager::new(config);
        validate(
            raw,
            &ValidationContext {
                config,
                record,
                banks: &banks,
                verifier,
            },
        )
    }

    fn unsigned(raw: &[u8]) -> ReqResult<AcceptedCommand> {
        run(
            raw,
            &test_config(),
            &SettingsRecord::default(),
            &MockSignatureVerifier::new(),
        )
    }

    #[test]
    fn test_decode_unsigned_packet() {
        let raw = InitCommandBuilder::application(1000)
            .fw_version(3)
            .sd_req(&[0xB6, 0x100])
            .build();
        let packet = Packet::decode(&raw).unwrap();
        let init = packet.init().unwrap();

        assert!(matches!(packet, Packet::Unsigned(_)));
        assert_eq!(packet.command().op_code, Some(INIT_OP_CODE));
        assert_eq!(init.fw_version, Some(3));
        assert_eq!(init.app_size, Some(1000));
        assert_eq!(init.sd_req, vec![0xB6, 0x100]);
        assert_eq!(init.firmware_type(), Some(FwType::Application));
        assert_eq!(init.image_size(), 1000);
    }

    #[test]
    fn test_decode_signed_packet_keeps_command_bytes() {
        let raw = InitCommandBuilder::application(64)
            .signed(SignatureType::Ed25519 as u32, vec![0xAB; 64])
            .build();
        match Packet::decode(&raw).unwrap() {
            Packet::Signed(signed) => {
                assert_eq!(signed.signature_type, Some(1));
                assert_eq!(signed.signature, vec![0xAB; 64]);
                assert_eq!(
                    Command::decode(&signed.command_bytes).unwrap(),
                    signed.command
                );
            }
            other => panic!("expected signed packet, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(Packet::decode(&[]), Err(DecodeError::Empty));
        assert_eq!(Packet::decode(&[0x0A, 0x05, 0x08]), Err(DecodeError::Truncated));
        assert_eq!(Packet::decode(&[0x0B]), Err(DecodeError::WireType(3)));
        assert_eq!(
            Packet::decode(&[0x78, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]),
            Err(DecodeError::VarintOverflow)
        );
    }

    #[test]
    fn test_decode_skips_unknown_fields() {
        let mut raw = vec![0x78, 0x05]; // field 15, varint
        raw.extend(InitCommandBuilder::application(10).build());
        assert!(Packet::decode(&raw).is_ok());
    }

    #[test]
    fn test_valid_application_command() {
        let accepted = unsigned(&InitCommandBuilder::application(0x2000).build()).unwrap();
        assert_eq!(accepted.fw_type, FwType::Application);
        assert_eq!(accepted.hash_type, HashType::Sha256);
        assert_eq!(accepted.image_size, 0x2000);
        assert_eq!(accepted.location.bank, BankId::Bank0);
    }

    #[test]
    fn test_garbage_is_wrong_command_format() {
        assert_eq!(
            unsigned(&[0xFF, 0xFF]),
            Err(Rejection::Ext(ExtError::WrongCommandFormat))
        );
    }

    #[test]
    fn test_unknown_op_code() {
        let raw = InitCommandBuilder::application(10).op_code(7).build();
        assert_eq!(unsigned(&raw), Err(Rejection::Ext(ExtError::UnknownCommand)));
    }

    #[test]
    fn test_missing_fields_are_invalid() {
        let no_hw = InitCommandBuilder::application(10).no_hw_version().build();
        assert_eq!(unsigned(&no_hw), Err(Rejection::Ext(ExtError::InitCommandInvalid)));

        let no_hash = InitCommandBuilder::application(10).no_hash().build();
        assert_eq!(unsigned(&no_hash), Err(Rejection::Ext(ExtError::InitCommandInvalid)));

        let bad_type = InitCommandBuilder::application(10).fw_type(9).build();
        assert_eq!(unsigned(&bad_type), Err(Rejection::Ext(ExtError::InitCommandInvalid)));
    }

    #[test]
    fn test_zero_sized_image_is_invalid_parameter() {
        let raw = InitCommandBuilder::application(0).build();
        assert_eq!(
            unsigned(&raw),
            Err(Rejection::Code(ResultCode::InvalidParameter))
        );
    }

    #[test]
    fn test_hash_checks() {
        let sha512 = InitCommandBuilder::application(10)
            .hash(HashType::Sha512 as u32, vec![0; 64])
            .build();
        assert_eq!(unsigned(&sha512), Err(Rejection::Ext(ExtError::WrongHashType)));

        let short = InitCommandBuilder::application(10)
            .hash(HashType::Sha256 as u32, vec![0; 16])
            .build();
        assert_eq!(unsigned(&short), Err(Rejection::Ext(ExtError::HashFailed)));
    }

    #[test]
    fn test_signature_type_and_presence() {
        let wrong_type = InitCommandBuilder::application(10)
            .signed(5, vec![1; 64])
            .build();
        assert_eq!(
            unsigned(&wrong_type),
            Err(Rejection::Ext(ExtError::WrongSignatureType))
        );

        let empty = InitCommandBuilder::application(10)
            .signed(SignatureType::EcdsaP256Sha256 as u32, vec![])
            .build();
        assert_eq!(unsigned(&empty), Err(Rejection::Ext(ExtError::SignatureMissing)));

        let config = DfuConfig {
            require_signed_command: true,
            ..test_config()
        };
        let raw = InitCommandBuilder::application(10).build();
        assert_eq!(
            run(&raw, &config, &SettingsRecord::default(), &MockSignatureVerifier::new()),
            Err(Rejection::Ext(ExtError::SignatureMissing))
        );
    }

    #[test]
    fn test_signature_is_checked_over_command_digest() {
        let raw = InitCommandBuilder::application(10)
            .signed(SignatureType::EcdsaP256Sha256 as u32, vec![7; 64])
            .build();
        let command_bytes = match Packet::decode(&raw).unwrap() {
            Packet::Signed(s) => s.command_bytes,
            _ => unreachable!(),
        };
        let expected: [u8; 32] = Sha256::digest(&command_bytes).into();

        let mut verifier = MockSignatureVerifier::new();
        verifier
            .expect_verify()
            .withf(move |ty, digest, sig| {
                *ty == SignatureType::EcdsaP256Sha256 && *digest == expected && *sig == [7u8; 64][..]
            })
            .times(1)
            .return_const(true);
        assert!(run(&raw, &test_config(), &SettingsRecord::default(), &verifier).is_ok());

        let mut rejecting = MockSignatureVerifier::new();
        rejecting.expect_verify().return_const(false);
        assert_eq!(
            run(&raw, &test_config(), &SettingsRecord::default(), &rejecting),
            Err(Rejection::Ext(ExtError::VerificationFailed))
        );
    }

    #[test]
    fn test_version_checks() {
        let wrong_hw = InitCommandBuilder::application(10).hw_version(99).build();
        assert_eq!(unsigned(&wrong_hw), Err(Rejection::Ext(ExtError::HwVersionFailure)));

        let config = DfuConfig {
            softdevice_fwid: Some(0xB6),
            ..test_config()
        };
        let no_sd = InitCommandBuilder::application(10).sd_req(&[0xA8]).build();
        assert_eq!(
            run(&no_sd, &config, &SettingsRecord::default(), &MockSignatureVerifier::new()),
            Err(Rejection::Ext(ExtError::SdVersionFailure))
        );

        let record = SettingsRecord {
            app_version: 5,
            ..SettingsRecord::default()
        };
        let old = InitCommandBuilder::application(10).fw_version(4).build();
        assert_eq!(
            run(&old, &test_config(), &record, &MockSignatureVerifier::new()),
            Err(Rejection::Ext(ExtError::FwVersionFailure))
        );
        let same = InitCommandBuilder::application(10).fw_version(5).build();
        assert!(run(&same, &test_config(), &record, &MockSignatureVerifier::new()).is_ok());
    }

    #[test]
    fn test_softdevice_ignores_fw_version() {
        let record = SettingsRecord {
            bootloader_version: 9,
            app_version: 9,
            ..SettingsRecord::default()
        };
        let raw = InitCommandBuilder::softdevice(0x3000).fw_version(1).build();
        let accepted = run(&raw, &test_config(), &record, &MockSignatureVerifier::new()).unwrap();
        assert_eq!(accepted.fw_type, FwType::SoftDevice);
    }

    #[test]
    fn test_debug_packages() {
        let raw = InitCommandBuilder::application(10)
            .debug()
            .hw_version(99)
            .build();
        assert_eq!(unsigned(&raw), Err(Rejection::Code(ResultCode::OperationFailed)));

        let config = DfuConfig {
            allow_debug_packages: true,
            ..test_config()
        };
        assert!(run(&raw, &config, &SettingsRecord::default(), &MockSignatureVerifier::new()).is_ok());
    }

    #[test]
    fn test_insufficient_space() {
        let too_big = test_config().flash.bank_region_size() + 1;
        let raw = InitCommandBuilder::application(too_big).build();
        assert_eq!(unsigned(&raw), Err(Rejection::Ext(ExtError::InsufficientSpace)));
    }

    #[test]
    fn test_format_checked_before_versions() {
        // Both the hash type and the hardware version are wrong; hash wins.
        let raw = InitCommandBuilder::application(10)
            .hw_version(99)
            .hash(HashType::NoHash as u32, vec![])
            .build();
        assert_eq!(unsigned(&raw), Err(Rejection::Ext(ExtError::WrongHashType)));
    }
}
