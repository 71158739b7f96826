//! Object transfer state machine.
//!
//! [`RequestHandler`] owns the flash queue, the settings store and the bank
//! manager, and turns control point requests into flash operations. Data
//! writes are asynchronous: progress only advances when the write completes,
//! which the transport drives through [`RequestHandler::process_flash`].

use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use super::bank::{BankId, BankManager};
use super::checksum::{crc32, crc32_continue};
use super::config::{DfuConfig, ObjectType, CODE_PAGE_SIZE};
use super::error::DfuResult;
use super::flash::{FlashCompletion, FlashDriver, FlashQueue, FlashTag};
use super::init_command::{validate, FwType, HashType, Packet, ValidationContext};
use super::request::{Request, Response, ResponsePayload};
use super::rescode::{ExtError, Rejection, ReqResult, ResultCode};
use super::settings::{Progress, SettingsRecord, SettingsStore};
use crate::traits::SignatureVerifier;

/// Where the transfer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    /// An object type is selected, nothing is open.
    Selected,
    /// An object is open and accepting writes.
    Receiving,
    /// The open object is full and can be executed.
    Ready,
    /// An execute is waiting for its settings write.
    Executing,
    /// The image is verified. A reset follows once the response is out.
    Complete,
}

/// Device side of the DFU control point.
pub struct RequestHandler<F: FlashDriver, V: SignatureVerifier> {
    config: DfuConfig,
    flash: FlashQueue<F>,
    settings: SettingsStore,
    banks: BankManager,
    verifier: V,
    state: HandlerState,
    current_type: ObjectType,
    /// An accepted init command is in the record.
    init_valid: bool,
    /// Image offset at the last progress flush.
    flushed_offset: u32,
    response_sent: bool,
}

impl<F: FlashDriver, V: SignatureVerifier> RequestHandler<F, V> {
    /// Load settings from `driver` and resume any interrupted transfer.
    pub fn new(config: DfuConfig, driver: F, verifier: V) -> DfuResult<Self> {
        config.validate()?;
        let mut flash = FlashQueue::new(driver);
        let settings = SettingsStore::init(&mut flash, &config.flash, config.bank_layout);
        let banks = BankManager::new(&config);

        let record = settings.record();
        let progress = record.progress;
        let init_valid = progress.command_size != 0
            && progress.image_size != 0
            && Packet::decode(&record.init_command).is_ok();
        if init_valid {
            info!(
                offset = progress.firmware_image_offset,
                image_size = progress.image_size,
                "resuming interrupted transfer"
            );
        }

        Ok(Self {
            config,
            flash,
            settings,
            banks,
            verifier,
            state: HandlerState::Idle,
            current_type: ObjectType::Command,
            init_valid,
            flushed_offset: progress.firmware_image_offset,
            response_sent: false,
        })
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn config(&self) -> &DfuConfig {
        &self.config
    }

    pub fn settings(&self) -> &SettingsRecord {
        self.settings.record()
    }

    pub fn settings_store(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn settings_store_mut(&mut self) -> &mut SettingsStore {
        &mut self.settings
    }

    pub fn flash(&self) -> &FlashQueue<F> {
        &self.flash
    }

    pub fn banks(&self) -> &BankManager {
        &self.banks
    }

    pub fn is_flash_busy(&self) -> bool {
        self.flash.is_busy()
    }

    /// Reason the last init command was rejected, if any.
    pub fn last_ext_error(&self) -> ExtError {
        self.settings.record().ext_error
    }

    /// Bank the bootloader would start right now.
    pub fn boot_bank(&self) -> Option<BankId> {
        self.banks.boot_bank(self.settings.record())
    }

    /// Persist the in-memory settings.
    pub fn persist_settings(&mut self) -> DfuResult<()> {
        self.settings.write(&mut self.flash)
    }

    /// Drop queued flash work and hand the device back, as a power cut would.
    pub fn into_flash(mut self) -> F {
        let dropped = self.flash.discard_pending();
        if dropped > 0 {
            warn!(dropped, "discarding queued flash operations");
        }
        self.flash.into_driver()
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Handle one request and build its response.
    pub fn handle(&mut self, request: Request) -> Response {
        let opcode = request.opcode();
        debug!(?opcode, state = ?self.state, "request");

        let result = match request {
            Request::Create { object_type, size } => {
                self.create(object_type, size).map(|_| ResponsePayload::None)
            }
            // Receipt notifications are counted by the control point.
            Request::SetReceiptNotification { .. } => Ok(ResponsePayload::None),
            Request::CalculateCrc => Ok(self.calculate_crc()),
            Request::Execute => self.execute().map(|_| ResponsePayload::None),
            Request::Select { object_type } => self.select(object_type),
            Request::Write { data } => self.write(&data).map(|_| ResponsePayload::None),
        };

        match result {
            Ok(payload) => Response::success(opcode, payload),
            Err(rejection) => {
                debug!(
                    ?opcode,
                    ?rejection,
                    reason = rejection.description(),
                    "request rejected"
                );
                Response::rejected(opcode, rejection)
            }
        }
    }

    fn object_type(raw: u8) -> ReqResult<ObjectType> {
        ObjectType::from_byte(raw).ok_or(Rejection::Code(ResultCode::InvalidParameter))
    }

    fn progress(&self) -> Progress {
        self.settings.record().progress
    }

    fn progress_mut(&mut self) -> &mut Progress {
        &mut self.settings.record_mut().progress
    }

    /// Select an object type and report where the transfer stands.
    pub fn select(&mut self, object_type: u8) -> ReqResult<ResponsePayload> {
        let object_type = Self::object_type(object_type)?;
        let p = self.progress();

        let (offset, crc, open_size, open_offset) = match object_type {
            ObjectType::Command => (
                p.command_offset,
                p.command_crc,
                p.command_size,
                p.command_offset,
            ),
            ObjectType::Data => {
                if !self.init_valid {
                    return Err(ResultCode::OperationNotPermitted.into());
                }
                (
                    p.firmware_image_offset,
                    p.firmware_image_crc,
                    p.data_object_size,
                    p.data_object_offset(),
                )
            }
        };

        self.current_type = object_type;
        if self.state != HandlerState::Complete {
            self.state = if open_size == 0 {
                HandlerState::Selected
            } else if open_offset < open_size {
                HandlerState::Receiving
            } else {
                HandlerState::Ready
            };
        }

        Ok(ResponsePayload::Select {
            max_size: object_type.max_size(),
            offset,
            crc,
        })
    }

    /// Open a new object of `size` bytes.
    pub fn create(&mut self, object_type: u8, size: u32) -> ReqResult<()> {
        match Self::object_type(object_type)? {
            ObjectType::Command => self.create_command(size),
            ObjectType::Data => self.create_data(size),
        }
    }

    fn create_command(&mut self, size: u32) -> ReqResult<()> {
        if size == 0 {
            return Err(ResultCode::InvalidParameter.into());
        }
        if size > ObjectType::Command.max_size() {
            return Err(ResultCode::InsufficientResources.into());
        }
        if self.flash.is_busy() {
            return Err(ResultCode::OperationNotPermitted.into());
        }

        // A new command abandons any earlier transfer. Nothing is persisted
        // until the command is executed.
        let record = self.settings.record_mut();
        record.progress = Progress {
            command_size: size,
            ..Progress::default()
        };
        record.init_command.clear();
        self.init_valid = false;
        self.flushed_offset = 0;
        self.current_type = ObjectType::Command;
        self.state = HandlerState::Receiving;
        debug!(size, "command object created");
        Ok(())
    }

    fn create_data(&mut self, size: u32) -> ReqResult<()> {
        if !self.init_valid || self.flash.is_busy() {
            return Err(ResultCode::OperationNotPermitted.into());
        }
        if size == 0 {
            return Err(ResultCode::InvalidParameter.into());
        }
        if size > ObjectType::Data.max_size() {
            return Err(ResultCode::InsufficientResources.into());
        }

        let p = self.progress();
        let start = p.firmware_image_offset_last;
        let end = u64::from(start) + u64::from(size);
        if size % CODE_PAGE_SIZE != 0 && end != u64::from(p.image_size) {
            return Err(ResultCode::InvalidParameter.into());
        }
        if end > u64::from(p.image_size) {
            return Err(ResultCode::OperationNotPermitted.into());
        }

        let address = p.image_start_address + start;
        let pages = size.div_ceil(self.flash.page_size());
        self.flash
            .erase(address, pages, FlashTag::DataErase)
            .map_err(|e| {
                error!(address, error = %e, "could not queue data erase");
                Rejection::from(&e)
            })?;

        let progress = self.progress_mut();
        if progress.data_object_size != 0 {
            debug!(
                offset = progress.firmware_image_offset_last,
                "restarting open data object"
            );
        }
        progress.rollback_data_object();
        progress.data_object_size = size;
        self.flushed_offset = start;
        self.current_type = ObjectType::Data;
        self.state = HandlerState::Receiving;
        debug!(offset = start, size, "data object created");
        Ok(())
    }

    /// Append a fragment to the open object.
    pub fn write(&mut self, data: &[u8]) -> ReqResult<()> {
        if data.len() > self.config.max_fragment_size as usize {
            return Err(ResultCode::InsufficientResources.into());
        }
        match self.current_type {
            ObjectType::Command => self.write_command(data),
            ObjectType::Data => self.write_data(data),
        }
    }

    fn write_command(&mut self, data: &[u8]) -> ReqResult<()> {
        let record = self.settings.record_mut();
        let p = &mut record.progress;
        if p.command_size == 0 {
            return Err(ResultCode::OperationNotPermitted.into());
        }
        if u64::from(p.command_offset) + data.len() as u64 > u64::from(p.command_size) {
            return Err(ResultCode::InvalidObject.into());
        }

        record.init_command.extend_from_slice(data);
        p.command_offset += data.len() as u32;
        p.command_crc = crc32_continue(p.command_crc, data);
        self.state = if p.command_offset == p.command_size {
            HandlerState::Ready
        } else {
            HandlerState::Receiving
        };
        Ok(())
    }

    fn write_data(&mut self, data: &[u8]) -> ReqResult<()> {
        let p = self.progress();
        if !self.init_valid || p.data_object_size == 0 {
            return Err(ResultCode::OperationNotPermitted.into());
        }
        if u64::from(p.data_object_offset()) + data.len() as u64 > u64::from(p.data_object_size) {
            return Err(ResultCode::InvalidObject.into());
        }
        if self.flash.is_busy() {
            return Err(ResultCode::InsufficientResources.into());
        }

        let address = p.image_start_address + p.firmware_image_offset;
        let tag = FlashTag::DataWrite {
            len: data.len() as u32,
            crc: crc32_continue(p.firmware_image_crc, data),
        };
        self.flash
            .write(address, data.to_vec(), tag)
            .map_err(|e| {
                error!(address, error = %e, "could not queue data write");
                Rejection::from(&e)
            })?;
        self.state = HandlerState::Receiving;
        Ok(())
    }

    /// Offset and CRC of the selected object type.
    pub fn calculate_crc(&self) -> ResponsePayload {
        let p = self.progress();
        match self.current_type {
            ObjectType::Command => ResponsePayload::Crc {
                offset: p.command_offset,
                crc: p.command_crc,
            },
            ObjectType::Data => ResponsePayload::Crc {
                offset: p.firmware_image_offset,
                crc: p.firmware_image_crc,
            },
        }
    }

    /// Execute the selected object.
    pub fn execute(&mut self) -> ReqResult<()> {
        match self.current_type {
            ObjectType::Command => self.execute_command(),
            ObjectType::Data => self.execute_data(),
        }
    }

    fn execute_command(&mut self) -> ReqResult<()> {
        let p = self.progress();
        if self.init_valid || p.command_size == 0 || p.command_offset != p.command_size {
            return Err(ResultCode::OperationNotPermitted.into());
        }
        if self.flash.is_busy() {
            return Err(ResultCode::InsufficientResources.into());
        }

        let result = {
            let record = self.settings.record();
            let ctx = ValidationContext {
                config: &self.config,
                record,
                banks: &self.banks,
                verifier: &self.verifier,
            };
            validate(&record.init_command, &ctx)
        };

        let accepted = match result {
            Ok(accepted) => accepted,
            Err(rejection) => {
                warn!(?rejection, reason = rejection.description(), "init command rejected");
                if let Some(ext) = rejection.ext_error() {
                    self.settings.record_mut().ext_error = ext;
                    if let Err(e) = self.settings.write(&mut self.flash) {
                        warn!(error = %e, "could not persist rejection");
                    }
                }
                self.state = HandlerState::Idle;
                return Err(rejection);
            }
        };

        let record = self.settings.record_mut();
        record.ext_error = ExtError::NoError;
        self.banks
            .begin_update(record, accepted.location, accepted.image_size);
        record.progress.image_start_address = accepted.location.address;
        record.progress.image_size = accepted.image_size;
        self.init_valid = true;
        self.persist()?;

        info!(
            fw_type = ?accepted.fw_type,
            image_size = accepted.image_size,
            address = accepted.location.address,
            "init command accepted"
        );
        self.state = HandlerState::Executing;
        Ok(())
    }

    fn execute_data(&mut self) -> ReqResult<()> {
        let p = self.progress();
        if !self.init_valid || p.data_object_size == 0 || p.data_object_offset() != p.data_object_size
        {
            return Err(ResultCode::OperationNotPermitted.into());
        }
        if self.flash.is_busy() {
            return Err(ResultCode::InsufficientResources.into());
        }

        if p.firmware_image_offset == p.image_size {
            return self.finish_image();
        }

        let progress = self.progress_mut();
        progress.data_object_size = 0;
        progress.firmware_image_offset_last = progress.firmware_image_offset;
        progress.firmware_image_crc_last = progress.firmware_image_crc;
        self.flushed_offset = p.firmware_image_offset;
        self.persist()?;
        debug!(offset = p.firmware_image_offset, "data object executed");
        self.state = HandlerState::Executing;
        Ok(())
    }

    /// Check the received image against the init command and activate it.
    fn finish_image(&mut self) -> ReqResult<()> {
        let p = self.progress();
        let init = Packet::decode(&self.settings.record().init_command)
            .ok()
            .and_then(|packet| packet.init().cloned())
            .ok_or(ResultCode::OperationFailed)?;
        let fw_type = init.firmware_type().ok_or(ResultCode::OperationFailed)?;
        let hash = init.hash.clone().unwrap_or_default();

        let mut image = vec![0u8; p.image_size as usize];
        self.flash
            .read(p.image_start_address, &mut image)
            .map_err(|e| {
                error!(error = %e, "could not read back image");
                Rejection::from(&e)
            })?;

        let image_crc = crc32(&image);
        let matches = match HashType::from_u32(hash.hash_type) {
            Some(HashType::Crc) => hash.hash[..] == image_crc.to_le_bytes()[..],
            Some(HashType::Sha256) => Sha256::digest(&image).as_slice() == hash.hash.as_slice(),
            _ => false,
        };

        if !matches {
            error!(?fw_type, image_size = p.image_size, "image failed verification");
            let record = self.settings.record_mut();
            record.progress.rollback_data_object();
            record.ext_error = ExtError::VerificationFailed;
            let offset = record.progress.firmware_image_offset;
            self.flushed_offset = offset;
            if let Err(e) = self.settings.write(&mut self.flash) {
                warn!(error = %e, "could not persist verification failure");
            }
            self.state = HandlerState::Idle;
            return Err(ResultCode::OperationFailed.into());
        }

        let record = self.settings.record_mut();
        let bank = self.banks.current_bank(record);
        self.banks
            .mark_valid(record, bank, fw_type.bank_code(), image_crc, p.image_size);
        if !init.is_debug {
            if let Some(version) = init.fw_version {
                match fw_type {
                    FwType::Application => record.app_version = version,
                    FwType::Bootloader | FwType::SoftDeviceBootloader => {
                        record.bootloader_version = version
                    }
                    FwType::SoftDevice => {}
                }
            }
        }
        if matches!(fw_type, FwType::SoftDevice | FwType::SoftDeviceBootloader) {
            record.sd_size = init.sd_size.unwrap_or(0);
        }
        record.progress = Progress::default();
        record.init_command.clear();
        record.ext_error = ExtError::NoError;
        self.init_valid = false;
        self.flushed_offset = 0;
        self.persist()?;

        info!(?fw_type, ?bank, image_size = p.image_size, "image verified, reset pending");
        self.state = HandlerState::Complete;
        self.response_sent = false;
        Ok(())
    }

    fn persist(&mut self) -> ReqResult<()> {
        self.settings.write(&mut self.flash).map_err(|e| {
            error!(error = %e, "could not queue settings write");
            Rejection::from(&e)
        })
    }

    // ------------------------------------------------------------------------
    // Flash completions and reset
    // ------------------------------------------------------------------------

    /// Run one queued flash operation. Returns false when the queue was empty.
    pub fn process_flash(&mut self) -> bool {
        match self.flash.process_next() {
            Some(completion) => {
                self.on_flash_complete(completion);
                true
            }
            None => false,
        }
    }

    /// Run flash operations until the queue is empty.
    pub fn run_flash(&mut self) -> usize {
        let mut processed = 0;
        while self.process_flash() {
            processed += 1;
        }
        processed
    }

    fn on_flash_complete(&mut self, completion: FlashCompletion) {
        let FlashCompletion { tag, result } = completion;
        match tag {
            FlashTag::DataErase | FlashTag::DataWrite { .. } if result.is_err() => {
                warn!(?tag, "data operation failed, rolling back object");
                let progress = self.progress_mut();
                progress.rollback_data_object();
                let offset = progress.firmware_image_offset;
                self.flushed_offset = offset;
                self.state = HandlerState::Idle;
            }
            FlashTag::DataErase => {}
            FlashTag::DataWrite { len, crc } => {
                let progress = self.progress_mut();
                progress.firmware_image_offset += len;
                progress.firmware_image_crc = crc;
                let full = progress.data_object_offset() == progress.data_object_size;
                let offset = progress.firmware_image_offset;
                if full {
                    self.state = HandlerState::Ready;
                }
                self.maybe_flush_progress(offset);
            }
            FlashTag::SettingsErase(_) | FlashTag::SettingsWrite(_) => {
                let idle = self.settings.on_flash_complete(tag, &result, &mut self.flash);
                if idle && self.state == HandlerState::Executing {
                    self.state = HandlerState::Idle;
                }
            }
        }
    }

    fn maybe_flush_progress(&mut self, offset: u32) {
        let interval = self.config.progress_flush_interval;
        if interval == 0 || offset - self.flushed_offset < interval {
            return;
        }
        self.flushed_offset = offset;
        debug!(offset, "flushing transfer progress");
        if let Err(e) = self.settings.write(&mut self.flash) {
            warn!(error = %e, "could not flush progress");
        }
    }

    /// The response to the last request has gone out.
    pub fn on_response_sent(&mut self) {
        if self.state == HandlerState::Complete {
            self.response_sent = true;
        }
    }

    /// The device should reset into the new image now.
    pub fn reset_requested(&self) -> bool {
        self.state == HandlerState::Complete
            && self.response_sent
            && !self.flash.is_busy()
            && !self.settings.is_writing()
    }

    /// Record that a transport came up, so the next boot stays in DFU mode.
    pub fn set_transport_activated(&mut self, activated: bool) -> DfuResult<()> {
        if self.settings.record().transport_activated == activated {
            return Ok(());
        }
        self.settings.record_mut().transport_activated = activated;
        self.settings.write(&mut self.flash)
    }
}
