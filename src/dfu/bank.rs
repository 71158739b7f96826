//! Bank bookkeeping.
//!
//! A bank is a flash region that holds one complete image. In single-bank
//! layout there is only bank 0 and an update overwrites the running
//! application. In dual-bank layout the bank region is split in two halves;
//! an update goes into the half that is not currently booted, so the old
//! image stays bootable until the new one has been verified.

use tracing::{info, warn};

use super::config::{BankLayout, DfuConfig, FlashLayout};
use super::rescode::{ExtError, ReqResult};
use super::settings::SettingsRecord;

/// Validity code of a bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum BankCode {
    #[default]
    Invalid = 0x00,
    ValidApp = 0x01,
    ValidSd = 0xA5,
    ValidBl = 0xAA,
    ValidSdBl = 0xAC,
}

impl BankCode {
    /// Decode a persisted code. Unknown values are treated as invalid.
    pub fn from_u32(value: u32) -> Self {
        match value {
            0x01 => BankCode::ValidApp,
            0xA5 => BankCode::ValidSd,
            0xAA => BankCode::ValidBl,
            0xAC => BankCode::ValidSdBl,
            _ => BankCode::Invalid,
        }
    }

    pub fn is_valid(self) -> bool {
        self != BankCode::Invalid
    }

    /// Staged soft-device or bootloader waiting to be copied into place.
    pub fn needs_activation(self) -> bool {
        matches!(
            self,
            BankCode::ValidSd | BankCode::ValidBl | BankCode::ValidSdBl
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BankRecord {
    pub code: BankCode,
    pub image_crc: u32,
    pub image_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankId {
    Bank0,
    Bank1,
}

impl BankId {
    pub fn index(self) -> u32 {
        match self {
            BankId::Bank0 => 0,
            BankId::Bank1 => 1,
        }
    }

    pub fn from_index(index: u32) -> Self {
        if index == 1 {
            BankId::Bank1
        } else {
            BankId::Bank0
        }
    }

    pub fn other(self) -> Self {
        match self {
            BankId::Bank0 => BankId::Bank1,
            BankId::Bank1 => BankId::Bank0,
        }
    }
}

/// Where an incoming image will be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLocation {
    pub bank: BankId,
    pub address: u32,
}

/// Reads and updates the bank records of a [`SettingsRecord`].
#[derive(Debug, Clone)]
pub struct BankManager {
    layout: FlashLayout,
    mode: BankLayout,
    max_bootloader_size: u32,
}

impl BankManager {
    pub fn new(config: &DfuConfig) -> Self {
        Self {
            layout: config.flash,
            mode: config.bank_layout,
            max_bootloader_size: config.max_bootloader_size,
        }
    }

    pub fn mode(&self) -> BankLayout {
        self.mode
    }

    pub fn bank<'a>(&self, record: &'a SettingsRecord, bank: BankId) -> &'a BankRecord {
        match bank {
            BankId::Bank0 => &record.bank_0,
            BankId::Bank1 => &record.bank_1,
        }
    }

    fn bank_mut<'a>(&self, record: &'a mut SettingsRecord, bank: BankId) -> &'a mut BankRecord {
        match bank {
            BankId::Bank0 => &mut record.bank_0,
            BankId::Bank1 => &mut record.bank_1,
        }
    }

    /// Bytes in one half of the bank region, rounded down to whole pages.
    fn half_region(&self) -> u32 {
        let half = self.layout.bank_region_size() / 2;
        half - half % self.layout.page_size
    }

    pub fn bank_address(&self, bank: BankId) -> u32 {
        match bank {
            BankId::Bank0 => self.layout.app_start,
            BankId::Bank1 => self.layout.app_start + self.half_region(),
        }
    }

    pub fn current_bank(&self, record: &SettingsRecord) -> BankId {
        BankId::from_index(record.bank_current)
    }

    /// Choose where an image of `image_size` bytes goes.
    ///
    /// `bootloader_size` is the bootloader part of the image, if any.
    pub fn find_cache(
        &self,
        record: &SettingsRecord,
        image_size: u32,
        bootloader_size: Option<u32>,
    ) -> ReqResult<CacheLocation> {
        if let Some(bl_size) = bootloader_size {
            if bl_size > self.max_bootloader_size {
                warn!(bl_size, max = self.max_bootloader_size, "bootloader too large");
                return Err(ExtError::InsufficientSpace.into());
            }
        }

        if self.mode == BankLayout::Dual {
            let target = match self.boot_bank(record) {
                Some(running) => running.other(),
                None => BankId::Bank0,
            };
            if image_size <= self.half_region() {
                return Ok(CacheLocation {
                    bank: target,
                    address: self.bank_address(target),
                });
            }
            warn!(image_size, "image does not fit a half bank, updating in place");
        }

        if image_size <= self.layout.bank_region_size() {
            return Ok(CacheLocation {
                bank: BankId::Bank0,
                address: self.layout.app_start,
            });
        }

        warn!(
            image_size,
            available = self.layout.bank_region_size(),
            "no room for image"
        );
        Err(ExtError::InsufficientSpace.into())
    }

    /// Claim `location` for an image of `image_size` bytes.
    ///
    /// Every bank the image will overlap is invalidated first.
    pub fn begin_update(
        &self,
        record: &mut SettingsRecord,
        location: CacheLocation,
        image_size: u32,
    ) {
        self.invalidate(record, location.bank);
        if location.bank == BankId::Bank0
            && location.address + image_size > self.bank_address(BankId::Bank1)
        {
            self.invalidate(record, BankId::Bank1);
        }
        self.bank_mut(record, location.bank).image_size = image_size;
        record.bank_current = location.bank.index();
        info!(bank = ?location.bank, address = location.address, image_size, "update target selected");
    }

    pub fn invalidate(&self, record: &mut SettingsRecord, bank: BankId) {
        *self.bank_mut(record, bank) = BankRecord::default();
    }

    /// Record a verified image.
    pub fn mark_valid(
        &self,
        record: &mut SettingsRecord,
        bank: BankId,
        code: BankCode,
        image_crc: u32,
        image_size: u32,
    ) {
        *self.bank_mut(record, bank) = BankRecord {
            code,
            image_crc,
            image_size,
        };
        info!(?bank, ?code, image_size, "bank marked valid");
    }

    /// A bank holding a verified application can be started.
    pub fn is_bootable(&self, record: &SettingsRecord, bank: BankId) -> bool {
        if self.mode == BankLayout::Single && bank == BankId::Bank1 {
            return false;
        }
        self.bank(record, bank).code == BankCode::ValidApp
    }

    /// Bank to start, preferring the current one.
    pub fn boot_bank(&self, record: &SettingsRecord) -> Option<BankId> {
        let current = self.current_bank(record);
        if self.is_bootable(record, current) {
            return Some(current);
        }
        let other = current.other();
        if self.mode == BankLayout::Dual && self.is_bootable(record, other) {
            return Some(other);
        }
        None
    }
}
