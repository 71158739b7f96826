//! Protocol constants and runtime configuration for the DFU core.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{DfuError, DfuResult};
use super::settings::RECORD_SIZE;

// ============================================================================
// Object Limits
// ============================================================================

/// Largest init command the Command object can hold.
pub const INIT_COMMAND_MAX_SIZE: u32 = 256;

/// Largest single Data object.
pub const DATA_OBJECT_MAX_SIZE: u32 = 4096;

/// Flash page size data objects are aligned to.
pub const CODE_PAGE_SIZE: u32 = 4096;

/// Default cap on a single write fragment.
pub const DEFAULT_MAX_FRAGMENT_SIZE: u32 = 512;

// ============================================================================
// Settings Record
// ============================================================================

/// Schema version written into every settings slot.
pub const SETTINGS_VERSION: u32 = 1;

/// Capacity of the peer-pairing blob in the shared data block.
pub const PEER_DATA_SIZE: usize = 64;

/// Capacity of the advertising name in the shared data block.
pub const ADV_NAME_MAX_LEN: usize = 20;

/// Length of a radio address (type byte + 6 address bytes).
pub const BLE_ADDR_LEN: usize = 7;

// ============================================================================
// Serial Communication
// ============================================================================

/// Baud rate for serial DFU links.
pub const DFU_BAUD_RATE: u32 = 115_200;

/// Read timeout for a single serial poll.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Largest SLIP frame accepted before the decoder gives up on it.
pub const MAX_SLIP_FRAME_SIZE: usize = 2 * DATA_OBJECT_MAX_SIZE as usize;

// ============================================================================
// SLIP Protocol Constants
// ============================================================================

/// SLIP frame delimiter (END byte).
pub const SLIP_END: u8 = 0xC0;

/// SLIP escape byte.
pub const SLIP_ESC: u8 = 0xDB;

/// SLIP escaped END (0xC0 encoded as 0xDB 0xDC).
pub const SLIP_ESC_END: u8 = 0xDC;

/// SLIP escaped ESC (0xDB encoded as 0xDB 0xDD).
pub const SLIP_ESC_ESC: u8 = 0xDD;

// ============================================================================
// Control Point Opcodes
// ============================================================================

/// Control point op-codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Create an object of a given type and size
    Create = 0x01,
    /// Configure packet receipt notifications
    SetReceiptNotification = 0x02,
    /// Report offset and CRC of the current object
    CalculateCrc = 0x03,
    /// Execute the current object
    Execute = 0x04,
    /// Select an object type and report its state
    Select = 0x06,
    /// Write a payload fragment (serial links)
    Write = 0x08,
    /// Response frame marker
    Response = 0x60,
}

impl OpCode {
    /// Parse an op-code from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(OpCode::Create),
            0x02 => Some(OpCode::SetReceiptNotification),
            0x03 => Some(OpCode::CalculateCrc),
            0x04 => Some(OpCode::Execute),
            0x06 => Some(OpCode::Select),
            0x08 => Some(OpCode::Write),
            0x60 => Some(OpCode::Response),
            _ => None,
        }
    }
}

/// Object types carried by Select and Create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    Command = 0x01,
    Data = 0x02,
}

impl ObjectType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(ObjectType::Command),
            0x02 => Some(ObjectType::Data),
            _ => None,
        }
    }

    /// Capacity reported by Select for this object type.
    pub fn max_size(self) -> u32 {
        match self {
            ObjectType::Command => INIT_COMMAND_MAX_SIZE,
            ObjectType::Data => DATA_OBJECT_MAX_SIZE,
        }
    }
}

// ============================================================================
// Runtime Configuration
// ============================================================================

/// Whether updates land beside the running application or over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum BankLayout {
    /// Overwrite the application in place. No rollback.
    #[default]
    Single,
    /// Stage the new image behind the current one.
    Dual,
}

impl BankLayout {
    pub fn as_u32(self) -> u32 {
        match self {
            BankLayout::Single => 0,
            BankLayout::Dual => 1,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        if value == 1 {
            BankLayout::Dual
        } else {
            BankLayout::Single
        }
    }
}

/// Addresses of the regions the core manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlashLayout {
    pub page_size: u32,
    /// First byte of bank 0.
    pub app_start: u32,
    /// End of the region available to banks.
    pub bootloader_start: u32,
    pub settings_slot_a: u32,
    pub settings_slot_b: u32,
    /// Total size of the flash device.
    pub flash_size: u32,
}

impl Default for FlashLayout {
    fn default() -> Self {
        // nRF52840 with a 152 KiB soft-device
        Self {
            page_size: CODE_PAGE_SIZE,
            app_start: 0x0002_6000,
            bootloader_start: 0x000F_4000,
            settings_slot_a: 0x000F_F000,
            settings_slot_b: 0x000F_E000,
            flash_size: 0x0010_0000,
        }
    }
}

impl FlashLayout {
    /// Bytes available to firmware banks.
    pub fn bank_region_size(&self) -> u32 {
        self.bootloader_start.saturating_sub(self.app_start)
    }

    /// Round `value` up to a whole number of pages.
    pub fn align_up(&self, value: u32) -> u32 {
        value.div_ceil(self.page_size) * self.page_size
    }

    /// Pages one settings slot occupies.
    pub fn settings_pages(&self) -> u32 {
        self.align_up(RECORD_SIZE as u32) / self.page_size
    }

    fn settings_footprint(&self) -> u32 {
        self.settings_pages() * self.page_size
    }

    /// Check the layout is usable before any flash is touched.
    pub fn validate(&self) -> DfuResult<()> {
        let invalid = |reason: &str| DfuError::InvalidConfig {
            reason: reason.to_string(),
        };

        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(invalid("page size must be a power of two"));
        }
        for (name, addr) in [
            ("appStart", self.app_start),
            ("bootloaderStart", self.bootloader_start),
            ("settingsSlotA", self.settings_slot_a),
            ("settingsSlotB", self.settings_slot_b),
        ] {
            if addr % self.page_size != 0 {
                return Err(invalid(&format!("{} 0x{:08X} is not page aligned", name, addr)));
            }
            if addr >= self.flash_size {
                return Err(invalid(&format!("{} 0x{:08X} is outside flash", name, addr)));
            }
        }
        // Data objects are erased in CODE_PAGE_SIZE steps.
        if CODE_PAGE_SIZE % self.page_size != 0 {
            return Err(invalid(&format!(
                "page size 0x{:X} does not divide the data object size 0x{:X}",
                self.page_size, CODE_PAGE_SIZE
            )));
        }
        if self.app_start >= self.bootloader_start {
            return Err(invalid("application region must start below the bootloader"));
        }
        let footprint = u64::from(self.settings_footprint());
        if u64::from(self.settings_slot_a.abs_diff(self.settings_slot_b)) < footprint {
            return Err(invalid("settings slots must not overlap"));
        }
        for slot in [self.settings_slot_a, self.settings_slot_b] {
            let end = u64::from(slot) + footprint;
            if end > u64::from(self.flash_size) {
                return Err(invalid(&format!("settings slot 0x{:08X} runs past the end of flash", slot)));
            }
            if end > u64::from(self.app_start) && slot < self.bootloader_start {
                return Err(invalid("settings slot overlaps the bank region"));
            }
        }
        Ok(())
    }
}

/// Device configuration consumed by the request handler.
///
/// Loaded from a JSON file; missing fields fall back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DfuConfig {
    /// Hardware version an init command must name.
    pub hw_version: u32,
    /// FWID of the installed soft-device, if the device carries one.
    pub softdevice_fwid: Option<u32>,
    pub bank_layout: BankLayout,
    pub flash: FlashLayout,
    /// Largest accepted write fragment.
    pub max_fragment_size: u32,
    /// Committed data bytes between mid-object progress flushes. 0 disables.
    pub progress_flush_interval: u32,
    pub require_signed_command: bool,
    pub allow_debug_packages: bool,
    pub max_bootloader_size: u32,
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self {
            hw_version: 52,
            softdevice_fwid: None,
            bank_layout: BankLayout::Single,
            flash: FlashLayout::default(),
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            progress_flush_interval: 1024,
            require_signed_command: false,
            allow_debug_packages: false,
            max_bootloader_size: 0x0000_A000,
        }
    }
}

impl DfuConfig {
    /// Load configuration from disk, returning defaults if the file doesn't exist.
    pub fn load(path: &Path) -> DfuResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;

        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: DfuConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk.
    pub fn save(&self, path: &Path) -> DfuResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> DfuResult<()> {
        self.flash.validate()?;
        if self.max_fragment_size == 0 {
            return Err(DfuError::InvalidConfig {
                reason: "maxFragmentSize must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}
