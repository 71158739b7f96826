//! Persistent DFU settings.
//!
//! The [`SettingsRecord`] is the durable root of an update: bank state,
//! versions, transfer progress and the accepted init command. It is kept in
//! two flash slots. Every write goes to the slot that is *not* canonical, and
//! the canonical slot only changes once that write has completed, so a power
//! loss mid-write always leaves the previous copy readable.
//!
//! ## Slot format
//!
//! All integers little-endian, [`RECORD_SIZE`] bytes:
//!
//! | Offset | Field |
//! |---|---|
//! | 0 | version |
//! | 4 | crc (CRC-32 of bytes 8..) |
//! | 8 | generation |
//! | 12 | bank_current, bank_layout, bootloader_version, app_version, sd_size |
//! | 32 | transport_activated, ext_error |
//! | 40 | bank_0, bank_1 (code, crc, size) |
//! | 64 | progress (10 words) |
//! | 104 | init command length + 256 bytes |
//! | 364 | shared data (crc, peer data, advertising name, radio address) |

use tracing::{debug, info, warn};

use super::bank::{BankCode, BankRecord};
use super::checksum::crc32;
use super::config::{
    BankLayout, FlashLayout, ADV_NAME_MAX_LEN, BLE_ADDR_LEN, INIT_COMMAND_MAX_SIZE, PEER_DATA_SIZE,
    SETTINGS_VERSION,
};
use super::error::{DfuError, DfuResult};
use super::flash::{FlashDriver, FlashQueue, FlashTag, Slot, ERASED_BYTE};
use super::rescode::ExtError;

const SHARED_DATA_SIZE: usize = 4 + PEER_DATA_SIZE + 1 + ADV_NAME_MAX_LEN + BLE_ADDR_LEN;

/// Serialized size of one settings slot.
pub const RECORD_SIZE: usize = 40 + 24 + 40 + 4 + INIT_COMMAND_MAX_SIZE as usize + SHARED_DATA_SIZE;

/// Offset of the first byte covered by the record CRC.
const CRC_START: usize = 8;

/// Snapshot of an in-flight update.
///
/// The `_last` fields only move when a Data object is executed, and the
/// current offset/crc only move when a flash write has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub command_size: u32,
    pub command_offset: u32,
    pub command_crc: u32,
    /// Size of the open Data object, 0 when none is open.
    pub data_object_size: u32,
    pub firmware_image_crc: u32,
    pub firmware_image_crc_last: u32,
    pub firmware_image_offset: u32,
    pub firmware_image_offset_last: u32,
    /// Where the image being received starts in flash.
    pub image_start_address: u32,
    /// Total size of the image being received.
    pub image_size: u32,
}

impl Progress {
    /// Bytes committed to the open Data object.
    pub fn data_object_offset(&self) -> u32 {
        self.firmware_image_offset
            .saturating_sub(self.firmware_image_offset_last)
    }

    /// Drop the open Data object and return to the last checkpoint.
    pub fn rollback_data_object(&mut self) {
        self.data_object_size = 0;
        self.firmware_image_offset = self.firmware_image_offset_last;
        self.firmware_image_crc = self.firmware_image_crc_last;
    }
}

/// Data shared with the application across the update: bonding info and
/// advertising identity. Guarded by its own CRC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedData {
    pub crc: u32,
    pub peer_data: [u8; PEER_DATA_SIZE],
    pub adv_name: Vec<u8>,
    pub ble_addr: [u8; BLE_ADDR_LEN],
}

impl Default for SharedData {
    fn default() -> Self {
        Self {
            crc: u32::MAX,
            peer_data: [ERASED_BYTE; PEER_DATA_SIZE],
            adv_name: Vec::new(),
            ble_addr: [ERASED_BYTE; BLE_ADDR_LEN],
        }
    }
}

impl SharedData {
    fn covered_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SHARED_DATA_SIZE - 4);
        out.extend_from_slice(&self.peer_data);
        let name_len = self.adv_name.len().min(ADV_NAME_MAX_LEN);
        out.push(name_len as u8);
        let mut name = [0u8; ADV_NAME_MAX_LEN];
        name[..name_len].copy_from_slice(&self.adv_name[..name_len]);
        out.extend_from_slice(&name);
        out.extend_from_slice(&self.ble_addr);
        out
    }

    /// Build a valid shared data block.
    pub fn new(peer_data: &[u8], adv_name: &str, ble_addr: [u8; BLE_ADDR_LEN]) -> Self {
        let mut peer = [0u8; PEER_DATA_SIZE];
        let peer_len = peer_data.len().min(PEER_DATA_SIZE);
        peer[..peer_len].copy_from_slice(&peer_data[..peer_len]);

        let name = adv_name.as_bytes();
        let mut shared = Self {
            crc: 0,
            peer_data: peer,
            adv_name: name[..name.len().min(ADV_NAME_MAX_LEN)].to_vec(),
            ble_addr,
        };
        shared.crc = crc32(&shared.covered_bytes());
        shared
    }

    pub fn is_valid(&self) -> bool {
        self.crc == crc32(&self.covered_bytes())
    }
}

/// The durable root of the DFU state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsRecord {
    pub settings_version: u32,
    pub crc: u32,
    /// Incremented on every persisted write. Picks the newer slot at boot.
    pub generation: u32,
    /// Index of the bank the current (or last) update targets.
    pub bank_current: u32,
    pub bank_layout: BankLayout,
    pub bootloader_version: u32,
    pub app_version: u32,
    pub sd_size: u32,
    pub transport_activated: bool,
    /// Last init command validation failure.
    pub ext_error: ExtError,
    pub bank_0: BankRecord,
    pub bank_1: BankRecord,
    pub progress: Progress,
    /// Raw init command bytes.
    pub init_command: Vec<u8>,
    pub shared: SharedData,
}

impl Default for SettingsRecord {
    fn default() -> Self {
        Self {
            settings_version: SETTINGS_VERSION,
            crc: 0,
            generation: 0,
            bank_current: 0,
            bank_layout: BankLayout::Single,
            bootloader_version: 0,
            app_version: 0,
            sd_size: 0,
            transport_activated: false,
            ext_error: ExtError::NoError,
            bank_0: BankRecord::default(),
            bank_1: BankRecord::default(),
            progress: Progress::default(),
            init_command: Vec::new(),
            shared: SharedData::default(),
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.array())
    }

    fn u8(&mut self) -> u8 {
        self.array::<1>()[0]
    }

    fn bank(&mut self) -> BankRecord {
        BankRecord {
            code: BankCode::from_u32(self.u32()),
            image_crc: self.u32(),
            image_size: self.u32(),
        }
    }
}

fn put_bank(out: &mut Vec<u8>, bank: &BankRecord) {
    out.extend_from_slice(&(bank.code as u32).to_le_bytes());
    out.extend_from_slice(&bank.image_crc.to_le_bytes());
    out.extend_from_slice(&bank.image_size.to_le_bytes());
}

impl SettingsRecord {
    /// Serialize into slot format with a fresh CRC.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_SIZE);
        let words = [
            SETTINGS_VERSION,
            0, // crc, patched below
            self.generation,
            self.bank_current,
            self.bank_layout.as_u32(),
            self.bootloader_version,
            self.app_version,
            self.sd_size,
            u32::from(self.transport_activated),
            self.ext_error as u32,
        ];
        for word in words {
            out.extend_from_slice(&word.to_le_bytes());
        }

        put_bank(&mut out, &self.bank_0);
        put_bank(&mut out, &self.bank_1);

        let p = &self.progress;
        for word in [
            p.command_size,
            p.command_offset,
            p.command_crc,
            p.data_object_size,
            p.firmware_image_crc,
            p.firmware_image_crc_last,
            p.firmware_image_offset,
            p.firmware_image_offset_last,
            p.image_start_address,
            p.image_size,
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }

        let cmd_len = self.init_command.len().min(INIT_COMMAND_MAX_SIZE as usize);
        out.extend_from_slice(&(cmd_len as u32).to_le_bytes());
        let mut cmd = [ERASED_BYTE; INIT_COMMAND_MAX_SIZE as usize];
        cmd[..cmd_len].copy_from_slice(&self.init_command[..cmd_len]);
        out.extend_from_slice(&cmd);

        out.extend_from_slice(&self.shared.crc.to_le_bytes());
        out.extend_from_slice(&self.shared.covered_bytes());

        let crc = crc32(&out[CRC_START..]);
        out[4..8].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parse a slot. Blank, foreign-version and CRC-mismatched slots are errors.
    pub fn decode(data: &[u8]) -> DfuResult<Self> {
        if data.len() < RECORD_SIZE {
            return Err(DfuError::SettingsErased);
        }
        let data = &data[..RECORD_SIZE];
        if data.iter().all(|&b| b == ERASED_BYTE) {
            return Err(DfuError::SettingsErased);
        }

        let mut r = Reader { data, pos: 0 };
        let version = r.u32();
        if version != SETTINGS_VERSION {
            return Err(DfuError::SettingsVersion { found: version });
        }
        let stored_crc = r.u32();
        let computed = crc32(&data[CRC_START..]);
        if stored_crc != computed {
            return Err(DfuError::SettingsCrcMismatch {
                expected: stored_crc,
                actual: computed,
            });
        }

        let generation = r.u32();
        let bank_current = r.u32();
        let bank_layout = BankLayout::from_u32(r.u32());
        let bootloader_version = r.u32();
        let app_version = r.u32();
        let sd_size = r.u32();
        let transport_activated = r.u32() != 0;
        let ext_error = ExtError::from_u32(r.u32());
        let bank_0 = r.bank();
        let bank_1 = r.bank();
        let progress = Progress {
            command_size: r.u32(),
            command_offset: r.u32(),
            command_crc: r.u32(),
            data_object_size: r.u32(),
            firmware_image_crc: r.u32(),
            firmware_image_crc_last: r.u32(),
            firmware_image_offset: r.u32(),
            firmware_image_offset_last: r.u32(),
            image_start_address: r.u32(),
            image_size: r.u32(),
        };

        let cmd_len = (r.u32() as usize).min(INIT_COMMAND_MAX_SIZE as usize);
        let cmd: [u8; INIT_COMMAND_MAX_SIZE as usize] = r.array();

        let shared_crc = r.u32();
        let peer_data = r.array();
        let name_len = usize::from(r.u8()).min(ADV_NAME_MAX_LEN);
        let name: [u8; ADV_NAME_MAX_LEN] = r.array();
        let ble_addr = r.array();

        Ok(Self {
            settings_version: version,
            crc: stored_crc,
            generation,
            bank_current,
            bank_layout,
            bootloader_version,
            app_version,
            sd_size,
            transport_activated,
            ext_error,
            bank_0,
            bank_1,
            progress,
            init_command: cmd[..cmd_len].to_vec(),
            shared: SharedData {
                crc: shared_crc,
                peer_data,
                adv_name: name[..name_len].to_vec(),
                ble_addr,
            },
        })
    }
}

/// Generation order with wraparound: `a` is newer if it is less than half
/// the counter space ahead of `b`.
fn is_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Dual-slot store for the [`SettingsRecord`].
#[derive(Debug)]
pub struct SettingsStore {
    record: SettingsRecord,
    slot_a: u32,
    slot_b: u32,
    /// Pages erased per slot write.
    slot_pages: u32,
    /// Slot holding the canonical persisted copy.
    active: Option<Slot>,
    in_flight: Option<Slot>,
    in_flight_failed: bool,
    /// A write was requested while another was in flight.
    dirty: bool,
}

impl SettingsStore {
    /// Load the newest valid slot, or start from a fresh record.
    ///
    /// Newer generation wins; equal generations prefer slot A.
    pub fn init<F: FlashDriver>(
        flash: &mut FlashQueue<F>,
        layout: &FlashLayout,
        bank_layout: BankLayout,
    ) -> Self {
        let load = |flash: &mut FlashQueue<F>, slot: Slot, address: u32| {
            let mut buf = vec![0u8; RECORD_SIZE];
            let result = flash
                .read(address, &mut buf)
                .and_then(|_| SettingsRecord::decode(&buf));
            match result {
                Ok(record) => Some(record),
                Err(DfuError::SettingsErased) => {
                    debug!(?slot, "settings slot is blank");
                    None
                }
                Err(e) => {
                    warn!(?slot, address, error = %e, "rejecting settings slot");
                    None
                }
            }
        };

        let a = load(flash, Slot::A, layout.settings_slot_a);
        let b = load(flash, Slot::B, layout.settings_slot_b);

        let (record, active) = match (a, b) {
            (Some(a), Some(b)) if is_newer(b.generation, a.generation) => (b, Some(Slot::B)),
            (Some(a), _) => (a, Some(Slot::A)),
            (None, Some(b)) => (b, Some(Slot::B)),
            (None, None) => {
                info!("no valid settings found, starting fresh");
                (SettingsRecord::default(), None)
            }
        };

        if let Some(slot) = active {
            info!(?slot, generation = record.generation, "loaded settings");
        }

        let mut record = record;
        record.bank_layout = bank_layout;

        Self {
            record,
            slot_a: layout.settings_slot_a,
            slot_b: layout.settings_slot_b,
            slot_pages: layout.settings_pages(),
            active,
            in_flight: None,
            in_flight_failed: false,
            dirty: false,
        }
    }

    pub fn record(&self) -> &SettingsRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut SettingsRecord {
        &mut self.record
    }

    pub fn active_slot(&self) -> Option<Slot> {
        self.active
    }

    /// A write has been issued and has not completed yet.
    pub fn is_writing(&self) -> bool {
        self.in_flight.is_some() || self.dirty
    }

    fn slot_address(&self, slot: Slot) -> u32 {
        match slot {
            Slot::A => self.slot_a,
            Slot::B => self.slot_b,
        }
    }

    /// Persist the in-memory record to the non-canonical slot.
    ///
    /// Durable only once [`SettingsStore::on_flash_complete`] sees the write
    /// finish. A call while a write is in flight is folded into one follow-up
    /// write.
    pub fn write<F: FlashDriver>(&mut self, flash: &mut FlashQueue<F>) -> DfuResult<()> {
        if self.in_flight.is_some() {
            self.dirty = true;
            return Ok(());
        }

        let target = self.active.map_or(Slot::A, Slot::other);
        let address = self.slot_address(target);

        self.record.generation = self.record.generation.wrapping_add(1);
        self.record.settings_version = SETTINGS_VERSION;
        let bytes = self.record.encode();
        self.record.crc = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        flash.erase(address, self.slot_pages, FlashTag::SettingsErase(target))?;
        flash.write(address, bytes, FlashTag::SettingsWrite(target))?;

        debug!(?target, generation = self.record.generation, "settings write issued");
        self.in_flight = Some(target);
        self.in_flight_failed = false;
        self.dirty = false;
        Ok(())
    }

    /// Feed a settings completion back. Returns true once no write is outstanding.
    pub fn on_flash_complete<F: FlashDriver>(
        &mut self,
        tag: FlashTag,
        result: &DfuResult<()>,
        flash: &mut FlashQueue<F>,
    ) -> bool {
        match tag {
            FlashTag::SettingsErase(_) => {
                if result.is_err() {
                    self.in_flight_failed = true;
                }
                return false;
            }
            FlashTag::SettingsWrite(slot) => {
                if result.is_ok() && !self.in_flight_failed {
                    debug!(?slot, generation = self.record.generation, "settings persisted");
                    self.active = Some(slot);
                } else {
                    warn!(?slot, "settings write failed, keeping previous slot");
                }
                self.in_flight = None;
                self.in_flight_failed = false;
            }
            _ => return !self.is_writing(),
        }

        if self.dirty {
            self.dirty = false;
            if let Err(e) = self.write(flash) {
                warn!(error = %e, "could not issue follow-up settings write");
            }
        }

        !self.is_writing()
    }

    /// Shared data block, if its CRC is intact.
    pub fn shared_data(&self) -> Option<&SharedData> {
        Some(&self.record.shared).filter(|s| s.is_valid())
    }

    pub fn shared_data_is_valid(&self) -> bool {
        self.record.shared.is_valid()
    }

    /// Bonding data handed over by the application.
    pub fn peer_data(&self) -> Option<&[u8; PEER_DATA_SIZE]> {
        self.shared_data().map(|s| &s.peer_data)
    }

    /// Advertising name handed over by the application.
    pub fn adv_name(&self) -> Option<&[u8]> {
        self.shared_data().map(|s| s.adv_name.as_slice())
    }

    pub fn set_shared_data(&mut self, shared: SharedData) {
        self.record.shared = shared;
    }

    /// Blank the shared data block. Takes effect on the next write.
    pub fn erase_shared_data(&mut self) {
        self.record.shared = SharedData::default();
    }
}
