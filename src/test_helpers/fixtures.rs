use sha2::{Digest, Sha256};

use crate::dfu::checksum::crc32;
use crate::dfu::config::{DfuConfig, FlashLayout, ObjectType};
use crate::dfu::flash::MemFlash;
use crate::dfu::handler::RequestHandler;
use crate::dfu::init_command::{HashType, INIT_OP_CODE};
use crate::dfu::request::{Request, Response};
use crate::traits::NoKeyVerifier;

/// Small device: 64 KiB of banks between 0x1000 and 0x11000, then the two
/// settings pages.
pub fn test_layout() -> FlashLayout {
    FlashLayout {
        page_size: 0x1000,
        app_start: 0x1000,
        bootloader_start: 0x11000,
        settings_slot_a: 0x12000,
        settings_slot_b: 0x13000,
        flash_size: 0x14000,
    }
}

pub fn test_config() -> DfuConfig {
    DfuConfig {
        flash: test_layout(),
        max_bootloader_size: 0x6000,
        ..DfuConfig::default()
    }
}

/// Deterministic, non-repeating-looking image content.
pub fn image_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

// ============================================================================
// Init command encoding
// ============================================================================

fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn put_uint(out: &mut Vec<u8>, field: u64, value: u32) {
    put_varint(out, field << 3);
    put_varint(out, u64::from(value));
}

fn put_bytes(out: &mut Vec<u8>, field: u64, bytes: &[u8]) {
    put_varint(out, (field << 3) | 2);
    put_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// Builder for encoded init command packets.
pub struct InitCommandBuilder {
    op_code: u32,
    fw_type: u32,
    fw_version: Option<u32>,
    hw_version: Option<u32>,
    sd_req: Vec<u32>,
    sd_size: Option<u32>,
    bl_size: Option<u32>,
    app_size: Option<u32>,
    hash: Option<(u32, Vec<u8>)>,
    is_debug: bool,
    signature: Option<(u32, Vec<u8>)>,
}

impl InitCommandBuilder {
    fn new(fw_type: u32) -> Self {
        Self {
            op_code: INIT_OP_CODE,
            fw_type,
            fw_version: Some(1),
            hw_version: Some(test_config().hw_version),
            sd_req: Vec::new(),
            sd_size: None,
            bl_size: None,
            app_size: None,
            hash: Some((HashType::Sha256 as u32, vec![0; 32])),
            is_debug: false,
            signature: None,
        }
    }

    pub fn application(size: u32) -> Self {
        let mut builder = Self::new(0);
        builder.app_size = Some(size);
        builder
    }

    pub fn softdevice(size: u32) -> Self {
        let mut builder = Self::new(1);
        builder.sd_size = Some(size);
        builder
    }

    pub fn op_code(mut self, op_code: u32) -> Self {
        self.op_code = op_code;
        self
    }

    pub fn fw_type(mut self, fw_type: u32) -> Self {
        self.fw_type = fw_type;
        self
    }

    pub fn fw_version(mut self, version: u32) -> Self {
        self.fw_version = Some(version);
        self
    }

    pub fn hw_version(mut self, version: u32) -> Self {
        self.hw_version = Some(version);
        self
    }

    pub fn no_hw_version(mut self) -> Self {
        self.hw_version = None;
        self
    }

    pub fn sd_req(mut self, fwids: &[u32]) -> Self {
        self.sd_req = fwids.to_vec();
        self
    }

    pub fn hash(mut self, hash_type: u32, hash: Vec<u8>) -> Self {
        self.hash = Some((hash_type, hash));
        self
    }

    pub fn no_hash(mut self) -> Self {
        self.hash = None;
        self
    }

    /// SHA-256 of `image`.
    pub fn image(self, image: &[u8]) -> Self {
        let digest = Sha256::digest(image).to_vec();
        self.hash(HashType::Sha256 as u32, digest)
    }

    /// CRC-32 of `image`.
    pub fn crc_of(self, image: &[u8]) -> Self {
        let crc = crc32(image).to_le_bytes().to_vec();
        self.hash(HashType::Crc as u32, crc)
    }

    pub fn debug(mut self) -> Self {
        self.is_debug = true;
        self
    }

    pub fn signed(mut self, signature_type: u32, signature: Vec<u8>) -> Self {
        self.signature = Some((signature_type, signature));
        self
    }

    fn encode_init(&self) -> Vec<u8> {
        let mut init = Vec::new();
        if let Some(v) = self.fw_version {
            put_uint(&mut init, 1, v);
        }
        if let Some(v) = self.hw_version {
            put_uint(&mut init, 2, v);
        }
        if !self.sd_req.is_empty() {
            let mut packed = Vec::new();
            for fwid in &self.sd_req {
                put_varint(&mut packed, u64::from(*fwid));
            }
            put_bytes(&mut init, 3, &packed);
        }
        put_uint(&mut init, 4, self.fw_type);
        for (field, size) in [(5, self.sd_size), (6, self.bl_size), (7, self.app_size)] {
            if let Some(size) = size {
                put_uint(&mut init, field, size);
            }
        }
        if let Some((hash_type, hash)) = &self.hash {
            let mut msg = Vec::new();
            put_uint(&mut msg, 1, *hash_type);
            put_bytes(&mut msg, 2, hash);
            put_bytes(&mut init, 8, &msg);
        }
        if self.is_debug {
            put_uint(&mut init, 9, 1);
        }
        init
    }

    pub fn build(self) -> Vec<u8> {
        let mut command = Vec::new();
        put_uint(&mut command, 1, self.op_code);
        put_bytes(&mut command, 2, &self.encode_init());

        let mut packet = Vec::new();
        match &self.signature {
            Some((signature_type, signature)) => {
                let mut signed = Vec::new();
                put_bytes(&mut signed, 1, &command);
                put_uint(&mut signed, 2, *signature_type);
                put_bytes(&mut signed, 3, signature);
                put_bytes(&mut packet, 2, &signed);
            }
            None => put_bytes(&mut packet, 1, &command),
        }
        packet
    }

    /// Build, then pad to exactly `len` bytes with an unknown outer field.
    pub fn build_padded(self, len: usize) -> Vec<u8> {
        let mut packet = self.build();
        let filler = len
            .checked_sub(packet.len() + 2)
            .filter(|n| *n < 0x80)
            .expect("padding must fit a one-byte length");
        put_bytes(&mut packet, 15, &vec![0u8; filler]);
        assert_eq!(packet.len(), len);
        packet
    }
}

// ============================================================================
// Handler driver
// ============================================================================

/// Request handler over RAM flash, driven the way a transport would.
pub struct HandlerFixture {
    pub handler: RequestHandler<MemFlash, NoKeyVerifier>,
}

impl HandlerFixture {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: DfuConfig) -> Self {
        let flash = MemFlash::new(config.flash.flash_size, config.flash.page_size);
        Self::from_flash(config, flash)
    }

    /// Boot a handler on an existing flash image.
    pub fn from_flash(config: DfuConfig, flash: MemFlash) -> Self {
        Self {
            handler: RequestHandler::new(config, flash, NoKeyVerifier)
                .expect("Failed to create handler"),
        }
    }

    /// Handle a request without touching the flash queue.
    pub fn request(&mut self, request: Request) -> Response {
        self.handler.handle(request)
    }

    /// Handle a request, then let every queued flash operation finish.
    pub fn send(&mut self, request: Request) -> Response {
        let response = self.handler.handle(request);
        self.handler.run_flash();
        response
    }

    /// Transfer and execute an init command. Returns the Execute response.
    pub fn send_init(&mut self, init: &[u8]) -> Response {
        let command = ObjectType::Command as u8;
        self.send(Request::Select {
            object_type: command,
        });
        let created = self.send(Request::Create {
            object_type: command,
            size: init.len() as u32,
        });
        assert!(created.is_success(), "create command: {:?}", created);
        for chunk in init.chunks(64) {
            let written = self.send(Request::Write {
                data: chunk.to_vec(),
            });
            assert!(written.is_success(), "write command: {:?}", written);
        }
        self.send(Request::Execute)
    }

    /// Transfer `image` in Data objects, `fragment` bytes per write.
    /// Returns the first failing response or the last Execute response.
    pub fn send_image(&mut self, image: &[u8], fragment: usize) -> Response {
        let data = ObjectType::Data as u8;
        let selected = self.send(Request::Select { object_type: data });
        if !selected.is_success() {
            return selected;
        }

        let mut last = selected;
        for object in image.chunks(ObjectType::Data.max_size() as usize) {
            let created = self.send(Request::Create {
                object_type: data,
                size: object.len() as u32,
            });
            if !created.is_success() {
                return created;
            }
            for chunk in object.chunks(fragment) {
                let written = self.send(Request::Write {
                    data: chunk.to_vec(),
                });
                if !written.is_success() {
                    return written;
                }
            }
            last = self.send(Request::Execute);
            if !last.is_success() {
                return last;
            }
        }
        last
    }

    pub fn into_flash(self) -> MemFlash {
        self.handler.into_flash()
    }
}

impl Default for HandlerFixture {
    fn default() -> Self {
        Self::new()
    }
}
