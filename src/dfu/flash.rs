//! Flash access for the DFU core.
//!
//! [`FlashDriver`] is the synchronous device contract: page erase, NOR-style
//! program (bits only go from 1 to 0) and read. [`FlashQueue`] turns it into
//! the asynchronous primitive the request handler consumes: operations are
//! queued with a [`FlashTag`] and completions come back one at a time, in
//! issue order, from [`FlashQueue::process_next`].

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, error, trace};

use super::error::{DfuError, DfuResult};

/// Value of an erased flash byte.
pub const ERASED_BYTE: u8 = 0xFF;

/// Synchronous flash device.
pub trait FlashDriver {
    /// Erase granularity in bytes.
    fn page_size(&self) -> u32;

    /// Total device size in bytes.
    fn size(&self) -> u32;

    /// Erase the page starting at `address`.
    fn erase_page(&mut self, address: u32) -> DfuResult<()>;

    /// Program `data` at `address`.
    fn write(&mut self, address: u32, data: &[u8]) -> DfuResult<()>;

    /// Read `buf.len()` bytes from `address`.
    fn read(&mut self, address: u32, buf: &mut [u8]) -> DfuResult<()>;
}

fn check_bounds(size: u32, address: u32, len: usize) -> DfuResult<()> {
    let end = u64::from(address) + len as u64;
    if end > u64::from(size) {
        return Err(DfuError::FlashOutOfBounds { address, len });
    }
    Ok(())
}

fn check_page(page_size: u32, size: u32, address: u32) -> DfuResult<()> {
    if address % page_size != 0 {
        return Err(DfuError::FlashMisaligned { address });
    }
    check_bounds(size, address, page_size as usize)
}

// ============================================================================
// In-memory flash
// ============================================================================

/// RAM-backed flash used for host builds and tests.
#[derive(Debug, Clone)]
pub struct MemFlash {
    data: Vec<u8>,
    page_size: u32,
    fail_at: Option<u32>,
}

impl MemFlash {
    /// Create a fully erased device.
    pub fn new(size: u32, page_size: u32) -> Self {
        Self {
            data: vec![ERASED_BYTE; size as usize],
            page_size,
            fail_at: None,
        }
    }

    /// Make every erase or write touching `address` fail.
    pub fn fail_at(&mut self, address: Option<u32>) {
        self.fail_at = address;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn check_fault(&self, address: u32, len: usize) -> DfuResult<()> {
        match self.fail_at {
            Some(bad) if bad >= address && u64::from(bad) < u64::from(address) + len as u64 => {
                Err(DfuError::FlashFailed {
                    address,
                    reason: "injected fault".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl FlashDriver for MemFlash {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn erase_page(&mut self, address: u32) -> DfuResult<()> {
        check_page(self.page_size, self.size(), address)?;
        self.check_fault(address, self.page_size as usize)?;
        let start = address as usize;
        self.data[start..start + self.page_size as usize].fill(ERASED_BYTE);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> DfuResult<()> {
        check_bounds(self.size(), address, data.len())?;
        self.check_fault(address, data.len())?;
        let start = address as usize;
        for (cell, byte) in self.data[start..start + data.len()].iter_mut().zip(data) {
            *cell &= *byte;
        }
        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> DfuResult<()> {
        check_bounds(self.size(), address, buf.len())?;
        let start = address as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }
}

// ============================================================================
// File-backed flash
// ============================================================================

/// Flash image kept in a file, so state survives across process runs.
#[derive(Debug)]
pub struct FileFlash {
    file: File,
    size: u32,
    page_size: u32,
}

impl FileFlash {
    /// Open an image file, creating an erased one of `size` bytes if missing.
    pub fn open(path: &Path, size: u32, page_size: u32) -> DfuResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let current = file.metadata()?.len();
        if current < u64::from(size) {
            debug!(path = %path.display(), size, "extending flash image");
            file.seek(SeekFrom::Start(current))?;
            let padding = vec![ERASED_BYTE; (u64::from(size) - current) as usize];
            file.write_all(&padding)?;
            file.flush()?;
        }

        Ok(Self {
            file,
            size,
            page_size,
        })
    }
}

impl FlashDriver for FileFlash {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn erase_page(&mut self, address: u32) -> DfuResult<()> {
        check_page(self.page_size, self.size, address)?;
        self.file.seek(SeekFrom::Start(u64::from(address)))?;
        self.file
            .write_all(&vec![ERASED_BYTE; self.page_size as usize])?;
        self.file.flush()?;
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> DfuResult<()> {
        check_bounds(self.size, address, data.len())?;
        let mut current = vec![0u8; data.len()];
        self.file.seek(SeekFrom::Start(u64::from(address)))?;
        self.file.read_exact(&mut current)?;
        for (cell, byte) in current.iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.file.seek(SeekFrom::Start(u64::from(address)))?;
        self.file.write_all(&current)?;
        self.file.flush()?;
        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> DfuResult<()> {
        check_bounds(self.size, address, buf.len())?;
        self.file.seek(SeekFrom::Start(u64::from(address)))?;
        self.file.read_exact(buf)?;
        Ok(())
    }
}

// ============================================================================
// Asynchronous queue
// ============================================================================

/// Settings slot identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }
}

/// What a queued operation was issued for. Returned with its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashTag {
    /// Erase ahead of a data object.
    DataErase,
    /// Data fragment; `crc` is the image CRC once these `len` bytes land.
    DataWrite { len: u32, crc: u32 },
    SettingsErase(Slot),
    SettingsWrite(Slot),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOp {
    Erase { address: u32, pages: u32 },
    Write { address: u32, data: Vec<u8> },
}

/// Result of one queued operation.
#[derive(Debug)]
pub struct FlashCompletion {
    pub tag: FlashTag,
    pub result: DfuResult<()>,
}

/// Queue of pending flash operations over a [`FlashDriver`].
#[derive(Debug)]
pub struct FlashQueue<F> {
    driver: F,
    pending: VecDeque<(FlashOp, FlashTag)>,
}

impl<F: FlashDriver> FlashQueue<F> {
    pub fn new(driver: F) -> Self {
        Self {
            driver,
            pending: VecDeque::new(),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.driver.page_size()
    }

    /// Queue an erase of `pages` pages starting at `address`.
    pub fn erase(&mut self, address: u32, pages: u32, tag: FlashTag) -> DfuResult<()> {
        let page_size = self.driver.page_size();
        if address % page_size != 0 {
            return Err(DfuError::FlashMisaligned { address });
        }
        check_bounds(
            self.driver.size(),
            address,
            (u64::from(pages) * u64::from(page_size)) as usize,
        )?;
        trace!(address, pages, ?tag, "queue erase");
        self.pending
            .push_back((FlashOp::Erase { address, pages }, tag));
        Ok(())
    }

    /// Queue a program of `data` at `address`.
    pub fn write(&mut self, address: u32, data: Vec<u8>, tag: FlashTag) -> DfuResult<()> {
        check_bounds(self.driver.size(), address, data.len())?;
        trace!(address, len = data.len(), ?tag, "queue write");
        self.pending.push_back((FlashOp::Write { address, data }, tag));
        Ok(())
    }

    /// Synchronous read. Reads see only completed operations.
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> DfuResult<()> {
        self.driver.read(address, buf)
    }

    pub fn is_busy(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Run the oldest queued operation and report its completion.
    pub fn process_next(&mut self) -> Option<FlashCompletion> {
        let (op, tag) = self.pending.pop_front()?;
        let result = match op {
            FlashOp::Erase { address, pages } => {
                let page_size = self.driver.page_size();
                (0..pages).try_for_each(|i| self.driver.erase_page(address + i * page_size))
            }
            FlashOp::Write { address, data } => self.driver.write(address, &data),
        };
        if let Err(e) = &result {
            error!(?tag, error = %e, "flash operation failed");
        }
        Some(FlashCompletion { tag, result })
    }

    /// Drop every queued operation without running it, as a power loss would.
    pub fn discard_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn driver(&self) -> &F {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut F {
        &mut self.driver
    }

    pub fn into_driver(self) -> F {
        self.driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfu::config::FlashLayout;
    use crate::test_helpers::fixtures::test_layout;
    use crate::test_helpers::temp::TestContext;

    #[test]
    fn test_mem_flash_starts_erased() {
        let mut flash = MemFlash::new(0x2000, 0x1000);
        let mut buf = [0u8; 4];
        flash.read(0x1FFC, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 4]);
    }

    #[test]
    fn test_mem_flash_write_only_clears_bits() {
        let mut flash = MemFlash::new(0x1000, 0x1000);
        flash.write(0, &[0x0F]).unwrap();
        flash.write(0, &[0xF3]).unwrap();
        assert_eq!(flash.as_slice()[0], 0x03);

        flash.erase_page(0).unwrap();
        assert_eq!(flash.as_slice()[0], 0xFF);
    }

    #[test]
    fn test_mem_flash_bounds() {
        let mut flash = MemFlash::new(0x1000, 0x1000);
        assert!(matches!(
            flash.write(0x0FFF, &[0, 0]),
            Err(DfuError::FlashOutOfBounds { .. })
        ));
        assert!(matches!(
            flash.erase_page(0x10),
            Err(DfuError::FlashMisaligned { address: 0x10 })
        ));
    }

    #[test]
    fn test_queue_completes_in_issue_order() {
        let mut queue = FlashQueue::new(MemFlash::new(0x3000, 0x1000));
        queue.erase(0x1000, 2, FlashTag::DataErase).unwrap();
        queue
            .write(0x1000, vec![1, 2, 3], FlashTag::DataWrite { len: 3, crc: 7 })
            .unwrap();
        queue
            .write(0x2000, vec![9], FlashTag::SettingsWrite(Slot::B))
            .unwrap();
        assert!(queue.is_busy());
        assert_eq!(queue.pending_len(), 3);

        let tags: Vec<FlashTag> = std::iter::from_fn(|| queue.process_next())
            .map(|c| {
                assert!(c.result.is_ok());
                c.tag
            })
            .collect();

        assert_eq!(
            tags,
            vec![
                FlashTag::DataErase,
                FlashTag::DataWrite { len: 3, crc: 7 },
                FlashTag::SettingsWrite(Slot::B),
            ]
        );
        assert!(!queue.is_busy());
        assert_eq!(&queue.driver().as_slice()[0x1000..0x1003], &[1, 2, 3]);
    }

    #[test]
    fn test_queue_reads_only_see_completed_ops() {
        let mut queue = FlashQueue::new(MemFlash::new(0x1000, 0x1000));
        queue
            .write(0, vec![0x00], FlashTag::DataWrite { len: 1, crc: 0 })
            .unwrap();

        let mut buf = [0u8; 1];
        queue.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xFF]);

        queue.process_next();
        queue.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0x00]);
    }

    #[test]
    fn test_queue_rejects_bad_requests_synchronously() {
        let mut queue = FlashQueue::new(MemFlash::new(0x2000, 0x1000));
        assert!(queue.erase(0x0800, 1, FlashTag::DataErase).is_err());
        assert!(queue.erase(0x1000, 2, FlashTag::DataErase).is_err());
        assert!(queue
            .write(0x1FFF, vec![0, 0], FlashTag::DataErase)
            .is_err());
        assert!(!queue.is_busy());
    }

    #[test]
    fn test_queue_reports_driver_failure() {
        let mut flash = MemFlash::new(0x2000, 0x1000);
        flash.fail_at(Some(0x1004));
        let mut queue = FlashQueue::new(flash);
        queue
            .write(0x1000, vec![0; 8], FlashTag::DataWrite { len: 8, crc: 1 })
            .unwrap();

        let completion = queue.process_next().unwrap();
        assert!(matches!(
            completion.result,
            Err(DfuError::FlashFailed { address: 0x1000, .. })
        ));
    }

    #[test]
    fn test_discard_pending() {
        let mut queue = FlashQueue::new(MemFlash::new(0x1000, 0x1000));
        queue.erase(0, 1, FlashTag::DataErase).unwrap();
        assert_eq!(queue.discard_pending(), 1);
        assert!(queue.process_next().is_none());
    }

    #[test]
    fn test_file_flash_persists_between_opens() {
        let ctx = TestContext::new();
        let layout = FlashLayout {
            flash_size: 0x2000,
            ..test_layout()
        };

        {
            let mut flash = ctx.open_flash(&layout);
            flash.write(0x1000, &[0xAA, 0x55]).unwrap();
        }

        let mut flash = ctx.open_flash(&layout);
        let mut buf = [0u8; 3];
        flash.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0x55, 0xFF]);

        flash.erase_page(0x1000).unwrap();
        flash.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 3]);
        assert_eq!(std::fs::metadata(ctx.flash_path()).unwrap().len(), 0x2000);
    }
}
