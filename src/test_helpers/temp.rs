use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::dfu::config::FlashLayout;
use crate::dfu::flash::FileFlash;

const CONFIG_FILE: &str = "dfu.json";
const FLASH_FILE: &str = "flash.bin";

/// Scratch directory holding a device config file and a flash image.
/// Removed when dropped.
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Path of the config file. It does not exist until written.
    pub fn config_path(&self) -> PathBuf {
        self.root().join(CONFIG_FILE)
    }

    /// Write raw config text and return its path.
    pub fn write_config(&self, contents: &str) -> PathBuf {
        let path = self.config_path();
        fs::write(&path, contents).expect("Failed to write config");
        path
    }

    pub fn flash_path(&self) -> PathBuf {
        self.root().join(FLASH_FILE)
    }

    /// Open (or reopen) the file-backed flash sized for `layout`.
    pub fn open_flash(&self, layout: &FlashLayout) -> FileFlash {
        FileFlash::open(&self.flash_path(), layout.flash_size, layout.page_size)
            .expect("Failed to open flash image")
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
