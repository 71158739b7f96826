//! Device side of the Nordic Secure DFU protocol.
//!
//! The host transfers a firmware update as two kinds of objects: one Command
//! object (the init command, describing the image) and a sequence of Data
//! objects (the image itself, in page-sized pieces). Each object is
//! created, written, checked and executed in turn:
//!
//! 1. **Select** the object type and learn how far a previous attempt got
//! 2. **Create** an object of a given size
//! 3. **Write** fragments into it
//! 4. **CalculateCrc** to confirm what arrived
//! 5. **Execute** to validate and commit it
//!
//! Progress is kept in a dual-slot [`SettingsStore`] so a transfer survives a
//! power loss, and the [`BankManager`] decides where images go and which one
//! boots.
//!
//! # Example
//!
//! ```ignore
//! use bluebuzzah_dfu::dfu::{DfuConfig, FileFlash, RequestHandler, SerialTransport, TransportRegistry};
//! use bluebuzzah_dfu::traits::NoKeyVerifier;
//!
//! let config = DfuConfig::load(Path::new("dfu.json"))?;
//! let flash = FileFlash::open(Path::new("flash.bin"), config.flash.flash_size, config.flash.page_size)?;
//! let mut handler = RequestHandler::new(config, flash, NoKeyVerifier)?;
//!
//! let mut registry = TransportRegistry::new();
//! registry.register("serial", Box::new(SerialTransport::open_serial("/dev/ttyACM0")?));
//! registry.init_all(&mut handler)?;
//! while !registry.finish_if_reset(&handler)? {
//!     registry.service(&mut handler)?;
//! }
//! ```

pub mod bank;
pub mod checksum;
pub mod config;
pub mod control_point;
pub mod error;
pub mod flash;
pub mod handler;
pub mod init_command;
pub mod request;
pub mod rescode;
pub mod settings;
pub mod slip;
pub mod transport;

pub use bank::{BankCode, BankId, BankManager, BankRecord, CacheLocation};
pub use config::{BankLayout, DfuConfig, FlashLayout, ObjectType, OpCode};
pub use control_point::ControlPoint;
pub use error::{DfuError, DfuResult};
pub use flash::{FileFlash, FlashDriver, FlashQueue, MemFlash};
pub use handler::{HandlerState, RequestHandler};
pub use init_command::{FwType, HashType, InitCommand, Packet, SignatureType};
pub use request::{Request, Response, ResponsePayload};
pub use rescode::{ExtError, Rejection, ResultCode};
pub use settings::{Progress, SettingsRecord, SettingsStore, SharedData};
pub use transport::{DfuTransport, SerialTransport, SlipTransport, TransportRegistry};
