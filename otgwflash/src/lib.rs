//! # otgwflash
//!
//! A library for upgrading the PIC firmware of an OpenTherm Gateway.
//!
//! The gateway PIC runs a small bootloader that is driven over the serial
//! line with a byte-stuffed, checksummed command protocol. This crate
//! provides:
//!
//! - A loader for the Intel-HEX style firmware images
//! - The frame codec and command builders of the bootloader protocol
//! - A reactive upgrade engine (erase, write and read-back verify of program
//!   and data memory, with bounded retries and a failsafe patch)
//! - A blocking driver that runs the engine over a serial port
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use otgwflash::{Indicator, MemoryImage, Outcome, Phase};
//!
//! struct Progress;
//!
//! impl Indicator for Progress {
//!     fn progress(&mut self, phase: Phase, pc: u16) {
//!         println!("{phase}: {pc:#06x}");
//!     }
//!
//!     fn finished(&mut self, outcome: Outcome) {
//!         println!("done: {outcome}");
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = MemoryImage::from_file("gateway.hex")?;
//!     println!("{} program words in use", image.used_program_words());
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let config = otgwflash::UpgradeConfig::default();
//!         let mut flasher = otgwflash::Flasher::open("/dev/ttyUSB0", 9600, config)?;
//!         let outcome = flasher.run_image(image, Progress)?;
//!         println!("{outcome}");
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod engine;
pub mod error;
pub mod flasher;
pub mod host;
pub mod image;
pub mod port;
pub mod protocol;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    engine::{
        Engine, Indicator, Outcome, Transport, UpgradeConfig,
        session::{FailsafePatch, Phase, ProtectionBoundary},
    },
    error::{Error, Result},
    flasher::{Flasher, PortTransport},
    host::{BridgeKind, DetectedPort, auto_detect_port, discover_ports, format_port_list},
    image::{FileStore, HexRecord, ImageStore, LoadError, MemoryImage},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{CommandFrame, FrameDecoder, Opcode, Response},
};
