//! Blocking upgrade driver.
//!
//! [`Flasher`] owns a [`Port`] and pumps it through an [`Engine`]: bytes
//! read from the port are fed to the engine, and the engine's watchdog is
//! serviced between reads. The port's read timeout bounds how late a
//! timeout can be noticed, so it should be well below the round-trip budget.
//!
//! ## Example
//!
//! ```rust,no_run
//! use otgwflash::{FileStore, Flasher, Indicator, Outcome, UpgradeConfig};
//!
//! struct Print;
//!
//! impl Indicator for Print {
//!     fn finished(&mut self, outcome: Outcome) {
//!         println!("{outcome}");
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut flasher = Flasher::open("/dev/ttyUSB0", 9600, UpgradeConfig::default())?;
//!     let outcome = flasher.run(&FileStore::new("gateway.hex"), Print)?;
//!     assert!(outcome.is_success());
//!     Ok(())
//! }
//! ```

use crate::engine::{Engine, Indicator, Outcome, Transport, UpgradeConfig};
use crate::error::{Error, Result};
use crate::image::hex::{ImageStore, MemoryImage};
use crate::port::Port;
use log::{debug, info, warn};
use std::io::{ErrorKind, Read};
use std::thread;
use std::time::{Duration, Instant};

/// Pause after a failed read so a broken port does not spin the CPU.
const READ_ERROR_DELAY: Duration = Duration::from_millis(10);

/// [`Transport`] writing to a borrowed [`Port`]; DTR drives the reset line.
pub struct PortTransport<'a, P: Port> {
    port: &'a mut P,
}

impl<'a, P: Port> PortTransport<'a, P> {
    /// Wrap `port`.
    pub fn new(port: &'a mut P) -> Self {
        Self { port }
    }

    /// Get the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        self.port
    }
}

impl<P: Port> Transport for PortTransport<'_, P> {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all_bytes(bytes)
    }

    fn pulse_reset(&mut self, width: Duration) -> Result<()> {
        self.port.clear_buffers()?;
        self.port.set_dtr(true)?;
        thread::sleep(width);
        self.port.set_dtr(false)
    }
}

/// Upgrades a gateway PIC over a serial port.
pub struct Flasher<P: Port> {
    port: P,
    config: UpgradeConfig,
}

impl<P: Port> Flasher<P> {
    /// Create a flasher driving an already opened port.
    pub fn new(port: P, config: UpgradeConfig) -> Self {
        Self { port, config }
    }

    /// Get the port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Release the port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Load the image from `store` and upgrade the target.
    ///
    /// Load failures are reported to `indicator` as [`Outcome::ReadFile`]
    /// and returned as errors.
    pub fn run<S, I>(&mut self, store: &S, indicator: I) -> Result<Outcome>
    where
        S: ImageStore + ?Sized,
        I: Indicator,
    {
        let mut engine = self.engine(indicator)?;
        engine.start(store, Instant::now())?;
        Self::pump(&mut engine)
    }

    /// Upgrade the target with an already loaded image.
    pub fn run_image<I: Indicator>(&mut self, image: MemoryImage, indicator: I) -> Result<Outcome> {
        let mut engine = self.engine(indicator)?;
        engine.start_with_image(image, Instant::now())?;
        Self::pump(&mut engine)
    }

    fn engine<I: Indicator>(&mut self, indicator: I) -> Result<Engine<PortTransport<'_, P>, I>> {
        info!("Upgrading gateway on {}", self.port.name());
        self.port.clear_buffers()?;
        Ok(Engine::new(
            PortTransport::new(&mut self.port),
            indicator,
            self.config.clone(),
        ))
    }

    fn pump<I: Indicator>(engine: &mut Engine<PortTransport<'_, P>, I>) -> Result<Outcome> {
        let mut buf = [0u8; 256];

        while !engine.is_idle() {
            if crate::is_interrupted_requested() {
                warn!("Upgrade interrupted in {} phase", engine.phase());
                engine.stop(Outcome::Reset);
                return Err(Error::Interrupted);
            }

            match engine.transport_mut().port_mut().read(&mut buf) {
                Ok(n) => engine.feed_bytes(&buf[..n], Instant::now()),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {},
                Err(e) => {
                    // The watchdog treats this like a missing response
                    debug!("Read error: {e}");
                    thread::sleep(READ_ERROR_DELAY);
                },
            }
            engine.tick(Instant::now());
        }

        Ok(engine.last_outcome().unwrap_or(Outcome::Reset))
    }
}

#[cfg(feature = "native")]
mod native_impl {
    use super::{Flasher, Result, UpgradeConfig};
    use crate::port::{NativePort, SerialConfig};

    impl Flasher<NativePort> {
        /// Open `port_name` and create a flasher for it.
        pub fn open(port_name: &str, baud_rate: u32, config: UpgradeConfig) -> Result<Self> {
            let port = NativePort::open(&SerialConfig::new(port_name, baud_rate))?;
            Ok(Self::new(port, config))
        }
    }
}
