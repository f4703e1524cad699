//! Host-side utilities for serial port discovery.
//!
//! The gateway is usually reached through a USB-UART bridge, so ports are
//! classified by their USB VID/PID to pick a sensible default.

use crate::error::{Error, Result};
use crate::port::PortInfo;

#[cfg(feature = "native")]
use crate::port::{NativePortEnumerator, PortEnumerator};
#[cfg(feature = "native")]
use log::{debug, info, trace};

/// USB-UART bridges commonly found on OpenTherm Gateway interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum BridgeKind {
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs for common USB-to-UART bridges.
const KNOWN_BRIDGES: &[(u16, &[u16], BridgeKind)] = &[
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        BridgeKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], BridgeKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        BridgeKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], BridgeKind::Prolific),
];

impl BridgeKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_BRIDGES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && pids.contains(&pid))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Get a human-readable name for the bridge.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known bridge.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Serial port together with its bridge classification.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port information as reported by the OS.
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub info: PortInfo,
    /// Classified bridge kind.
    pub bridge: BridgeKind,
}

impl DetectedPort {
    /// Classify `info`.
    pub fn new(info: PortInfo) -> Self {
        let bridge = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => BridgeKind::from_vid_pid(vid, pid),
            _ => BridgeKind::Unknown,
        };
        Self { info, bridge }
    }

    /// Port name/path.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Whether the port sits on a USB bus.
    pub fn is_usb(&self) -> bool {
        self.info.vid.is_some()
    }
}

/// Discover all available serial ports.
#[cfg(feature = "native")]
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(DetectedPort::new)
            .inspect(|p| trace!("Found port: {} ({})", p.name(), p.bridge.name()))
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Discover all available serial ports (always empty without `native`).
#[cfg(not(feature = "native"))]
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the most likely gateway port among `ports`.
///
/// Known bridges win over other USB ports, which win over anything else.
pub fn select_port(ports: &[DetectedPort]) -> Result<&DetectedPort> {
    ports
        .iter()
        .find(|p| p.bridge.is_known())
        .or_else(|| ports.iter().find(|p| p.is_usb()))
        .or_else(|| ports.first())
        .ok_or(Error::PortNotFound)
}

/// Auto-detect a single gateway port.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let ports = discover_ports();
    let port = select_port(&ports)?;
    info!("Auto-detected {} port: {}", port.bridge.name(), port.name());
    Ok(port.clone())
}

/// Auto-detect a single gateway port (unsupported without `native`).
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Result<DetectedPort> {
    Err(Error::Unsupported(
        "Port discovery requires the `native` feature".to_string(),
    ))
}

/// Format a list of detected ports for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let bridge = if port.bridge.is_known() {
                format!(" [{}]", port.bridge.name())
            } else if let (Some(vid), Some(pid)) = (port.info.vid, port.info.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };
            let product = port
                .info
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();
            format!("{}{bridge}{product}", port.name())
        })
        .collect()
}
