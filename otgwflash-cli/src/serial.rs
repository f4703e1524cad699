//! Interactive serial port selection.
//!
//! Ports are chosen in this order:
//! - the port given on the command line or in `OTGWFLASH_PORT`
//! - the port remembered in the configuration
//! - the only detected port on a known USB-UART bridge
//! - an interactive prompt (never in non-interactive mode)

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    otgwflash::{DetectedPort, PortInfo, discover_ports},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
}

/// Result of port selection including whether it was a known device.
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port sits on a known USB-UART bridge.
    pub is_known: bool,
}

impl SelectedPort {
    fn new(port: DetectedPort) -> Self {
        let is_known = port.bridge.is_known();
        Self { port, is_known }
    }
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn cancelled() -> anyhow::Error {
    CliError::Cancelled("Port selection cancelled".to_string()).into()
}

/// Known bridges when there are any, otherwise every port.
fn candidates(ports: Vec<DetectedPort>) -> Vec<DetectedPort> {
    if ports.iter().any(|p| p.bridge.is_known()) {
        ports.into_iter().filter(|p| p.bridge.is_known()).collect()
    } else {
        ports
    }
}

fn select_non_interactive_port(selection_ports: Vec<DetectedPort>) -> Result<SelectedPort> {
    // 0 or >1 candidates are setup problems, never a guess
    let count = selection_ports.len();
    match (count.cmp(&1), selection_ports.into_iter().next()) {
        (Ordering::Equal, Some(port)) => Ok(SelectedPort::new(port)),
        (Ordering::Greater, _) => Err(usage_err(&format!(
            "{count} serial ports found; specify one with --port"
        ))),
        _ => Err(usage_err("No serial ports available")),
    }
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    // If port explicitly specified, use it
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name, discover_ports()));
    }

    // If port in config, use it
    if let Some(port_name) = &config.connection.serial {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name, discover_ports()));
    }

    let ports = discover_ports();
    if ports.is_empty() {
        return Err(usage_err("No serial ports found"));
    }

    let selection_ports = candidates(ports);

    // Non-interactive mode must never prompt
    if options.non_interactive {
        return select_non_interactive_port(selection_ports);
    }

    match selection_ports.len().cmp(&1) {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(selection_ports)
        },
        Ordering::Equal => {
            let Some(port) = selection_ports.into_iter().next() else {
                return Err(usage_err("No serial ports available"));
            };
            if port.bridge.is_known() {
                info!(
                    "Auto-selected port: {} [{}]",
                    port.name(),
                    port.bridge.name()
                );
                Ok(SelectedPort::new(port))
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        Ordering::Less => Err(usage_err("No serial ports available")),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal; use --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                cancelled()
            } else {
                usage_err(&format!("Port prompt failed: {io_err}"))
            }
        },
    }
}

/// Find a port by name among `ports`.
fn find_port_by_name(name: &str, ports: Vec<DetectedPort>) -> SelectedPort {
    // Exact match first, then case-insensitive (Windows)
    let found = ports
        .iter()
        .position(|p| p.name() == name)
        .or_else(|| ports.iter().position(|p| p.name().eq_ignore_ascii_case(name)));

    if let Some(port) = found.and_then(|index| ports.into_iter().nth(index)) {
        return SelectedPort::new(port);
    }

    // Not enumerated (e.g. a socat pty), but the user asked for it
    SelectedPort::new(DetectedPort::new(PortInfo {
        name: name.to_string(),
        ..PortInfo::default()
    }))
}

/// Build the label shown for `port` in the selection prompt.
fn port_label(port: &DetectedPort) -> String {
    let name = if port.bridge.is_known() {
        style(port.name()).bold().to_string()
    } else {
        port.name().to_string()
    };

    let bridge = if port.bridge.is_known() {
        format!(" [{}]", style(port.bridge.name()).yellow())
    } else if let (Some(vid), Some(pid)) = (port.info.vid, port.info.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .info
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{bridge}{product}")
}

/// Interactive port selection.
fn select_port_interactive(mut ports: Vec<DetectedPort>) -> Result<SelectedPort> {
    eprintln!(
        "{} Detected {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    // Known bridges first
    ports.sort_by_key(|p| !p.bridge.is_known());

    // Truncate labels so narrow terminals do not wrap them
    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&port_label(p), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the gateway's serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection.and_then(|index| ports.into_iter().nth(index)) {
        Some(port) => Ok(SelectedPort::new(port)),
        None => Err(cancelled()),
    }
}

/// Confirm use of a single unrecognized port.
fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let product_info = port
        .info
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}{product_info}?", port.name()))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort::new(port))
    } else {
        Err(cancelled())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        console::{measure_text_width, truncate_str},
    };

    fn port(name: &str, ids: Option<(u16, u16)>) -> DetectedPort {
        DetectedPort::new(PortInfo {
            name: name.to_string(),
            vid: ids.map(|(v, _)| v),
            pid: ids.map(|(_, p)| p),
            product: Some("USB Serial".to_string()),
            ..PortInfo::default()
        })
    }

    fn exit_class(err: &anyhow::Error) -> Option<&CliError> {
        err.downcast_ref::<CliError>()
    }

    #[test]
    fn test_serial_options_default() {
        let options = SerialOptions::default();
        assert!(options.port.is_none());
        assert!(!options.non_interactive);
    }

    #[test]
    fn test_candidates_prefer_known_bridges() {
        let ports = vec![
            port("/dev/ttyS0", None),
            port("/dev/ttyUSB0", Some((0x0403, 0x6001))),
            port("/dev/ttyACM0", Some((0x2341, 0x0043))),
        ];
        let picked = candidates(ports);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name(), "/dev/ttyUSB0");

        let unknown = vec![port("/dev/ttyS0", None), port("/dev/ttyS1", None)];
        assert_eq!(candidates(unknown).len(), 2);
    }

    #[test]
    fn test_non_interactive_single_port() {
        let selected =
            select_non_interactive_port(vec![port("/dev/ttyUSB0", Some((0x1A86, 0x7523)))])
                .unwrap();
        assert_eq!(selected.port.name(), "/dev/ttyUSB0");
        assert!(selected.is_known);
    }

    #[test]
    fn test_non_interactive_ambiguous_or_empty_is_usage_error() {
        let err = select_non_interactive_port(vec![port("a", None), port("b", None)])
            .err()
            .unwrap();
        assert!(matches!(exit_class(&err), Some(CliError::Usage(_))));
        assert!(err.to_string().contains("--port"));

        let err = select_non_interactive_port(Vec::new()).err().unwrap();
        assert!(matches!(exit_class(&err), Some(CliError::Usage(_))));
    }

    #[test]
    fn test_find_port_by_name() {
        let ports = vec![port("COM3", Some((0x10C4, 0xEA60))), port("COM4", None)];

        let selected = find_port_by_name("com3", ports.clone());
        assert_eq!(selected.port.name(), "COM3");
        assert!(selected.is_known);

        let selected = find_port_by_name("COM4", ports.clone());
        assert!(!selected.is_known);

        let selected = find_port_by_name("/dev/pts/7", ports);
        assert_eq!(selected.port.name(), "/dev/pts/7");
        assert!(!selected.is_known);
        assert!(!selected.port.is_usb());
    }

    #[test]
    fn test_explicit_port_wins_over_config() {
        let mut config = Config::default();
        config.connection.serial = Some("/dev/ttyConfigured".to_string());
        let options = SerialOptions {
            port: Some("/dev/ttyExplicit".to_string()),
            non_interactive: true,
        };
        let selected = select_serial_port(&options, &config).unwrap();
        assert_eq!(selected.port.name(), "/dev/ttyExplicit");

        let options = SerialOptions {
            port: None,
            non_interactive: true,
        };
        let selected = select_serial_port(&options, &config).unwrap();
        assert_eq!(selected.port.name(), "/dev/ttyConfigured");
    }

    #[test]
    fn test_prompt_interrupt_is_cancel() {
        let err = map_prompt_error(DialoguerError::IO(std::io::Error::from(
            std::io::ErrorKind::Interrupted,
        )));
        assert!(matches!(exit_class(&err), Some(CliError::Cancelled(_))));

        let err = map_prompt_error(DialoguerError::IO(std::io::Error::from(
            std::io::ErrorKind::BrokenPipe,
        )));
        assert!(matches!(exit_class(&err), Some(CliError::Usage(_))));
    }

    #[test]
    fn test_port_label_fits_after_truncation() {
        let label = port_label(&port(
            "/dev/serial/by-id/usb-FTDI_FT232R_USB_UART_A50285BI-if00-port0",
            Some((0x0403, 0x6001)),
        ));
        let truncated = truncate_str(&label, 26, "…").into_owned();
        assert!(!truncated.contains('\n'));
        assert!(measure_text_width(&truncated) <= 26);
    }
}
