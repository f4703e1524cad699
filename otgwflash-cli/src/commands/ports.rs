//! Port listing command implementation.

use {
    anyhow::Result,
    console::style,
    otgwflash::{DetectedPort, auto_detect_port, discover_ports, format_port_list},
};

fn port_json(port: &DetectedPort) -> serde_json::Value {
    serde_json::json!({
        "name": port.name(),
        "bridge": port.bridge.name(),
        "known": port.bridge.is_known(),
        "vid": port.info.vid,
        "pid": port.info.pid,
        "manufacturer": port.info.manufacturer,
        "product": port.info.product,
        "serial": port.info.serial_number,
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = discover_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected.iter().map(port_json).collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for line in format_port_list(&detected) {
        eprintln!("  {} {line}", style("•").green());
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(auto_port.name()).cyan().bold()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use otgwflash::PortInfo;

    #[test]
    fn test_port_json_shape() {
        let port = DetectedPort::new(PortInfo {
            name: "/dev/ttyUSB0".to_string(),
            vid: Some(0x1A86),
            pid: Some(0x7523),
            product: Some("USB Serial".to_string()),
            ..PortInfo::default()
        });
        let value = port_json(&port);
        assert_eq!(value["name"], "/dev/ttyUSB0");
        assert_eq!(value["bridge"], "CH340/CH341");
        assert_eq!(value["known"], true);
        assert_eq!(value["vid"], 0x1A86);
        assert!(value["serial"].is_null());
    }

    #[test]
    fn test_listing_lines() {
        let ports = [
            DetectedPort::new(PortInfo {
                name: "/dev/ttyUSB0".to_string(),
                vid: Some(0x0403),
                pid: Some(0x6001),
                product: Some("FT232R USB UART".to_string()),
                ..PortInfo::default()
            }),
            DetectedPort::new(PortInfo {
                name: "/dev/ttyS0".to_string(),
                ..PortInfo::default()
            }),
        ];
        let lines = format_port_list(&ports);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "/dev/ttyUSB0 [FTDI] - FT232R USB UART");
        assert_eq!(lines[1], "/dev/ttyS0");
    }
}
