//! Firmware image inspection commands.

use {
    anyhow::{Context, Result},
    console::style,
    otgwflash::MemoryImage,
    std::path::Path,
};

fn load(firmware: &Path) -> Result<MemoryImage> {
    MemoryImage::from_file(firmware)
        .with_context(|| format!("Failed to load firmware image {}", firmware.display()))
}

fn info_json(firmware: &Path, image: &MemoryImage) -> serde_json::Value {
    serde_json::json!({
        "ok": true,
        "data": {
            "file": firmware.display().to_string(),
            "program_words": image.used_program_words(),
            "data_bytes": image.used_data_bytes(),
            "compatible": image.has_magic(),
            "reset_vector": [image.program()[0], image.program()[1]],
        }
    })
}

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, json: bool) -> Result<()> {
    let image = load(firmware)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&info_json(firmware, &image))?
        );
        return Ok(());
    }

    eprintln!("{}", style("Firmware image").bold().underlined());
    eprintln!("  File: {}", firmware.display());
    eprintln!(
        "  Program memory: {} words used",
        image.used_program_words()
    );
    eprintln!("  Data memory: {} bytes used", image.used_data_bytes());
    eprintln!(
        "  Reset vector: {:04X} {:04X}",
        image.program()[0],
        image.program()[1]
    );

    if image.has_magic() {
        eprintln!("  Bootloader compatible: {}", style("yes").green());
    } else {
        eprintln!("  Bootloader compatible: {}", style("no").red());
    }

    Ok(())
}

/// Dump command implementation: the image re-encoded as hex on stdout.
pub(crate) fn cmd_dump(firmware: &Path) -> Result<()> {
    let image = load(firmware)?;
    print!("{}", image.to_hex());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_json_shape() {
        let mut image = MemoryImage::new();
        image.program_mut()[0] = 0x158A;
        image.program_mut()[1] = 0x2600;
        image.data_mut()[0] = 0x42;

        let value = info_json(Path::new("gateway.hex"), &image);
        assert_eq!(value["ok"], true);
        assert_eq!(value["data"]["file"], "gateway.hex");
        assert_eq!(value["data"]["program_words"], 2);
        assert_eq!(value["data"]["data_bytes"], 1);
        assert_eq!(value["data"]["compatible"], true);
        assert_eq!(value["data"]["reset_vector"][0], 0x158A);
    }

    #[test]
    fn test_load_reports_path() {
        let err = load(Path::new("/nonexistent/gateway.hex")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/gateway.hex"));
    }
}
