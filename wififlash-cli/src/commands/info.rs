//! Image info and port listing command implementations.

use {
    anyhow::{Context, Result},
    console::style,
    std::path::Path,
    wififlash::{DetectedPort, FileImage, ImageInfo, detect_ports, rank_ports},
};

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        println!("{}", serde_json::to_string_pretty(&ports_json(&detected))?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{device_type}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan(),
        );
    }

    if let Some(best) = rank_ports(&detected) {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&best.name).cyan().bold()
        );
    }

    Ok(())
}

fn ports_json(ports: &[DetectedPort]) -> serde_json::Value {
    ports
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.name,
                "device": p.device.name(),
                "known": p.device.is_known(),
                "vid": p.vid,
                "pid": p.pid,
                "manufacturer": p.manufacturer,
                "product": p.product,
                "serial": p.serial,
            })
        })
        .collect()
}

/// Info command implementation.
pub(crate) fn cmd_info(image_path: &Path, address: u32, json: bool) -> Result<()> {
    let mut image = FileImage::open(image_path)
        .with_context(|| format!("Failed to open image {}", image_path.display()))?;
    let info = ImageInfo::inspect(&mut image, address)
        .with_context(|| format!("Failed to read image {}", image_path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    eprintln!(
        "{} {}",
        style("📦").cyan(),
        style(image_path.display()).bold().underlined()
    );
    eprintln!("  Size:        {} bytes", info.size);
    eprintln!("  Address:     0x{:06X}", info.address);
    eprintln!("  Blocks:      {} x 1024 bytes", info.blocks);
    eprintln!("  Erase size:  {} bytes", info.erase_size);
    eprintln!(
        "  Bootable:    {}",
        if info.bootable {
            style("yes").green()
        } else {
            style("no").dim()
        }
    );

    if let (Some(segments), Some(mode), Some(size_freq)) =
        (info.segments, info.flash_mode, info.flash_size_freq)
    {
        eprintln!("  Segments:    {segments}");
        eprintln!("  Flash mode:  0x{mode:02X}");
        eprintln!("  Size/freq:   0x{size_freq:02X}");
    }
    if let Some(entry) = info.entry_point {
        eprintln!("  Entry point: 0x{entry:08X}");
    }

    Ok(())
}
