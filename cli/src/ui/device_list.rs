//! Device list and clipboard preview formatting.

use clipshare_core::Device;

const MAX_PREVIEW_CHARS: usize = 50;

/// Print one page of devices with a "page x/y" footer.
pub fn print_device_page(devices: &[Device], page: usize, pages: usize) {
    for device in devices {
        let dot = if device.connected { "\x1b[1;32m⬤\x1b[0m" } else { "\x1b[2m⬤\x1b[0m" };
        let mac = device.mac.as_deref().unwrap_or("-");
        println!("  {} \x1b[1m{:<24}\x1b[0m {:<16} {}", dot, device.name, device.ip, mac);
    }
    if pages > 1 {
        println!("\x1b[2m  page {}/{}\x1b[0m", page + 1, pages);
    }
}

/// Shorten clipboard text for a one-line preview.
pub fn format_preview(text: &str) -> String {
    let single_line = text.replace(['\n', '\r'], " ");
    if single_line.chars().count() > MAX_PREVIEW_CHARS {
        let cut: String = single_line.chars().take(MAX_PREVIEW_CHARS).collect();
        format!("{}...", cut)
    } else {
        single_line
    }
}
