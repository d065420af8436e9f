//! Info command implementation.

use clipshare_core::{discovery, Config};

/// Display device information.
pub fn show_info(config: Config) {
    let local_ip = config.local_ip.unwrap_or_else(discovery::preferred_local_ip);

    println!("\n\x1b[1mClipshare Device Info\x1b[0m");
    println!("═══════════════════════════════════════");
    println!("\x1b[1mName:\x1b[0m        {}", config.device_name);
    println!("\x1b[1mAddress:\x1b[0m     {}", local_ip);
    println!("\x1b[1mSession:\x1b[0m     tcp/{}", config.session_port);
    println!("\x1b[1mDiscovery:\x1b[0m   udp/{}", config.discovery_port);
    println!("\x1b[1mDownloads:\x1b[0m   {}", config.download_dir.display());

    println!("\n\x1b[1mLocal IPs:\x1b[0m");
    for ip in discovery::local_ips() {
        let note = if discovery::is_ignored_ip(ip) { " \x1b[2m(ignored)\x1b[0m" } else { "" };
        println!("  • {}{}", ip, note);
    }
    println!();
}
