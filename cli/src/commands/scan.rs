//! Scan command implementation.

use clipshare_core::{Config, DeviceRegistry};

use crate::ui::print_device_page;

/// Run a single discovery round and print what answered.
pub async fn scan_devices(config: Config, page_size: usize) -> anyhow::Result<()> {
    let registry = DeviceRegistry::from_config(&config);

    println!(
        "Scanning for {:?} on udp/{}...",
        config.scan_window, config.discovery_port
    );
    registry.scan(&config.device_name).await?;

    if registry.is_empty().await {
        println!("\x1b[2mNo devices found.\x1b[0m");
        return Ok(());
    }

    let pages = registry.page_count(page_size).await;
    for page in 0..pages {
        print_device_page(&registry.get_page(page, page_size).await, page, pages);
    }
    Ok(())
}
