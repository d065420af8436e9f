//! Run command implementation.

use std::net::IpAddr;

use clipshare_core::{ClipshareService, Config, ContentKind, ServiceEvent};

use crate::ui::{format_preview, print_banner, print_device_page};

/// Run the clipshare service until Ctrl+C.
pub async fn run_service(config: Config, accept: bool, connect: Vec<IpAddr>) -> anyhow::Result<()> {
    print_banner();

    let mut service = ClipshareService::new(config).with_auto_accept(accept);

    println!("\x1b[1mDevice:\x1b[0m  {}", service.device_name());
    println!("\x1b[1mAddress:\x1b[0m {}", service.local_ip());
    println!(
        "\x1b[1mRequests:\x1b[0m {}",
        if accept { "accepted automatically" } else { "declined (use --accept)" }
    );

    let mut events = service.start().await?;

    for ip in connect {
        match service.request_connection(ip).await {
            Ok(()) => println!("\x1b[1;35m⚡\x1b[0m Connection request sent to {}", ip),
            Err(e) => eprintln!("\x1b[1;31m✗\x1b[0m Failed to send request to {}: {}", ip, e),
        }
    }

    println!("\x1b[1;32m✓\x1b[0m Listening for devices and clipboard changes...");
    println!("\x1b[2mPress Ctrl+C to stop.\x1b[0m\n");

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx.blocking_send(());
    })?;

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                handle_event(event);
            }
            _ = rx.recv() => {
                println!("\n\x1b[1;33mShutting down...\x1b[0m");
                break;
            }
        }
    }

    service.shutdown().await;
    Ok(())
}

/// Handle a service event and print appropriate output.
fn handle_event(event: ServiceEvent) {
    match event {
        ServiceEvent::DevicesChanged(devices) => {
            println!("\x1b[1;36m◎\x1b[0m {} device(s) on the network", devices.len());
            print_device_page(&devices, 0, 1);
        }
        ServiceEvent::RequestAnswered { ip, name, accepted } => {
            if accepted {
                println!("\x1b[1;35m⚡\x1b[0m Accepted request from \x1b[1m{}\x1b[0m ({}), waiting for it to connect", name, ip);
            } else {
                println!("\x1b[1;35m⚡\x1b[0m Declined request from \x1b[1m{}\x1b[0m ({})", name, ip);
            }
        }
        ServiceEvent::ResponseReceived { ip, accepted } => {
            if !accepted {
                println!("\x1b[1;33m⚡\x1b[0m {} declined the connection", ip);
            }
        }
        ServiceEvent::Connected { ip, name, .. } => {
            println!("\x1b[1;32m⬤\x1b[0m Connected with \x1b[1m{}\x1b[0m ({})", name, ip);
        }
        ServiceEvent::Disconnected { ip, name, reason } => {
            println!("\x1b[1;31m⬤\x1b[0m Disconnected from \x1b[1m{}\x1b[0m ({}): {}", name, ip, reason);
        }
        ServiceEvent::ClipboardReceived { name, text, .. } => {
            println!("\x1b[1;34m📋\x1b[0m Received from {}: \"{}\"", name, format_preview(&text));
        }
        ServiceEvent::ClipboardSent { to } => {
            println!("\x1b[1;34m📤\x1b[0m Sent to {} device(s)", to.len());
        }
        ServiceEvent::FileIncoming { from, file_name, total_size } => {
            println!("\x1b[1;34m📥\x1b[0m Receiving {} ({} KB) from {}...", file_name, total_size / 1024, from);
        }
        ServiceEvent::FileProgress { progress, .. } => {
            tracing::debug!("{}: {}/{} chunks", progress.file_name, progress.received, progress.total);
        }
        ServiceEvent::FileReceived { file_name, path, kind, .. } => {
            let what = match kind {
                ContentKind::Image => "Image",
                ContentKind::File => "File",
            };
            println!("\x1b[1;32m✓\x1b[0m {} {} saved to {}", what, file_name, path.display());
        }
        ServiceEvent::FileFailed { from, error } => {
            eprintln!("\x1b[1;31m✗\x1b[0m Transfer from {} failed: {}", from, error);
        }
        ServiceEvent::FileSent { file_name, report } => {
            println!(
                "\x1b[1;34m📤\x1b[0m Sent {} to {} device(s){}",
                file_name,
                report.delivered.len(),
                if report.failed.is_empty() {
                    String::new()
                } else {
                    format!(", {} failed", report.failed.len())
                }
            );
        }
        ServiceEvent::Error(e) => {
            eprintln!("\x1b[1;31m✗\x1b[0m Error: {}", e);
        }
    }
}
