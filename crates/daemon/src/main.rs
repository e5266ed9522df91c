//! usb-inputd
//!
//! Input daemon that opens HID game controllers through libusb or hidapi,
//! claims their interfaces and keeps their interrupt endpoints read.

mod config;
mod devices;

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use config::{DaemonConfig, DeviceConfig};
use std::rc::Rc;
use tokio::signal;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};
use usb_helper::{Scheduler, UsbHelper};

#[derive(Parser, Debug)]
#[command(name = "usb-inputd")]
#[command(author, version, about = "USB input daemon - read HID controllers")]
#[command(long_about = "
Opens USB game controllers either as raw libusb devices or as hidapi
report-access devices, claims their HID interfaces and keeps reading
their interrupt endpoints from a single-threaded mainloop.

EXAMPLES:
    # Run with the devices listed in the default config
    usb-inputd

    # Read one device given by its sysfs path
    usb-inputd /sys/bus/usb/devices/3-2

    # Read a hidapi device for 500 ticks, then exit
    usb-inputd --ticks 500 '/hidapi/dev/hidraw0'

    # Run with trace logging to see every report
    usb-inputd --log-level trace

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-inputd/daemon.toml
    3. /etc/usb-inputd/daemon.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Stop after this many mainloop ticks
    #[arg(long, value_name = "N")]
    ticks: Option<u64>,

    /// Device paths to read in addition to the configured ones
    #[arg(value_name = "DEVICE")]
    paths: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DaemonConfig::default();
        let path = DaemonConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        DaemonConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-inputd v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    config
        .devices
        .extend(args.paths.iter().map(|p| DeviceConfig::for_path(p)));
    if config.devices.is_empty() {
        info!("No devices configured, nothing to read");
    }

    let scheduler = Rc::new(Scheduler::new(config.daemon.tick_interval()));
    let helper = UsbHelper::init(scheduler.clone(), config.usb.clone())
        .context("Failed to initialize USB helper")?;

    let active = devices::start_all(&helper, &config.devices);
    info!(
        "Reading {} of {} device(s)",
        active.len(),
        config.devices.len()
    );

    let result = run_mainloop(&scheduler, args.ticks).await;

    info!("Shutting down USB helper...");
    devices::stop_all(&helper, active);
    // One more tick lets cancelled transfers finish before libusb goes away.
    scheduler.tick();
    helper.shutdown();

    result
}

/// Tick the scheduler until Ctrl+C or until `limit` ticks have run
async fn run_mainloop(scheduler: &Scheduler, limit: Option<u64>) -> Result<()> {
    let mut timer = interval(scheduler.interval());
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!("Press Ctrl+C to shutdown");
    loop {
        if limit.is_some_and(|limit| scheduler.ticks() >= limit) {
            info!("Reached {} ticks, stopping", scheduler.ticks());
            return Ok(());
        }

        tokio::select! {
            _ = timer.tick() => scheduler.tick(),
            result = &mut ctrl_c => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                return Ok(());
            }
        }
    }
}
