// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! speedctl: drives a serial dimmer fan from CPU/GPU temperatures until
//! interrupted, then sets the fan to 0 and releases the port.

use anyhow::Context;
use clap::Parser;
use dimmer_speedctl::config::{self, Config};
use dimmer_speedctl::controller::{ControlSettings, Controller, Mode, Observers};
use dimmer_speedctl::device::SerialDimmer;
use dimmer_speedctl::ports::{self, PortEnumerator, PortFilter, SystemPorts};
use dimmer_speedctl::sensors::{self, HwmonSensors, SensorSource};
use log::LevelFilter;
use std::sync::atomic::{AtomicBool, Ordering};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "speedctl", about = "Serial dimmer fan speed control daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override the serial port tried before discovery.
    #[arg(short, long)]
    port: Option<String>,

    /// Start in manual mode at this duty (0-100).
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=100))]
    manual: Option<u8>,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,

    /// List serial ports and the one the device filters select, then exit.
    #[arg(long)]
    list_ports: bool,

    /// List temperature readings and how they are classified, then exit.
    #[arg(long)]
    list_sensors: bool,

    /// Write the effective configuration to the config path, then exit.
    #[arg(long)]
    write_config: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = config::resolve_config_path(Some(&cli.config));

    let debug_ceiling = init_logging(cli.verbose)?;

    // Malformed config is fatal.
    let mut cfg = config::load_config(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    apply_overrides(&mut cfg, &cli);
    if cfg.verbose {
        log::set_max_level(debug_ceiling);
    }

    if cli.write_config {
        config::save_config(&config_path, &cfg)?;
        println!("Wrote {}", config_path.display());
        return Ok(());
    }
    if cli.list_ports {
        return list_ports(&cfg).await;
    }
    if cli.list_sensors {
        list_sensors(&cfg).await;
        return Ok(());
    }

    log::info!(
        "Using config {}: port {}, tick {}ms, mode {}",
        config_path.display(),
        cfg.device.port,
        cfg.control.delay_ms,
        cfg.control.mode
    );

    let announced = AtomicBool::new(false);
    let observers = Observers::new()
        .on_status(move |connected, running| {
            if connected && running && !announced.swap(true, Ordering::Relaxed) {
                log::info!("Fan control active");
            }
        })
        .on_speed(|speed| log::debug!("Fan duty is now {speed}"));

    let mut controller = Controller::new(
        ControlSettings::from_config(&cfg),
        Box::new(SerialDimmer::from_config(&cfg.device)),
        Box::new(HwmonSensors::new()),
        Box::new(SystemPorts),
        observers,
    );

    controller.start().await;

    let signal = wait_for_shutdown().await;
    log::info!("Received shutdown signal");
    controller.shutdown().await;
    log::info!("Shutdown complete");

    signal
}

/// Install env_logger before anything else logs.
///
/// `RUST_LOG` wins when set. Otherwise the level is debug with `--verbose`
/// and info without; the returned ceiling lets `verbose = true` in the
/// config file raise it once the file has been read.
fn init_logging(verbose: bool) -> anyhow::Result<LevelFilter> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).build();
    let ceiling = logger.filter();
    let from_env = std::env::var_os("RUST_LOG").is_some();

    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(if verbose || from_env {
        ceiling
    } else {
        ceiling.min(LevelFilter::Info)
    });
    Ok(ceiling)
}

fn apply_overrides(cfg: &mut Config, cli: &Cli) {
    if let Some(port) = &cli.port {
        cfg.device.port = port.clone();
    }
    if let Some(speed) = cli.manual {
        cfg.control.mode = Mode::Manual;
        cfg.control.manual_speed = speed;
    }
    if cli.verbose {
        cfg.verbose = true;
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

async fn list_ports(cfg: &Config) -> anyhow::Result<()> {
    let available = SystemPorts.list().await?;
    if available.is_empty() {
        println!("No serial ports found");
    }
    for port in &available {
        println!(
            "{:<20} {:<48} serial={}",
            port.device,
            port.description,
            port.serial_number.as_deref().unwrap_or("-")
        );
    }

    let filter = PortFilter::new(cfg.device.name.clone(), cfg.device.serial.clone());
    match ports::resolve(&available, &filter) {
        Some(found) => println!("Selected: {}", found.device),
        None => println!("Selected: none (falls back to {})", cfg.device.port),
    }
    Ok(())
}

async fn list_sensors(cfg: &Config) {
    let readings = HwmonSensors::new().read().await;
    if readings.is_empty() {
        println!("No temperature sensors found");
        return;
    }

    let mut labels: Vec<&String> = readings.keys().collect();
    labels.sort();

    fn matches(label: &str, filters: &[String]) -> bool {
        filters.iter().any(|f| label.contains(f.as_str()))
    }

    for label in labels {
        let group = if matches(label, &cfg.sensors.cpu_filters) {
            "cpu"
        } else if matches(label, &cfg.sensors.gpu_filters) {
            "gpu"
        } else {
            "-"
        };
        println!("{:<40} {:>6.1}C  {group}", label, readings[label]);
    }

    let (cpu, gpu) = sensors::split_temperatures(
        &readings,
        &cfg.sensors.cpu_filters,
        &cfg.sensors.gpu_filters,
    );
    let ranges = &cfg.control.temp_ranges;
    println!(
        "CPU {cpu}C -> duty {}, GPU {gpu}C -> duty {}",
        ranges.evaluate(cpu),
        ranges.evaluate(gpu)
    );
}
