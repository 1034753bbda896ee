mod backends;
mod config;
mod connection;
mod dns;
mod events;
mod monitor;
mod process;
mod scheduler;
mod service;
mod store;
mod traffic_classifier;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use crate::backends::connection::detect_connection_sources;
use crate::backends::process::detect_process_sources;
use crate::backends::SourceInfo;
use crate::config::Config;
use crate::events::MonitorEvent;
use crate::process::ProcessRecord;
use crate::service::MonitorService;

/// NetPulse - host network activity from connection-table diffs
#[derive(Parser, Debug)]
#[command(name = "netpulse")]
#[command(version)]
#[command(about = "Network activity monitor with DNS and process correlation", long_about = None)]
struct Args {
    /// Connection source to use (procfs, netstat, lsof, synthetic)
    #[arg(long, value_name = "SOURCE")]
    source: Option<String>,

    /// Process source to use (sysinfo, synthetic)
    #[arg(long, value_name = "SOURCE")]
    process_source: Option<String>,

    /// Only monitor this process
    #[arg(long, value_name = "PID")]
    pid: Option<u32>,

    /// Stop after this many seconds (default: run until Ctrl+C)
    #[arg(long, value_name = "SECONDS")]
    duration: Option<u64>,

    /// Disable activity estimation on established flows
    #[arg(long)]
    no_activity: bool,

    /// Print every event as a JSON line
    #[arg(long)]
    events: bool,

    /// Print a JSON summary of the collected telemetry on exit
    #[arg(long)]
    summary: bool,

    /// List all available sources and exit
    #[arg(long)]
    list_sources: bool,

    /// Config file (default: ~/.config/netpulse/config.json)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write the effective configuration back to the config file
    #[arg(long)]
    save_config: bool,
}

fn print_source_list(title: &str, sources: &[SourceInfo]) {
    println!("{}:", title);
    if sources.is_empty() {
        println!("  (none compiled in)");
        return;
    }
    for source in sources {
        let status = if source.available {
            "available"
        } else {
            "unavailable"
        };
        println!(
            "  {:20} [priority: {:?}] {}",
            source.name, source.priority, status
        );
    }
}

fn print_available_sources() {
    println!("NetPulse v{} - Available Sources\n", env!("CARGO_PKG_VERSION"));
    print_source_list("Connection Sources", &detect_connection_sources());
    println!();
    print_source_list("Process Sources", &detect_process_sources());
    println!();
    println!("The synthetic sources are never picked automatically; pass --source synthetic.");
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {:#}", e);
            Config::default()
        }),
    };

    if let Some(source) = &args.source {
        config.connection_source = Some(source.clone());
    }
    if let Some(source) = &args.process_source {
        config.process_source = Some(source.clone());
    }
    if args.no_activity {
        config.activity.enabled = false;
    }

    config.validate()?;
    Ok(config)
}

/// Human-readable line for the interesting events
fn print_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::Packet(packet) if !packet.is_activity => {
            println!(
                "{} {:>5} {} {}",
                packet.timestamp.format("%H:%M:%S"),
                packet.pid,
                packet.details,
                packet.domain.as_deref().unwrap_or("")
            );
        }
        MonitorEvent::Stats(stats) => {
            println!(
                "-- packets: {}  connections: {}  processes: {}  domains: {}",
                stats.total_packets,
                stats.total_connections,
                stats.active_processes,
                stats.unique_domains
            );
        }
        _ => {}
    }
}

fn print_target(process: Option<&ProcessRecord>, pid: u32) {
    match process {
        Some(p) => println!(
            "-- {} (PID {}): cpu {:.1}%  mem {}  connections {}",
            p.name,
            p.pid,
            p.cpu,
            ProcessRecord::format_memory(p.memory),
            p.connection_count
        ),
        None => println!("-- PID {} not found", pid),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    }

    if args.list_sources {
        print_available_sources();
        return Ok(());
    }

    let config = load_config(&args)?;
    if args.save_config {
        match &args.config {
            Some(path) => config.save_to(path)?,
            None => config.save()?,
        }
    }

    let service = Arc::new(MonitorService::new(config)?);
    let mut rx = service.subscribe();

    match args.pid {
        Some(pid) => service.start_process(pid).await?,
        None => service.start_global().await?,
    }

    let json_lines = args.events;
    let target = args.pid;
    let printer = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if json_lines => match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => log::warn!("Failed to serialize {} event: {}", event.name(), e),
                    },
                    Ok(event) => {
                        print_event(&event);
                        if let (MonitorEvent::Stats(_), Some(pid)) = (&event, target) {
                            print_target(service.process(pid).as_ref(), pid);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("Output fell behind, dropped {} events", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    match args.duration {
        Some(seconds) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {
                    log::info!("Duration elapsed, stopping");
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Received Ctrl+C, stopping");
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            log::info!("Received Ctrl+C, stopping");
        }
    }

    service.stop().await;
    printer.abort();

    if args.summary {
        let summary = service.summary().await;
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(())
}
