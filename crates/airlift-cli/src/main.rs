//! Airlift CLI
//!
//! LAN file exchange with trust-on-first-use certificate pinning: discover
//! devices, confirm first contacts with a short code, transfer files over
//! adaptive multi-stream chunked TLS.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, BufReader};

use airlift_core::{DiscoveryBackend, Event, Node, NodeConfig, TRANSFER_PORT, TransferStatus};
use airlift_trust::TrustStore;

use config::Config;

/// Airlift - LAN file exchange with TOFU-pinned peers
#[derive(Parser)]
#[command(name = "airlift")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (implies --verbose)
    #[arg(short, long)]
    debug: bool,

    /// Configuration directory override
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Use mDNS service advertisement instead of UDP broadcast
    #[arg(long)]
    mdns: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node: advertise presence and accept incoming transfers
    Serve,

    /// Discover and list devices on the network
    Devices {
        /// Seconds to listen for announcements
        #[arg(long, default_value_t = 6)]
        wait: u64,
    },

    /// Send files to a device
    Send {
        /// Target device id
        #[arg(long = "to")]
        device_id: String,

        /// Files to send
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Seconds to wait for the device to appear
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },

    /// Manage pinned devices
    Trust {
        #[command(subcommand)]
        command: TrustCommands,
    },

    /// Show or change local settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum TrustCommands {
    /// List pinned devices
    List,
    /// Forget a pinned device
    Forget {
        /// Device id to forget
        device_id: String,
    },
    /// Rename a pinned device
    Rename {
        /// Device id to rename
        device_id: String,
        /// New display name
        name: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the current configuration
    Show,
    /// Set the local device name
    SetName {
        /// New display name
        name: String,
    },
    /// Set the download directory
    SetDownloadDir {
        /// Directory delivered files land in
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.debug);

    let config_dir = match &cli.config_dir {
        Some(dir) => dir.clone(),
        None => Config::default_dir()?,
    };
    let config = Config::load_or_create(&config_dir)?;
    let backend = if cli.mdns {
        DiscoveryBackend::Mdns
    } else {
        DiscoveryBackend::Broadcast
    };

    match cli.command {
        Commands::Serve => serve(config, config_dir, backend).await,
        Commands::Devices { wait } => devices(config, config_dir, backend, wait).await,
        Commands::Send {
            device_id,
            paths,
            wait,
        } => send(config, config_dir, backend, device_id, paths, wait).await,
        Commands::Trust { command } => trust(&config_dir, command),
        Commands::Config { command } => configure(config, &config_dir, command),
    }
}

fn init_tracing(verbose: bool, debug: bool) {
    let default = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        "warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn node_config(config: &Config, config_dir: &PathBuf, backend: DiscoveryBackend) -> NodeConfig {
    NodeConfig {
        device_id: config.device_id.clone(),
        device_name: config.device_name.clone(),
        platform: std::env::consts::OS.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        config_dir: config_dir.clone(),
        download_dir: config.download_dir.clone(),
        staging_dir: std::env::temp_dir().join("airlift"),
        listen_port: TRANSFER_PORT,
        backend,
    }
}

async fn serve(config: Config, config_dir: PathBuf, backend: DiscoveryBackend) -> Result<()> {
    let node = Node::start(node_config(&config, &config_dir, backend)).await?;
    println!(
        "airlift serving as \"{}\" ({})",
        node.local_name(),
        config.device_id
    );
    println!("downloads land in {}", config.download_dir.display());

    let mut events = node.events();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => handle_event(&node, &mut stdin, event).await,
                Err(_) => break,
            },
        }
    }

    node.stop().await;
    println!("stopped");
    Ok(())
}

async fn handle_event(
    node: &Arc<Node>,
    stdin: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
    event: Event,
) {
    match event {
        Event::DeviceFound(device) => {
            tracing::debug!("seen {} ({})", device.name, device.id);
        }
        Event::DeviceLost { device_id } => {
            tracing::debug!("lost {device_id}");
        }
        Event::VerificationRequired { device_id, code } => {
            println!("verification required for {device_id}");
            println!("  code on both screens must match: {code}");
            print!("  accept? [y/N] ");
            use std::io::Write;
            let _ = std::io::stdout().flush();
            let accept = matches!(
                stdin.next_line().await,
                Ok(Some(line)) if line.trim().eq_ignore_ascii_case("y")
            );
            node.respond_verification(&device_id, accept);
            println!("  {}", if accept { "accepted" } else { "rejected" });
        }
        Event::TransferProgress(transfer) => {
            tracing::info!(
                "{} {:?} {}%",
                transfer.id,
                transfer.status,
                transfer.progress
            );
        }
        Event::TransferComplete(transfer) => {
            println!("received {} from {}", transfer.file_name, transfer.device_id);
        }
        Event::TransferError { transfer, error } => {
            eprintln!("transfer {} failed: {error}", transfer.id);
        }
    }
}

async fn devices(
    config: Config,
    config_dir: PathBuf,
    backend: DiscoveryBackend,
    wait: u64,
) -> Result<()> {
    let node = Node::start(node_config(&config, &config_dir, backend)).await?;
    println!("listening for {wait}s...");
    tokio::time::sleep(Duration::from_secs(wait)).await;

    let mut devices = node.devices();
    devices.sort_by(|a, b| a.name.cmp(&b.name));
    if devices.is_empty() {
        println!("no devices found");
    } else {
        println!("{:<34} {:<20} {:<16} {}", "ID", "NAME", "ADDRESS", "TRUSTED");
        for device in devices {
            let name = device.alias.as_deref().unwrap_or(&device.name);
            println!(
                "{:<34} {:<20} {:<16} {}",
                device.id,
                name,
                format!("{}:{}", device.address, device.port),
                if device.trusted { "yes" } else { "no" }
            );
        }
    }

    node.stop().await;
    Ok(())
}

async fn send(
    config: Config,
    config_dir: PathBuf,
    backend: DiscoveryBackend,
    device_id: String,
    paths: Vec<PathBuf>,
    wait: u64,
) -> Result<()> {
    for path in &paths {
        if !path.exists() {
            bail!("no such path: {}", path.display());
        }
    }

    let node = Node::start(node_config(&config, &config_dir, backend)).await?;

    // Wait for the target to announce itself.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
    loop {
        if node.devices().iter().any(|d| d.id == device_id) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            node.stop().await;
            bail!("device {device_id} not seen within {wait}s");
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let mut events = node.events();
    let queued = node.send(std::slice::from_ref(&device_id), &paths);
    if queued.is_empty() {
        node.stop().await;
        bail!("nothing queued");
    }
    let mut open: std::collections::HashSet<String> =
        queued.iter().map(|t| t.id.clone()).collect();

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}% {msg}")
            .context("progress template")?,
    );

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut failed = false;
    while !open.is_empty() {
        match events.recv().await {
            Ok(Event::VerificationRequired { device_id, code }) => {
                bar.suspend(|| {
                    println!("verification required for {device_id}");
                    println!("  code on both screens must match: {code}");
                    print!("  accept? [y/N] ");
                    use std::io::Write;
                    let _ = std::io::stdout().flush();
                });
                let accept = matches!(
                    stdin.next_line().await,
                    Ok(Some(line)) if line.trim().eq_ignore_ascii_case("y")
                );
                node.respond_verification(&device_id, accept);
            }
            Ok(Event::TransferProgress(transfer)) if open.contains(&transfer.id) => {
                bar.set_position(u64::from(transfer.progress));
                bar.set_message(format!(
                    "{} ({:?}, {} streams)",
                    transfer.file_name, transfer.status, transfer.stream_count
                ));
                if transfer.status == TransferStatus::Cancelled {
                    open.remove(&transfer.id);
                }
            }
            Ok(Event::TransferComplete(transfer)) if open.contains(&transfer.id) => {
                bar.suspend(|| println!("sent {}", transfer.file_name));
                open.remove(&transfer.id);
            }
            Ok(Event::TransferError { transfer, error }) if open.contains(&transfer.id) => {
                bar.suspend(|| eprintln!("transfer {} failed: {error}", transfer.id));
                open.remove(&transfer.id);
                failed = true;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    bar.finish_and_clear();

    node.stop().await;
    if failed {
        bail!("one or more transfers failed");
    }
    Ok(())
}

fn trust(config_dir: &PathBuf, command: TrustCommands) -> Result<()> {
    let store = TrustStore::load(config_dir.join("pinned_certs.json"));
    match command {
        TrustCommands::List => {
            let mut pinned = store.pinned_devices();
            if pinned.is_empty() {
                println!("no pinned devices");
                return Ok(());
            }
            pinned.sort_by(|a, b| a.1.device_name.cmp(&b.1.device_name));
            println!("{:<34} {:<20} {}", "ID", "NAME", "FINGERPRINT");
            for (id, record) in pinned {
                println!(
                    "{:<34} {:<20} {}...",
                    id,
                    record.device_name,
                    &record.fingerprint[..16.min(record.fingerprint.len())]
                );
            }
        }
        TrustCommands::Forget { device_id } => {
            if store.unpin(&device_id)? {
                println!("forgot {device_id}");
            } else {
                println!("{device_id} was not pinned");
            }
        }
        TrustCommands::Rename { device_id, name } => {
            if store.rename(&device_id, &name)? {
                println!("renamed {device_id} to {name}");
            } else {
                println!("{device_id} is not pinned");
            }
        }
    }
    Ok(())
}

fn configure(mut config: Config, config_dir: &PathBuf, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommands::SetName { name } => {
            config.device_name = name;
            config.save(config_dir)?;
            println!("device name set to {}", config.device_name);
        }
        ConfigCommands::SetDownloadDir { dir } => {
            config.download_dir = dir;
            config.save(config_dir)?;
            println!("download dir set to {}", config.download_dir.display());
        }
    }
    Ok(())
}
