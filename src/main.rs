use clap::{Parser, Subcommand, ValueEnum};
use peervault::registry::RegistryHandle;
use peervault::storage_target::CloudProvider;
use peervault::{peer_node, PeerId, PeerNodeConfig, RegistryConfig, RegistryNode};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "peervault")]
#[command(about = "A peer-coordinated, erasure-coded distributed file store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the registry with its administrative console
    Registry {
        /// Configuration file path
        #[arg(short, long, default_value = "config/registry.yaml")]
        config: String,
    },
    /// Run a storage peer daemon
    Peer {
        /// Configuration file path
        #[arg(short, long, default_value = "config/peer.yaml")]
        config: String,
        /// Instance number, for running several peers on one host
        #[arg(long)]
        instance: Option<u32>,
        /// Override the advertised capacity (MB)
        #[arg(long)]
        capacity_mb: Option<u64>,
        /// Override the registry address
        #[arg(long)]
        registry: Option<String>,
    },
    /// Write a default configuration file
    GenerateConfig {
        /// Which role to generate a config for
        #[arg(value_enum)]
        role: Role,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Show version information
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum Role {
    Registry,
    Peer,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Registry { config } => {
            info!("Starting peervault registry with config: {}", config);
            let registry_config = load_or_create(&config, |p| RegistryConfig::from_file(p), || {
                RegistryConfig::default().save_to_file(&config)
            })?;

            let node = RegistryNode::start(registry_config).await?;
            println!("Registry listening on {}", node.local_addr());
            println!("Type 'help' for console commands.");
            run_console(node.handle()).await
        }
        Commands::Peer {
            config,
            instance,
            capacity_mb,
            registry,
        } => {
            info!("Starting peervault storage peer with config: {}", config);
            let mut peer_config = load_or_create(&config, |p| PeerNodeConfig::from_file(p), || {
                PeerNodeConfig::default().save_to_file(&config)
            })?;
            if let Some(instance) = instance {
                peer_config.instance = instance;
            }
            if let Some(capacity_mb) = capacity_mb {
                peer_config.capacity_mb = capacity_mb;
            }
            if let Some(registry) = registry {
                peer_config.registry_address = registry;
            }

            peer_node::run(peer_config).await?;
            Ok(())
        }
        Commands::GenerateConfig { role, output } => {
            if let Some(parent) = output.parent() {
                std::fs::create_dir_all(parent)?;
            }
            match role {
                Role::Registry => RegistryConfig::default().save_to_file(&output)?,
                Role::Peer => PeerNodeConfig::default().save_to_file(&output)?,
            }
            println!("Default configuration written to {:?}", output);
            Ok(())
        }
        Commands::Version => {
            println!("peervault v{}", env!("CARGO_PKG_VERSION"));
            println!("A peer-coordinated, erasure-coded distributed file store");
            Ok(())
        }
    }
}

/// Load a config file, writing the defaults first if it does not exist yet.
fn load_or_create<T>(
    path: &str,
    from_file: impl Fn(&str) -> Result<T, peervault::config::ConfigError>,
    write_default: impl FnOnce() -> Result<(), peervault::config::ConfigError>,
) -> anyhow::Result<T> {
    if !Path::new(path).exists() {
        warn!("Configuration file not found, creating default configuration");
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_default()?;
        info!("Default configuration saved to: {}", path);
    }
    Ok(from_file(path)?)
}

/// Interactive administrative console, one command per line.
async fn run_console(handle: RegistryHandle) -> anyhow::Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();

        match command {
            "quit" | "exit" => break,
            "help" => print_help(),
            "list" => match handle.list_connected().await {
                Ok(records) => {
                    if records.is_empty() {
                        println!("No peers connected.");
                    } else {
                        println!(
                            "{:<34} {:<20} {:<12} {:<8}",
                            "Peer ID", "Hostname", "Capacity", "Port"
                        );
                        for record in records {
                            println!(
                                "{:<34} {:<20} {:<12} {:<8}",
                                record.id.to_string(),
                                record.hostname,
                                format_bytes(record.capacity_bytes),
                                record
                                    .transfer_port
                                    .map(|p| p.to_string())
                                    .unwrap_or_else(|| "-".to_string()),
                            );
                        }
                    }
                }
                Err(e) => println!("Error: {}", e),
            },
            "pending" => match handle.list_pending().await {
                Ok(records) => {
                    if records.is_empty() {
                        println!("No peers awaiting approval.");
                    } else {
                        for record in records {
                            println!(
                                "{} {} ({})",
                                record.id,
                                record.hostname,
                                format_bytes(record.capacity_bytes)
                            );
                        }
                    }
                }
                Err(e) => println!("Error: {}", e),
            },
            "approve" => match parse_peer_id(&args) {
                Ok(id) => report(handle.approve(id).await, &format!("Approved {}", id)),
                Err(e) => println!("{}", e),
            },
            "reject" => match parse_peer_id(&args) {
                Ok(id) => report(handle.reject(id).await, &format!("Rejected {}", id)),
                Err(e) => println!("{}", e),
            },
            "disconnect" => match parse_peer_id(&args) {
                Ok(id) => report(handle.disconnect(id).await, &format!("Disconnected {}", id)),
                Err(e) => println!("{}", e),
            },
            "upload" => match args.first() {
                Some(arg) => upload_path(&handle, Path::new(arg)).await,
                None => println!("Usage: upload <file-or-directory>"),
            },
            "download" => match args.first() {
                Some(file) => {
                    let out_dir = args.get(1).map(Path::new);
                    match handle.retrieve_to(file, out_dir).await {
                        Ok(path) => println!("Retrieved to {:?}", path),
                        Err(e) => println!("Error: {}", e),
                    }
                }
                None => println!("Usage: download <file> [directory]"),
            },
            "delete" => match args.first() {
                Some(file) => report(handle.delete(file).await, &format!("Deleted '{}'", file)),
                None => println!("Usage: delete <file>"),
            },
            "files" => {
                let files = handle.stored_files().await;
                if files.is_empty() {
                    println!("No files stored.");
                } else {
                    for file in files {
                        println!("{}", file);
                    }
                }
            }
            "storage" => match handle.storage_report().await {
                Ok(r) => {
                    for peer in &r.peers {
                        println!(
                            "{:<34} {:<20} {} / {}",
                            peer.id.to_string(),
                            peer.hostname,
                            format_bytes(peer.used_bytes),
                            format_bytes(peer.capacity_bytes)
                        );
                    }
                    println!(
                        "Pool: {} used of {}, fallback store holds {}",
                        format_bytes(r.total_used_bytes),
                        format_bytes(r.total_capacity_bytes),
                        format_bytes(r.fallback_bytes)
                    );
                }
                Err(e) => println!("Error: {}", e),
            },
            "availability" => match handle.availability_report().await {
                Ok(report) => {
                    if report.is_empty() {
                        println!("No files stored.");
                    } else {
                        println!(
                            "{:<40} {:<12} {:<10} {:<12} {}",
                            "File", "Size", "k/m", "Available", "Retrievable"
                        );
                        for f in report {
                            println!(
                                "{:<40} {:<12} {:<10} {:<12} {}",
                                f.file_name,
                                format_bytes(f.size),
                                format!("{}/{}", f.k, f.m),
                                f.available,
                                if f.retrievable { "yes" } else { "NO" }
                            );
                        }
                    }
                }
                Err(e) => println!("Error: {}", e),
            },
            "cloud" => match (args.first().copied(), args.get(1)) {
                (Some(action), Some(name)) => match name.parse::<CloudProvider>() {
                    Ok(provider) => match action {
                        "enable" => {
                            handle.cloud_enable(provider).await;
                            println!("Cloud target {} enabled", provider);
                        }
                        "disable" => {
                            if handle.cloud_disable(provider).await {
                                println!("Cloud target {} disabled", provider);
                            } else {
                                println!("Cloud target {} was not enabled", provider);
                            }
                        }
                        other => println!("Unknown cloud action '{}'", other),
                    },
                    Err(e) => println!("{}", e),
                },
                _ => println!("Usage: cloud enable|disable aws|google"),
            },
            other => println!("Unknown command '{}'. Type 'help'.", other),
        }
    }
    Ok(())
}

/// Distribute a single file, or every regular file in a directory.
async fn upload_path(handle: &RegistryHandle, path: &Path) {
    if path.is_dir() {
        let entries = match std::fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) => {
                println!("Error reading {:?}: {}", path, e);
                return;
            }
        };
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                distribute_one(handle, &entry.path()).await;
            }
        }
    } else {
        distribute_one(handle, path).await;
    }
}

async fn distribute_one(handle: &RegistryHandle, path: &Path) {
    match handle.distribute(path).await {
        Ok(name) => println!("Stored '{}'", name),
        Err(e) => println!("Error storing {:?}: {}", path, e),
    }
}

fn parse_peer_id(args: &[&str]) -> Result<PeerId, String> {
    let arg = args.first().ok_or("Usage: <command> <peer-id>")?;
    arg.parse::<PeerId>()
        .map_err(|e| format!("Invalid peer id '{}': {}", arg, e))
}

fn report<E: std::fmt::Display>(result: Result<(), E>, success: &str) {
    match result {
        Ok(()) => println!("{}", success),
        Err(e) => println!("Error: {}", e),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  list                         connected peers");
    println!("  pending                      peers awaiting approval");
    println!("  approve <peer-id>            approve a pending peer");
    println!("  reject <peer-id>             reject a pending peer");
    println!("  disconnect <peer-id>         drop a connected peer");
    println!("  upload <path>                store a file (or every file in a directory)");
    println!("  download <file> [dir]        reconstruct a stored file");
    println!("  delete <file>                delete a stored file everywhere");
    println!("  files                        stored file names");
    println!("  storage                      per-peer usage and pool totals");
    println!("  availability                 fragment availability per file");
    println!("  cloud enable|disable <name>  toggle a cloud target (aws, google)");
    println!("  quit                         stop the registry");
}

/// Format bytes in a human-readable format
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1000.0 && unit_index < UNITS.len() - 1 {
        size /= 1000.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
