//! UniSync CLI
//!
//! Thin wrapper around unisync-core functions for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show node information
//! unisync info
//!
//! # Create a namespace and write a file into it
//! unisync ns create
//! unisync file write <ns> notes.txt --text "hello"
//!
//! # List and read files
//! unisync file list <ns>
//! unisync file read <ns> notes.txt
//!
//! # Share a namespace, join it on another device
//! unisync share <ns>
//! unisync import <ticket>
//!
//! # Sync once, or keep serving until Ctrl-C
//! unisync sync <ns>
//! unisync serve
//! ```

use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use unisync_core::{
    DocTicket, Engine, EngineOptions, Hash, IrohOptions, NamespaceId, NodeId, SyncReport,
};

/// UniSync - peer-to-peer synchronized file store
#[derive(Parser)]
#[command(name = "unisync")]
#[command(version = "0.1.0")]
#[command(about = "UniSync - peer-to-peer synchronized file store")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.unisync/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Do not use relay servers
    #[arg(long, global = true)]
    no_relay: bool,

    /// Fixed UDP port to bind
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Show this device's author id
    Author,

    /// Namespace management
    Ns {
        #[command(subcommand)]
        action: NsAction,
    },

    /// File operations
    File {
        #[command(subcommand)]
        action: FileAction,
    },

    /// Blob operations
    Blob {
        #[command(subcommand)]
        action: BlobAction,
    },

    /// Print a ticket for a namespace
    Share {
        /// Namespace ID (base58)
        namespace: String,
    },

    /// Join a namespace from a ticket
    Import {
        /// Ticket string (docticket1:...)
        ticket: String,
    },

    /// Run one sync round for a namespace
    Sync {
        /// Namespace ID (base58)
        namespace: String,
    },

    /// Serve peers and keep namespaces in sync until Ctrl-C
    Serve {
        /// Namespaces to keep in sync (default: all)
        #[arg(short, long)]
        namespace: Vec<String>,

        /// Seconds between sync rounds
        #[arg(long, default_value = "30")]
        interval: u64,
    },

    /// Known node management
    Nodes {
        #[command(subcommand)]
        action: NodesAction,
    },
}

#[derive(Subcommand)]
enum NsAction {
    /// Create a new namespace
    Create,
    /// List all namespaces
    List,
    /// Delete a namespace and its entries
    Delete {
        /// Namespace ID (base58)
        namespace: String,
    },
    /// Print the default namespace, creating it if needed
    Default,
}

#[derive(Subcommand)]
enum FileAction {
    /// Write a file (from --text, --from, or stdin)
    Write {
        /// Namespace ID (base58)
        namespace: String,
        /// Path inside the namespace
        path: String,
        /// Literal content
        #[arg(long, conflicts_with = "from")]
        text: Option<String>,
        /// Local file to import
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// Print a file's content to stdout
    Read {
        /// Namespace ID (base58)
        namespace: String,
        /// Path inside the namespace
        path: String,
    },
    /// Delete a file
    Delete {
        /// Namespace ID (base58)
        namespace: String,
        /// Path inside the namespace
        path: String,
    },
    /// List files
    List {
        /// Namespace ID (base58)
        namespace: String,
        /// Include deleted files
        #[arg(short, long)]
        all: bool,
    },
    /// Copy a file to a local path
    Export {
        /// Namespace ID (base58)
        namespace: String,
        /// Path inside the namespace
        path: String,
        /// Destination on disk
        dest: PathBuf,
    },
}

#[derive(Subcommand)]
enum BlobAction {
    /// Print a blob's content to stdout
    Read {
        /// Blob hash (hex)
        hash: String,
    },
    /// Copy a blob to a local path
    Export {
        /// Blob hash (hex)
        hash: String,
        /// Destination on disk
        dest: PathBuf,
    },
    /// Delete blobs no entry refers to
    Gc,
}

#[derive(Subcommand)]
enum NodesAction {
    /// List known nodes
    List,
    /// Probe every known node
    Reconnect,
    /// Forget a node
    Remove {
        /// Node ID (hex)
        node_id: String,
    },
}

/// Set up logging based on verbosity level
fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.unisync/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".unisync")
        .join("data")
}

/// Parse a namespace ID from base58 string
fn parse_namespace(s: &str) -> Result<NamespaceId> {
    s.parse()
        .map_err(|e| anyhow::anyhow!("Invalid namespace ID '{}': {}", s, e))
}

/// Parse a blob hash from hex string
fn parse_hash(s: &str) -> Result<Hash> {
    s.parse()
        .map_err(|e| anyhow::anyhow!("Invalid hash '{}': {}", s, e))
}

/// Parse a node ID from hex string
fn parse_node_id(s: &str) -> Result<NodeId> {
    s.parse()
        .map_err(|e| anyhow::anyhow!("Invalid node ID '{}': {}", s, e))
}

fn format_nanos(nanos: u64) -> String {
    DateTime::<Utc>::from_timestamp_nanos(nanos as i64)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn format_secs(secs: u64) -> String {
    if secs == 0 {
        return "never".to_string();
    }
    DateTime::<Utc>::from_timestamp(secs as i64, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn print_report(report: &SyncReport) {
    println!(
        "Synced {} with {} node(s): {} ok, {} without namespace, {} failed",
        report.namespace,
        report.peers.len(),
        report.succeeded(),
        report.not_holding(),
        report.failed()
    );
    for peer in &report.peers {
        match &peer.result {
            Ok(stats) if stats.unknown_namespace => {
                println!("  {}  does not hold the namespace", peer.node.fmt_short());
            }
            Ok(stats) => println!(
                "  {}  received {}, sent {}, fetched {} blob(s), uploaded {} blob(s)",
                peer.node.fmt_short(),
                stats.entries_received,
                stats.entries_sent,
                stats.blobs_fetched,
                stats.blobs_sent
            ),
            Err(e) => println!("  {}  failed: {}", peer.node.fmt_short(), e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let mut iroh = IrohOptions::default().with_relay(!cli.no_relay);
    if let Some(port) = cli.port {
        iroh = iroh.with_bind_port(port);
    }
    let mut options = EngineOptions::default().with_iroh(iroh);
    if let Commands::Serve { interval, .. } = &cli.command {
        options = options.with_listen_interval(Duration::from_secs(*interval));
    }

    let engine = Engine::open_with(&data_dir, options)
        .await
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;

    tracing::debug!(data_dir = %data_dir.display(), node_id = %engine.node_id(), "Engine opened");

    let result = run(&engine, cli.command).await;
    if !engine.is_closed() {
        engine.shutdown().await?;
    }
    result
}

async fn run(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Info => {
            let info = engine.info().await?;

            println!("UniSync v0.1.0");
            println!();
            println!("Author: {}", info.author);
            println!();
            println!("Node:");
            println!("  ID: {}", info.node.node_id);
            if let Some(relay) = &info.node.relay_url {
                println!("  Relay: {}", relay);
            }
            for addr in &info.node.direct_addresses {
                println!("  Address: {}", addr);
            }
            println!();
            println!("Data directory: {}", info.data_dir.display());
            println!("Namespaces: {}", info.namespaces);
            println!("Known nodes: {}", info.known_nodes);
            println!("Blobs: {}", info.blobs);
        }

        Commands::Author => {
            println!("{}", engine.author()?);
        }

        Commands::Ns { action } => match action {
            NsAction::Create => {
                let ns = engine.create_namespace().await?;
                println!("{}", ns);
            }

            NsAction::List => {
                let namespaces = engine.list_namespaces()?;
                if namespaces.is_empty() {
                    println!("No namespaces found.");
                } else {
                    for record in namespaces {
                        println!(
                            "{}  {:?}  created {}",
                            record.id,
                            record.origin,
                            format_nanos(record.created_at)
                        );
                    }
                }
            }

            NsAction::Delete { namespace } => {
                let ns = parse_namespace(&namespace)?;
                engine.delete_namespace(ns).await?;
                println!("Deleted namespace {}", ns);
            }

            NsAction::Default => {
                let ns = engine.get_or_create_namespace().await?;
                println!("{}", ns);
            }
        },

        Commands::File { action } => match action {
            FileAction::Write {
                namespace,
                path,
                text,
                from,
            } => {
                let ns = parse_namespace(&namespace)?;
                let hash = match (text, from) {
                    (Some(text), _) => engine.write_file(ns, &path, text).await?,
                    (None, Some(source)) => engine.write_file_from(ns, &path, &source).await?,
                    (None, None) => {
                        let mut data = Vec::new();
                        std::io::stdin()
                            .read_to_end(&mut data)
                            .context("Failed to read stdin")?;
                        engine.write_file(ns, &path, data).await?
                    }
                };
                println!("{}", hash);
            }

            FileAction::Read { namespace, path } => {
                let ns = parse_namespace(&namespace)?;
                let data = engine.read_file(ns, &path).await?;
                let mut stdout = std::io::stdout();
                stdout.write_all(&data)?;
                stdout.flush()?;
            }

            FileAction::Delete { namespace, path } => {
                let ns = parse_namespace(&namespace)?;
                let hash = engine.delete_file(ns, &path).await?;
                println!("{}", hash);
            }

            FileAction::List { namespace, all } => {
                let ns = parse_namespace(&namespace)?;
                let entries = engine.list_files(ns, all)?;
                if entries.is_empty() {
                    println!("No files found.");
                } else {
                    for entry in entries {
                        let marker = if entry.deleted { "deleted" } else { "" };
                        println!(
                            "{}  {:>10}  {}  {}  {}",
                            entry.hash.fmt_short(),
                            entry.length,
                            format_nanos(entry.timestamp),
                            entry.path,
                            marker
                        );
                    }
                }
            }

            FileAction::Export {
                namespace,
                path,
                dest,
            } => {
                let ns = parse_namespace(&namespace)?;
                let written = engine.export_file(ns, &path, &dest).await?;
                println!("Exported {} bytes to {}", written, dest.display());
            }
        },

        Commands::Blob { action } => match action {
            BlobAction::Read { hash } => {
                let hash = parse_hash(&hash)?;
                let data = engine.read_file_hash(&hash).await?;
                let mut stdout = std::io::stdout();
                stdout.write_all(&data)?;
                stdout.flush()?;
            }

            BlobAction::Export { hash, dest } => {
                let hash = parse_hash(&hash)?;
                let written = engine.export_hash(&hash, &dest).await?;
                println!("Exported {} bytes to {}", written, dest.display());
            }

            BlobAction::Gc => {
                let removed = engine.gc().await?;
                println!("Removed {} blob(s)", removed);
            }
        },

        Commands::Share { namespace } => {
            let ns = parse_namespace(&namespace)?;
            let ticket = engine.share(ns).await?;
            println!("{}", ticket);
        }

        Commands::Import { ticket } => {
            let ticket: DocTicket = ticket.parse()?;
            let ns = engine.import(&ticket).await?;
            println!("{}", ns);
            match engine.last_sync_report(ns) {
                Some(report) => print_report(&report),
                None => println!("First sync did not run"),
            }
        }

        Commands::Sync { namespace } => {
            let ns = parse_namespace(&namespace)?;
            let report = engine.sync(ns).await?;
            print_report(&report);
        }

        Commands::Serve { namespace, .. } => {
            let namespaces = if namespace.is_empty() {
                engine.list_namespaces()?.into_iter().map(|r| r.id).collect()
            } else {
                namespace
                    .iter()
                    .map(|s| parse_namespace(s))
                    .collect::<Result<Vec<_>>>()?
            };

            println!("Starting UniSync...");
            println!("  Node: {}", engine.node_id());
            for ns in &namespaces {
                engine.listen(*ns)?;
                println!("  Listening: {}", ns);
            }
            println!();
            println!("Press Ctrl-C to stop.");

            tokio::signal::ctrl_c()
                .await
                .context("Failed to wait for Ctrl-C")?;
            println!();
            println!("Shutting down...");
            engine.shutdown().await?;
            println!("Goodbye.");
        }

        Commands::Nodes { action } => match action {
            NodesAction::List => {
                let nodes = engine.nodes()?;
                if nodes.is_empty() {
                    println!("No nodes found.");
                } else {
                    println!("Known nodes ({}):", nodes.len());
                    println!();
                    for node in nodes {
                        println!(
                            "  {} [{}] via {:?} ({} namespace(s))",
                            node.node_id(),
                            node.status,
                            node.source,
                            node.namespaces.len()
                        );
                        println!(
                            "    Last seen: {}  Attempts: {}  Successes: {}",
                            format_secs(node.last_seen),
                            node.connection_attempts,
                            node.successful_connections
                        );
                        if let Some(relay) = &node.addr.relay_url {
                            println!("    Relay: {}", relay);
                        }
                        for addr in &node.addr.direct_addresses {
                            println!("    Address: {}", addr);
                        }
                    }
                }
            }

            NodesAction::Reconnect => {
                let summary = engine.reconnect().await?;
                println!(
                    "Probed {} node(s): {} reachable",
                    summary.attempted,
                    summary.reachable.len()
                );
                for (node, reason) in &summary.unreachable {
                    println!("  {}  unreachable: {}", node.fmt_short(), reason);
                }
            }

            NodesAction::Remove { node_id } => {
                let id = parse_node_id(&node_id)?;
                if engine.remove_node(&id)? {
                    println!("Removed node {}", id);
                } else {
                    anyhow::bail!("Node {} is not known", id);
                }
            }
        },
    }

    Ok(())
}
