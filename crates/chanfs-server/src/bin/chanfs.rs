//! chanfs CLI - serve a channel tree, or upload/download single files
//!
//! Usage:
//!   chanfs serve [--root <dir>] [--port <port>]     Run the transfer server
//!   chanfs upload <local> <remote>                   Upload a file
//!   chanfs download <remote> <local>                 Download a file
//!   chanfs config [--write]                          Print or write a sample config

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chanfs_core::Config;
use chanfs_server::{FsStorage, TransferClient, TransferServer};

#[derive(Parser)]
#[command(name = "chanfs")]
#[command(about = "Channel-based file transfer server", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "CHANFS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the transfer server
    Serve {
        /// Storage root holding one directory per channel
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// Additional channel to serve (repeatable)
        #[arg(long = "channel")]
        channels: Vec<String>,

        /// Chunk buffer size in bytes
        #[arg(long)]
        buffer_size: Option<usize>,

        /// Accept uploads that declare an empty file
        #[arg(long)]
        allow_empty: bool,
    },

    /// Upload a local file
    Upload {
        /// Local file to send
        local: PathBuf,

        /// Destination path inside the channel (e.g. dir/file.txt)
        remote: String,

        #[command(flatten)]
        target: Target,
    },

    /// Download a file
    Download {
        /// Source path inside the channel
        remote: String,

        /// Local destination
        local: PathBuf,

        #[command(flatten)]
        target: Target,
    },

    /// Print a sample config file
    Config {
        /// Write the sample to the config path instead of printing it
        #[arg(long)]
        write: bool,
    },
}

#[derive(clap::Args)]
struct Target {
    /// Server address (defaults to localhost and the configured port)
    #[arg(short, long)]
    server: Option<String>,

    /// Channel (defaults to the server's default channel)
    #[arg(short, long)]
    channel: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let config = match &cli.config {
        Some(path) => {
            Config::load_from(path).with_context(|| format!("loading config {:?}", path))?
        }
        None => Config::load(),
    };

    match cli.command {
        Commands::Serve {
            root,
            port,
            bind,
            channels,
            buffer_size,
            allow_empty,
        } => {
            let mut config = config;
            if let Some(root) = root {
                config.storage.root = root;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            for channel in channels {
                if !config.storage.channels.contains(&channel) {
                    config.storage.channels.push(channel);
                }
            }
            if let Some(buffer_size) = buffer_size {
                config.storage.buffer_size = buffer_size;
            }
            if allow_empty {
                config.storage.reject_empty_uploads = false;
            }
            run_serve(config).await
        }
        Commands::Upload {
            local,
            remote,
            target,
        } => {
            let client = client_for(&config, target);
            let size = client.upload_file(&local, &remote).await?;
            println!("{} -> {} ({} bytes)", local.display(), remote, size);
            Ok(())
        }
        Commands::Download {
            remote,
            local,
            target,
        } => {
            let client = client_for(&config, target);
            let size = client.download_file(&remote, &local).await?;
            println!("{} -> {} ({} bytes)", remote, local.display(), size);
            Ok(())
        }
        Commands::Config { write } => {
            if !write {
                print!("{}", Config::sample());
                return Ok(());
            }
            let Some(path) = cli.config.or_else(Config::default_path) else {
                bail!("no config directory available; pass --config");
            };
            Config::default().save_to(&path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
    }
}

async fn run_serve(config: Config) -> Result<()> {
    config.validate()?;

    let storage = FsStorage::from_config(&config.storage);
    storage
        .prepare()
        .await
        .with_context(|| format!("preparing storage root {:?}", config.storage.root))?;

    info!("Starting chanfs server...");
    info!("  Storage: {:?}", config.storage.root);
    info!("  Channels: {}", config.storage.channels.join(", "));
    info!("  Default channel: {}", config.storage.default_channel);

    let server = TransferServer::new(&config, Arc::new(storage));
    server.serve().await?;

    info!("Shut down cleanly");
    Ok(())
}

fn client_for(config: &Config, target: Target) -> TransferClient {
    let addr = target
        .server
        .unwrap_or_else(|| format!("localhost:{}", config.server.port));

    let client = TransferClient::new(addr)
        .with_buffer_size(config.storage.buffer_size)
        .with_timeout(config.server.io_timeout());

    match target.channel {
        Some(channel) => client.with_channel(channel),
        None => client,
    }
}
