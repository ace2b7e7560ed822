use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;

use bitswarm::config::{ClientConfig, HashingConfig, TrackerConfig};
use bitswarm::constants::{DEFAULT_PIECE_LENGTH, DEFAULT_PORT, DEFAULT_TRACKER_PORT};
use bitswarm::metainfo::{Metainfo, TorrentBuilder};
use bitswarm::server::TrackerServer;
use bitswarm::session::Client;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// More logging; repeat for trace output.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an HTTP tracker.
    Tracker {
        #[arg(long, default_value_t = DEFAULT_TRACKER_PORT)]
        port: u16,
        /// Announce interval handed to clients, in seconds.
        #[arg(long, default_value_t = 1800)]
        interval: u64,
        /// Seconds of silence after which a peer is dropped.
        #[arg(long, default_value_t = 3600)]
        expiry: u64,
        /// Keep torrents whose swarms emptied.
        #[arg(long)]
        keep_empty: bool,
    },
    /// Build a torrent file from a file or directory.
    Create {
        path: PathBuf,
        #[arg(long)]
        announce: String,
        /// Defaults to `<name>.torrent` in the working directory.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = DEFAULT_PIECE_LENGTH)]
        piece_length: u64,
        #[arg(long)]
        created_by: Option<String>,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Share complete content until interrupted.
    Seed {
        torrent: PathBuf,
        dir: PathBuf,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Download content, then exit unless asked to keep seeding.
    Leech {
        torrent: PathBuf,
        dir: PathBuf,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
        #[arg(long)]
        keep_seeding: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let result = match cli.command {
        Commands::Tracker {
            port,
            interval,
            expiry,
            keep_empty,
        } => {
            let config = TrackerConfig::default()
                .with_bind_addr(SocketAddr::from(([0, 0, 0, 0], port)))
                .with_announce_interval(Duration::from_secs(interval))
                .with_peer_expiry(Duration::from_secs(expiry))
                .with_remove_peerless_torrents(!keep_empty);
            run_tracker(config).await
        }
        Commands::Create {
            path,
            announce,
            output,
            piece_length,
            created_by,
            comment,
        } => {
            let mut builder = TorrentBuilder::new(&path)
                .announce(announce)
                .piece_length(piece_length)
                .hashing(HashingConfig::from_env());
            if let Some(created_by) = created_by {
                builder = builder.created_by(created_by);
            }
            if let Some(comment) = comment {
                builder = builder.comment(comment);
            }
            let output = output.unwrap_or_else(|| default_output(&path));
            create(builder, path.is_dir(), output).await
        }
        Commands::Seed { torrent, dir, port } => share(&torrent, dir, port, None).await,
        Commands::Leech {
            torrent,
            dir,
            port,
            keep_seeding,
        } => share(&torrent, dir, port, Some(keep_seeding)).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

type CliResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

async fn run_tracker(config: TrackerConfig) -> CliResult {
    let tracker = TrackerServer::start(config).await?;
    info!(announce = %tracker.announce_url(), "tracker ready");
    tokio::signal::ctrl_c().await?;
    tracker.stop().await;
    Ok(())
}

fn default_output(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "torrent".into(), |n| n.to_string_lossy().into_owned());
    PathBuf::from(format!("{name}.torrent"))
}

async fn create(builder: TorrentBuilder, directory: bool, output: PathBuf) -> CliResult {
    let bytes = tokio::task::spawn_blocking(move || {
        let builder = if directory {
            builder.add_directory()?
        } else {
            builder
        };
        builder.build()
    })
    .await??;

    let metainfo = Metainfo::from_bytes(&bytes)?;
    tokio::fs::write(&output, &bytes).await?;
    info!(
        output = %output.display(),
        info_hash = %metainfo.info_hash,
        pieces = metainfo.info.piece_count(),
        "torrent written"
    );
    Ok(())
}

/// Seeds when `leech` is `None`; otherwise downloads and, if the flag is
/// set, keeps seeding afterwards.
async fn share(torrent: &Path, dir: PathBuf, port: u16, leech: Option<bool>) -> CliResult {
    let metainfo = Metainfo::from_file(torrent)?;
    let config = ClientConfig::default()
        .with_listen_addr(SocketAddr::from(([0, 0, 0, 0], port)))
        .with_hashing(HashingConfig::from_env());
    let client = Client::start(config)?;
    let session = client.add_torrent(metainfo, dir).await?;

    let keep_running = match leech {
        None => {
            if !session.is_complete() {
                warn!(torrent = %session.name(), "content is incomplete; seeding what is present");
            }
            true
        }
        Some(keep_seeding) => {
            let mut completion = session.subscribe_completion();
            tokio::select! {
                done = completion.wait_for(|done| *done) => {
                    if done.is_ok() {
                        info!(torrent = %session.name(), "download complete");
                    }
                    keep_seeding
                }
                _ = tokio::signal::ctrl_c() => false,
            }
        }
    };

    if keep_running {
        info!(torrent = %session.name(), "seeding; press ctrl-c to stop");
        tokio::signal::ctrl_c().await?;
    }
    client.stop().await?;
    Ok(())
}
