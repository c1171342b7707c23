//! ChunkIO CLI - Admin Command Line Interface
//!
//! Drives chunked volumes through a helper program: probe the backend,
//! move whole volumes in and out, query sizes, list blobs, truncate.

use anyhow::{Context, Result};
use chunkio_common::is_chunk_name;
use chunkio_engine::{ChunkedDevice, OpenMode, setup_device};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{Read, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const COPY_BUFFER: usize = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "chunkio")]
#[command(about = "ChunkIO Admin CLI")]
#[command(version)]
struct Args {
    /// Device options, e.g. "program=s3.sh,iothreads=2,BUCKET=backup"
    #[arg(short = 'o', long, env = "CHUNKIO_DEVICE_OPTIONS")]
    device_options: String,

    /// Directory against which a relative helper path is resolved
    #[arg(long)]
    scripts_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Probe the backing store through the helper program
    Test,
    /// Write a local file into a volume
    Put {
        volume: String,
        file: PathBuf,
    },
    /// Read a whole volume into a local file
    Get {
        volume: String,
        file: PathBuf,
    },
    /// Print the logical volume size in bytes
    Size {
        volume: String,
    },
    /// List the blobs under a volume namespace as JSON
    List {
        volume: String,
        /// Only list blobs named like chunks
        #[arg(long)]
        chunks_only: bool,
    },
    /// Remove every chunk of a volume
    Truncate {
        volume: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut dev = setup_device(&args.device_options, args.scripts_dir.as_deref())
        .context("device setup failed")?;

    match args.command {
        Commands::Test => {
            dev.check_connection().context("connection test failed")?;
            println!("backend reachable");
        }
        Commands::Put { volume, file } => {
            let written = put_volume(&mut dev, &volume, &file)
                .with_context(|| format!("uploading {} to volume {volume}", file.display()))?;
            println!("{written} bytes written to {volume}");
        }
        Commands::Get { volume, file } => {
            let read = get_volume(&mut dev, &volume, &file)
                .with_context(|| format!("downloading volume {volume} to {}", file.display()))?;
            println!("{read} bytes read from {volume}");
        }
        Commands::Size { volume } => {
            dev.open(&volume, OpenMode::Read)?;
            let size = dev.volume_size()?;
            println!("{size}");
        }
        Commands::List { volume, chunks_only } => {
            let mut listing = dev.list_chunks(&volume)?;
            if chunks_only {
                listing.retain(|name, _| is_chunk_name(name));
            }
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        Commands::Truncate { volume } => {
            dev.open(&volume, OpenMode::ReadWrite)?;
            dev.truncate(&volume)?;
            dev.close()?;
            println!("volume {volume} truncated");
        }
    }
    Ok(())
}

fn put_volume(dev: &mut ChunkedDevice, volume: &str, file: &Path) -> Result<u64> {
    let mut input = File::open(file)?;
    dev.open(volume, OpenMode::ReadWrite)?;

    let mut buf = vec![0u8; COPY_BUFFER];
    let mut total: u64 = 0;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        dev.write(&buf[..n])?;
        total += n as u64;
    }
    dev.close()?;
    dev.flush()?;
    Ok(total)
}

fn get_volume(dev: &mut ChunkedDevice, volume: &str, file: &Path) -> Result<u64> {
    let mut output = File::create(file)?;
    dev.open(volume, OpenMode::Read)?;
    dev.seek(SeekFrom::Start(0))?;

    let mut buf = vec![0u8; COPY_BUFFER];
    let mut total: u64 = 0;
    loop {
        let n = dev.read(&mut buf)?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n])?;
        total += n as u64;
    }
    dev.close()?;
    Ok(total)
}
