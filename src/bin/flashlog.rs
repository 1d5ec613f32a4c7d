//! flashlog CLI
//!
//! Inspect and edit a flash image file with the flashlog file system

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use flashlog_rs::{FlashFs, FlashFsBuilder, FsConfig, Geometry, MmapFlash};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "flashlog")]
#[command(about = "Log-structured flash file system image tool")]
struct Args {
    /// Path to the flash image file
    #[arg(short = 'i', long)]
    image: PathBuf,

    /// Device size in bytes
    #[arg(long, default_value = "1048576")]
    device_size: u64,

    /// Erase sector size in bytes
    #[arg(long, default_value = "65536")]
    sector_size: u32,

    /// Cluster size in bytes
    #[arg(long, default_value = "512")]
    cluster_size: u32,

    /// TOML file with file system settings
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the image (if needed) and format it
    Format,
    /// List files with their sizes and creation times
    Ls,
    /// Copy a host file into the image
    Put {
        source: PathBuf,
        /// Name inside the image (defaults to the host file name)
        name: Option<String>,
    },
    /// Copy a file out of the image
    Get {
        name: String,
        /// Host path to write (defaults to stdout)
        destination: Option<PathBuf>,
    },
    /// Delete a file
    Rm { name: String },
    /// Rename a file
    Mv { source: String, destination: String },
    /// Copy a file inside the image
    Cp {
        source: String,
        destination: String,
        /// Replace an existing destination
        #[arg(short, long)]
        force: bool,
    },
    /// Reclaim all orphaned clusters
    Compact,
    /// Print space accounting
    Stats {
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },
}

fn open_image(args: &Args, geometry: Geometry, config: FsConfig) -> anyhow::Result<FlashFs<MmapFlash>> {
    if let Command::Format = args.command {
        let flash = if args.image.exists() {
            MmapFlash::open(&args.image, geometry)?
        } else {
            info!("Creating image {:?} ({} bytes)", args.image, geometry.device_size);
            MmapFlash::create(&args.image, geometry)?
        };
        let fs = FlashFs::with_config(flash, config)?;
        fs.format()?;
        return Ok(fs);
    }

    if !args.image.exists() {
        bail!("image {:?} does not exist; run `flashlog format` first", args.image);
    }
    let flash = MmapFlash::open(&args.image, geometry)?;
    let fs = FlashFsBuilder::new(flash)
        .config(config)
        .mount()
        .with_context(|| format!("Failed to mount {:?}", args.image))?;
    Ok(fs)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let args = Args::parse();
    let geometry = Geometry::new(args.device_size, args.sector_size, args.cluster_size);
    let config = match &args.config {
        Some(path) => FsConfig::from_path(path)?,
        None => FsConfig::default(),
    };

    let fs = open_image(&args, geometry, config)?;

    match &args.command {
        Command::Format => {
            let stats = fs.get_stats()?;
            println!(
                "Formatted {:?}: {} clusters, {} bytes free",
                args.image, stats.total_clusters, stats.bytes_free
            );
        }
        Command::Ls => {
            for name in fs.get_files()? {
                let size = fs.get_file_size(&name)?;
                let created = fs.get_file_creation_time(&name)?;
                println!("{:>10}  {}  {}", size, created.format("%Y-%m-%d %H:%M:%S"), name);
            }
        }
        Command::Put { source, name } => {
            let data = std::fs::read(source).with_context(|| format!("Failed to read {:?}", source))?;
            let name = match name {
                Some(name) => name.clone(),
                None => source
                    .file_name()
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
                    .context("source has no usable file name")?,
            };
            fs.write_all_bytes(&name, &data)?;
            info!("Stored {} bytes as {}", data.len(), name);
        }
        Command::Get { name, destination } => {
            let data = fs.read_all_bytes(name)?;
            match destination {
                Some(path) => {
                    std::fs::write(path, &data).with_context(|| format!("Failed to write {:?}", path))?
                }
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&data)?;
                }
            }
        }
        Command::Rm { name } => fs.delete(name)?,
        Command::Mv {
            source,
            destination,
        } => fs.move_file(source, destination)?,
        Command::Cp {
            source,
            destination,
            force,
        } => fs.copy(source, destination, *force)?,
        Command::Compact => {
            let before = fs.get_stats()?;
            fs.compact()?;
            let after = fs.get_stats()?;
            println!(
                "Reclaimed {} bytes ({} bytes free)",
                before.bytes_orphaned.saturating_sub(after.bytes_orphaned),
                after.bytes_free
            );
        }
        Command::Stats { json } => {
            let stats = fs.get_stats()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Files:     {}", stats.file_count);
                println!("Clusters:  {}", stats.total_clusters);
                println!("Free:      {} bytes ({} clusters)", stats.bytes_free, stats.free_clusters);
                println!(
                    "Orphaned:  {} bytes ({} clusters)",
                    stats.bytes_orphaned, stats.orphaned_clusters
                );
                println!("Head:      sector {}", stats.head_sector);
                println!("Tail:      cluster {}", stats.tail_cluster);
            }
        }
    }

    fs.with_engine(|engine| engine.device().sync())?;
    Ok(())
}
