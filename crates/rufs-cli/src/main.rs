#![forbid(unsafe_code)]
//! RUFS command-line tools.
//!
//! One binary, three subcommands:
//!
//! - `mkfs` — install a filesystem on a device image;
//! - `fsck` — run every consistency validator, printing a step name and
//!   `[OK]` or the violated invariant; on failure the per-inode and
//!   per-cluster status tables are dumped to a log file for postmortem;
//! - `inspect` — print the superblock summary, optionally as JSON.
//!
//! Exit codes are success/failure only; detailed errors are printed,
//! not returned to the shell.

use anyhow::{bail, Context, Result};
use rufs_block::FileByteDevice;
use rufs_fs::{format, FormatOptions};
use rufs_fsck::Checker;
use rufs_ondisk::SuperBlock;
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    let rest: Vec<String> = args.collect();

    match command.as_str() {
        "mkfs" => mkfs_cmd(&rest),
        "fsck" => fsck_cmd(&rest),
        "inspect" => inspect_cmd(&rest),
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("rufs\n");
    println!("USAGE:");
    println!("  rufs mkfs [-n NAME] [-i COUNT] [-z] [-q] <device>");
    println!("  rufs fsck [--log PATH] <device>");
    println!("  rufs inspect <device> [--json]");
    println!();
    println!("mkfs options:");
    println!("  -n NAME   volume name (default \"rufs\")");
    println!("  -i COUNT  inode count (default: one per eight blocks)");
    println!("  -z        zero-fill free cluster bodies");
    println!("  -q        quiet mode");
}

// ── mkfs ────────────────────────────────────────────────────────────────────

fn mkfs_cmd(args: &[String]) -> Result<()> {
    let mut opts = FormatOptions::default();
    let mut quiet = false;
    let mut device: Option<PathBuf> = None;

    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-n" => {
                opts.name = it
                    .next()
                    .context("-n requires a volume name")?
                    .clone();
            }
            "-i" => {
                let count: u32 = it
                    .next()
                    .context("-i requires an inode count")?
                    .parse()
                    .context("inode count must be a number")?;
                if count == 0 {
                    bail!("inode count must be positive");
                }
                opts.itotal = Some(count);
            }
            "-z" => opts.zero = true,
            "-q" => quiet = true,
            other if device.is_none() && !other.starts_with('-') => {
                device = Some(PathBuf::from(other));
            }
            other => bail!("unexpected argument: {other}"),
        }
    }
    let device = device.context("mkfs requires a device path")?;

    let dev = FileByteDevice::open(&device)
        .with_context(|| format!("failed to open device {}", device.display()))?;
    if !dev.writable() {
        bail!("device {} is not writable", device.display());
    }

    if !quiet {
        println!("Installing a RUFS file system in {}.", device.display());
        print!("Formatting ... ");
        use std::io::Write as _;
        std::io::stdout().flush().ok();
    }
    let fs = format(dev, &opts)
        .with_context(|| format!("formatting {} failed", device.display()))?;
    if !quiet {
        println!("done.");
        let sb = fs.superblock();
        println!(
            "{} inodes, {} data clusters ({} free).",
            sb.itotal, sb.dzone_total, sb.dzone_free
        );
        println!("Formatting concluded.");
    }
    Ok(())
}

// ── fsck ────────────────────────────────────────────────────────────────────

fn fsck_cmd(args: &[String]) -> Result<()> {
    let mut log_path: Option<PathBuf> = None;
    let mut device: Option<PathBuf> = None;

    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--log" => {
                log_path = Some(PathBuf::from(
                    it.next().context("--log requires a path")?,
                ));
            }
            other if device.is_none() && !other.starts_with('-') => {
                device = Some(PathBuf::from(other));
            }
            other => bail!("unexpected argument: {other}"),
        }
    }
    let device = device.context("fsck requires a device path")?;

    let dev = FileByteDevice::open(&device)
        .with_context(|| format!("failed to open device {}", device.display()))?;
    let mut checker = Checker::open(dev)
        .with_context(|| format!("cannot read a superblock from {}", device.display()))?;

    let outcome = checker.run();
    for name in &outcome.passed {
        println!("Checking {name} ...\t[OK]");
    }
    match outcome.failure {
        None => {
            println!("All checks passed.");
            Ok(())
        }
        Some((step, err)) => {
            println!("Checking {step} ...\t[ERROR]");
            println!("{err}");

            let log_path = log_path.unwrap_or_else(|| default_log_path(&device));
            std::fs::write(&log_path, checker.status_dump())
                .with_context(|| format!("cannot write log file {}", log_path.display()))?;
            println!("Status tables dumped to {}.", log_path.display());
            bail!("filesystem is inconsistent: {err}")
        }
    }
}

fn default_log_path(device: &Path) -> PathBuf {
    let name = device
        .file_name()
        .map_or_else(|| "device".to_owned(), |n| n.to_string_lossy().into_owned());
    device.with_file_name(format!("{name}.fsck.log"))
}

// ── inspect ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    volume_name: String,
    total_blocks: u32,
    total_inodes: u32,
    free_inodes: u32,
    total_clusters: u32,
    free_clusters: u32,
    data_zone_start: u32,
    properly_unmounted: bool,
}

impl InspectOutput {
    fn from_superblock(sb: &SuperBlock) -> Self {
        Self {
            volume_name: sb.name_str(),
            total_blocks: sb.ntotal,
            total_inodes: sb.itotal,
            free_inodes: sb.ifree,
            total_clusters: sb.dzone_total,
            free_clusters: sb.dzone_free,
            data_zone_start: sb.dzone_start,
            properly_unmounted: sb.mstat == rufs_types::PROPERLY_UNMOUNTED,
        }
    }
}

fn inspect_cmd(args: &[String]) -> Result<()> {
    let mut device: Option<PathBuf> = None;
    let mut json = false;
    for arg in args {
        match arg.as_str() {
            "--json" => json = true,
            other if device.is_none() && !other.starts_with('-') => {
                device = Some(PathBuf::from(other));
            }
            other => bail!("unexpected argument: {other}"),
        }
    }
    let device = device.context("inspect requires a device path")?;

    let dev = FileByteDevice::open(&device)
        .with_context(|| format!("failed to open device {}", device.display()))?;
    let fs = rufs_fs::Fs::open(dev, rufs_fs::Credentials::default())
        .with_context(|| format!("{} does not hold a RUFS image", device.display()))?;
    let output = InspectOutput::from_superblock(fs.superblock());

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("RUFS Inspector");
        println!("volume_name: {}", output.volume_name);
        println!("total_blocks: {}", output.total_blocks);
        println!("total_inodes: {}", output.total_inodes);
        println!("free_inodes: {}", output.free_inodes);
        println!("total_clusters: {}", output.total_clusters);
        println!("free_clusters: {}", output.free_clusters);
        println!("data_zone_start: {}", output.data_zone_start);
        println!("properly_unmounted: {}", output.properly_unmounted);
    }
    Ok(())
}
