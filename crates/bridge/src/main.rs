//! devbridge
//!
//! Lists, scans and pulls files from devices reachable through unreliable
//! access channels.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bridge::access::{RemoteFileEntry, SizeSource, TransferResult};
use bridge::config::{default_config_path, Config};
use bridge::transfer::{classify_targets, TransferEvent};
use bridge::{
    DeviceBridge, IntegrityVerifier, ResumeManager, RetryManager, ScanOutcome, TransferPool,
};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

/// devbridge - resilient device access and resumable, verified file retrieval.
#[derive(Parser, Debug)]
#[command(name = "devbridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// List attached and configured devices
    Devices,

    /// Resolve a device to a path or handle without connecting
    Resolve {
        /// Device display name
        device: String,

        /// USB vendor ID used when no device has the exact name
        #[arg(long)]
        vendor_id: Option<String>,

        /// USB product ID used when no device has the exact name
        #[arg(long)]
        product_id: Option<String>,
    },

    /// List the files of a device
    Scan {
        /// Device display name
        device: String,

        /// Base path on the device
        #[arg(long, default_value = "")]
        path: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Copy files from a device, resuming interrupted transfers
    Pull {
        /// Device display name
        device: String,

        /// Destination directory
        dest: PathBuf,

        /// Base path on the device
        #[arg(long, default_value = "")]
        path: String,

        /// Copy every file, not only target types
        #[arg(long)]
        all: bool,
    },

    /// Show interrupted transfers waiting to be resumed
    Pending,

    /// Remove checkpoints older than the configured (or given) age
    Cleanup {
        /// Maximum checkpoint age in seconds
        #[arg(long)]
        max_age_secs: Option<u64>,
    },

    /// Show per-method access statistics
    Stats {
        /// Output in JSON format
        #[arg(long)]
        json: bool,

        /// Forget all recorded statistics
        #[arg(long)]
        reset: bool,
    },

    /// Print the digest of a local file
    Hash {
        file: PathBuf,

        /// Digest algorithm (defaults to the configured one)
        #[arg(long)]
        algorithm: Option<String>,
    },

    /// Check a local file against an expected digest
    Verify {
        file: PathBuf,

        /// Expected digest, hex
        digest: String,

        /// Digest algorithm (defaults to the configured one)
        #[arg(long)]
        algorithm: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    let _log_guard = bridge::logging::init(
        &config.general.log_level,
        cli.verbose,
        config.general.log_file.as_deref(),
    )?;
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Devices => list_devices(&config),
        Commands::Resolve {
            device,
            vendor_id,
            product_id,
        } => {
            let bridge = open_bridge(&config);
            let path = bridge.get_device_path(
                &device,
                vendor_id.as_deref().unwrap_or_default(),
                product_id.as_deref().unwrap_or_default(),
            );
            bridge.retry_manager().persist();
            match path {
                Ok(path) => {
                    println!("{path}");
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("{}", e.detailed());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Scan { device, path, json } => {
            let bridge = Arc::new(open_bridge(&config));
            let outcome = match scan(bridge, device, path).await? {
                Ok(outcome) => outcome,
                Err(code) => return Ok(code),
            };
            let mut entries = outcome.entries;
            classify_targets(&mut entries, &config.transfer.target_extensions);

            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print_entries(&entries);
                println!("Listed through {}", outcome.method);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Pull {
            device,
            dest,
            path,
            all,
        } => pull(&config, device, dest, path, all).await,
        Commands::Pending => {
            let resume = ResumeManager::open(config.general.resume_dir())?;
            let states = resume.list()?;
            if states.is_empty() {
                println!("No interrupted transfers.");
            }
            for state in states {
                let total = match state.size_source {
                    SizeSource::Measured => format_bytes(state.total_bytes),
                    _ => "?".to_string(),
                };
                println!(
                    "  {}  {} / {}  ({} ago)",
                    state.source_path,
                    format_bytes(state.copied_bytes),
                    total,
                    format_duration(state.age())
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cleanup { max_age_secs } => {
            let resume = ResumeManager::open(config.general.resume_dir())?;
            let max_age = max_age_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.transfer.checkpoint_max_age());
            let removed = resume.cleanup_expired(max_age)?;
            println!("Removed {removed} expired checkpoint(s)");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stats { json, reset } => {
            let retry = open_retry(&config);
            if reset {
                retry.reset_all();
                retry.save()?;
                println!("Statistics cleared");
                return Ok(ExitCode::SUCCESS);
            }
            let stats = retry.statistics();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else if stats.is_empty() {
                println!("No access attempts recorded.");
            } else {
                for s in &stats {
                    let excluded = if retry.should_skip(s.method) {
                        "  (excluded)"
                    } else {
                        ""
                    };
                    println!("  {:<18} {}{}", s.method, s.summary(), excluded);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Hash { file, algorithm } => {
            let verifier = verifier_for(&config, algorithm.as_deref());
            let digest = verifier
                .calculate_hash(&file)
                .with_context(|| format!("Failed to hash {}", file.display()))?;
            println!("{}  {}", digest, file.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Verify {
            file,
            digest,
            algorithm,
        } => {
            let verifier = verifier_for(&config, algorithm.as_deref());
            match verifier.verify(&file, &digest) {
                Ok(_) => {
                    println!("{}: OK ({})", file.display(), verifier.algorithm().as_str());
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("{}: {}", file.display(), e);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

fn open_retry(config: &Config) -> Arc<RetryManager> {
    let policy = config.retry.policy();
    let manager = if config.retry.persist_statistics {
        RetryManager::with_persistence(policy, config.general.statistics_path())
    } else {
        RetryManager::new(policy)
    };
    Arc::new(manager)
}

fn open_bridge(config: &Config) -> DeviceBridge {
    DeviceBridge::from_config(config, open_retry(config))
}

fn verifier_for(config: &Config, algorithm: Option<&str>) -> IntegrityVerifier {
    IntegrityVerifier::from_name(algorithm.unwrap_or(&config.transfer.digest_algorithm))
}

fn list_devices(config: &Config) -> anyhow::Result<ExitCode> {
    let devices = open_bridge(config).list_available_devices()?;
    if devices.is_empty() {
        println!("No devices found.");
        return Ok(ExitCode::SUCCESS);
    }
    println!("Devices:");
    for device in devices {
        let handle = if device.native_handle.is_empty() {
            "-"
        } else {
            device.native_handle.as_str()
        };
        println!(
            "  {} [{}:{}] {}",
            device.display_name, device.vendor_id, device.product_id, handle
        );
    }
    Ok(ExitCode::SUCCESS)
}

/// Scans on a blocking thread. The inner error carries the exit code after
/// the failure has been reported.
async fn scan(
    bridge: Arc<DeviceBridge>,
    device: String,
    path: String,
) -> anyhow::Result<Result<ScanOutcome, ExitCode>> {
    let outcome = tokio::task::spawn_blocking(move || {
        bridge
            .retry_manager()
            .scan_with_retry_detailed(bridge.as_ref(), &device, &path)
    })
    .await
    .context("Scan task failed")?;

    match outcome {
        Ok(outcome) => Ok(Ok(outcome)),
        Err(e) => {
            eprintln!("Scan failed: {}", e.detailed());
            Ok(Err(ExitCode::FAILURE))
        }
    }
}

async fn pull(
    config: &Config,
    device: String,
    dest: PathBuf,
    path: String,
    all: bool,
) -> anyhow::Result<ExitCode> {
    let bridge = Arc::new(open_bridge(config));
    let outcome = match scan(bridge.clone(), device.clone(), path).await? {
        Ok(outcome) => outcome,
        Err(code) => return Ok(code),
    };

    let mut entries = outcome.entries;
    classify_targets(&mut entries, &config.transfer.target_extensions);
    if config.transfer.only_target_types && !all {
        let before = entries.len();
        entries.retain(|e| e.is_target_type);
        tracing::info!(kept = entries.len(), skipped = before - entries.len(), "Filtered by type");
    }
    if entries.is_empty() {
        println!("Nothing to transfer.");
        return Ok(ExitCode::SUCCESS);
    }

    let channel = {
        let bridge = bridge.clone();
        let method = outcome.method;
        tokio::task::spawn_blocking(move || bridge.channel_for(&device, method))
            .await
            .context("Connect task failed")??
    };

    std::fs::create_dir_all(&dest)
        .with_context(|| format!("Failed to create destination: {}", dest.display()))?;
    let resume = ResumeManager::open(config.general.resume_dir())?;
    resume.cleanup_expired(config.transfer.checkpoint_max_age())?;

    let pool = TransferPool::new(
        channel,
        Arc::new(resume),
        verifier_for(config, None),
        config.transfer.options(),
        config.transfer.max_concurrency,
    );

    let token = pool.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, checkpointing in-flight transfers");
            token.cancel();
        }
    });
    let progress = tokio::spawn(report_progress(pool.subscribe()));

    let results = pool.transfer_all(entries, &dest).await;

    interrupt.abort();
    progress.abort();
    bridge.close_all();

    Ok(print_results(&results, &dest))
}

async fn report_progress(mut events: tokio::sync::broadcast::Receiver<TransferEvent>) {
    loop {
        match events.recv().await {
            Ok(TransferEvent::Started {
                path,
                resumed_from,
                ..
            }) if resumed_from > 0 => {
                tracing::info!(path = %path, offset = resumed_from, "Resuming");
            }
            Ok(TransferEvent::Checkpoint {
                path, copied_bytes, ..
            }) => {
                tracing::debug!(path = %path, copied = copied_bytes, "Checkpoint");
            }
            Ok(TransferEvent::Finished {
                path,
                success,
                skipped,
                bytes_copied,
            }) => {
                tracing::info!(path = %path, success, skipped, bytes = bytes_copied, "Finished");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => tracing::debug!("Dropped {} progress events", n),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_results(results: &[TransferResult], dest: &Path) -> ExitCode {
    let mut copied = 0;
    let mut skipped = 0;
    let mut failed = 0;
    let mut bytes = 0u64;

    for result in results {
        if result.skipped {
            skipped += 1;
        } else if result.success {
            copied += 1;
            bytes += result.bytes_copied;
        } else {
            failed += 1;
            match &result.error {
                Some(e) => eprintln!("  FAILED {}: {}", result.file.relative_path, e.detailed()),
                None => eprintln!("  FAILED {}", result.file.relative_path),
            }
        }
    }

    println!(
        "Copied {} file(s) ({}) to {}, skipped {}, failed {}",
        copied,
        format_bytes(bytes),
        dest.display(),
        skipped,
        failed
    );
    if failed > 0 {
        println!("Run the same command again to resume failed transfers.");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Print entries as an aligned table.
fn print_entries(entries: &[RemoteFileEntry]) {
    if entries.is_empty() {
        println!("No files.");
        return;
    }

    println!("{:>10}  {:<4}  PATH", "SIZE", "TYPE");
    for entry in entries {
        let size = match entry.size_source {
            SizeSource::Measured => format_bytes(entry.size),
            SizeSource::Estimated => format!("~{}", format_bytes(entry.size)),
            SizeSource::Unknown => "?".to_string(),
        };
        let kind = if entry.is_target_type { "*" } else { "" };
        println!("{:>10}  {:<4}  {}", size, kind, entry.relative_path);
    }
    println!();
    println!("Total: {} file(s)", entries.len());
}

/// Format a byte count with a binary unit (e.g., "1.5 MiB").
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Format a duration in a human-readable way (e.g., "2h 5m").
fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let days = secs / 86400;
    let hours = (secs % 86400) / 3600;
    let minutes = (secs % 3600) / 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m", minutes)
    } else {
        format!("{}s", secs)
    }
}
