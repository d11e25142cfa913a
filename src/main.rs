mod ble;
mod decompress;
mod engine;
mod error;
mod manifest;
mod packet;
mod pnf;
mod session;
mod slip;
mod transport;
mod tui;
mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use btleplug::api::Peripheral as _;
use clap::{Parser, Subcommand, ValueEnum};

use crate::ble::{DiscoveredDevice, ShearwaterBleLink};
use crate::session::Session;
use crate::types::{DownloadProgress, DownloadedLog};

#[derive(Parser)]
#[command(name = "shearwater-dive")]
#[command(about = "Extract dive logs from Shearwater dive computers via BLE")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for Shearwater BLE devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,

        /// Connect to the first found device and enumerate its GATT services
        #[arg(short, long)]
        enumerate: bool,
    },

    /// Connect and query device info (model, serial, firmware)
    Info {
        /// BLE device address. If omitted, connects to the first Shearwater device found.
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Scan the manifest ring buffer and list dive candidates without downloading them
    Manifest {
        /// BLE device address. If omitted, connects to the first Shearwater device found.
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Download dive logs from the device
    Download {
        /// BLE device address. If omitted, connects to the first Shearwater device found.
        #[arg(short, long)]
        address: Option<String>,

        /// Output file path
        #[arg(short, long, default_value = "dives.json")]
        output: PathBuf,

        /// Save raw (decompressed, pre-parse) dive data for debugging
        #[arg(long)]
        save_raw: Option<PathBuf>,

        /// Output format
        #[arg(short, long, default_value = "json")]
        format: OutputFormat,
    },

    /// Parse a previously saved raw dive blob (offline, no BLE needed)
    Parse {
        /// Path to a raw dive blob (see `download --save-raw`)
        #[arg(short, long)]
        raw_file: PathBuf,

        /// Output file path
        #[arg(short, long, default_value = "dive.json")]
        output: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "json")]
        format: OutputFormat,
    },

    /// View downloaded dive logs in an interactive TUI (offline, no BLE needed)
    View {
        /// Input JSON file produced by `download`
        #[arg(short, long, default_value = "dives.json")]
        input: PathBuf,
    },
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan { timeout, enumerate } => cmd_scan(timeout, enumerate).await,
        Commands::Info { address } => cmd_info(address).await,
        Commands::Manifest { address } => cmd_manifest(address).await,
        Commands::Download {
            address,
            output,
            save_raw,
            format,
        } => cmd_download(address, output, save_raw, format).await,
        Commands::Parse {
            raw_file,
            output,
            format,
        } => cmd_parse(raw_file, output, format),
        Commands::View { input } => tui::run(input),
    }
}

// ── Scan ──

async fn cmd_scan(timeout_secs: u64, enumerate: bool) -> Result<()> {
    let adapter = ble::get_adapter().await?;

    eprintln!("Scanning for Shearwater BLE devices ({timeout_secs}s)...");
    let devices = ble::scan_for_devices(&adapter, Duration::from_secs(timeout_secs)).await?;

    if devices.is_empty() {
        eprintln!("No Shearwater devices found. Make sure the dive computer is awake and in range.");
        return Ok(());
    }

    println!("\nFound {} device(s):", devices.len());
    for (i, dev) in devices.iter().enumerate() {
        println!(
            "  [{}] {} - {} (RSSI: {})",
            i,
            dev.name,
            dev.address,
            dev.rssi
                .map(|r| format!("{r} dBm"))
                .unwrap_or_else(|| "?".into())
        );
    }

    if enumerate {
        let dev = &devices[0];
        eprintln!("\nConnecting to {}...", dev.name);
        dev.peripheral
            .connect()
            .await
            .context("connecting for GATT enumeration")?;

        let services = ble::enumerate_gatt(&dev.peripheral).await?;
        println!("\nGATT Profile for {}:", dev.name);
        for svc in &services {
            println!("  Service: {}", svc.uuid);
            for c in &svc.characteristics {
                println!("    Characteristic: {} [{}]", c.uuid, c.properties);
            }
        }

        dev.peripheral
            .disconnect()
            .await
            .context("disconnecting after GATT enumeration")?;
    }

    Ok(())
}

// ── Info ──

async fn cmd_info(address: Option<String>) -> Result<()> {
    let mut session = connect(address).await?;

    let info = session.read_device_info().await?;
    println!("Device Info:");
    println!("  Model:    {}", info.model_name);
    println!("  Serial:   {}", info.serial);
    println!("  Firmware: {}", info.firmware);

    session.close().await.context("closing session")?;
    Ok(())
}

// ── Manifest ──

async fn cmd_manifest(address: Option<String>) -> Result<()> {
    let mut session = connect(address).await?;

    let candidates = session.download_manifest().await?;
    println!("Found {} dive candidate(s):", candidates.len());
    for c in &candidates {
        println!(
            "  #{:<4} fingerprint {:02X}{:02X}{:02X}{:02X}  address 0x{:08X}",
            c.ordinal, c.fingerprint[0], c.fingerprint[1], c.fingerprint[2], c.fingerprint[3], c.absolute_address
        );
    }

    session.close().await.context("closing session")?;
    Ok(())
}

// ── Download ──

async fn cmd_download(
    address: Option<String>,
    output: PathBuf,
    save_raw: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let existing_logs = load_existing_logs(&output);
    let existing_fingerprints: std::collections::HashSet<[u8; 4]> =
        existing_logs.iter().map(fingerprint_of).collect();
    if !existing_logs.is_empty() {
        eprintln!("Loaded {} existing log(s) from {}", existing_logs.len(), output.display());
    }

    let mut session = connect(address).await?;

    let info = session.read_device_info().await?;
    eprintln!("Connected to {}", info.model_name);

    let candidates = session.download_manifest().await?;
    let skipped = candidates
        .iter()
        .filter(|c| existing_fingerprints.contains(&c.fingerprint))
        .count();
    if skipped > 0 {
        eprintln!("Skipped {skipped} already-downloaded dive(s)");
    }
    if skipped == candidates.len() {
        eprintln!("No new dives on device.");
        session.close().await.context("closing session")?;
        return Ok(());
    }
    eprintln!("Downloading {} new dive(s)", candidates.len() - skipped);

    let new_logs = session
        .download_dives(&candidates, Some(&existing_fingerprints), |p: DownloadProgress| {
            eprint!(
                "\rDownloading log {}/{} ({} bytes)...",
                p.current_log_index, p.total_logs, p.current_log_bytes
            );
        })
        .await?;
    eprintln!();

    if let Some(raw_dir) = &save_raw {
        std::fs::create_dir_all(raw_dir)?;
        for (i, log) in new_logs.iter().enumerate() {
            if let DownloadedLog::Stub(stub) = log {
                let path = raw_dir.join(format!("dive_{i:03}.raw"));
                std::fs::write(&path, &stub.raw_data)?;
                eprintln!("  Saved raw blob for failed parse -> {}", path.display());
            }
        }
    }

    session.close().await.context("closing session")?;

    let mut all_logs = existing_logs;
    all_logs.extend(new_logs);

    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&all_logs)?;
            std::fs::write(&output, &json)?;
            eprintln!("Dive data saved to {} ({} log(s) total)", output.display(), all_logs.len());
        }
        OutputFormat::Csv => write_logs_as_csv(&all_logs, &output)?,
    }

    Ok(())
}

/// Write one CSV file per parsed dive, alongside `output` (stub logs have no
/// sample profile to export, so they're skipped).
fn write_logs_as_csv(logs: &[DownloadedLog], output: &PathBuf) -> Result<()> {
    let stem = output.file_stem().unwrap_or_default().to_string_lossy();
    let dir = output.parent().unwrap_or(std::path::Path::new("."));
    for (i, log) in logs.iter().enumerate() {
        if let DownloadedLog::Parsed(dive) = log {
            let csv_path = dir.join(format!("{stem}_{i:03}.csv"));
            let csv = pnf::dive_to_csv(dive);
            std::fs::write(&csv_path, &csv)?;
            eprintln!("  Dive #{i} -> {}", csv_path.display());
        }
    }
    Ok(())
}

/// Load previously downloaded logs from `path` for incremental sync. Missing
/// or unparseable files are treated as "nothing downloaded yet", not a hard
/// error, so a corrupt output file never blocks a fresh download.
fn load_existing_logs(path: &PathBuf) -> Vec<DownloadedLog> {
    if !path.exists() {
        return Vec::new();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(logs) => logs,
            Err(e) => {
                eprintln!("Warning: could not parse {}: {e}", path.display());
                Vec::new()
            }
        },
        Err(e) => {
            eprintln!("Warning: could not read {}: {e}", path.display());
            Vec::new()
        }
    }
}

fn fingerprint_of(log: &DownloadedLog) -> [u8; 4] {
    match log {
        DownloadedLog::Parsed(dive) => dive.fingerprint,
        DownloadedLog::Stub(stub) => stub.fingerprint,
    }
}

// ── Parse (offline) ──

fn cmd_parse(raw_file: PathBuf, output: PathBuf, format: OutputFormat) -> Result<()> {
    let blob = std::fs::read(&raw_file).with_context(|| format!("reading {}", raw_file.display()))?;

    match pnf::parse(&blob) {
        Some(dive) => {
            eprintln!(
                "Parsed dive: {} | {:.1}m | {}s | {} samples",
                dive.start_time.format("%Y-%m-%d %H:%M"),
                dive.max_depth_m,
                dive.duration_s,
                dive.samples.len(),
            );
            match format {
                OutputFormat::Json => {
                    let json = serde_json::to_string_pretty(&dive)?;
                    std::fs::write(&output, &json)?;
                    eprintln!("Dive data saved to {}", output.display());
                }
                OutputFormat::Csv => {
                    let csv = pnf::dive_to_csv(&dive);
                    std::fs::write(&output, &csv)?;
                    eprintln!("Dive data saved to {}", output.display());
                }
            }
        }
        None => bail!("could not parse {} as a dive blob", raw_file.display()),
    }

    Ok(())
}

// ── Shared connect helper ──

async fn connect(address: Option<String>) -> Result<Session> {
    let adapter = ble::get_adapter().await?;
    let dev = find_device(&adapter, address.as_deref()).await?;

    eprintln!("Connecting to {}...", dev.name);
    let link = ShearwaterBleLink::connect(&dev.peripheral)
        .await
        .context("establishing BLE link")?;

    Session::new(Arc::new(link)).await.context("starting transport")
}

async fn find_device(adapter: &btleplug::platform::Adapter, address: Option<&str>) -> Result<DiscoveredDevice> {
    eprintln!("Scanning for Shearwater devices...");
    let devices = ble::scan_for_devices(adapter, Duration::from_secs(10)).await?;

    if devices.is_empty() {
        bail!("No Shearwater devices found. Make sure the dive computer is awake and in range.");
    }

    if let Some(addr) = address {
        let addr_upper = addr.to_uppercase();
        devices
            .into_iter()
            .find(|d| d.address.to_uppercase() == addr_upper)
            .with_context(|| format!("device with address {addr} not found"))
    } else {
        eprintln!("Connecting to first device: {}", devices[0].name);
        Ok(devices.into_iter().next().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_existing_logs_round_trips_stub_entries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let logs = vec![DownloadedLog::Stub(crate::types::StubDive {
            fingerprint: [0xAA, 0x11, 0xBB, 0x22],
            raw_data: vec![1, 2, 3],
            error: "PNF parser produced no dive".to_string(),
        })];
        write!(file, "{}", serde_json::to_string(&logs).unwrap()).unwrap();

        let loaded = load_existing_logs(&file.path().to_path_buf());
        assert_eq!(loaded.len(), 1);
        assert_eq!(fingerprint_of(&loaded[0]), [0xAA, 0x11, 0xBB, 0x22]);
    }

    #[test]
    fn load_existing_logs_returns_empty_for_missing_file() {
        let loaded = load_existing_logs(&PathBuf::from("/nonexistent/dives.json"));
        assert!(loaded.is_empty());
    }
}
