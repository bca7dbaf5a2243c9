use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use hardhat_core::{Gallery, GalleryLoad, OnnxFaceAnalyzer};
use hardhat_hw::frame::is_dark_frame;
use hardhat_hw::Camera;
use hardhat_ledger::{AttendanceLedger, AttendanceRecord};
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.freedesktop.Hardhat1",
    default_service = "org.freedesktop.Hardhat1",
    default_path = "/org/freedesktop/Hardhat1"
)]
trait Hardhat {
    fn status(&self) -> zbus::Result<String>;
    fn attendance_today(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "hardhat", about = "hardhat attendance station CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show station daemon status
    Status,
    /// Print attendance records from the ledger
    Attendance {
        /// Day to report (YYYY-MM-DD, default: today)
        #[arg(short, long, conflicts_with = "all")]
        date: Option<NaiveDate>,
        /// Report every recorded day
        #[arg(short, long)]
        all: bool,
        /// Ledger database (default: $HARDHAT_DB_PATH or the per-user data dir)
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Load the reference gallery and report what was accepted or skipped
    Gallery {
        /// Reference image directory (default: $HARDHAT_REFERENCE_DIR)
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Model directory (default: $HARDHAT_MODEL_DIR)
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics
    Test {
        /// Camera device (default: $HARDHAT_CAMERA_DEVICE or /dev/video0)
        #[arg(short, long)]
        device: Option<String>,
        /// Save the captured frame here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let connection = zbus::Connection::session().await?;
            let proxy = HardhatProxy::new(&connection).await?;
            let raw = proxy
                .status()
                .await
                .context("hardhatd is not reachable on the session bus")?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Attendance { date, all, db } => {
            let db = db.unwrap_or_else(|| env_path("HARDHAT_DB_PATH").unwrap_or_else(hardhat_ledger::default_db_path));
            if !db.exists() {
                bail!("no attendance database at {}", db.display());
            }
            let ledger = AttendanceLedger::open(&db)?;
            let records = if all {
                ledger.all_records()?
            } else {
                ledger.records_on(date.unwrap_or_else(|| Local::now().date_naive()))?
            };
            print_records(&records);
        }
        Commands::Gallery { dir, model_dir } => {
            let dir = dir
                .or_else(|| env_path("HARDHAT_REFERENCE_DIR"))
                .unwrap_or_else(|| hardhat_core::data_dir().join("references"));
            let model_dir = model_dir
                .or_else(|| env_path("HARDHAT_MODEL_DIR"))
                .unwrap_or_else(hardhat_core::default_model_dir);
            let scrfd = model_dir.join(hardhat_core::SCRFD_MODEL_FILE);
            let arcface = model_dir.join(hardhat_core::ARCFACE_MODEL_FILE);

            let mut analyzer = OnnxFaceAnalyzer::load(&scrfd.to_string_lossy(), &arcface.to_string_lossy())?;
            let GalleryLoad { gallery, skipped } = Gallery::load_dir(&dir, &mut analyzer)?;

            println!("Gallery {}: {} identities", dir.display(), gallery.len());
            for identity in gallery.iter() {
                println!("  {:<24} dim={}", identity.name, identity.embedding.dim());
            }
            if !skipped.is_empty() {
                println!("Skipped {}:", skipped.len());
                for s in &skipped {
                    println!("  {:<24} {}", s.label, s.reason);
                }
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Test { device, output } => {
            let device = device
                .or_else(|| std::env::var("HARDHAT_CAMERA_DEVICE").ok())
                .unwrap_or_else(|| "/dev/video0".to_string());
            println!("Running camera diagnostics on {device}...");

            let mut camera = Camera::open(&device)?;
            println!("  format: {}x{} {:?}", camera.width, camera.height, camera.fourcc);
            camera.discard_warmup(4);

            let frame = camera.capture_frame()?;
            let dark = is_dark_frame(&frame.image, 0.95);
            println!("  captured frame {} ({}x{}), dark: {dark}", frame.sequence, frame.width(), frame.height());

            if let Some(path) = output {
                frame
                    .image
                    .save(&path)
                    .with_context(|| format!("failed to save {}", path.display()))?;
                println!("  saved to {}", path.display());
            }
        }
    }

    Ok(())
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn print_records(records: &[AttendanceRecord]) {
    if records.is_empty() {
        println!("No attendance recorded");
        return;
    }
    println!("{:<24} {:<10} {}", "NAME", "DATE", "TIME");
    for r in records {
        println!("{:<24} {:<10} {}", r.name.to_uppercase(), r.day, r.time);
    }
}
