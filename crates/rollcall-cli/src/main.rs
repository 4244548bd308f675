use anyhow::{bail, Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use rollcall_core::Identity;
use rollcall_hw::{Camera, FrameSource, SourceSpec};
use rollcall_store::SqliteStore;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// Daemon base URL
    #[arg(long, global = true, default_value = "http://127.0.0.1:5000")]
    server: String,

    /// Attendance database (defaults to $ROLLCALL_DB_PATH or the XDG data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from a photo
    Enroll {
        /// National code identifying the person
        #[arg(short = 'n', long)]
        national_code: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        /// Photo containing exactly the person's face
        image: PathBuf,
    },
    /// Show the attendance log, newest first
    Attendance {
        /// Only this national code
        #[arg(short, long)]
        identity: Option<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show when and where each person was last seen
    Presence,
    /// List V4L2 capture devices
    Devices,
    /// Grab one frame from a camera source and save it as PNG
    Capture {
        /// Device index, /dev/videoN or snapshot URL
        source: String,
        #[arg(short, long, default_value = "frame.png")]
        output: PathBuf,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db_path = cli
        .db
        .clone()
        .or_else(|| std::env::var_os("ROLLCALL_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(rollcall_store::default_db_path);

    match cli.command {
        Commands::Enroll {
            national_code,
            first_name,
            last_name,
            image,
        } => {
            let bytes = std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
            let body = json!({
                "image": base64::engine::general_purpose::STANDARD.encode(bytes),
                "nationalCode": national_code,
                "firstName": first_name,
                "lastName": last_name,
            });
            let response = reqwest::Client::new()
                .post(format!("{}/upload", cli.server.trim_end_matches('/')))
                .json(&body)
                .send()
                .await
                .with_context(|| format!("rollcalld not reachable at {}", cli.server))?;
            let status = response.status();
            let reply: Value = response.json().await.context("unexpected reply from rollcalld")?;
            let message = reply["message"].as_str().unwrap_or("(no message)");
            if !status.is_success() {
                bail!("enrollment failed ({status}): {message}");
            }
            println!("{national_code}: {message}");
        }
        Commands::Attendance { identity, limit } => {
            let identity = identity.as_deref().map(Identity::new).transpose().context("empty national code")?;
            let store = SqliteStore::open(&db_path).await?;
            let rows = store.list_events(identity.as_ref(), limit).await?;
            if rows.is_empty() {
                println!("No attendance recorded");
            }
            for row in rows {
                println!(
                    "{:>6}  {}  {:<14}  {}",
                    row.id,
                    row.checkin_at.format("%Y-%m-%d %H:%M:%S"),
                    row.national_code,
                    row.location
                );
            }
            store.close().await?;
        }
        Commands::Presence => {
            let store = SqliteStore::open(&db_path).await?;
            let rows = store.list_presence().await?;
            if rows.is_empty() {
                println!("Nobody seen yet");
            }
            for row in rows {
                let name = format!("{} {}", row.first_name, row.last_name);
                println!(
                    "{:<14}  {:<24}  {}  {}",
                    row.national_code,
                    name.trim(),
                    row.last_seen.format("%Y-%m-%d %H:%M:%S"),
                    row.location
                );
            }
            store.close().await?;
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Capture { source, output } => {
            let spec: SourceSpec = match source.parse() {
                Ok(spec) => spec,
                Err(never) => match never {},
            };
            let frame = tokio::task::spawn_blocking(move || {
                let mut camera = spec.open(Duration::from_secs(5))?;
                camera.read()
            })
            .await??;
            frame.image.save(&output).with_context(|| format!("writing {}", output.display()))?;
            println!("{}x{} frame written to {}", frame.width(), frame.height(), output.display());
        }
        Commands::Status => {
            let url = format!("{}/health", cli.server.trim_end_matches('/'));
            match reqwest::get(&url).await {
                Ok(response) => {
                    let health: Value = response.json().await.context("unexpected reply from rollcalld")?;
                    println!(
                        "rollcalld {}: {}",
                        health["version"].as_str().unwrap_or("?"),
                        health["status"].as_str().unwrap_or("?")
                    );
                    println!("  cameras: {}", health["cameras"]);
                    println!("  database: {}", if health["store"] == true { "open" } else { "unavailable" });
                }
                Err(err) => {
                    tracing::debug!(error = %err, "health request failed");
                    println!("rollcalld: not reachable at {}", cli.server);
                }
            }
        }
    }

    Ok(())
}
