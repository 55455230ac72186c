use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

#[zbus::proxy(
    interface = "org.moodwatch.Daemon1",
    default_service = "org.moodwatch.Daemon1",
    default_path = "/org/moodwatch/Daemon1"
)]
trait Daemon {
    fn start_detection(&self) -> zbus::Result<String>;
    fn stop_detection(&self) -> zbus::Result<String>;
    fn start_enrollment(&self, name: &str, email: &str) -> zbus::Result<String>;
    fn cancel_enrollment(&self) -> zbus::Result<String>;
    fn current_state(&self) -> zbus::Result<String>;
    fn list_identities(&self) -> zbus::Result<String>;
    fn history(&self, identity_id: &str, days: u32) -> zbus::Result<String>;
    fn stats(&self, identity_id: &str) -> zbus::Result<String>;
    fn refresh_cache(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "moodwatch", about = "Face recognition and emotion tracking")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new person from live camera samples
    Enroll {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        email: String,
    },
    /// Start live recognition and emotion detection
    Start,
    /// Stop live detection
    Stop,
    /// Cancel a running enrollment
    Cancel,
    /// Print live captions until interrupted
    Watch {
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// List registered people
    List,
    /// Show detection history
    History {
        /// Identity id; all identities when omitted
        identity: Option<String>,
        /// Look back this many days (0 for everything)
        #[arg(short, long, default_value_t = 30)]
        days: u32,
    },
    /// Show emotion counts
    Stats {
        /// Identity id; all identities when omitted
        identity: Option<String>,
    },
    /// Reload embeddings from the database
    RefreshCache,
    /// Show daemon status
    Status,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Save the last captured frame as PNG
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

async fn daemon() -> Result<DaemonProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("cannot connect to the session bus")?;
    DaemonProxy::new(&conn)
        .await
        .context("moodwatchd is not running")
}

fn parse(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).context("daemon returned invalid JSON")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { name, email } => enroll(&daemon().await?, &name, &email).await?,
        Commands::Start => {
            daemon().await?.start_detection().await?;
            println!("Detection started");
        }
        Commands::Stop => {
            let summary = parse(&daemon().await?.stop_detection().await?)?;
            println!("Detection stopped");
            if let Some(stats) = summary.get("stats").filter(|s| !s.is_null()) {
                println!(
                    "  frames {}  recognized {}  unknown {}  saved {}  dropped writes {}",
                    stats["frames"], stats["recognized"], stats["unknown"], stats["persisted"], stats["dropped_writes"]
                );
            }
        }
        Commands::Cancel => {
            daemon().await?.cancel_enrollment().await?;
            println!("Enrollment cancelled");
        }
        Commands::Watch { interval_ms } => watch(&daemon().await?, Duration::from_millis(interval_ms)).await?,
        Commands::List => {
            let identities = parse(&daemon().await?.list_identities().await?)?;
            let rows = identities.as_array().cloned().unwrap_or_default();
            if rows.is_empty() {
                println!("No one registered");
            }
            for i in rows {
                println!(
                    "{}  {:<24} {:<32} {}",
                    text(&i["id"]),
                    text(&i["display_name"]),
                    text(&i["email"]),
                    text(&i["created_at"])
                );
            }
        }
        Commands::History { identity, days } => {
            let raw = daemon()
                .await?
                .history(identity.as_deref().unwrap_or(""), days)
                .await?;
            let records = parse(&raw)?.as_array().cloned().unwrap_or_default();
            if records.is_empty() {
                println!("No detections");
            }
            for r in records {
                println!(
                    "{}  {}  {:<9} {:.1}%",
                    text(&r["timestamp"]),
                    text(&r["identity_id"]),
                    text(&r["label"]),
                    r["confidence"].as_f64().unwrap_or(0.0) * 100.0
                );
            }
        }
        Commands::Stats { identity } => {
            let stats = parse(&daemon().await?.stats(identity.as_deref().unwrap_or("")).await?)?;
            let total = stats["total"].as_u64().unwrap_or(0);
            println!("{total} detections");
            if let Some(counts) = stats["counts"].as_object() {
                for (label, count) in counts {
                    let n = count.as_u64().unwrap_or(0);
                    let pct = if total > 0 { n as f64 * 100.0 / total as f64 } else { 0.0 };
                    println!("  {label:<9} {n:>6}  {pct:5.1}%");
                }
            }
        }
        Commands::RefreshCache => {
            let out = parse(&daemon().await?.refresh_cache().await?)?;
            println!("{} identities cached", out["identities"]);
        }
        Commands::Status => {
            let status = parse(&daemon().await?.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Test { device, output } => camera_test(&device, output)?,
    }

    Ok(())
}

fn text(v: &Value) -> String {
    v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())
}

async fn enroll(proxy: &DaemonProxy<'_>, name: &str, email: &str) -> Result<()> {
    proxy.start_enrollment(name, email).await?;
    println!("Look at the camera...");

    let mut last_captured = 0;
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let state = parse(&proxy.current_state().await?)?;
        let board = &state["board"];

        if let Some(captured) = board["enrollment"]["captured"].as_u64() {
            if captured != last_captured {
                println!("  sample {captured}/{}", board["enrollment"]["required"]);
                last_captured = captured;
            }
        }
        if state["mode"] == "idle" {
            let outcome = &board["last_enrollment"];
            if let Some(identity) = outcome.get("registered") {
                println!("Registered {} ({})", text(&identity["display_name"]), text(&identity["id"]));
                return Ok(());
            }
            match outcome.get("failed") {
                Some(failed) => bail!("enrollment failed: {}", text(&failed["reason"])),
                None => bail!("enrollment ended before completing"),
            }
        }
    }
}

async fn watch(proxy: &DaemonProxy<'_>, interval: Duration) -> Result<()> {
    let mut last_frame = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }
        let state = parse(&proxy.current_state().await?)?;
        let frame = state["board"]["frame"]["frame_index"].as_u64();
        if frame.is_none() || frame == last_frame {
            continue;
        }
        last_frame = frame;
        let captions: Vec<String> = state["board"]["captions"]
            .as_array()
            .map(|c| c.iter().map(text).collect())
            .unwrap_or_default();
        println!("[{}] {}", frame.unwrap_or(0), captions.join(" | "));
    }
}

fn camera_test(device: &str, output: Option<PathBuf>) -> Result<()> {
    println!("V4L2 capture devices:");
    for d in moodwatch_hw::Camera::list_devices() {
        println!("  {}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let mut camera = moodwatch_hw::Camera::open(device, 640, 480)?;
    println!(
        "Opened {} at {}x{} ({:?})",
        camera.device_path, camera.width, camera.height, camera.format
    );

    let mut last = None;
    for _ in 0..10 {
        let frame = camera.capture()?;
        println!(
            "  seq {:>5}  brightness {:6.1}  {}",
            frame.sequence,
            frame.avg_brightness(),
            if frame.is_dark { "dark" } else { "ok" }
        );
        last = Some(frame);
    }

    if let (Some(path), Some(frame)) = (output, last) {
        let Some(img) = image::GrayImage::from_raw(frame.width, frame.height, frame.data) else {
            bail!("frame buffer does not match its dimensions");
        };
        img.save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Saved {}", path.display());
    }
    Ok(())
}
