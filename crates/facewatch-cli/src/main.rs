use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::{
    ArcFaceEmbedder, EmbeddingMatcher, GalleryIndex, IdentityResolver, RecognitionConfig, RecognitionPipeline,
    ScrfdDetector, Settings, UnknownEvent, UnknownLog,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "facewatch", about = "facewatch face recognition monitor CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Review recorded unknown-face events
    Unknowns {
        #[command(subcommand)]
        action: UnknownsAction,
    },
    /// Identify faces in a still image against the gallery
    Identify {
        /// Image to identify
        image: PathBuf,
        /// Write the annotated image here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List gallery identities and reference counts
    Gallery,
    /// List V4L2 capture devices
    Devices,
    /// Show daemon status
    Status,
    /// Ask the daemon to stop
    Stop,
}

#[derive(Subcommand)]
enum UnknownsAction {
    /// List events, newest first
    List {
        /// Include events whose image has been removed
        #[arg(long)]
        all: bool,
    },
    /// Delete an event's image and log line
    Delete {
        /// Event timestamp, the first column of `list`
        timestamp: String,
    },
}

#[zbus::proxy(
    interface = "org.facewatch.Monitor1",
    default_service = "org.facewatch.Monitor1",
    default_path = "/org/facewatch/Monitor1"
)]
trait Monitor {
    async fn status(&self) -> zbus::Result<String>;
    async fn stop(&self) -> zbus::Result<bool>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command {
        Commands::Unknowns { action } => {
            let log = UnknownLog::new(&settings.unknown_log_dir);
            match action {
                UnknownsAction::List { all } => list_unknowns(&log, all)?,
                UnknownsAction::Delete { timestamp } => delete_unknown(&log, &timestamp)?,
            }
        }
        Commands::Identify { image, output } => {
            let config = settings.recognition().context("invalid configuration")?;
            tokio::task::spawn_blocking(move || identify(&config, image, output)).await??;
        }
        Commands::Gallery => {
            let config = settings.recognition().context("invalid configuration")?;
            let gallery = tokio::task::spawn_blocking(move || load_gallery(&config).map(|(g, _, _)| g)).await??;
            for identity in gallery.identities() {
                println!("{:<24} {} reference(s)", identity.name, identity.reference_embeddings.len());
            }
            println!(
                "{} identities, {} references",
                gallery.len(),
                gallery.reference_count()
            );
        }
        Commands::Devices => {
            let devices = facewatch_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Status => {
            let proxy = connect().await?;
            let status = proxy.status().await.context("Status() call failed")?;
            let value: serde_json::Value = serde_json::from_str(&status).context("malformed status")?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Stop => {
            let proxy = connect().await?;
            if proxy.stop().await.context("Stop() call failed")? {
                println!("Stop requested");
            } else {
                println!("facewatchd is already stopping");
            }
        }
    }

    Ok(())
}

async fn connect() -> Result<MonitorProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    MonitorProxy::new(&conn)
        .await
        .context("facewatchd is not reachable on D-Bus")
}

fn list_unknowns(log: &UnknownLog, all: bool) -> Result<()> {
    let mut entries = if all {
        log.entries()
    } else {
        log.entries_with_existing_images()
    }
    .with_context(|| format!("failed to read {}", log.log_path().display()))?;
    tracing::debug!(count = entries.len(), all, "unknown log read");
    entries.reverse();

    if entries.is_empty() {
        println!("No unknown events recorded");
        return Ok(());
    }
    for event in &entries {
        println!("{}", format_entry(event));
    }
    println!("{} event(s)", entries.len());
    Ok(())
}

/// One `list` row. The first column is the key `delete` accepts.
fn format_entry(event: &UnknownEvent) -> String {
    let marker = if event.image_path.exists() { "" } else { "  (image missing)" };
    format!("{}  {}{marker}", event.timestamp, event.image_path.display())
}

/// Accepts the stored form `2026-10-19_14-03-22.125` or the readable
/// `2026-10-19 14:03:22.125`.
fn normalize_timestamp(input: &str) -> String {
    match input.split_whitespace().collect::<Vec<_>>().as_slice() {
        [date, time] => format!("{date}_{}", time.replace(':', "-")),
        _ => input.trim().to_string(),
    }
}

fn find_event<'a>(entries: &'a [UnknownEvent], timestamp: &str) -> Result<&'a UnknownEvent> {
    let wanted = normalize_timestamp(timestamp);
    let matches: Vec<&UnknownEvent> = entries.iter().filter(|e| e.timestamp == wanted).collect();
    match matches.as_slice() {
        [] => bail!("no unknown event with timestamp {timestamp}"),
        [event] => Ok(*event),
        _ => bail!("timestamp {timestamp} matches {} events", matches.len()),
    }
}

fn delete_unknown(log: &UnknownLog, timestamp: &str) -> Result<()> {
    let entries = log.entries()?;
    let event = find_event(&entries, timestamp)?;
    log.delete(event)?;
    println!("Deleted {}", event.image_path.display());
    Ok(())
}

fn load_gallery(config: &RecognitionConfig) -> Result<(GalleryIndex, ScrfdDetector, ArcFaceEmbedder)> {
    let mut detector = ScrfdDetector::load(&config.scrfd_model_path(), config.detection_confidence)
        .context("failed to load detector")?;
    let mut embedder = ArcFaceEmbedder::load(&config.arcface_model_path()).context("failed to load embedder")?;
    let gallery = GalleryIndex::build(
        &config.known_faces_dir,
        &mut detector,
        &mut embedder,
        config.gallery_cache_path(),
    )
    .context("failed to build gallery")?;
    Ok((gallery, detector, embedder))
}

fn identify(config: &RecognitionConfig, input: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let frame = image::open(&input)
        .with_context(|| format!("failed to open {}", input.display()))?
        .to_rgb8();

    let (gallery, detector, embedder) = load_gallery(config)?;
    let mut pipeline = RecognitionPipeline::new(
        detector,
        EmbeddingMatcher::new(embedder),
        IdentityResolver::new(config.threshold),
    );
    let report = pipeline.process(&frame, &gallery);

    if report.detection_failed {
        println!("Face detection failed");
    } else if report.faces.is_empty() {
        println!("No faces found");
    }
    for face in &report.faces {
        let r = &face.region;
        println!(
            "{:<24} at ({:.0}, {:.0}) {:.0}x{:.0}",
            face.resolution.caption(),
            r.x,
            r.y,
            r.width,
            r.height
        );
    }

    if let Some(path) = output {
        report
            .annotated
            .save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Annotated image written to {}", path.display());
    }
    Ok(())
}
