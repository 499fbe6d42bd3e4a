use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facereg_core::{
    loader, FaceNetExtractor, LoadError, Recognition, RecognitionService, RecordStore,
    ScrfdDetector, Verdict,
};
use facereg_store::SqliteStore;
use image::RgbImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;
use engine::EngineHandle;

#[derive(Parser)]
#[command(name = "facereg", about = "Face registration and recognition")]
struct Cli {
    /// SQLite database path (overrides FACEREG_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Directory with det_10g.onnx and facenet_512.onnx (overrides FACEREG_MODEL_DIR)
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    /// Similarity a match must exceed (overrides FACEREG_SIMILARITY_THRESHOLD)
    #[arg(long, global = true)]
    threshold: Option<f32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a person from one or more photos, each showing exactly one face
    Add {
        /// Person's name
        #[arg(short, long)]
        name: String,
        /// Photos of the person
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Identify the faces in one or more images
    Recognize {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// List registered people
    List,
    /// Remove a person and all of their face embeddings
    Remove {
        /// Person ID to remove
        id: i64,
    },
    /// Show store and model status
    Status,
}

#[derive(Serialize)]
struct ImageRecognition<'a> {
    path: &'a Path,
    #[serde(flatten)]
    recognition: Recognition,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(dir) = cli.model_dir {
        config.model_dir = dir;
    }
    if let Some(threshold) = cli.threshold {
        config.similarity_threshold = threshold;
    }
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Add { name, images } => add(&config, name, images).await,
        Commands::Recognize { images, json } => recognize(&config, images, json).await,
        Commands::List => list(&config),
        Commands::Remove { id } => remove(&config, id),
        Commands::Status => status(&config),
    }
}

fn open_store(config: &Config) -> Result<SqliteStore> {
    SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening face store at {}", config.db_path.display()))
}

/// Load both models and the gallery, and start the engine thread.
fn start_engine(config: &Config) -> Result<EngineHandle> {
    let detector = ScrfdDetector::load(
        &config.detector_model_path(),
        config.detection_threshold,
        config.intra_threads,
    )
    .context("loading face detector")?;
    let extractor = FaceNetExtractor::load(&config.embedding_model_path(), config.intra_threads)
        .context("loading embedding model")?;

    let service = RecognitionService::new(
        detector,
        extractor,
        open_store(config)?,
        config.similarity_threshold,
    )?;
    Ok(engine::spawn_engine(service)?)
}

/// Decode images on the blocking pool, all at once. One result per path,
/// in order.
async fn load_images(paths: &[PathBuf]) -> Result<Vec<Result<RgbImage, LoadError>>> {
    let tasks: Vec<_> = paths
        .iter()
        .cloned()
        .map(|path| tokio::task::spawn_blocking(move || loader::load_rgb(&path)))
        .collect();

    let mut images = Vec::with_capacity(tasks.len());
    for task in tasks {
        images.push(task.await.context("image loader panicked")?);
    }
    Ok(images)
}

async fn add(config: &Config, name: String, paths: Vec<PathBuf>) -> Result<()> {
    let engine = start_engine(config)?;

    let images = load_images(&paths).await?;
    let registration = engine.register(name.clone(), images).await?;
    for (path, outcome) in paths.iter().zip(&registration.outcomes) {
        match outcome {
            Ok(()) => println!("{}: added", path.display()),
            Err(err) => println!("{}: {err}", path.display()),
        }
    }
    println!(
        "Registered {name} (id {}) with {} of {} image(s)",
        registration.person_id,
        registration.added(),
        paths.len()
    );
    Ok(())
}

async fn recognize(config: &Config, paths: Vec<PathBuf>, json: bool) -> Result<()> {
    let engine = start_engine(config)?;
    if engine.gallery_size() == 0 {
        tracing::warn!("no faces registered; every face will be unrecognized");
    }

    let mut results = Vec::new();
    for (path, loaded) in paths.iter().zip(load_images(&paths).await?) {
        let frame = loaded?;
        let recognition = engine
            .recognize(frame)
            .await
            .with_context(|| format!("recognizing {}", path.display()))?;
        results.push(ImageRecognition { path, recognition });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    for result in &results {
        println!("{}:", result.path.display());
        if result.recognition.faces.is_empty() {
            println!("  no faces found");
        }
        for face in &result.recognition.faces {
            let r = face.bounding_box;
            let score = match &face.verdict {
                Verdict::Recognized { score, .. } => format!(" ({score:.3})"),
                Verdict::Unknown { best_score: Some(score) } => format!(" (best {score:.3})"),
                Verdict::Unknown { best_score: None } => String::new(),
            };
            println!(
                "  {}{score} at [{}, {}, {}x{}]",
                face.person_name(),
                r.left,
                r.top,
                r.width,
                r.height
            );
        }
        if let Some(m) = result.recognition.metrics {
            println!(
                "  detection {} ms, embedding {} ms, search {} ms",
                m.detection_ms, m.embedding_ms, m.search_ms
            );
        }
    }
    Ok(())
}

fn list(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let people = store.people()?;
    if people.is_empty() {
        println!("No people registered");
        return Ok(());
    }
    for person in people {
        println!(
            "{:>4}  {:<24} {} image(s)  added {}",
            person.id,
            person.name,
            person.num_images,
            person.added_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn remove(config: &Config, id: i64) -> Result<()> {
    let mut store = open_store(config)?;
    let removal = store.remove_person(id)?;
    if removal.is_empty() {
        anyhow::bail!("no person with id {id}");
    }
    tracing::info!(person_id = id, embeddings = removal.embeddings, "person removed");
    println!("Removed person {id} ({} embedding(s))", removal.embeddings);
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let detector = config.detector_model_path();
    let embedder = config.embedding_model_path();

    let status = serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "db_path": config.db_path,
        "people": store.count_people()?,
        "embeddings": store.count_records()?,
        "similarity_threshold": config.similarity_threshold,
        "detection_threshold": config.detection_threshold,
        "models": {
            "detector": { "path": detector, "present": detector.exists() },
            "embedding": { "path": embedder, "present": embedder.exists() },
        },
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
