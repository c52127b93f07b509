use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::{Database, EnrollMode, FaceCrop, Pipeline, SampleOutcome, StoreError};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod manifest;

use config::Settings;
use manifest::Manifest;

#[derive(Parser)]
#[command(name = "facewatch", about = "Face recognition over externally detected face crops")]
struct Cli {
    /// Identity database (default: $FACEWATCH_DB_PATH or the XDG data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// TOML file with recognition settings (default: $FACEWATCH_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Write a timestamped database copy here after every change
    /// (default: $FACEWATCH_BACKUP_DIR)
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from pre-cropped face images
    Register {
        /// Identity name
        name: String,
        /// Face crop images, offered in order until the sample quota is met
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Replace the identity's existing signatures instead of appending
        #[arg(long)]
        replace: bool,
        /// Abort the session if it is still collecting after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        name: String,
    },
    /// Show database statistics
    Stats,
    /// Export identity metadata (no signature data) as JSON
    Export {
        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Copy the database to a new file
    Backup {
        /// Destination path; must not exist
        path: PathBuf,
    },
    /// Delete every enrolled identity
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Recognize and track faces listed in a detector manifest
    Recognize {
        /// JSON manifest: {"frames":[{"image": path, "faces": [box...]}]}
        manifest: PathBuf,
        /// Grow each face box by this fraction of its size before cropping
        #[arg(long, default_value_t = 0.0)]
        padding: f32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::resolve(cli.db, cli.config, cli.backup_dir)?;
    tracing::debug!(
        db = %settings.db_path.display(),
        config = ?settings.config_path,
        backup_dir = ?settings.backup_dir,
        "settings resolved"
    );

    match cli.command {
        Commands::Register {
            name,
            images,
            replace,
            timeout_secs,
        } => register(&settings, &name, &images, replace, timeout_secs),
        Commands::List => {
            let db = open_db(&settings)?;
            let people = db.export_metadata().people;
            println!("{}", serde_json::to_string_pretty(&people)?);
            Ok(())
        }
        Commands::Remove { name } => {
            let mut db = open_db(&settings)?;
            if !db.remove(&name)? {
                return Err(StoreError::NotFound(name).into());
            }
            println!("Removed {name}");
            Ok(())
        }
        Commands::Stats => {
            let db = open_db(&settings)?;
            println!("{}", serde_json::to_string_pretty(&db.stats())?);
            Ok(())
        }
        Commands::Export { output } => {
            let db = open_db(&settings)?;
            let json = serde_json::to_string_pretty(&db.export_metadata())?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json + "\n")
                        .with_context(|| format!("cannot write {}", path.display()))?;
                    println!("Exported {} identities to {}", db.len(), path.display());
                }
                None => println!("{json}"),
            }
            Ok(())
        }
        Commands::Backup { path } => {
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            let db = open_db(&settings)?;
            db.backup_to(&path)?;
            println!("Backed up {} identities to {}", db.len(), path.display());
            Ok(())
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("refusing to delete every identity without --yes");
            }
            let mut db = open_db(&settings)?;
            let removed = db.clear()?;
            println!("Removed {removed} identities");
            Ok(())
        }
        Commands::Recognize { manifest, padding } => recognize(&settings, &manifest, padding),
    }
}

fn open_db(settings: &Settings) -> Result<Database> {
    if let Some(dir) = settings.db_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create {}", dir.display()))?;
    }
    let mut db = Database::open(&settings.db_path)?;
    db.set_backup_dir(settings.backup_dir.clone());
    Ok(db)
}

fn register(
    settings: &Settings,
    name: &str,
    images: &[PathBuf],
    replace: bool,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let config = &settings.recognition;
    let encoder = facewatch_core::Encoder::new(config.encoder)?;
    let mut db = open_db(settings)?;
    // Fail before collecting anything; the encoder is bound when the
    // session commits.
    db.check_encoder(&config.encoder)?;

    let mut registrar = config.registrar();
    if let Some(secs) = timeout_secs {
        registrar = registrar.with_timeout(Duration::from_secs(secs));
    }
    let mode = if replace {
        EnrollMode::Replace
    } else {
        EnrollMode::Append
    };

    let mut session = registrar.begin(name, mode);
    for path in images {
        if session.is_complete() {
            break;
        }
        let image = match image::open(path) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read image, skipping");
                continue;
            }
        };
        let crop = FaceCrop::from_image(&image);
        match session.offer_crop(&encoder, &crop) {
            Ok(SampleOutcome::Accepted { collected, required }) => {
                tracing::info!(path = %path.display(), collected, required, "sample accepted");
            }
            Ok(SampleOutcome::LowQuality { score, threshold }) => {
                tracing::info!(path = %path.display(), score, threshold, "sample rejected: low quality");
            }
            Ok(SampleOutcome::Ignored) => {}
            Err(facewatch_core::RegistrarError::Encode(e)) => {
                tracing::warn!(path = %path.display(), error = %e, "sample skipped");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let total = session.commit(&mut db)?;
    println!("{}", serde_json::json!({ "name": name, "signatures": total }));
    Ok(())
}

fn recognize(settings: &Settings, manifest_path: &std::path::Path, padding: f32) -> Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    let db = open_db(settings)?;
    let mut pipeline = Pipeline::new(settings.recognition.clone(), db)?;

    for entry in &manifest.frames {
        if !pipeline.admit_frame() {
            continue;
        }

        let frame = match image::open(&entry.image) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(image = %entry.image.display(), error = %e, "cannot read frame, dropping");
                continue;
            }
        };

        let mut cut_failures = 0;
        let crops: Vec<FaceCrop> = entry
            .faces
            .iter()
            .filter_map(|bbox| match FaceCrop::from_frame(&frame, *bbox, padding) {
                Ok(crop) => Some(crop),
                Err(e) => {
                    tracing::warn!(image = %entry.image.display(), error = %e, "skipping detection");
                    cut_failures += 1;
                    None
                }
            })
            .collect();

        let mut report = pipeline.process_frame(&crops);
        report.skipped_detections += cut_failures;
        println!("{}", serde_json::to_string(&report)?);
    }

    Ok(())
}
