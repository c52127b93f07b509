use anyhow::{Context, Result};
use facewatch_core::BoundingBox;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Frames and face boxes produced by an external detector.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub frames: Vec<ManifestFrame>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestFrame {
    /// Frame image; relative paths are resolved against the manifest's directory.
    pub image: PathBuf,
    #[serde(default)]
    pub faces: Vec<BoundingBox>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read manifest {}", path.display()))?;
        let mut manifest: Manifest = serde_json::from_str(&text)
            .with_context(|| format!("malformed manifest {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for frame in &mut manifest.frames {
            if frame.image.is_relative() {
                frame.image = base.join(&frame.image);
            }
        }
        Ok(manifest)
    }
}
