use crate::encoder::EncoderParams;
use crate::matcher::DEFAULT_TOLERANCE;
use crate::registrar::{Registrar, DEFAULT_QUALITY_THRESHOLD, DEFAULT_SAMPLE_COUNT};
use crate::tracker::{
    TrackerParams, DEFAULT_IOU_THRESHOLD, DEFAULT_TRACK_EXPIRY_FRAMES, DEFAULT_VOTE_WINDOW,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// Tunables for enrollment, matching and tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecognitionConfig {
    /// Maximum chi-square distance accepted as a match.
    pub tolerance: f32,
    /// Minimum quality score for an enrollment sample.
    pub quality_threshold: f32,
    /// Qualifying samples required per enrollment.
    pub sample_count: usize,
    /// Minimum IoU for a detection to continue a track.
    pub iou_threshold: f32,
    /// Consecutive missed frames tolerated before a track is dropped.
    pub track_expiry_frames: u32,
    /// Verdicts kept per track for voting.
    pub vote_window_size: usize,
    /// Frames dropped after each processed frame.
    pub frame_skip: u32,
    pub encoder: EncoderParams,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            sample_count: DEFAULT_SAMPLE_COUNT,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            track_expiry_frames: DEFAULT_TRACK_EXPIRY_FRAMES,
            vote_window_size: DEFAULT_VOTE_WINDOW,
            frame_skip: 0,
            encoder: EncoderParams::default(),
        }
    }
}

impl RecognitionConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            return Err(invalid(format!("tolerance must be > 0, got {}", self.tolerance)));
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(invalid(format!(
                "quality_threshold must be in [0, 1], got {}",
                self.quality_threshold
            )));
        }
        if self.sample_count == 0 {
            return Err(invalid("sample_count must be at least 1".to_string()));
        }
        if !(self.iou_threshold > 0.0 && self.iou_threshold <= 1.0) {
            return Err(invalid(format!(
                "iou_threshold must be in (0, 1], got {}",
                self.iou_threshold
            )));
        }
        if self.track_expiry_frames == 0 {
            return Err(invalid("track_expiry_frames must be at least 1".to_string()));
        }
        if self.vote_window_size == 0 {
            return Err(invalid("vote_window_size must be at least 1".to_string()));
        }
        self.encoder
            .validate()
            .map_err(|e| invalid(format!("encoder: {e}")))?;
        Ok(())
    }

    pub fn tracker_params(&self) -> TrackerParams {
        TrackerParams {
            iou_threshold: self.iou_threshold,
            expiry_frames: self.track_expiry_frames,
            vote_window: self.vote_window_size,
        }
    }

    pub fn registrar(&self) -> Registrar {
        Registrar::new(self.quality_threshold, self.sample_count)
    }
}

fn invalid(msg: String) -> ConfigError {
    ConfigError::Invalid(msg)
}
