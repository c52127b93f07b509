//! Frame-synchronous recognition driver.
//!
//! For every admitted frame: encode each detected crop, classify it, and feed
//! the verdicts to the tracker. One frame is fully processed before the next
//! is accepted.

use crate::config::{ConfigError, RecognitionConfig};
use crate::crop::FaceCrop;
use crate::encoder::{EncodeError, Encoder};
use crate::matcher::{ChiSquareMatcher, Matcher};
use crate::store::{Database, StoreError};
use crate::tracker::{Observation, TrackReport, Tracker};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Output of one processed frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameReport {
    /// Sequence number among processed frames, starting at 1.
    pub frame: u64,
    pub tracks: Vec<TrackReport>,
    /// Tracks dropped on this frame.
    pub expired: Vec<u64>,
    /// Detections that could not be encoded and were left out of tracking.
    pub skipped_detections: usize,
}

pub struct Pipeline {
    config: RecognitionConfig,
    encoder: Encoder,
    matcher: ChiSquareMatcher,
    tracker: Tracker,
    db: Database,
    captured: u64,
    processed: u64,
}

impl Pipeline {
    /// Build a pipeline over `db`. Fails before any frame is processed if the
    /// configuration is invalid or the database was built with another encoder.
    pub fn new(config: RecognitionConfig, db: Database) -> Result<Self, PipelineError> {
        config.validate()?;
        let encoder = Encoder::new(config.encoder)?;
        db.check_encoder(&config.encoder)?;

        tracing::info!(
            people = db.len(),
            tolerance = config.tolerance,
            frame_skip = config.frame_skip,
            "recognition pipeline ready"
        );

        Ok(Self {
            matcher: ChiSquareMatcher::new(config.tolerance),
            tracker: Tracker::new(config.tracker_params()),
            encoder,
            config,
            db,
            captured: 0,
            processed: 0,
        })
    }

    pub fn config(&self) -> &RecognitionConfig {
        &self.config
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn matcher(&self) -> &ChiSquareMatcher {
        &self.matcher
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn into_database(self) -> Database {
        self.db
    }

    /// Call once per captured frame; returns whether it should be processed.
    /// With `frame_skip = n` one frame is processed, then n are dropped.
    pub fn admit_frame(&mut self) -> bool {
        let period = u64::from(self.config.frame_skip) + 1;
        let admit = self.captured % period == 0;
        self.captured += 1;
        admit
    }

    /// Run one frame's detections through encode, match and track.
    pub fn process_frame(&mut self, faces: &[FaceCrop]) -> FrameReport {
        self.processed += 1;
        let frame = self.processed;

        let mut observations = Vec::with_capacity(faces.len());
        let mut skipped = 0;
        for (index, face) in faces.iter().enumerate() {
            match self.encoder.encode(face) {
                Ok(signature) => {
                    let verdict = self.matcher.classify(&signature, &self.db);
                    tracing::trace!(
                        frame,
                        index,
                        identity = %verdict.identity,
                        distance = verdict.distance,
                        "detection classified"
                    );
                    observations.push(Observation {
                        bbox: face.bbox,
                        verdict,
                    });
                }
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(frame, index, error = %e, "skipping detection");
                }
            }
        }

        let update = self.tracker.update(observations);
        tracing::debug!(
            frame,
            tracks = update.reports.len(),
            expired = update.expired.len(),
            skipped,
            "frame processed"
        );

        FrameReport {
            frame,
            tracks: update.reports,
            expired: update.expired,
            skipped_detections: skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncoderParams;
    use crate::types::{BoundingBox, Signature};

    fn small_config() -> RecognitionConfig {
        RecognitionConfig {
            encoder: EncoderParams {
                grid: 2,
                cell_size: 8,
                radius: 1,
                equalize: true,
            },
            ..RecognitionConfig::default()
        }
    }

    fn gradient_crop(x: f32) -> FaceCrop {
        let pixels = (0..40u32 * 40).map(|i| ((i % 40) * 6 + (i / 40)) as u8).collect();
        let mut crop = FaceCrop::from_gray(40, 40, pixels);
        crop.bbox = BoundingBox::new(x, 10.0, 40.0, 40.0);
        crop
    }

    #[test]
    fn test_frame_skip_cadence() {
        let config = RecognitionConfig {
            frame_skip: 2,
            ..small_config()
        };
        let mut pipeline = Pipeline::new(config, Database::in_memory().unwrap()).unwrap();
        let admitted: Vec<bool> = (0..7).map(|_| pipeline.admit_frame()).collect();
        assert_eq!(admitted, vec![true, false, false, true, false, false, true]);
    }

    #[test]
    fn test_no_skip_admits_every_frame() {
        let mut pipeline = Pipeline::new(small_config(), Database::in_memory().unwrap()).unwrap();
        assert!((0..5).all(|_| pipeline.admit_frame()));
    }

    #[test]
    fn test_encoder_mismatch_rejected() {
        let mut db = Database::in_memory().unwrap();
        db.ensure_encoder(&EncoderParams::default()).unwrap();
        let err = Pipeline::new(small_config(), db).err().unwrap();
        assert!(matches!(err, PipelineError::Store(StoreError::EncoderMismatch { .. })));
    }

    #[test]
    fn test_database_of_other_length_rejected() {
        let mut db = Database::in_memory().unwrap();
        db.add("mallory", Signature::new(vec![0.25; 4])).unwrap();
        let err = Pipeline::new(RecognitionConfig::default(), db).err().unwrap();
        assert!(matches!(
            err,
            PipelineError::Store(StoreError::DimensionMismatch { expected: 4, .. })
        ));
    }

    #[test]
    fn test_recognition_does_not_bind_database() {
        let pipeline = Pipeline::new(small_config(), Database::in_memory().unwrap()).unwrap();
        assert!(pipeline.database().encoder_params().is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RecognitionConfig {
            tolerance: -1.0,
            ..small_config()
        };
        let err = Pipeline::new(config, Database::in_memory().unwrap()).err().unwrap();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_bad_detection_skipped() {
        let mut pipeline = Pipeline::new(small_config(), Database::in_memory().unwrap()).unwrap();
        let tiny = FaceCrop::from_gray(4, 4, vec![0; 16]);
        let report = pipeline.process_frame(&[gradient_crop(0.0), tiny]);
        assert_eq!(report.frame, 1);
        assert_eq!(report.skipped_detections, 1);
        assert_eq!(report.tracks.len(), 1);
    }

    #[test]
    fn test_enrolled_face_is_recognized() {
        let mut db = Database::in_memory().unwrap();
        let config = small_config();
        let encoder = Encoder::new(config.encoder).unwrap();
        db.add("alice", encoder.encode(&gradient_crop(0.0)).unwrap()).unwrap();

        let mut pipeline = Pipeline::new(config, db).unwrap();
        let report = pipeline.process_frame(&[gradient_crop(100.0)]);
        let track = &report.tracks[0];
        assert_eq!(track.identity.name(), Some("alice"));
        assert!((track.confidence - 1.0).abs() < 1e-6);
    }
}
