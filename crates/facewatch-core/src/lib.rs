//! facewatch-core: face recognition pipeline over externally detected crops.
//!
//! Face crops are encoded into grid-of-cells local binary pattern
//! histograms, matched against an SQLite-backed identity database by
//! chi-square distance, and smoothed across frames by an IoU tracker with a
//! confidence-weighted identity vote.

pub mod config;
pub mod crop;
pub mod encoder;
pub mod matcher;
pub mod pipeline;
pub mod quality;
pub mod registrar;
pub mod store;
pub mod tracker;
pub mod types;

pub use config::{ConfigError, RecognitionConfig};
pub use crop::{FaceCrop, PixelLayout};
pub use encoder::{EncodeError, Encoder, EncoderParams};
pub use matcher::{ChiSquareMatcher, IdentityScore, Matcher};
pub use pipeline::{FrameReport, Pipeline, PipelineError};
pub use quality::QualityScore;
pub use registrar::{EnrollmentSession, Registrar, RegistrarError, SampleOutcome};
pub use store::{Database, DatabaseExport, DatabaseStats, EnrollMode, PersonSummary, StoreError};
pub use tracker::{Observation, TrackReport, TrackState, Tracker, TrackerParams};
pub use types::{BoundingBox, Identity, MatchResult, PersonRecord, Signature};
