//! Enrollment sessions: quality-gated sample collection with all-or-nothing commit.

use crate::crop::FaceCrop;
use crate::encoder::{EncodeError, Encoder, EncoderParams};
use crate::quality;
use crate::store::{Database, EnrollMode, StoreError};
use crate::types::Signature;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_QUALITY_THRESHOLD: f32 = 0.7;
pub const DEFAULT_SAMPLE_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Cancelled,
    TimedOut,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Cancelled => f.write_str("cancelled"),
            AbortReason::TimedOut => f.write_str("timed out"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistrarError {
    #[error("session aborted: {reason}, {discarded} collected sample(s) discarded")]
    SessionAborted {
        reason: AbortReason,
        discarded: usize,
    },
    #[error("session aborted: only {collected} of {required} qualifying samples collected")]
    Incomplete { collected: usize, required: usize },
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Feedback for one offered candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    /// Counted toward the quota.
    Accepted { collected: usize, required: usize },
    /// Below the quality threshold; not counted.
    LowQuality { score: f32, threshold: f32 },
    /// Quota already full; the candidate was not used.
    Ignored,
}

/// Admission policy for enrollment sessions.
#[derive(Debug, Clone)]
pub struct Registrar {
    quality_threshold: f32,
    sample_count: usize,
    timeout: Option<Duration>,
}

impl Default for Registrar {
    fn default() -> Self {
        Self::new(DEFAULT_QUALITY_THRESHOLD, DEFAULT_SAMPLE_COUNT)
    }
}

impl Registrar {
    pub fn new(quality_threshold: f32, sample_count: usize) -> Self {
        Self {
            quality_threshold,
            sample_count,
            timeout: None,
        }
    }

    /// Abort sessions that are still collecting after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn begin(&self, name: &str, mode: EnrollMode) -> EnrollmentSession {
        tracing::info!(
            name,
            required = self.sample_count,
            threshold = self.quality_threshold,
            "enrollment session started"
        );
        EnrollmentSession {
            name: name.to_string(),
            mode,
            required: self.sample_count,
            threshold: self.quality_threshold,
            samples: Vec::with_capacity(self.sample_count),
            deadline: self.timeout.map(|t| Instant::now() + t),
            aborted: None,
            encoder: None,
        }
    }
}

/// One identity's in-progress enrollment. Nothing reaches the database until
/// [`commit`](Self::commit) succeeds with a full quota.
#[derive(Debug)]
pub struct EnrollmentSession {
    name: String,
    mode: EnrollMode,
    required: usize,
    threshold: f32,
    samples: Vec<Signature>,
    deadline: Option<Instant>,
    aborted: Option<AbortReason>,
    /// Set once a crop was encoded here; bound to the database on commit.
    encoder: Option<EncoderParams>,
}

impl EnrollmentSession {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collected(&self) -> usize {
        self.samples.len()
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn is_complete(&self) -> bool {
        self.aborted.is_none() && self.samples.len() == self.required
    }

    /// Offer an already-encoded candidate with its quality score.
    pub fn offer(
        &mut self,
        signature: Signature,
        quality: f32,
    ) -> Result<SampleOutcome, RegistrarError> {
        self.check_alive()?;

        if self.samples.len() >= self.required {
            return Ok(SampleOutcome::Ignored);
        }
        // NaN scores fail the comparison and are rejected.
        if !(quality >= self.threshold) {
            return Ok(self.low_quality(quality));
        }

        self.samples.push(signature);
        tracing::debug!(
            name = %self.name,
            collected = self.samples.len(),
            required = self.required,
            "sample accepted"
        );
        Ok(SampleOutcome::Accepted {
            collected: self.samples.len(),
            required: self.required,
        })
    }

    /// Score a raw crop, and encode it only if it clears the threshold.
    pub fn offer_crop(
        &mut self,
        encoder: &Encoder,
        face: &FaceCrop,
    ) -> Result<SampleOutcome, RegistrarError> {
        self.check_alive()?;
        if self.samples.len() >= self.required {
            return Ok(SampleOutcome::Ignored);
        }

        let gray = face.to_gray()?;
        let score = quality::assess(&gray, face.width, face.height).score;
        if !(score >= self.threshold) {
            return Ok(self.low_quality(score));
        }

        let signature = encoder.encode(face)?;
        let outcome = self.offer(signature, score)?;
        self.encoder = Some(*encoder.params());
        Ok(outcome)
    }

    /// Persist all samples in one transaction. Fails without side effects
    /// unless exactly the required number of samples was collected. Samples
    /// encoded through [`offer_crop`](Self::offer_crop) also bind the
    /// database to that encoder in the same transaction.
    pub fn commit(mut self, db: &mut Database) -> Result<usize, RegistrarError> {
        self.check_alive()?;

        if self.samples.len() != self.required {
            tracing::warn!(
                name = %self.name,
                collected = self.samples.len(),
                required = self.required,
                "enrollment incomplete, nothing stored"
            );
            return Err(RegistrarError::Incomplete {
                collected: self.samples.len(),
                required: self.required,
            });
        }

        let samples = std::mem::take(&mut self.samples);
        let record = match &self.encoder {
            Some(params) => db.enroll_encoded(&self.name, samples, self.mode, params)?,
            None => db.enroll(&self.name, samples, self.mode)?,
        };
        let total = record.signatures.len();
        tracing::info!(name = %self.name, total, "enrollment committed");
        Ok(total)
    }

    /// Drop every collected sample and end the session.
    pub fn cancel(mut self) -> RegistrarError {
        let discarded = self.samples.len();
        self.samples.clear();
        tracing::info!(name = %self.name, discarded, "enrollment cancelled");
        RegistrarError::SessionAborted {
            reason: AbortReason::Cancelled,
            discarded,
        }
    }

    fn low_quality(&self, score: f32) -> SampleOutcome {
        tracing::debug!(name = %self.name, score, "sample below quality threshold");
        SampleOutcome::LowQuality {
            score,
            threshold: self.threshold,
        }
    }

    fn check_alive(&mut self) -> Result<(), RegistrarError> {
        if let Some(reason) = self.aborted {
            return Err(RegistrarError::SessionAborted {
                reason,
                discarded: 0,
            });
        }

        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            let discarded = self.samples.len();
            self.samples.clear();
            self.aborted = Some(AbortReason::TimedOut);
            tracing::warn!(name = %self.name, discarded, "enrollment timed out");
            return Err(RegistrarError::SessionAborted {
                reason: AbortReason::TimedOut,
                discarded,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(fill: f32) -> Signature {
        Signature::new(vec![fill; 4])
    }

    #[test]
    fn test_full_session_commits() {
        let mut db = Database::in_memory().unwrap();
        let mut session = Registrar::default().begin("alice", EnrollMode::Append);
        for i in 0..5 {
            let outcome = session.offer(sig(0.1 * i as f32), 0.9).unwrap();
            assert_eq!(
                outcome,
                SampleOutcome::Accepted { collected: i + 1, required: 5 }
            );
        }
        assert!(session.is_complete());
        assert_eq!(session.commit(&mut db).unwrap(), 5);
        assert_eq!(db.get("alice").unwrap().signatures.len(), 5);
    }

    #[test]
    fn test_low_quality_not_counted() {
        let mut session = Registrar::default().begin("alice", EnrollMode::Append);
        let outcome = session.offer(sig(0.1), 0.69).unwrap();
        assert_eq!(outcome, SampleOutcome::LowQuality { score: 0.69, threshold: 0.7 });
        assert!(matches!(
            session.offer(sig(0.1), f32::NAN).unwrap(),
            SampleOutcome::LowQuality { .. }
        ));
        assert_eq!(session.collected(), 0);
    }

    #[test]
    fn test_extra_samples_ignored() {
        let mut session = Registrar::new(0.5, 2).begin("bob", EnrollMode::Append);
        session.offer(sig(0.1), 0.9).unwrap();
        session.offer(sig(0.2), 0.9).unwrap();
        assert_eq!(session.offer(sig(0.3), 0.9).unwrap(), SampleOutcome::Ignored);
        assert_eq!(session.collected(), 2);
    }

    #[test]
    fn test_incomplete_commit_stores_nothing() {
        let mut db = Database::in_memory().unwrap();
        let mut session = Registrar::default().begin("alice", EnrollMode::Append);
        for _ in 0..4 {
            session.offer(sig(0.2), 0.8).unwrap();
        }
        let err = session.commit(&mut db).unwrap_err();
        assert!(matches!(err, RegistrarError::Incomplete { collected: 4, required: 5 }));
        assert!(db.get("alice").is_none());
    }

    #[test]
    fn test_cancel_discards_samples() {
        let mut db = Database::in_memory().unwrap();
        let mut session = Registrar::default().begin("alice", EnrollMode::Append);
        for _ in 0..4 {
            session.offer(sig(0.2), 0.8).unwrap();
        }
        let err = session.cancel();
        assert!(matches!(
            err,
            RegistrarError::SessionAborted { reason: AbortReason::Cancelled, discarded: 4 }
        ));
        assert!(err.to_string().starts_with("session aborted"));
        assert!(db.is_empty());
        // The database remains usable and untouched.
        assert!(!db.remove("alice").unwrap());
    }

    #[test]
    fn test_timeout_aborts_session() {
        let mut db = Database::in_memory().unwrap();
        let registrar = Registrar::default().with_timeout(Duration::ZERO);
        let mut session = registrar.begin("alice", EnrollMode::Append);
        assert!(matches!(
            session.offer(sig(0.2), 0.9),
            Err(RegistrarError::SessionAborted { reason: AbortReason::TimedOut, .. })
        ));
        assert!(matches!(
            session.commit(&mut db),
            Err(RegistrarError::SessionAborted { reason: AbortReason::TimedOut, .. })
        ));
        assert!(db.is_empty());
    }

    #[test]
    fn test_offer_crop_rejects_flat_crop_without_encoding() {
        let encoder = Encoder::new(Default::default()).unwrap();
        let mut session = Registrar::default().begin("alice", EnrollMode::Append);
        let crop = FaceCrop::from_gray(100, 100, vec![128; 100 * 100]);
        assert!(matches!(
            session.offer_crop(&encoder, &crop).unwrap(),
            SampleOutcome::LowQuality { .. }
        ));
    }

    #[test]
    fn test_offer_crop_accepts_sharp_crop() {
        let encoder = Encoder::new(Default::default()).unwrap();
        let mut session = Registrar::default().begin("alice", EnrollMode::Append);
        let pixels = (0..100u32 * 100)
            .map(|i| if (i % 100 + i / 100) % 2 == 0 { 64 } else { 192 })
            .collect();
        let crop = FaceCrop::from_gray(100, 100, pixels);
        assert_eq!(
            session.offer_crop(&encoder, &crop).unwrap(),
            SampleOutcome::Accepted { collected: 1, required: 5 }
        );
    }

    fn sharp_crop() -> FaceCrop {
        let pixels = (0..100u32 * 100)
            .map(|i| if (i % 100 + i / 100) % 2 == 0 { 64 } else { 192 })
            .collect();
        FaceCrop::from_gray(100, 100, pixels)
    }

    #[test]
    fn test_commit_binds_encoder_only_on_success() {
        let encoder = Encoder::new(Default::default()).unwrap();

        let mut db = Database::in_memory().unwrap();
        let mut session = Registrar::new(0.5, 2).begin("alice", EnrollMode::Append);
        session.offer_crop(&encoder, &sharp_crop()).unwrap();
        session.cancel();
        assert!(db.encoder_params().is_none());

        let mut session = Registrar::new(0.5, 2).begin("alice", EnrollMode::Append);
        session.offer_crop(&encoder, &sharp_crop()).unwrap();
        session.offer_crop(&encoder, &sharp_crop()).unwrap();
        assert_eq!(session.commit(&mut db).unwrap(), 2);
        assert_eq!(db.encoder_params(), Some(encoder.params()));
    }

    #[test]
    fn test_replace_mode_overwrites_existing() {
        let mut db = Database::in_memory().unwrap();
        db.enroll("alice", vec![sig(0.9); 3], EnrollMode::Append).unwrap();
        let mut session = Registrar::new(0.5, 2).begin("alice", EnrollMode::Replace);
        session.offer(sig(0.1), 0.9).unwrap();
        session.offer(sig(0.2), 0.9).unwrap();
        assert_eq!(session.commit(&mut db).unwrap(), 2);
    }
}
