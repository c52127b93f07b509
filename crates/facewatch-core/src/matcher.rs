//! Classification of a query signature against the enrolled database.

use crate::store::Database;
use crate::types::{Identity, MatchResult, Signature};
use serde::Serialize;

pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Strategy for classifying a query signature against the database.
pub trait Matcher {
    fn classify(&self, query: &Signature, db: &Database) -> MatchResult;
}

/// Best score of one identity for a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityScore {
    pub name: String,
    pub distance: f32,
    pub confidence: f32,
}

/// Chi-square nearest-signature matcher.
///
/// An identity scores the minimum distance over its signatures, so one
/// well-matching enrollment pose is enough. The best identity is accepted
/// when its score is within `tolerance`.
#[derive(Debug, Clone, Copy)]
pub struct ChiSquareMatcher {
    tolerance: f32,
}

impl Default for ChiSquareMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE)
    }
}

impl ChiSquareMatcher {
    pub fn new(tolerance: f32) -> Self {
        Self { tolerance }
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    /// `1 - distance / tolerance`, clamped to [0, 1].
    pub fn confidence(&self, distance: f32) -> f32 {
        if self.tolerance <= 0.0 {
            return 0.0;
        }
        (1.0 - distance / self.tolerance).clamp(0.0, 1.0)
    }

    /// Every identity with at least one signature, closest first.
    ///
    /// Confidence is reported even above tolerance (as 0) so callers can show
    /// near misses. A query of the wrong length ranks nobody.
    pub fn rank(&self, query: &Signature, db: &Database) -> Vec<IdentityScore> {
        if !comparable(query, db) {
            return Vec::new();
        }
        let mut scores: Vec<IdentityScore> = db
            .records()
            .filter_map(|record| {
                let distance = record
                    .signatures
                    .iter()
                    .map(|s| query.distance(s))
                    .fold(None, |best: Option<f32>, d| Some(best.map_or(d, |b| b.min(d))))?;
                Some(IdentityScore {
                    name: record.name.clone(),
                    distance,
                    confidence: self.confidence(distance),
                })
            })
            .collect();

        scores.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        scores
    }
}

impl Matcher for ChiSquareMatcher {
    fn classify(&self, query: &Signature, db: &Database) -> MatchResult {
        if !comparable(query, db) {
            return MatchResult::unknown(f32::INFINITY);
        }

        // The global minimum over all signatures equals the minimum over
        // per-identity minima. Records iterate in name order, and only a
        // strictly smaller distance replaces the best, so ties go to the
        // lexicographically smallest name.
        let mut best: Option<(&str, f32)> = None;
        for (name, signature) in db.all_signatures() {
            let distance = query.distance(signature);
            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((name, distance)),
            }
        }

        match best {
            Some((name, distance)) if distance <= self.tolerance => MatchResult {
                identity: Identity::Known(name.to_string()),
                distance,
                confidence: self.confidence(distance),
            },
            Some((_, distance)) => MatchResult::unknown(distance),
            None => MatchResult::unknown(f32::INFINITY),
        }
    }
}

/// Signatures of different length come from different encoders.
fn comparable(query: &Signature, db: &Database) -> bool {
    match db.signature_len() {
        Some(len) if len != query.len() => {
            tracing::warn!(
                query = query.len(),
                stored = len,
                "query signature length differs from database"
            );
            false
        }
        _ => true,
    }
}
