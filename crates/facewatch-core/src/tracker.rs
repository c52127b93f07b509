//! Cross-frame face tracking and identity smoothing.
//!
//! Detections are associated to tracks by greedy IoU matching. Each track
//! keeps a rolling window of per-frame verdicts and displays the
//! confidence-weighted vote over that window, with ties resolved toward the
//! identity it already shows. One stray verdict is outvoted by the rest of
//! the window instead of flipping the label.

use crate::types::{BoundingBox, Identity, MatchResult};
use serde::Serialize;
use std::collections::VecDeque;

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
pub const DEFAULT_TRACK_EXPIRY_FRAMES: u32 = 10;
pub const DEFAULT_VOTE_WINDOW: usize = 5;

/// Vote weights closer than this are treated as tied.
const VOTE_TIE_EPSILON: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// No verdict has identified a known person yet.
    Tentative,
    /// At least one verdict identified a known person.
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerParams {
    /// Minimum IoU for a detection to continue a track.
    pub iou_threshold: f32,
    /// A track is dropped once its consecutive misses exceed this.
    pub expiry_frames: u32,
    /// Verdicts kept per track for voting.
    pub vote_window: usize,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            expiry_frames: DEFAULT_TRACK_EXPIRY_FRAMES,
            vote_window: DEFAULT_VOTE_WINDOW,
        }
    }
}

/// One detection of the current frame with its matcher verdict.
#[derive(Debug, Clone)]
pub struct Observation {
    pub bbox: BoundingBox,
    pub verdict: MatchResult,
}

#[derive(Debug, Clone)]
pub struct Track {
    id: u64,
    bbox: BoundingBox,
    history: VecDeque<MatchResult>,
    displayed: Identity,
    confidence: f32,
    misses: u32,
    state: TrackState,
}

impl Track {
    fn new(id: u64, observation: Observation, window: usize) -> Self {
        let mut track = Self {
            id,
            bbox: observation.bbox,
            history: VecDeque::with_capacity(window),
            displayed: observation.verdict.identity.clone(),
            confidence: 0.0,
            misses: 0,
            state: TrackState::Tentative,
        };
        track.record(observation.verdict, window);
        track
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn displayed(&self) -> &Identity {
        &self.displayed
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    /// Verdicts in the window, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &MatchResult> {
        self.history.iter()
    }

    fn observe(&mut self, observation: Observation, window: usize) {
        self.bbox = observation.bbox;
        self.misses = 0;
        self.record(observation.verdict, window);
    }

    fn record(&mut self, verdict: MatchResult, window: usize) {
        if verdict.identity.is_known() {
            self.state = TrackState::Confirmed;
        }
        while self.history.len() >= window.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(verdict);

        let (identity, confidence) = vote(&self.history, &self.displayed);
        self.displayed = identity;
        self.confidence = confidence;
    }

    fn report(&self) -> TrackReport {
        TrackReport {
            track_id: self.id,
            bbox: self.bbox,
            identity: self.displayed.clone(),
            confidence: self.confidence,
            state: self.state,
            misses: self.misses,
        }
    }
}

/// Per-frame output for one active track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackReport {
    pub track_id: u64,
    pub bbox: BoundingBox,
    pub identity: Identity,
    pub confidence: f32,
    pub state: TrackState,
    pub misses: u32,
}

/// Result of one tracker step.
#[derive(Debug, Clone, Default)]
pub struct TrackUpdate {
    /// Active tracks after this frame, ordered by id.
    pub reports: Vec<TrackReport>,
    /// Ids of tracks dropped this frame.
    pub expired: Vec<u64>,
}

/// Owns every track; nothing else reads or mutates track state.
#[derive(Debug, Clone)]
pub struct Tracker {
    params: TrackerParams,
    tracks: Vec<Track>,
    next_id: u64,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(TrackerParams::default())
    }
}

impl Tracker {
    pub fn new(params: TrackerParams) -> Self {
        Self {
            params,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn params(&self) -> &TrackerParams {
        &self.params
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Advance one processed frame.
    pub fn update(&mut self, observations: Vec<Observation>) -> TrackUpdate {
        let window = self.params.vote_window;
        let assignments = self.associate(&observations);

        let mut track_matched = vec![false; self.tracks.len()];
        let mut slots: Vec<Option<Observation>> = observations.into_iter().map(Some).collect();

        for (ti, di) in assignments {
            if let Some(obs) = slots[di].take() {
                self.tracks[ti].observe(obs, window);
                track_matched[ti] = true;
            }
        }

        let expiry = self.params.expiry_frames;
        let mut expired = Vec::new();
        for (track, matched) in self.tracks.iter_mut().zip(&track_matched) {
            if !matched {
                track.misses += 1;
                if track.misses > expiry {
                    expired.push(track.id);
                }
            }
        }
        if !expired.is_empty() {
            self.tracks.retain(|t| t.misses <= expiry);
            for id in &expired {
                tracing::debug!(track_id = id, "track expired");
            }
        }

        for obs in slots.into_iter().flatten() {
            let id = self.next_id;
            self.next_id += 1;
            let track = Track::new(id, obs, window);
            tracing::debug!(track_id = id, identity = %track.displayed, "track created");
            self.tracks.push(track);
        }

        TrackUpdate {
            reports: self.tracks.iter().map(Track::report).collect(),
            expired,
        }
    }

    /// Greedy IoU matching: pairs above threshold sorted by descending IoU,
    /// each track and detection used at most once. Returns (track, detection).
    fn associate(&self, observations: &[Observation]) -> Vec<(usize, usize)> {
        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, obs) in observations.iter().enumerate() {
                let score = track.bbox.iou(&obs.bbox);
                if score >= self.params.iou_threshold {
                    pairs.push((ti, di, score));
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
                .then_with(|| a.1.cmp(&b.1))
        });

        let mut used_tracks = vec![false; self.tracks.len()];
        let mut used_dets = vec![false; observations.len()];
        let mut matches = Vec::new();

        for (ti, di, _) in pairs {
            if !used_tracks[ti] && !used_dets[di] {
                used_tracks[ti] = true;
                used_dets[di] = true;
                matches.push((ti, di));
            }
        }

        matches
    }
}

/// Confidence-weighted vote over a verdict window.
///
/// Each candidate (including unknown) scores the sum of its confidences. The
/// highest score wins; on a tie the previously displayed identity is kept if
/// it is among the leaders, otherwise the leader seen most recently wins.
/// Returned confidence is the winner's score divided by the window length.
///
/// Unknown verdicts carry confidence 0, so they never outweigh a known
/// candidate: a single weak known verdict in an otherwise unknown window is
/// displayed at once, with a correspondingly low confidence.
fn vote(history: &VecDeque<MatchResult>, previous: &Identity) -> (Identity, f32) {
    // (candidate, weight, index of latest occurrence)
    let mut tally: Vec<(&Identity, f32, usize)> = Vec::new();
    for (i, verdict) in history.iter().enumerate() {
        match tally.iter_mut().find(|(id, _, _)| *id == &verdict.identity) {
            Some(entry) => {
                entry.1 += verdict.confidence;
                entry.2 = i;
            }
            None => tally.push((&verdict.identity, verdict.confidence, i)),
        }
    }

    let Some(best) = tally.iter().map(|(_, w, _)| *w).reduce(f32::max) else {
        return (previous.clone(), 0.0);
    };
    let leaders = tally
        .iter()
        .filter(|(_, w, _)| (best - *w).abs() <= VOTE_TIE_EPSILON);

    let mut winner: Option<&(&Identity, f32, usize)> = None;
    for entry in leaders {
        if entry.0 == previous {
            winner = Some(entry);
            break;
        }
        if winner.map_or(true, |w| entry.2 > w.2) {
            winner = Some(entry);
        }
    }

    match winner {
        Some((identity, weight, _)) => ((*identity).clone(), weight / history.len() as f32),
        None => (previous.clone(), 0.0),
    }
}
