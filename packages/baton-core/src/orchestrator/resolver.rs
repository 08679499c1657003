//! Deferred URL resolution: scoring search candidates for a queued query.
//!
//! A `search:<query>` track resolves just-in-time before playback. The
//! engine's search lookup returns candidates; this module scores them
//! against the query and the expected duration, preferring faithful
//! uploads over covers, remixes, and other derivatives.

use serde::{Deserialize, Serialize};

/// Title terms that usually mark a derivative upload. Penalized unless the
/// query itself asks for one.
const DERIVATIVE_TERMS: &[&str] = &[
    "cover",
    "remix",
    "karaoke",
    "instrumental",
    "reaction",
    "tutorial",
    "nightcore",
    "sped up",
    "slowed",
    "bass boosted",
    "lofi",
    "8d audio",
];

/// Long-form threshold: candidates past this are probably mixes or full
/// albums, wrong when a normal-length track is expected.
const LONG_FORM_SECS: f64 = 600.0;

/// One search candidate as surfaced to consumers and the scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchCandidate {
    /// Page URL of the candidate.
    pub url: String,
    /// Candidate title.
    pub title: String,
    /// Duration in seconds, when reported.
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

/// Scores one candidate against the query and expected duration.
pub fn score_candidate(
    candidate: &SearchCandidate,
    query: &str,
    expected_duration_secs: Option<f64>,
) -> i32 {
    let mut score = 0;
    let title = candidate.title.to_lowercase();
    let query = query.to_lowercase();

    if let (Some(expected), Some(actual)) = (expected_duration_secs, candidate.duration_secs) {
        let delta = (expected - actual).abs();
        score += if delta <= 3.0 {
            50
        } else if delta <= 10.0 {
            30
        } else if delta <= 30.0 {
            10
        } else {
            -20
        };

        if actual > LONG_FORM_SECS && expected < LONG_FORM_SECS {
            score -= 25;
        }
    }

    if title.contains("official audio") {
        score += 15;
    } else if title.contains("official") {
        score += 10;
    } else if title.contains("audio") {
        score += 5;
    }

    let derivative = DERIVATIVE_TERMS
        .iter()
        .any(|term| title.contains(term) && !query.contains(term));
    if derivative {
        score -= 15;
    }

    score
}

/// Picks the highest-scoring candidate, `None` when the list is empty.
#[must_use]
pub fn pick_best(
    candidates: &[SearchCandidate],
    query: &str,
    expected_duration_secs: Option<f64>,
) -> Option<&SearchCandidate> {
    candidates
        .iter()
        .max_by_key(|c| score_candidate(c, query, expected_duration_secs))
}
