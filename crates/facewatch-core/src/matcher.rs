//! Gallery matching: find the known identity nearest to a probe embedding.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("malformed encoding: {0}")]
    MalformedEncoding(String),
}

/// Distance function used to compare two embeddings. Smaller = more similar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// L2 distance in embedding space.
    #[default]
    Euclidean,
    /// `1 - cosine_similarity`, in [0, 2].
    Cosine,
}

impl Metric {
    pub fn distance(self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            Metric::Euclidean => a.euclidean_distance(b),
            Metric::Cosine => 1.0 - a.similarity(b),
        }
    }

    /// Raw distance between two unit-length embeddings whose cosine
    /// similarity is `similarity`.
    pub fn unit_distance_at(self, similarity: f32) -> f32 {
        match self {
            Metric::Euclidean => (2.0 - 2.0 * similarity).max(0.0).sqrt(),
            Metric::Cosine => 1.0 - similarity,
        }
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            "cosine" => Ok(Metric::Cosine),
            other => Err(format!("unknown metric {other:?} (expected euclidean or cosine)")),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Euclidean => f.write_str("euclidean"),
            Metric::Cosine => f.write_str("cosine"),
        }
    }
}

/// One known identity with its reference encodings.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub name: String,
    pub encodings: Vec<Embedding>,
}

/// Immutable snapshot of the known-face library.
///
/// Entries keep insertion order, and every entry holds at least one
/// encoding. Matching iterates in this order, so ties go to the identity
/// that was added first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an encoding to `name`, creating the identity at the end of the
    /// gallery if it is not present yet.
    pub fn push(&mut self, name: impl Into<String>, encoding: Embedding) {
        let name = name.into();
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry.encodings.push(encoding),
            None => self.entries.push(GalleryEntry {
                name,
                encodings: vec![encoding],
            }),
        }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    /// Number of identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of reference encodings across all identities.
    pub fn encoding_count(&self) -> usize {
        self.entries.iter().map(|e| e.encodings.len()).sum()
    }
}

impl<S: Into<String>> FromIterator<(S, Embedding)> for Gallery {
    fn from_iter<I: IntoIterator<Item = (S, Embedding)>>(iter: I) -> Self {
        let mut gallery = Gallery::new();
        for (name, encoding) in iter {
            gallery.push(name, encoding);
        }
        gallery
    }
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Match { identity: String, distance: f32 },
    /// No identity within tolerance. `nearest` is the best distance seen,
    /// `None` when the gallery was empty.
    NoMatch { nearest: Option<f32> },
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Match { .. })
    }

    pub fn identity(&self) -> Option<&str> {
        match self {
            MatchResult::Match { identity, .. } => Some(identity),
            MatchResult::NoMatch { .. } => None,
        }
    }

    pub fn distance(&self) -> Option<f32> {
        match self {
            MatchResult::Match { distance, .. } => Some(*distance),
            MatchResult::NoMatch { nearest } => *nearest,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of known faces.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        tolerance: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Nearest-identity matcher.
///
/// Each identity is scored by the closest of its encodings; the identity with
/// the smallest score wins if that score is within `tolerance`. Ties keep the
/// first identity in gallery order.
///
/// Scores are raw metric distances multiplied by `scale`, so a tolerance can
/// be expressed on a scale fitted to the embedding model.
#[derive(Debug, Clone, Copy)]
pub struct DistanceMatcher {
    metric: Metric,
    scale: f32,
}

impl DistanceMatcher {
    pub fn new(metric: Metric) -> Self {
        Self { metric, scale: 1.0 }
    }

    /// Multiply every raw distance by `scale` before comparing it with the
    /// tolerance.
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// Scale chosen so that unit embeddings at cosine `similarity` score
    /// exactly `tolerance`.
    pub fn calibrated(metric: Metric, similarity: f32, tolerance: f32) -> Self {
        let raw = metric.unit_distance_at(similarity);
        let scale = if raw > 0.0 { tolerance / raw } else { 1.0 };
        Self::new(metric).with_scale(scale)
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }
}

impl Default for DistanceMatcher {
    fn default() -> Self {
        Self::new(Metric::default())
    }
}

impl Matcher for DistanceMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        tolerance: f32,
    ) -> Result<MatchResult, MatchError> {
        validate(probe, gallery)?;

        let mut best: Option<(&str, f32)> = None;

        for entry in gallery.entries() {
            let identity_best = entry
                .encodings
                .iter()
                .map(|reference| self.metric.distance(probe, reference) * self.scale)
                .fold(f32::INFINITY, f32::min);

            // Strict comparison: on equal distance the earlier identity stays.
            if best.map_or(true, |(_, d)| identity_best < d) {
                best = Some((&entry.name, identity_best));
            }
        }

        Ok(match best {
            Some((name, distance)) if distance <= tolerance => MatchResult::Match {
                identity: name.to_string(),
                distance,
            },
            Some((_, distance)) => MatchResult::NoMatch {
                nearest: Some(distance),
            },
            None => MatchResult::NoMatch { nearest: None },
        })
    }
}

/// Reject probes and galleries that cannot be compared element-wise.
fn validate(probe: &Embedding, gallery: &Gallery) -> Result<(), MatchError> {
    if probe.values.is_empty() {
        return Err(MatchError::MalformedEncoding(
            "query encoding has zero length".into(),
        ));
    }
    if probe.values.iter().any(|v| !v.is_finite()) {
        return Err(MatchError::MalformedEncoding(
            "query encoding contains non-finite values".into(),
        ));
    }

    let dim = probe.dim();
    for entry in gallery.entries() {
        if let Some(bad) = entry.encodings.iter().find(|e| e.dim() != dim) {
            return Err(MatchError::MalformedEncoding(format!(
                "identity {:?} has a {}-dim encoding, query has {dim}",
                entry.name,
                bad.dim()
            )));
        }
    }
    Ok(())
}
