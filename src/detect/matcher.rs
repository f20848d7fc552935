use crate::detect::result::{Embedding, IdentityMatch};

/// Identity lookup for face embeddings.
///
/// The core only forwards embeddings; the reference catalog behind a matcher
/// is owned elsewhere.
pub trait IdentityMatcher: Send + Sync {
    fn best_match(&self, embedding: &Embedding) -> Option<IdentityMatch>;
}

/// In-memory reference gallery with nearest-neighbour matching.
///
/// A match is accepted when the Euclidean distance is within `tolerance`;
/// its confidence is `1 - distance`.
#[derive(Clone, Debug)]
pub struct ReferenceGallery {
    entries: Vec<(String, Embedding)>,
    tolerance: f32,
}

pub const DEFAULT_MATCH_TOLERANCE: f32 = 0.6;

impl ReferenceGallery {
    pub fn new(tolerance: f32) -> Self {
        Self {
            entries: Vec::new(),
            tolerance,
        }
    }

    /// Add a reference embedding. Several embeddings may share one name.
    pub fn insert(&mut self, name: impl Into<String>, embedding: Embedding) {
        self.entries.push((name.into(), embedding));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ReferenceGallery {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_TOLERANCE)
    }
}

impl IdentityMatcher for ReferenceGallery {
    fn best_match(&self, embedding: &Embedding) -> Option<IdentityMatch> {
        let (name, distance) = self
            .entries
            .iter()
            .map(|(name, reference)| (name, reference.distance(embedding)))
            .min_by(|a, b| a.1.total_cmp(&b.1))?;
        if distance > self.tolerance {
            return None;
        }
        Some(IdentityMatch {
            label: display_name(name),
            confidence: (1.0 - distance).clamp(0.0, 1.0),
        })
    }
}

/// Reference names carry upload suffixes (`alice_2`, `bob-front`); strip them.
fn display_name(name: &str) -> String {
    name.split('_')
        .next()
        .unwrap_or(name)
        .split('-')
        .next()
        .unwrap_or(name)
        .trim()
        .to_string()
}
