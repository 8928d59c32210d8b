use crate::types::{EmployeeId, EnrolledTemplate, FeatureVector};
use serde::{Deserialize, Serialize};

/// Default minimum similarity for accepting an identification.
pub const DEFAULT_ACCEPT_THRESHOLD: f32 = 0.5;
/// Default cutoff for a positive one-to-one verification.
pub const DEFAULT_VERIFY_THRESHOLD: f32 = 0.6;

const HIGH_TIER_FLOOR: f32 = 0.8;
const MEDIUM_TIER_FLOOR: f32 = 0.6;

/// Thresholds for identification and verification. The two are configured
/// independently.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchThresholds {
    /// Best similarity must be strictly greater than this to identify.
    pub accept: f32,
    /// Verification reports a match when similarity is strictly greater.
    pub verify: f32,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            accept: DEFAULT_ACCEPT_THRESHOLD,
            verify: DEFAULT_VERIFY_THRESHOLD,
        }
    }
}

/// Outcome of matching a probe against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum Identification {
    Match {
        employee_id: EmployeeId,
        similarity: f32,
    },
    NoMatch {
        /// Best similarity seen, if the gallery was non-empty.
        best_similarity: Option<f32>,
    },
}

impl Identification {
    pub fn employee_id(&self) -> Option<&EmployeeId> {
        match self {
            Self::Match { employee_id, .. } => Some(employee_id),
            Self::NoMatch { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

impl ConfidenceTier {
    pub fn from_similarity(similarity: f32) -> Self {
        if similarity > HIGH_TIER_FLOOR {
            Self::High
        } else if similarity > MEDIUM_TIER_FLOOR {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Result of comparing two vectors one-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    #[serde(rename = "match")]
    pub matched: bool,
    pub tier: ConfidenceTier,
    pub similarity: f32,
}

/// Nearest-template identification over a gallery snapshot.
///
/// Every candidate is scored; the highest similarity wins and ties go to the
/// smallest employee id, so the result does not depend on gallery order.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentificationEngine {
    thresholds: MatchThresholds,
}

impl IdentificationEngine {
    pub fn new(thresholds: MatchThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> MatchThresholds {
        self.thresholds
    }

    pub fn identify<'a, I>(&self, probe: &FeatureVector, gallery: I) -> Identification
    where
        I: IntoIterator<Item = &'a EnrolledTemplate>,
    {
        let best = gallery
            .into_iter()
            .map(|template| {
                let similarity = probe.similarity(&template.feature_vector);
                tracing::debug!(employee_id = %template.employee_id, similarity, "scored candidate");
                (similarity, &template.employee_id)
            })
            .fold(None::<(f32, &EmployeeId)>, |best, candidate| match best {
                None => Some(candidate),
                Some(current) if outranks(candidate, current) => Some(candidate),
                keep => keep,
            });

        match best {
            Some((similarity, employee_id)) if similarity > self.thresholds.accept => {
                Identification::Match {
                    employee_id: employee_id.clone(),
                    similarity,
                }
            }
            best => Identification::NoMatch {
                best_similarity: best.map(|(similarity, _)| similarity),
            },
        }
    }

    pub fn verify(&self, a: &FeatureVector, b: &FeatureVector) -> Verification {
        let similarity = a.similarity(b);
        Verification {
            matched: similarity > self.thresholds.verify,
            tier: ConfidenceTier::from_similarity(similarity),
            similarity,
        }
    }
}

/// Higher similarity wins; equal similarity goes to the smaller id.
fn outranks(candidate: (f32, &EmployeeId), current: (f32, &EmployeeId)) -> bool {
    match candidate.0.total_cmp(&current.0) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Equal => candidate.1 < current.1,
        std::cmp::Ordering::Less => false,
    }
}
