use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Guard added to vector norms so zero vectors compare as 0.0 instead of NaN.
const NORM_EPSILON: f64 = 1e-7;

/// Opaque employee identifier. Ordered lexicographically; the ordering is the
/// identification tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmployeeId(String);

impl EmployeeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EmployeeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EmployeeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Reference to an image persisted by a [`BlobStore`](crate::store::BlobStore).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(String);

impl BlobRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Numeric summary of an image. The statistical extractor always produces
/// 64 components; other extractors may use a different fixed length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    pub values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean norm.
    pub fn norm(&self) -> f64 {
        self.values
            .iter()
            .map(|&v| (v as f64) * (v as f64))
            .sum::<f64>()
            .sqrt()
    }

    /// Cosine similarity in approximately [-1, 1]. Higher = more similar.
    ///
    /// Both vectors are divided by their norm plus a small epsilon before the
    /// dot product. Vectors of different lengths are not comparable and
    /// score 0.0.
    pub fn similarity(&self, other: &FeatureVector) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let denom_a = self.norm() + NORM_EPSILON;
        let denom_b = other.norm() + NORM_EPSILON;

        let dot: f64 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| (a as f64 / denom_a) * (b as f64 / denom_b))
            .sum();

        dot as f32
    }
}

/// The stored vector (and source images) identifying one employee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledTemplate {
    pub employee_id: EmployeeId,
    pub feature_vector: FeatureVector,
    pub enrollment_image_refs: Vec<BlobRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    OnTime,
    Late,
    EarlyLeave,
    Absent,
    Holiday,
    Leave,
    Overtime,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnTime => "on_time",
            Self::Late => "late",
            Self::EarlyLeave => "early_leave",
            Self::Absent => "absent",
            Self::Holiday => "holiday",
            Self::Leave => "leave",
            Self::Overtime => "overtime",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "on_time" => Some(Self::OnTime),
            "late" => Some(Self::Late),
            "early_leave" => Some(Self::EarlyLeave),
            "absent" => Some(Self::Absent),
            "holiday" => Some(Self::Holiday),
            "leave" => Some(Self::Leave),
            "overtime" => Some(Self::Overtime),
            _ => None,
        }
    }
}

/// One employee's check-in/check-out record for one local calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSession {
    pub id: String,
    pub employee_id: EmployeeId,
    pub work_day: NaiveDate,
    pub check_in_time: DateTime<FixedOffset>,
    pub check_in_image: BlobRef,
    pub check_in_location: Option<String>,
    pub check_in_device: Option<String>,
    pub check_in_confidence: f32,
    pub check_out_time: Option<DateTime<FixedOffset>>,
    pub check_out_image: Option<BlobRef>,
    pub check_out_confidence: Option<f32>,
    pub work_hours: Option<f64>,
    pub status: AttendanceStatus,
    pub late_minutes: f64,
    pub early_leave_minutes: f64,
    pub overtime_hours: f64,
}

impl AttendanceSession {
    pub fn is_open(&self) -> bool {
        self.check_out_time.is_none()
    }
}

/// Fields written by a check-out. Applied only to a still-open session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionClosure {
    pub check_out_time: DateTime<FixedOffset>,
    pub check_out_image: BlobRef,
    pub check_out_confidence: f32,
    pub work_hours: f64,
    pub status: AttendanceStatus,
    pub early_leave_minutes: f64,
    pub overtime_hours: f64,
}

impl SessionClosure {
    pub fn apply_to(&self, session: &mut AttendanceSession) {
        session.check_out_time = Some(self.check_out_time);
        session.check_out_image = Some(self.check_out_image.clone());
        session.check_out_confidence = Some(self.check_out_confidence);
        session.work_hours = Some(self.work_hours);
        session.status = self.status;
        session.early_leave_minutes = self.early_leave_minutes;
        session.overtime_hours = self.overtime_hours;
    }
}

/// Filter for attendance history queries. Day bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub employee_id: Option<EmployeeId>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl HistoryFilter {
    pub fn matches(&self, session: &AttendanceSession) -> bool {
        self.employee_id
            .as_ref()
            .map_or(true, |id| *id == session.employee_id)
            && self.from.map_or(true, |from| session.work_day >= from)
            && self.to.map_or(true, |to| session.work_day <= to)
    }
}

/// Check-in/check-out counts for one local day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayCounts {
    pub checked_in: usize,
    pub checked_out: usize,
}
