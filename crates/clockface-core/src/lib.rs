//! clockface-core: Biometric identification and attendance session engine.
//!
//! Extracts fixed-length feature vectors from photos, identifies the nearest
//! enrolled employee, and drives the daily check-in/check-out state machine
//! against pluggable template, session and image stores.

pub mod attendance;
pub mod features;
pub mod matcher;
pub mod store;
pub mod time;
pub mod types;

pub use attendance::{
    AttendanceError, AttendanceSessionManager, CheckIn, CheckOut, DailySummary, ShiftPolicy,
};
pub use features::{FeatureError, FeatureExtractor, StatisticalExtractor, FEATURE_DIM};
pub use matcher::{ConfidenceTier, Identification, IdentificationEngine, MatchThresholds, Verification};
pub use store::{BlobStore, SessionRepository, StoreError, TemplateStore};
pub use time::{Clock, LocalZone, SystemClock};
pub use types::{
    AttendanceSession, AttendanceStatus, BlobRef, DayCounts, EmployeeId, EnrolledTemplate,
    FeatureVector, HistoryFilter, SessionClosure,
};
