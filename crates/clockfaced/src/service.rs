//! The attendance service: one object built at startup that turns photos into
//! identifications and attendance transitions.
//!
//! Everything here is synchronous; the D-Bus layer runs each call on the
//! blocking pool.

use chrono::{DateTime, FixedOffset, NaiveDate};
use clockface_core::attendance::safe_component;
use clockface_core::features::sniff_extension;
use clockface_core::time::TimeError;
use clockface_core::{
    AttendanceError, AttendanceSession, AttendanceSessionManager, AttendanceStatus, BlobRef,
    BlobStore, CheckIn, CheckOut, Clock, ConfidenceTier, DailySummary, EmployeeId,
    EnrolledTemplate, FeatureError, FeatureExtractor, FeatureVector, HistoryFilter,
    Identification, IdentificationEngine, LocalZone, MatchThresholds, SessionRepository,
    ShiftPolicy, StoreError, SystemClock, TemplateStore, Verification,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

const MAX_EMPLOYEE_ID_LEN: usize = 64;

/// Every caller-visible outcome other than success. Each kind stays distinct
/// all the way to the transport.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("feature extraction failed: {0}")]
    FeatureExtractionFailed(String),
    #[error("no enrolled employee matched")]
    NoMatch { best_similarity: Option<f32> },
    #[error("employee {employee_id} already checked in on {day}")]
    AlreadyCheckedIn { employee_id: EmployeeId, day: NaiveDate },
    #[error("no open session for employee {employee_id} on {day}")]
    NoOpenSession { employee_id: EmployeeId, day: NaiveDate },
    #[error("check-out at {check_out} is not after check-in at {check_in}")]
    CheckOutBeforeCheckIn {
        check_in: DateTime<FixedOffset>,
        check_out: DateTime<FixedOffset>,
    },
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(#[from] TimeError),
    #[error("unknown employee {0}")]
    UnknownEmployee(EmployeeId),
    /// Blob or record persistence failed; no attendance state changed.
    #[error("storage failure: {0}")]
    StorageFailure(#[from] StoreError),
}

impl From<FeatureError> for ServiceError {
    fn from(err: FeatureError) -> Self {
        match err {
            FeatureError::InvalidImage(msg) => Self::InvalidImage(msg),
            FeatureError::ExtractionFailed(msg) => Self::FeatureExtractionFailed(msg),
        }
    }
}

impl From<AttendanceError> for ServiceError {
    fn from(err: AttendanceError) -> Self {
        match err {
            AttendanceError::AlreadyCheckedIn { employee_id, day } => {
                Self::AlreadyCheckedIn { employee_id, day }
            }
            AttendanceError::NoOpenSession { employee_id, day } => {
                Self::NoOpenSession { employee_id, day }
            }
            AttendanceError::CheckOutBeforeCheckIn { check_in, check_out } => {
                Self::CheckOutBeforeCheckIn { check_in, check_out }
            }
            AttendanceError::Storage(err) => Self::StorageFailure(err),
        }
    }
}

fn check_image(image: &[u8], max_image_bytes: usize) -> Result<(), ServiceError> {
    if image.is_empty() {
        return Err(ServiceError::InvalidRequest("image is empty".into()));
    }
    if image.len() > max_image_bytes {
        return Err(ServiceError::InvalidRequest(format!(
            "image is {} bytes, limit is {max_image_bytes}",
            image.len()
        )));
    }
    Ok(())
}

fn parse_employee_id(raw: &str) -> Result<EmployeeId, ServiceError> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(ServiceError::InvalidRequest("employee id is empty".into()));
    }
    if id.len() > MAX_EMPLOYEE_ID_LEN || id.chars().any(char::is_control) {
        return Err(ServiceError::InvalidRequest(format!(
            "employee id {id:?} is not acceptable"
        )));
    }
    Ok(EmployeeId::new(id))
}

/// Register or replace an employee's template from one or more photos.
#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub employee_id: String,
    /// Tried in order; the first that yields a vector is enrolled.
    pub images: Vec<Vec<u8>>,
}

impl EnrollRequest {
    pub fn validate(&self, max_image_bytes: usize) -> Result<EmployeeId, ServiceError> {
        let employee_id = parse_employee_id(&self.employee_id)?;
        if self.images.is_empty() {
            return Err(ServiceError::InvalidRequest("no images supplied".into()));
        }
        for image in &self.images {
            check_image(image, max_image_bytes)?;
        }
        Ok(employee_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckInRequest {
    pub image: Vec<u8>,
    /// Event time; `Z` or an offset is honoured, otherwise local time.
    /// Defaults to now.
    pub timestamp: Option<String>,
    pub location: Option<String>,
    pub device_info: Option<String>,
}

impl CheckInRequest {
    pub fn validate(&self, max_image_bytes: usize) -> Result<(), ServiceError> {
        check_image(&self.image, max_image_bytes)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckOutRequest {
    pub image: Vec<u8>,
    pub timestamp: Option<String>,
}

impl CheckOutRequest {
    pub fn validate(&self, max_image_bytes: usize) -> Result<(), ServiceError> {
        check_image(&self.image, max_image_bytes)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollOutcome {
    pub employee_id: EmployeeId,
    pub feature_vector_length: usize,
    pub image_ref: BlobRef,
    /// Position of the enrolled photo in the request.
    pub image_index: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentifyOutcome {
    pub employee_id: EmployeeId,
    pub similarity: f32,
    pub tier: ConfidenceTier,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckInOutcome {
    pub session_id: String,
    pub employee_id: EmployeeId,
    pub check_in_time: DateTime<FixedOffset>,
    pub similarity: f32,
    pub status: AttendanceStatus,
    pub late_minutes: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckOutOutcome {
    pub session_id: String,
    pub employee_id: EmployeeId,
    pub check_out_time: DateTime<FixedOffset>,
    pub work_hours: f64,
    pub similarity: f32,
    pub status: AttendanceStatus,
    pub early_leave_minutes: f64,
    pub overtime_hours: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub version: &'static str,
    pub extractor: String,
    pub enrolled_templates: usize,
    pub active_employees: usize,
    pub accept_threshold: f32,
    pub verify_threshold: f32,
    pub utc_offset: String,
}

/// Tunables injected at construction.
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    pub thresholds: MatchThresholds,
    pub zone: LocalZone,
    pub shift: ShiftPolicy,
    pub max_image_bytes: usize,
}

pub struct AttendanceService {
    extractor: Box<dyn FeatureExtractor>,
    engine: IdentificationEngine,
    templates: Arc<dyn TemplateStore>,
    blobs: Arc<dyn BlobStore>,
    attendance: AttendanceSessionManager,
    clock: Box<dyn Clock>,
    max_image_bytes: usize,
}

impl AttendanceService {
    pub fn new(
        extractor: Box<dyn FeatureExtractor>,
        templates: Arc<dyn TemplateStore>,
        sessions: Arc<dyn SessionRepository>,
        blobs: Arc<dyn BlobStore>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            extractor,
            engine: IdentificationEngine::new(settings.thresholds),
            templates,
            attendance: AttendanceSessionManager::new(
                sessions,
                blobs.clone(),
                settings.zone,
                settings.shift,
            ),
            blobs,
            clock: Box::new(SystemClock),
            max_image_bytes: settings.max_image_bytes,
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn zone(&self) -> LocalZone {
        self.attendance.zone()
    }

    /// Supplied event time, or now, in the local zone.
    fn event_time(&self, raw: Option<&str>) -> Result<DateTime<FixedOffset>, ServiceError> {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Ok(self.zone().parse_timestamp(raw)?),
            None => Ok(self.zone().localize(&self.clock.now())),
        }
    }

    fn extract(&self, image: &[u8]) -> Result<FeatureVector, ServiceError> {
        Ok(self.extractor.extract(image)?)
    }

    /// Best match for a probe against a fresh gallery snapshot.
    fn identify_vector(&self, probe: &FeatureVector) -> Result<(EmployeeId, f32), ServiceError> {
        let gallery = self.templates.all()?;
        tracing::debug!(templates = gallery.len(), "gallery snapshot taken");

        match self.engine.identify(probe, &gallery) {
            Identification::Match {
                employee_id,
                similarity,
            } => Ok((employee_id, similarity)),
            Identification::NoMatch { best_similarity } => {
                tracing::warn!(?best_similarity, "no enrolled employee matched");
                Err(ServiceError::NoMatch { best_similarity })
            }
        }
    }

    pub fn enroll(&self, req: EnrollRequest) -> Result<EnrollOutcome, ServiceError> {
        let employee_id = req.validate(self.max_image_bytes)?;

        let mut first_error = None;
        let mut chosen = None;
        for (index, image) in req.images.iter().enumerate() {
            match self.extractor.extract(image) {
                Ok(vector) => {
                    chosen = Some((index, vector));
                    break;
                }
                Err(err) => {
                    tracing::debug!(%employee_id, index, error = %err, "enrollment image unusable");
                    first_error.get_or_insert(err);
                }
            }
        }
        let Some((index, feature_vector)) = chosen else {
            return Err(match first_error {
                Some(err) => err.into(),
                None => ServiceError::InvalidRequest("no images supplied".into()),
            });
        };

        let image = &req.images[index];
        // Fresh per call: a failed put must not remove a file the previous
        // template still references.
        let name = format!(
            "faces/{}_{index}_{}.{}",
            safe_component(employee_id.as_str()),
            Uuid::new_v4().simple(),
            sniff_extension(image)
        );
        let image_ref = self.blobs.store(image, &name)?;

        let feature_vector_length = feature_vector.len();
        let template = EnrolledTemplate {
            employee_id: employee_id.clone(),
            feature_vector,
            enrollment_image_refs: vec![image_ref.clone()],
        };
        if let Err(err) = self.templates.put(template) {
            if let Err(remove_err) = self.blobs.remove(&image_ref) {
                tracing::warn!(blob = %image_ref, error = %remove_err, "failed to remove orphaned enrollment image");
            }
            return Err(err.into());
        }

        tracing::info!(%employee_id, image = %image_ref, "template enrolled");
        Ok(EnrollOutcome {
            employee_id,
            feature_vector_length,
            image_ref,
            image_index: index,
        })
    }

    pub fn identify(&self, image: &[u8]) -> Result<IdentifyOutcome, ServiceError> {
        check_image(image, self.max_image_bytes)?;
        let probe = self.extract(image)?;
        let (employee_id, similarity) = self.identify_vector(&probe)?;
        Ok(IdentifyOutcome {
            employee_id,
            similarity,
            tier: ConfidenceTier::from_similarity(similarity),
        })
    }

    pub fn check_in(&self, req: CheckInRequest) -> Result<CheckInOutcome, ServiceError> {
        req.validate(self.max_image_bytes)?;
        let timestamp = self.event_time(req.timestamp.as_deref())?;
        let probe = self.extract(&req.image)?;
        let (employee_id, similarity) = self.identify_vector(&probe)?;

        let session = self.attendance.check_in(CheckIn {
            employee_id,
            timestamp,
            location: req.location,
            device_info: req.device_info,
            confidence: similarity,
            image: &req.image,
        })?;

        Ok(CheckInOutcome {
            session_id: session.id,
            employee_id: session.employee_id,
            check_in_time: session.check_in_time,
            similarity,
            status: session.status,
            late_minutes: session.late_minutes,
        })
    }

    pub fn check_out(&self, req: CheckOutRequest) -> Result<CheckOutOutcome, ServiceError> {
        req.validate(self.max_image_bytes)?;
        let timestamp = self.event_time(req.timestamp.as_deref())?;
        let probe = self.extract(&req.image)?;
        let (employee_id, similarity) = self.identify_vector(&probe)?;

        let session = self.attendance.check_out(CheckOut {
            employee_id,
            timestamp,
            confidence: similarity,
            image: &req.image,
        })?;

        let (Some(check_out_time), Some(work_hours)) = (session.check_out_time, session.work_hours)
        else {
            return Err(StoreError::Corrupt(format!("session {} closed without times", session.id)).into());
        };
        Ok(CheckOutOutcome {
            session_id: session.id,
            employee_id: session.employee_id,
            check_out_time,
            work_hours,
            similarity,
            status: session.status,
            early_leave_minutes: session.early_leave_minutes,
            overtime_hours: session.overtime_hours,
        })
    }

    /// Compare two photos one-to-one.
    pub fn verify(&self, image_a: &[u8], image_b: &[u8]) -> Result<Verification, ServiceError> {
        check_image(image_a, self.max_image_bytes)?;
        check_image(image_b, self.max_image_bytes)?;
        let a = self.extract(image_a)?;
        let b = self.extract(image_b)?;
        Ok(self.engine.verify(&a, &b))
    }

    /// Totals for the current local day.
    pub fn today_status(&self) -> Result<DailySummary, ServiceError> {
        let day = self.zone().day_of(&self.clock.now());
        let total = self.templates.active_employee_count()?;
        let counts = self.attendance.day_counts(day)?;
        Ok(DailySummary::new(day, total, counts))
    }

    pub fn history(&self, filter: &HistoryFilter) -> Result<Vec<AttendanceSession>, ServiceError> {
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(ServiceError::InvalidRequest(format!(
                    "range start {from} is after end {to}"
                )));
            }
        }
        Ok(self.attendance.history(filter)?)
    }

    pub fn register_employee(&self, employee_id: &str) -> Result<EmployeeId, ServiceError> {
        let employee_id = parse_employee_id(employee_id)?;
        self.templates.register_employee(&employee_id)?;
        tracing::info!(%employee_id, "employee registered");
        Ok(employee_id)
    }

    pub fn set_employee_active(&self, employee_id: &str, active: bool) -> Result<(), ServiceError> {
        let employee_id = parse_employee_id(employee_id)?;
        match self.templates.set_active(&employee_id, active) {
            Ok(()) => {
                tracing::info!(%employee_id, active, "employee active flag changed");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Err(ServiceError::UnknownEmployee(employee_id)),
            Err(err) => Err(err.into()),
        }
    }

    pub fn status(&self) -> Result<ServiceStatus, ServiceError> {
        let thresholds = self.engine.thresholds();
        Ok(ServiceStatus {
            version: env!("CARGO_PKG_VERSION"),
            extractor: self.extractor.name().to_string(),
            enrolled_templates: self.templates.all()?.len(),
            active_employees: self.templates.active_employee_count()?,
            accept_threshold: thresholds.accept,
            verify_threshold: thresholds.verify,
            utc_offset: self.zone().offset().to_string(),
        })
    }
}
