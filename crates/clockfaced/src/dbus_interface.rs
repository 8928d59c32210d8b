use crate::service::{
    AttendanceService, CheckInRequest, CheckOutRequest, EnrollRequest, ServiceError,
};
use chrono::NaiveDate;
use clockface_core::{EmployeeId, HistoryFilter};
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.clockface.Attendance1";
pub const OBJECT_PATH: &str = "/org/clockface/Attendance1";

/// Errors returned over D-Bus, one error name per outcome kind.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.clockface.Attendance1.Error")]
pub enum AttendanceBusError {
    #[zbus(error)]
    ZBus(zbus::Error),
    InvalidRequest(String),
    InvalidImage(String),
    FeatureExtractionFailed(String),
    NoMatch(String),
    AlreadyCheckedIn(String),
    NoOpenSession(String),
    CheckOutBeforeCheckIn(String),
    InvalidTimestamp(String),
    UnknownEmployee(String),
    StorageFailure(String),
    Internal(String),
}

impl From<ServiceError> for AttendanceBusError {
    fn from(err: ServiceError) -> Self {
        let message = err.to_string();
        match err {
            ServiceError::InvalidRequest(_) => Self::InvalidRequest(message),
            ServiceError::InvalidImage(_) => Self::InvalidImage(message),
            ServiceError::FeatureExtractionFailed(_) => Self::FeatureExtractionFailed(message),
            ServiceError::NoMatch { .. } => Self::NoMatch(message),
            ServiceError::AlreadyCheckedIn { .. } => Self::AlreadyCheckedIn(message),
            ServiceError::NoOpenSession { .. } => Self::NoOpenSession(message),
            ServiceError::CheckOutBeforeCheckIn { .. } => Self::CheckOutBeforeCheckIn(message),
            ServiceError::InvalidTimestamp(_) => Self::InvalidTimestamp(message),
            ServiceError::UnknownEmployee(_) => Self::UnknownEmployee(message),
            ServiceError::StorageFailure(_) => Self::StorageFailure(message),
        }
    }
}

/// D-Bus interface for the Clockface attendance daemon.
///
/// Bus name: org.clockface.Attendance1
/// Object path: /org/clockface/Attendance1
///
/// Optional string arguments are passed as `""` when absent. Structured
/// replies are JSON strings.
pub struct AttendanceBus {
    service: Arc<AttendanceService>,
}

impl AttendanceBus {
    pub fn new(service: Arc<AttendanceService>) -> Self {
        Self { service }
    }

    /// Run a service call on the blocking pool.
    async fn run<T, F>(&self, op: F) -> Result<T, AttendanceBusError>
    where
        F: FnOnce(&AttendanceService) -> Result<T, ServiceError> + Send + 'static,
        T: Send + 'static,
    {
        let service = Arc::clone(&self.service);
        tokio::task::spawn_blocking(move || op(&service))
            .await
            .map_err(|e| AttendanceBusError::Internal(format!("worker task failed: {e}")))?
            .map_err(|err| {
                tracing::debug!(error = %err, "request failed");
                err.into()
            })
    }
}

fn optional(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn optional_day(value: String, field: &str) -> Result<Option<NaiveDate>, AttendanceBusError> {
    optional(value)
        .map(|raw| {
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| {
                AttendanceBusError::InvalidRequest(format!("{field} {raw:?} is not YYYY-MM-DD: {e}"))
            })
        })
        .transpose()
}

fn to_json<T: Serialize>(value: &T) -> Result<String, AttendanceBusError> {
    serde_json::to_string(value)
        .map_err(|e| AttendanceBusError::Internal(format!("failed to encode reply: {e}")))
}

#[interface(name = "org.clockface.Attendance1")]
impl AttendanceBus {
    /// Enroll (or re-enroll) an employee from one or more photos.
    async fn enroll(
        &self,
        employee_id: String,
        images: Vec<Vec<u8>>,
    ) -> Result<String, AttendanceBusError> {
        tracing::info!(employee_id = %employee_id, images = images.len(), "enroll requested");
        let outcome = self
            .run(move |svc| svc.enroll(EnrollRequest { employee_id, images }))
            .await?;
        to_json(&outcome)
    }

    /// Identify the employee in a photo without recording attendance.
    async fn identify(&self, image: Vec<u8>) -> Result<String, AttendanceBusError> {
        tracing::debug!(bytes = image.len(), "identify requested");
        let outcome = self.run(move |svc| svc.identify(&image)).await?;
        to_json(&outcome)
    }

    async fn check_in(
        &self,
        image: Vec<u8>,
        timestamp: String,
        location: String,
        device_info: String,
    ) -> Result<String, AttendanceBusError> {
        let req = CheckInRequest {
            image,
            timestamp: optional(timestamp),
            location: optional(location),
            device_info: optional(device_info),
        };
        tracing::debug!(timestamp = ?req.timestamp, "check-in requested");
        let outcome = self.run(move |svc| svc.check_in(req)).await?;
        to_json(&outcome)
    }

    async fn check_out(
        &self,
        image: Vec<u8>,
        timestamp: String,
    ) -> Result<String, AttendanceBusError> {
        let req = CheckOutRequest {
            image,
            timestamp: optional(timestamp),
        };
        tracing::debug!(timestamp = ?req.timestamp, "check-out requested");
        let outcome = self.run(move |svc| svc.check_out(req)).await?;
        to_json(&outcome)
    }

    /// Compare two photos one-to-one.
    async fn verify(
        &self,
        image_a: Vec<u8>,
        image_b: Vec<u8>,
    ) -> Result<String, AttendanceBusError> {
        let outcome = self.run(move |svc| svc.verify(&image_a, &image_b)).await?;
        to_json(&outcome)
    }

    async fn today_status(&self) -> Result<String, AttendanceBusError> {
        let summary = self.run(|svc| svc.today_status()).await?;
        to_json(&summary)
    }

    /// Sessions newest first. Empty arguments leave that bound open.
    async fn history(
        &self,
        employee_id: String,
        from: String,
        to: String,
    ) -> Result<String, AttendanceBusError> {
        let filter = HistoryFilter {
            employee_id: optional(employee_id).map(EmployeeId::new),
            from: optional_day(from, "from")?,
            to: optional_day(to, "to")?,
        };
        let sessions = self.run(move |svc| svc.history(&filter)).await?;
        to_json(&sessions)
    }

    async fn register_employee(&self, employee_id: String) -> Result<(), AttendanceBusError> {
        self.run(move |svc| svc.register_employee(&employee_id))
            .await
            .map(|_| ())
    }

    async fn set_employee_active(
        &self,
        employee_id: String,
        active: bool,
    ) -> Result<(), AttendanceBusError> {
        self.run(move |svc| svc.set_employee_active(&employee_id, active))
            .await
    }

    /// Return daemon status information.
    async fn status(&self) -> Result<String, AttendanceBusError> {
        let status = self.run(|svc| svc.status()).await?;
        to_json(&status)
    }
}
