//! SQLite-backed template store and session repository.
//!
//! One connection behind a mutex. Each trait call is a single statement, so
//! every write either lands whole or not at all.

use crate::migrations::run_migrations;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use clockface_core::{
    AttendanceSession, AttendanceStatus, BlobRef, DayCounts, EmployeeId, EnrolledTemplate,
    FeatureVector, HistoryFilter, SessionClosure, SessionRepository, StoreError, TemplateStore,
};
use rusqlite::{params, Connection, ErrorCode, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DAY_FORMAT: &str = "%Y-%m-%d";

const SESSION_COLUMNS: &str = "id, employee_id, work_day, check_in_time, check_in_image, \
     check_in_location, check_in_device, check_in_confidence, check_out_time, check_out_image, \
     check_out_confidence, work_hours, status, late_minutes, early_leave_minutes, overtime_hours";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and apply migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(sql_error)?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "attendance database ready");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(sql_error)?)
    }

    fn init(mut conn: Connection) -> Result<Self, StoreError> {
        match conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        }) {
            Ok(mode) => tracing::debug!(%mode, "journal mode set"),
            Err(e) => tracing::warn!(error = %e, "failed to enable WAL mode"),
        }
        conn.busy_timeout(BUSY_TIMEOUT).map_err(sql_error)?;
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Unique and primary-key violations become [`StoreError::Conflict`].
fn sql_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(code, message)
            if code.code == ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict(message.clone().unwrap_or_else(|| code.to_string()))
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn column<T: rusqlite::types::FromSql>(row: &Row<'_>, idx: usize) -> Result<T, StoreError> {
    row.get(idx).map_err(sql_error)
}

fn parse_time(raw: &str) -> Result<DateTime<FixedOffset>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map_err(|e| StoreError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

fn parse_day(raw: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(raw, DAY_FORMAT)
        .map_err(|e| StoreError::Corrupt(format!("work day {raw:?}: {e}")))
}

fn row_to_template(row: &Row<'_>) -> Result<EnrolledTemplate, StoreError> {
    let id: String = column(row, 0)?;
    let vector: String = column(row, 1)?;
    let refs: Option<String> = column(row, 2)?;

    let values: Vec<f32> = serde_json::from_str(&vector)
        .map_err(|e| StoreError::Corrupt(format!("feature vector for {id}: {e}")))?;
    let refs: Vec<String> = match refs {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| StoreError::Corrupt(format!("image refs for {id}: {e}")))?,
        None => Vec::new(),
    };

    Ok(EnrolledTemplate {
        employee_id: EmployeeId::new(id),
        feature_vector: FeatureVector::new(values),
        enrollment_image_refs: refs.into_iter().map(BlobRef::new).collect(),
    })
}

fn row_to_session(row: &Row<'_>) -> Result<AttendanceSession, StoreError> {
    let status: String = column(row, 12)?;
    let check_out_time: Option<String> = column(row, 8)?;

    Ok(AttendanceSession {
        id: column(row, 0)?,
        employee_id: EmployeeId::new(column::<String>(row, 1)?),
        work_day: parse_day(&column::<String>(row, 2)?)?,
        check_in_time: parse_time(&column::<String>(row, 3)?)?,
        check_in_image: BlobRef::new(column::<String>(row, 4)?),
        check_in_location: column(row, 5)?,
        check_in_device: column(row, 6)?,
        check_in_confidence: column::<f64>(row, 7)? as f32,
        check_out_time: check_out_time.as_deref().map(parse_time).transpose()?,
        check_out_image: column::<Option<String>>(row, 9)?.map(BlobRef::new),
        check_out_confidence: column::<Option<f64>>(row, 10)?.map(|c| c as f32),
        work_hours: column(row, 11)?,
        status: AttendanceStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status {status:?}")))?,
        late_minutes: column(row, 13)?,
        early_leave_minutes: column(row, 14)?,
        overtime_hours: column(row, 15)?,
    })
}

impl TemplateStore for SqliteStore {
    fn all(&self) -> Result<Vec<EnrolledTemplate>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, feature_vector, image_refs FROM employees \
                 WHERE is_active = 1 AND feature_vector IS NOT NULL ORDER BY id",
            )
            .map_err(sql_error)?;
        let mut rows = stmt.query([]).map_err(sql_error)?;

        let mut templates = Vec::new();
        while let Some(row) = rows.next().map_err(sql_error)? {
            templates.push(row_to_template(row)?);
        }
        Ok(templates)
    }

    fn put(&self, template: EnrolledTemplate) -> Result<(), StoreError> {
        let vector = serde_json::to_string(&template.feature_vector.values)
            .map_err(|e| StoreError::Backend(format!("encode feature vector: {e}")))?;
        let refs: Vec<&str> = template
            .enrollment_image_refs
            .iter()
            .map(BlobRef::as_str)
            .collect();
        let refs = serde_json::to_string(&refs)
            .map_err(|e| StoreError::Backend(format!("encode image refs: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO employees (id, is_active, feature_vector, image_refs, updated_at) \
                 VALUES (?1, 1, ?2, ?3, ?4) \
                 ON CONFLICT(id) DO UPDATE SET feature_vector = excluded.feature_vector, \
                 image_refs = excluded.image_refs, updated_at = excluded.updated_at",
                params![
                    template.employee_id.as_str(),
                    vector,
                    refs,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(sql_error)?;
        tracing::debug!(employee_id = %template.employee_id, "template stored");
        Ok(())
    }

    fn register_employee(&self, employee_id: &EmployeeId) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO employees (id, is_active, updated_at) VALUES (?1, 1, ?2) \
                 ON CONFLICT(id) DO NOTHING",
                params![employee_id.as_str(), Utc::now().to_rfc3339()],
            )
            .map_err(sql_error)?;
        Ok(())
    }

    fn set_active(&self, employee_id: &EmployeeId, active: bool) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE employees SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                params![active, Utc::now().to_rfc3339(), employee_id.as_str()],
            )
            .map_err(sql_error)?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("employee {employee_id}")));
        }
        Ok(())
    }

    fn active_employee_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM employees WHERE is_active = 1",
                [],
                |row| row.get(0),
            )
            .map_err(sql_error)?;
        Ok(count.max(0) as usize)
    }
}

impl SessionRepository for SqliteStore {
    fn find(
        &self,
        employee_id: &EmployeeId,
        day: NaiveDate,
    ) -> Result<Option<AttendanceSession>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM attendance_sessions \
                 WHERE employee_id = ?1 AND work_day = ?2"
            ))
            .map_err(sql_error)?;
        let mut rows = stmt
            .query(params![
                employee_id.as_str(),
                day.format(DAY_FORMAT).to_string()
            ])
            .map_err(sql_error)?;

        let session = match rows.next().map_err(sql_error)? {
            Some(row) => Some(row_to_session(row)?),
            None => None,
        };
        Ok(session)
    }

    fn insert(&self, session: &AttendanceSession) -> Result<(), StoreError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO attendance_sessions ({SESSION_COLUMNS}, check_in_ts) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    session.id,
                    session.employee_id.as_str(),
                    session.work_day.format(DAY_FORMAT).to_string(),
                    session.check_in_time.to_rfc3339(),
                    session.check_in_image.as_str(),
                    session.check_in_location,
                    session.check_in_device,
                    session.check_in_confidence as f64,
                    session.check_out_time.map(|t| t.to_rfc3339()),
                    session.check_out_image.as_ref().map(BlobRef::as_str),
                    session.check_out_confidence.map(|c| c as f64),
                    session.work_hours,
                    session.status.as_str(),
                    session.late_minutes,
                    session.early_leave_minutes,
                    session.overtime_hours,
                    session.check_in_time.timestamp_millis(),
                ],
            )
            .map_err(sql_error)?;
        Ok(())
    }

    fn close(&self, session_id: &str, closure: &SessionClosure) -> Result<bool, StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE attendance_sessions SET check_out_time = ?1, check_out_image = ?2, \
                 check_out_confidence = ?3, work_hours = ?4, status = ?5, \
                 early_leave_minutes = ?6, overtime_hours = ?7 \
                 WHERE id = ?8 AND check_out_time IS NULL",
                params![
                    closure.check_out_time.to_rfc3339(),
                    closure.check_out_image.as_str(),
                    closure.check_out_confidence as f64,
                    closure.work_hours,
                    closure.status.as_str(),
                    closure.early_leave_minutes,
                    closure.overtime_hours,
                    session_id,
                ],
            )
            .map_err(sql_error)?;
        Ok(changed == 1)
    }

    fn history(&self, filter: &HistoryFilter) -> Result<Vec<AttendanceSession>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM attendance_sessions \
                 WHERE (?1 IS NULL OR employee_id = ?1) \
                 AND (?2 IS NULL OR work_day >= ?2) \
                 AND (?3 IS NULL OR work_day <= ?3) \
                 ORDER BY check_in_ts DESC, id"
            ))
            .map_err(sql_error)?;
        let mut rows = stmt
            .query(params![
                filter.employee_id.as_ref().map(EmployeeId::as_str),
                filter.from.map(|d| d.format(DAY_FORMAT).to_string()),
                filter.to.map(|d| d.format(DAY_FORMAT).to_string()),
            ])
            .map_err(sql_error)?;

        let mut sessions = Vec::new();
        while let Some(row) = rows.next().map_err(sql_error)? {
            sessions.push(row_to_session(row)?);
        }
        Ok(sessions)
    }

    fn day_counts(&self, day: NaiveDate) -> Result<DayCounts, StoreError> {
        let (checked_in, checked_out): (i64, i64) = self
            .conn()
            .query_row(
                "SELECT COUNT(*), COUNT(check_out_time) FROM attendance_sessions \
                 WHERE work_day = ?1",
                params![day.format(DAY_FORMAT).to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(sql_error)?;
        Ok(DayCounts {
            checked_in: checked_in.max(0) as usize,
            checked_out: checked_out.max(0) as usize,
        })
    }
}
