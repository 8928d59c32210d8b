//! Daily attendance state machine.
//!
//! Per (employee, local day): `NoSession -> Open -> Closed`. A check-in opens
//! the day's session, the matching check-out closes it, and `Closed` is
//! terminal until the next local midnight. Operations on the same key are
//! serialized by a per-key lock; the repository's uniqueness constraint backs
//! that up across processes.

use crate::features::sniff_extension;
use crate::store::{lock, BlobStore, SessionRepository, StoreError};
use crate::time::{round2, work_hours, LocalZone};
use crate::types::{
    AttendanceSession, AttendanceStatus, BlobRef, DayCounts, EmployeeId, HistoryFilter,
    SessionClosure,
};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("employee {employee_id} already checked in on {day}")]
    AlreadyCheckedIn { employee_id: EmployeeId, day: NaiveDate },
    #[error("no open session for employee {employee_id} on {day}")]
    NoOpenSession { employee_id: EmployeeId, day: NaiveDate },
    #[error("check-out at {check_out} is not after check-in at {check_in}")]
    CheckOutBeforeCheckIn {
        check_in: DateTime<FixedOffset>,
        check_out: DateTime<FixedOffset>,
    },
    #[error("storage failure, attendance unchanged: {0}")]
    Storage(#[from] StoreError),
}

/// An identified employee arriving.
#[derive(Debug, Clone)]
pub struct CheckIn<'a> {
    pub employee_id: EmployeeId,
    pub timestamp: DateTime<FixedOffset>,
    pub location: Option<String>,
    pub device_info: Option<String>,
    /// Identification similarity.
    pub confidence: f32,
    /// Snapshot to persist with the session.
    pub image: &'a [u8],
}

/// An identified employee leaving.
#[derive(Debug, Clone)]
pub struct CheckOut<'a> {
    pub employee_id: EmployeeId,
    pub timestamp: DateTime<FixedOffset>,
    pub confidence: f32,
    pub image: &'a [u8],
}

/// Optional shift bounds used to grade a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShiftPolicy {
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
    pub late_grace_minutes: u32,
}

impl ShiftPolicy {
    /// Status and late minutes for a local check-in time.
    fn assess_check_in(&self, at: &DateTime<FixedOffset>) -> (AttendanceStatus, f64) {
        let Some(start) = self.start else {
            return (AttendanceStatus::OnTime, 0.0);
        };
        let minutes_late = (at.time() - start).num_seconds() as f64 / 60.0;
        if minutes_late > self.late_grace_minutes as f64 {
            (AttendanceStatus::Late, round2(minutes_late))
        } else {
            (AttendanceStatus::OnTime, 0.0)
        }
    }

    /// Status, early-leave minutes and overtime hours for a local check-out.
    /// Only an on-time session changes status.
    fn assess_check_out(
        &self,
        status: AttendanceStatus,
        at: &DateTime<FixedOffset>,
    ) -> (AttendanceStatus, f64, f64) {
        let Some(end) = self.end else {
            return (status, 0.0, 0.0);
        };
        let minutes_early = (end - at.time()).num_seconds() as f64 / 60.0;
        let promote = |next| if status == AttendanceStatus::OnTime { next } else { status };

        if minutes_early > 0.0 {
            (promote(AttendanceStatus::EarlyLeave), round2(minutes_early), 0.0)
        } else if minutes_early < 0.0 {
            (promote(AttendanceStatus::Overtime), 0.0, round2(-minutes_early / 60.0))
        } else {
            (status, 0.0, 0.0)
        }
    }
}

/// Daily totals for the attendance dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub total_employees: usize,
    pub checked_in: usize,
    pub checked_out: usize,
    pub absent: usize,
}

impl DailySummary {
    pub fn new(date: NaiveDate, total_employees: usize, counts: DayCounts) -> Self {
        Self {
            date,
            total_employees,
            checked_in: counts.checked_in,
            checked_out: counts.checked_out,
            absent: total_employees.saturating_sub(counts.checked_in),
        }
    }
}

type SessionKey = (EmployeeId, NaiveDate);

/// One mutex per live key; entries are dropped once no caller holds them.
#[derive(Default)]
struct KeyedLocks {
    slots: Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    fn with_key<T>(&self, key: &SessionKey, f: impl FnOnce() -> T) -> T {
        let slot = lock(&self.slots).entry(key.clone()).or_default().clone();

        let result = {
            let _guard = lock(&slot);
            f()
        };
        drop(slot);

        let mut slots = lock(&self.slots);
        if slots.get(key).is_some_and(|s| Arc::strong_count(s) == 1) {
            slots.remove(key);
        }
        result
    }
}

/// Owns the check-in/check-out lifecycle of attendance sessions.
pub struct AttendanceSessionManager {
    sessions: Arc<dyn SessionRepository>,
    blobs: Arc<dyn BlobStore>,
    zone: LocalZone,
    shift: ShiftPolicy,
    locks: KeyedLocks,
}

impl AttendanceSessionManager {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        blobs: Arc<dyn BlobStore>,
        zone: LocalZone,
        shift: ShiftPolicy,
    ) -> Self {
        Self {
            sessions,
            blobs,
            zone,
            shift,
            locks: KeyedLocks::default(),
        }
    }

    pub fn zone(&self) -> LocalZone {
        self.zone
    }

    /// Open today's session. Fails with `AlreadyCheckedIn` if the employee
    /// already has a session (open or closed) for the local day.
    pub fn check_in(&self, req: CheckIn<'_>) -> Result<AttendanceSession, AttendanceError> {
        let check_in_time = self.zone.localize(&req.timestamp);
        let day = check_in_time.date_naive();
        let key = (req.employee_id.clone(), day);

        self.locks.with_key(&key, || -> Result<AttendanceSession, AttendanceError> {
            if self.sessions.find(&req.employee_id, day)?.is_some() {
                tracing::warn!(employee_id = %req.employee_id, %day, "check-in rejected: already checked in");
                return Err(AttendanceError::AlreadyCheckedIn {
                    employee_id: req.employee_id.clone(),
                    day,
                });
            }

            let id = Uuid::new_v4();
            let name = snapshot_name("checkin", &req.employee_id, &check_in_time, &id, req.image);
            let image_ref = self.blobs.store(req.image, &name)?;
            let (status, late_minutes) = self.shift.assess_check_in(&check_in_time);

            let session = AttendanceSession {
                id: id.to_string(),
                employee_id: req.employee_id.clone(),
                work_day: day,
                check_in_time,
                check_in_image: image_ref.clone(),
                check_in_location: req.location.clone(),
                check_in_device: req.device_info.clone(),
                check_in_confidence: req.confidence,
                check_out_time: None,
                check_out_image: None,
                check_out_confidence: None,
                work_hours: None,
                status,
                late_minutes,
                early_leave_minutes: 0.0,
                overtime_hours: 0.0,
            };

            if let Err(err) = self.sessions.insert(&session) {
                self.discard_blob(&image_ref);
                return Err(match err {
                    StoreError::Conflict(_) => AttendanceError::AlreadyCheckedIn {
                        employee_id: req.employee_id.clone(),
                        day,
                    },
                    other => other.into(),
                });
            }

            tracing::info!(
                employee_id = %session.employee_id,
                %day,
                check_in = %session.check_in_time,
                status = session.status.as_str(),
                "session opened"
            );
            Ok(session)
        })
    }

    /// Close the employee's open session for the local day of `timestamp`.
    pub fn check_out(&self, req: CheckOut<'_>) -> Result<AttendanceSession, AttendanceError> {
        let check_out_time = self.zone.localize(&req.timestamp);
        let day = check_out_time.date_naive();
        let key = (req.employee_id.clone(), day);
        let no_open = || AttendanceError::NoOpenSession {
            employee_id: req.employee_id.clone(),
            day,
        };

        self.locks.with_key(&key, || -> Result<AttendanceSession, AttendanceError> {
            let open = match self.sessions.find(&req.employee_id, day)? {
                Some(session) if session.is_open() => session,
                _ => {
                    tracing::warn!(employee_id = %req.employee_id, %day, "check-out rejected: no open session");
                    return Err(no_open());
                }
            };

            if check_out_time <= open.check_in_time {
                return Err(AttendanceError::CheckOutBeforeCheckIn {
                    check_in: open.check_in_time,
                    check_out: check_out_time,
                });
            }

            let name = snapshot_name(
                "checkout",
                &req.employee_id,
                &check_out_time,
                &Uuid::new_v4(),
                req.image,
            );
            let image_ref = self.blobs.store(req.image, &name)?;
            let (status, early_leave_minutes, overtime_hours) =
                self.shift.assess_check_out(open.status, &check_out_time);

            let closure = SessionClosure {
                check_out_time,
                check_out_image: image_ref.clone(),
                check_out_confidence: req.confidence,
                work_hours: work_hours(&open.check_in_time, &check_out_time),
                status,
                early_leave_minutes,
                overtime_hours,
            };

            match self.sessions.close(&open.id, &closure) {
                Ok(true) => {
                    let mut closed = open;
                    closure.apply_to(&mut closed);
                    tracing::info!(
                        employee_id = %closed.employee_id,
                        %day,
                        work_hours = closure.work_hours,
                        "session closed"
                    );
                    Ok(closed)
                }
                Ok(false) => {
                    self.discard_blob(&image_ref);
                    Err(no_open())
                }
                Err(err) => {
                    self.discard_blob(&image_ref);
                    Err(err.into())
                }
            }
        })
    }

    /// Current state for (employee, day), if any session exists.
    pub fn session_for(
        &self,
        employee_id: &EmployeeId,
        day: NaiveDate,
    ) -> Result<Option<AttendanceSession>, StoreError> {
        self.sessions.find(employee_id, day)
    }

    pub fn history(&self, filter: &HistoryFilter) -> Result<Vec<AttendanceSession>, StoreError> {
        self.sessions.history(filter)
    }

    pub fn day_counts(&self, day: NaiveDate) -> Result<DayCounts, StoreError> {
        self.sessions.day_counts(day)
    }

    /// Remove a snapshot whose session write did not commit.
    fn discard_blob(&self, blob: &BlobRef) {
        if let Err(err) = self.blobs.remove(blob) {
            tracing::warn!(blob = %blob, error = %err, "failed to remove orphaned snapshot");
        }
    }
}

/// Blob name for an attendance photo. `nonce` is fresh per call, so a
/// compensating remove can only ever delete that call's own write.
fn snapshot_name(
    kind: &str,
    employee_id: &EmployeeId,
    at: &DateTime<FixedOffset>,
    nonce: &Uuid,
    image: &[u8],
) -> String {
    format!(
        "attendance/{kind}_{}_{}_{}.{}",
        safe_component(employee_id.as_str()),
        at.format("%Y%m%d_%H%M%S"),
        nonce.simple(),
        sniff_extension(image)
    )
}

/// Restrict an id to characters that are safe inside a file name.
pub fn safe_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBlobStore, MemorySessionRepository};
    use std::sync::Barrier;
    use std::thread;

    const SNAPSHOT: &[u8] = b"snapshot-bytes";

    struct Harness {
        repo: Arc<MemorySessionRepository>,
        blobs: Arc<MemoryBlobStore>,
        manager: AttendanceSessionManager,
    }

    fn harness_with(shift: ShiftPolicy) -> Harness {
        let repo = Arc::new(MemorySessionRepository::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let manager = AttendanceSessionManager::new(
            repo.clone(),
            blobs.clone(),
            LocalZone::default(),
            shift,
        );
        Harness { repo, blobs, manager }
    }

    fn harness() -> Harness {
        harness_with(ShiftPolicy::default())
    }

    fn ts(raw: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(raw).unwrap()
    }

    fn check_in(employee: &str, at: &str) -> CheckIn<'static> {
        CheckIn {
            employee_id: EmployeeId::from(employee),
            timestamp: ts(at),
            location: Some("lobby".into()),
            device_info: None,
            confidence: 0.93,
            image: SNAPSHOT,
        }
    }

    fn check_out(employee: &str, at: &str) -> CheckOut<'static> {
        CheckOut {
            employee_id: EmployeeId::from(employee),
            timestamp: ts(at),
            confidence: 0.88,
            image: SNAPSHOT,
        }
    }

    #[test]
    fn test_check_in_opens_session() {
        let h = harness();
        let s = h.manager.check_in(check_in("E", "2024-01-10T09:00:00+07:00")).unwrap();
        assert!(s.is_open());
        assert_eq!(s.work_day, NaiveDate::from_ymd_opt(2024, 1, 10).unwrap());
        assert_eq!(s.check_in_location.as_deref(), Some("lobby"));
        assert_eq!(s.check_in_confidence, 0.93);
        assert!(s.check_in_image.as_str().starts_with("attendance/checkin_E_20240110_090000"));
        assert_eq!(h.blobs.len(), 1);
    }

    #[test]
    fn test_second_check_in_same_day_rejected() {
        let h = harness();
        h.manager.check_in(check_in("E", "2024-01-10T09:00:00+07:00")).unwrap();
        let err = h
            .manager
            .check_in(check_in("E", "2024-01-10T09:05:00+07:00"))
            .unwrap_err();
        assert!(matches!(err, AttendanceError::AlreadyCheckedIn { .. }));
        assert_eq!(h.repo.len(), 1);
        assert_eq!(h.blobs.len(), 1);
    }

    #[test]
    fn test_check_out_computes_work_hours() {
        let h = harness();
        h.manager.check_in(check_in("E", "2024-01-10T09:00:00+07:00")).unwrap();
        let s = h.manager.check_out(check_out("E", "2024-01-10T17:30:00+07:00")).unwrap();
        assert_eq!(s.work_hours, Some(8.5));
        assert_eq!(s.check_out_confidence, Some(0.88));
        assert!(!s.is_open());

        let stored = h
            .manager
            .session_for(&EmployeeId::from("E"), s.work_day)
            .unwrap()
            .unwrap();
        assert_eq!(stored, s);
    }

    #[test]
    fn test_check_out_without_check_in() {
        let h = harness();
        let err = h
            .manager
            .check_out(check_out("F", "2024-01-10T17:30:00+07:00"))
            .unwrap_err();
        assert!(matches!(err, AttendanceError::NoOpenSession { .. }));
        assert!(h.blobs.is_empty());
    }

    #[test]
    fn test_closed_is_terminal_for_the_day() {
        let h = harness();
        h.manager.check_in(check_in("E", "2024-01-10T09:00:00+07:00")).unwrap();
        h.manager.check_out(check_out("E", "2024-01-10T17:00:00+07:00")).unwrap();

        assert!(matches!(
            h.manager.check_in(check_in("E", "2024-01-10T18:00:00+07:00")),
            Err(AttendanceError::AlreadyCheckedIn { .. })
        ));
        assert!(matches!(
            h.manager.check_out(check_out("E", "2024-01-10T19:00:00+07:00")),
            Err(AttendanceError::NoOpenSession { .. })
        ));
    }

    #[test]
    fn test_new_day_resets_state() {
        let h = harness();
        h.manager.check_in(check_in("E", "2024-01-10T23:59:59+07:00")).unwrap();
        let next = h.manager.check_in(check_in("E", "2024-01-11T00:00:01+07:00")).unwrap();
        assert_eq!(next.work_day, NaiveDate::from_ymd_opt(2024, 1, 11).unwrap());
        assert_eq!(h.repo.len(), 2);
    }

    #[test]
    fn test_utc_timestamp_grouped_by_local_day() {
        let h = harness();
        // 17:30 UTC on the 10th is 00:30 on the 11th locally.
        let s = h.manager.check_in(check_in("E", "2024-01-10T17:30:00Z")).unwrap();
        assert_eq!(s.work_day, NaiveDate::from_ymd_opt(2024, 1, 11).unwrap());
        assert_eq!(s.check_in_time.to_rfc3339(), "2024-01-11T00:30:00+07:00");
    }

    #[test]
    fn test_check_out_before_check_in_rejected() {
        let h = harness();
        h.manager.check_in(check_in("E", "2024-01-10T09:00:00+07:00")).unwrap();
        let err = h
            .manager
            .check_out(check_out("E", "2024-01-10T08:00:00+07:00"))
            .unwrap_err();
        assert!(matches!(err, AttendanceError::CheckOutBeforeCheckIn { .. }));
        let s = h
            .manager
            .session_for(&EmployeeId::from("E"), NaiveDate::from_ymd_opt(2024, 1, 10).unwrap())
            .unwrap()
            .unwrap();
        assert!(s.is_open());
    }

    #[test]
    fn test_concurrent_check_ins_exactly_one_wins() {
        let h = Arc::new(harness());
        let n = 16;
        let barrier = Arc::new(Barrier::new(n));

        let handles: Vec<_> = (0..n)
            .map(|i| {
                let h = h.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let at = format!("2024-01-10T09:00:{:02}+07:00", i);
                    h.manager.check_in(CheckIn {
                        employee_id: EmployeeId::from("E"),
                        timestamp: ts(&at),
                        location: None,
                        device_info: None,
                        confidence: 0.9,
                        image: SNAPSHOT,
                    })
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|t| t.join().unwrap()).collect();
        let opened = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(AttendanceError::AlreadyCheckedIn { .. })))
            .count();
        assert_eq!(opened, 1);
        assert_eq!(rejected, n - 1);
        assert_eq!(h.repo.len(), 1);
        assert_eq!(h.blobs.len(), 1);
    }

    #[test]
    fn test_concurrent_check_outs_close_once() {
        let h = Arc::new(harness());
        h.manager.check_in(check_in("E", "2024-01-10T09:00:00+07:00")).unwrap();
        let n = 8;
        let barrier = Arc::new(Barrier::new(n));

        let handles: Vec<_> = (0..n)
            .map(|_| {
                let h = h.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    h.manager.check_out(check_out("E", "2024-01-10T17:00:00+07:00"))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(AttendanceError::NoOpenSession { .. })))
                .count(),
            n - 1
        );
        // one check-in snapshot, one check-out snapshot
        assert_eq!(h.blobs.len(), 2);
    }

    #[test]
    fn test_different_employees_independent() {
        let h = harness();
        h.manager.check_in(check_in("A", "2024-01-10T09:00:00+07:00")).unwrap();
        h.manager.check_in(check_in("B", "2024-01-10T09:00:00+07:00")).unwrap();
        assert_eq!(h.repo.len(), 2);
    }

    struct FailingSessions {
        inner: MemorySessionRepository,
        fail_insert: bool,
        fail_close: bool,
    }

    impl SessionRepository for FailingSessions {
        fn find(&self, e: &EmployeeId, d: NaiveDate) -> Result<Option<AttendanceSession>, StoreError> {
            self.inner.find(e, d)
        }
        fn insert(&self, s: &AttendanceSession) -> Result<(), StoreError> {
            if self.fail_insert {
                return Err(StoreError::Backend("disk full".into()));
            }
            self.inner.insert(s)
        }
        fn close(&self, id: &str, c: &SessionClosure) -> Result<bool, StoreError> {
            if self.fail_close {
                return Err(StoreError::Backend("disk full".into()));
            }
            self.inner.close(id, c)
        }
        fn history(&self, f: &HistoryFilter) -> Result<Vec<AttendanceSession>, StoreError> {
            self.inner.history(f)
        }
        fn day_counts(&self, d: NaiveDate) -> Result<DayCounts, StoreError> {
            self.inner.day_counts(d)
        }
    }

    struct BrokenBlobs;

    impl BlobStore for BrokenBlobs {
        fn store(&self, _: &[u8], _: &str) -> Result<BlobRef, StoreError> {
            Err(StoreError::Io(std::io::Error::other("read-only filesystem")))
        }
        fn remove(&self, _: &BlobRef) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_insert_rolls_back_snapshot() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let sessions = Arc::new(FailingSessions {
            inner: MemorySessionRepository::new(),
            fail_insert: true,
            fail_close: false,
        });
        let manager = AttendanceSessionManager::new(
            sessions.clone(),
            blobs.clone(),
            LocalZone::default(),
            ShiftPolicy::default(),
        );

        let err = manager.check_in(check_in("E", "2024-01-10T09:00:00+07:00")).unwrap_err();
        assert!(matches!(err, AttendanceError::Storage(_)));
        assert!(err.to_string().contains("attendance unchanged"));
        assert!(blobs.is_empty());
        assert!(sessions.inner.is_empty());
    }

    #[test]
    fn test_failed_close_keeps_session_open() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let sessions = Arc::new(FailingSessions {
            inner: MemorySessionRepository::new(),
            fail_insert: false,
            fail_close: true,
        });
        let manager = AttendanceSessionManager::new(
            sessions.clone(),
            blobs.clone(),
            LocalZone::default(),
            ShiftPolicy::default(),
        );

        manager.check_in(check_in("E", "2024-01-10T09:00:00+07:00")).unwrap();
        let err = manager.check_out(check_out("E", "2024-01-10T17:00:00+07:00")).unwrap_err();
        assert!(matches!(err, AttendanceError::Storage(_)));
        assert_eq!(blobs.len(), 1);
        let s = sessions
            .inner
            .find(&EmployeeId::from("E"), NaiveDate::from_ymd_opt(2024, 1, 10).unwrap())
            .unwrap()
            .unwrap();
        assert!(s.is_open());
    }

    #[test]
    fn test_blob_failure_leaves_no_session() {
        let repo = Arc::new(MemorySessionRepository::new());
        let manager = AttendanceSessionManager::new(
            repo.clone(),
            Arc::new(BrokenBlobs),
            LocalZone::default(),
            ShiftPolicy::default(),
        );
        let err = manager.check_in(check_in("E", "2024-01-10T09:00:00+07:00")).unwrap_err();
        assert!(matches!(err, AttendanceError::Storage(StoreError::Io(_))));
        assert!(repo.is_empty());
    }

    /// Repository whose reads lag behind its writes, as seen by a second
    /// process sharing the same database.
    struct StaleSessions {
        inner: MemorySessionRepository,
        frozen: Mutex<Option<AttendanceSession>>,
    }

    impl StaleSessions {
        fn new() -> Self {
            Self {
                inner: MemorySessionRepository::new(),
                frozen: Mutex::new(None),
            }
        }

        fn freeze(&self, session: Option<AttendanceSession>) {
            *lock(&self.frozen) = session;
        }
    }

    impl SessionRepository for StaleSessions {
        fn find(&self, _: &EmployeeId, _: NaiveDate) -> Result<Option<AttendanceSession>, StoreError> {
            Ok(lock(&self.frozen).clone())
        }
        fn insert(&self, s: &AttendanceSession) -> Result<(), StoreError> {
            self.inner.insert(s)
        }
        fn close(&self, id: &str, c: &SessionClosure) -> Result<bool, StoreError> {
            self.inner.close(id, c)
        }
        fn history(&self, f: &HistoryFilter) -> Result<Vec<AttendanceSession>, StoreError> {
            self.inner.history(f)
        }
        fn day_counts(&self, d: NaiveDate) -> Result<DayCounts, StoreError> {
            self.inner.day_counts(d)
        }
    }

    fn stale_manager() -> (Arc<StaleSessions>, Arc<MemoryBlobStore>, AttendanceSessionManager) {
        let sessions = Arc::new(StaleSessions::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let manager = AttendanceSessionManager::new(
            sessions.clone(),
            blobs.clone(),
            LocalZone::default(),
            ShiftPolicy::default(),
        );
        (sessions, blobs, manager)
    }

    #[test]
    fn test_insert_conflict_is_already_checked_in() {
        let (sessions, blobs, manager) = stale_manager();
        let won = manager.check_in(check_in("E", "2024-01-10T09:00:00.100+07:00")).unwrap();

        let err = manager
            .check_in(check_in("E", "2024-01-10T09:00:00.700+07:00"))
            .unwrap_err();
        assert!(matches!(err, AttendanceError::AlreadyCheckedIn { .. }));

        assert_eq!(sessions.inner.len(), 1);
        let day = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let stored = sessions.inner.find(&EmployeeId::from("E"), day).unwrap().unwrap();
        assert_eq!(stored, won);
        assert_eq!(blobs.get(&won.check_in_image).as_deref(), Some(SNAPSHOT));
        assert_eq!(blobs.len(), 1);
    }

    #[test]
    fn test_lost_close_keeps_winner_snapshot() {
        let (sessions, blobs, manager) = stale_manager();
        let opened = manager.check_in(check_in("E", "2024-01-10T09:00:00+07:00")).unwrap();
        sessions.freeze(Some(opened));

        let closed = manager
            .check_out(check_out("E", "2024-01-10T17:00:00.100+07:00"))
            .unwrap();
        let err = manager
            .check_out(check_out("E", "2024-01-10T17:00:00.700+07:00"))
            .unwrap_err();
        assert!(matches!(err, AttendanceError::NoOpenSession { .. }));

        let out_ref = closed.check_out_image.clone().unwrap();
        assert!(blobs.get(&closed.check_in_image).is_some());
        assert!(blobs.get(&out_ref).is_some());
        assert_eq!(blobs.len(), 2);
    }

    #[test]
    fn test_colliding_safe_names_get_distinct_refs() {
        let h = harness();
        let a = h.manager.check_in(check_in("emp.1", "2024-01-10T09:00:00+07:00")).unwrap();
        let b = h.manager.check_in(check_in("emp/1", "2024-01-10T09:00:00+07:00")).unwrap();

        assert_ne!(a.check_in_image, b.check_in_image);
        assert!(a.check_in_image.as_str().starts_with("attendance/checkin_emp_1_20240110_090000_"));
        assert!(b.check_in_image.as_str().starts_with("attendance/checkin_emp_1_20240110_090000_"));
        assert_eq!(h.blobs.len(), 2);
    }

    fn office_hours() -> ShiftPolicy {
        ShiftPolicy {
            start: NaiveTime::from_hms_opt(8, 0, 0),
            end: NaiveTime::from_hms_opt(17, 0, 0),
            late_grace_minutes: 5,
        }
    }

    #[test]
    fn test_shift_grace_and_late() {
        let h = harness_with(office_hours());
        let on_time = h.manager.check_in(check_in("A", "2024-01-10T08:04:00+07:00")).unwrap();
        assert_eq!(on_time.status, AttendanceStatus::OnTime);
        assert_eq!(on_time.late_minutes, 0.0);

        let late = h.manager.check_in(check_in("B", "2024-01-10T08:20:00+07:00")).unwrap();
        assert_eq!(late.status, AttendanceStatus::Late);
        assert_eq!(late.late_minutes, 20.0);
    }

    #[test]
    fn test_shift_early_leave_and_overtime() {
        let h = harness_with(office_hours());
        h.manager.check_in(check_in("A", "2024-01-10T08:00:00+07:00")).unwrap();
        let early = h.manager.check_out(check_out("A", "2024-01-10T16:30:00+07:00")).unwrap();
        assert_eq!(early.status, AttendanceStatus::EarlyLeave);
        assert_eq!(early.early_leave_minutes, 30.0);

        h.manager.check_in(check_in("B", "2024-01-10T08:00:00+07:00")).unwrap();
        let over = h.manager.check_out(check_out("B", "2024-01-10T18:30:00+07:00")).unwrap();
        assert_eq!(over.status, AttendanceStatus::Overtime);
        assert_eq!(over.overtime_hours, 1.5);

        // a late arrival stays late even when leaving after hours
        h.manager.check_in(check_in("C", "2024-01-10T09:00:00+07:00")).unwrap();
        let late = h.manager.check_out(check_out("C", "2024-01-10T18:00:00+07:00")).unwrap();
        assert_eq!(late.status, AttendanceStatus::Late);
        assert_eq!(late.overtime_hours, 1.0);
    }

    #[test]
    fn test_daily_summary_absent_never_negative() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let s = DailySummary::new(day, 2, DayCounts { checked_in: 3, checked_out: 1 });
        assert_eq!(s.absent, 0);
        let s = DailySummary::new(day, 5, DayCounts { checked_in: 3, checked_out: 1 });
        assert_eq!(s.absent, 2);
    }

    #[test]
    fn test_safe_component() {
        assert_eq!(safe_component("../etc/passwd"), "___etc_passwd");
        assert_eq!(safe_component("emp-01_a"), "emp-01_a");
    }
}
