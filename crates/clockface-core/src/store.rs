//! Collaborator contracts for templates, sessions and image blobs, plus
//! in-memory implementations of each.

use crate::types::{
    AttendanceSession, BlobRef, DayCounts, EmployeeId, EnrolledTemplate, HistoryFilter,
    SessionClosure,
};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("conflicting record: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage backend: {0}")]
    Backend(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Enrolled templates plus the employee roster they belong to.
///
/// `all` returns a point-in-time snapshot: callers compare against it with no
/// lock held. Writes replace a whole template at once.
pub trait TemplateStore: Send + Sync {
    /// Templates of active employees that have one.
    fn all(&self) -> Result<Vec<EnrolledTemplate>, StoreError>;

    /// Insert or replace an employee's template; last write wins. Unknown
    /// employees are registered as active.
    fn put(&self, template: EnrolledTemplate) -> Result<(), StoreError>;

    /// Add an employee to the roster without a template. No-op if present.
    fn register_employee(&self, employee_id: &EmployeeId) -> Result<(), StoreError>;

    fn set_active(&self, employee_id: &EmployeeId, active: bool) -> Result<(), StoreError>;

    fn active_employee_count(&self) -> Result<usize, StoreError>;
}

/// Durable attendance session records.
///
/// At most one session exists per (employee, day); `insert` surfaces a
/// duplicate as [`StoreError::Conflict`].
pub trait SessionRepository: Send + Sync {
    fn find(
        &self,
        employee_id: &EmployeeId,
        day: NaiveDate,
    ) -> Result<Option<AttendanceSession>, StoreError>;

    fn insert(&self, session: &AttendanceSession) -> Result<(), StoreError>;

    /// Close a still-open session. Returns `false` when the session is
    /// missing or already closed; nothing is written in that case.
    fn close(&self, session_id: &str, closure: &SessionClosure) -> Result<bool, StoreError>;

    /// Sessions matching the filter, newest check-in first.
    fn history(&self, filter: &HistoryFilter) -> Result<Vec<AttendanceSession>, StoreError>;

    fn day_counts(&self, day: NaiveDate) -> Result<DayCounts, StoreError>;
}

/// Raw image storage.
pub trait BlobStore: Send + Sync {
    /// Persist `bytes` under `name` (a relative path) and return a reference.
    fn store(&self, bytes: &[u8], name: &str) -> Result<BlobRef, StoreError>;

    fn remove(&self, blob: &BlobRef) -> Result<(), StoreError>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone)]
struct RosterEntry {
    active: bool,
    template: Option<Arc<EnrolledTemplate>>,
}

/// Template store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryTemplateStore {
    roster: RwLock<HashMap<EmployeeId, RosterEntry>>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TemplateStore for MemoryTemplateStore {
    fn all(&self) -> Result<Vec<EnrolledTemplate>, StoreError> {
        // Clone the Arcs under the read lock, deep-copy after releasing it.
        let snapshot: Vec<Arc<EnrolledTemplate>> = {
            let roster = self
                .roster
                .read()
                .map_err(|_| StoreError::Backend("template lock poisoned".into()))?;
            roster
                .values()
                .filter(|entry| entry.active)
                .filter_map(|entry| entry.template.clone())
                .collect()
        };
        Ok(snapshot.iter().map(|t| t.as_ref().clone()).collect())
    }

    fn put(&self, template: EnrolledTemplate) -> Result<(), StoreError> {
        let template = Arc::new(template);
        let mut roster = self
            .roster
            .write()
            .map_err(|_| StoreError::Backend("template lock poisoned".into()))?;
        roster
            .entry(template.employee_id.clone())
            .and_modify(|entry| entry.template = Some(template.clone()))
            .or_insert_with(|| RosterEntry {
                active: true,
                template: Some(template.clone()),
            });
        Ok(())
    }

    fn register_employee(&self, employee_id: &EmployeeId) -> Result<(), StoreError> {
        let mut roster = self
            .roster
            .write()
            .map_err(|_| StoreError::Backend("template lock poisoned".into()))?;
        roster.entry(employee_id.clone()).or_insert(RosterEntry {
            active: true,
            template: None,
        });
        Ok(())
    }

    fn set_active(&self, employee_id: &EmployeeId, active: bool) -> Result<(), StoreError> {
        let mut roster = self
            .roster
            .write()
            .map_err(|_| StoreError::Backend("template lock poisoned".into()))?;
        match roster.get_mut(employee_id) {
            Some(entry) => {
                entry.active = active;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("employee {employee_id}"))),
        }
    }

    fn active_employee_count(&self) -> Result<usize, StoreError> {
        let roster = self
            .roster
            .read()
            .map_err(|_| StoreError::Backend("template lock poisoned".into()))?;
        Ok(roster.values().filter(|entry| entry.active).count())
    }
}

/// Session repository held in process memory, keyed like the SQLite table.
#[derive(Debug, Default)]
pub struct MemorySessionRepository {
    sessions: Mutex<BTreeMap<(EmployeeId, NaiveDate), AttendanceSession>>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionRepository for MemorySessionRepository {
    fn find(
        &self,
        employee_id: &EmployeeId,
        day: NaiveDate,
    ) -> Result<Option<AttendanceSession>, StoreError> {
        Ok(lock(&self.sessions).get(&(employee_id.clone(), day)).cloned())
    }

    fn insert(&self, session: &AttendanceSession) -> Result<(), StoreError> {
        let mut sessions = lock(&self.sessions);
        let key = (session.employee_id.clone(), session.work_day);
        if sessions.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "session exists for {} on {}",
                session.employee_id, session.work_day
            )));
        }
        sessions.insert(key, session.clone());
        Ok(())
    }

    fn close(&self, session_id: &str, closure: &SessionClosure) -> Result<bool, StoreError> {
        let mut sessions = lock(&self.sessions);
        match sessions
            .values_mut()
            .find(|s| s.id == session_id && s.is_open())
        {
            Some(session) => {
                closure.apply_to(session);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn history(&self, filter: &HistoryFilter) -> Result<Vec<AttendanceSession>, StoreError> {
        let mut out: Vec<AttendanceSession> = lock(&self.sessions)
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.check_in_time.cmp(&a.check_in_time));
        Ok(out)
    }

    fn day_counts(&self, day: NaiveDate) -> Result<DayCounts, StoreError> {
        let sessions = lock(&self.sessions);
        let today = sessions.values().filter(|s| s.work_day == day);
        let (checked_in, checked_out) = today.fold((0, 0), |(i, o), s| {
            (i + 1, o + usize::from(!s.is_open()))
        });
        Ok(DayCounts {
            checked_in,
            checked_out,
        })
    }
}

/// Blob store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, blob: &BlobRef) -> Option<Vec<u8>> {
        lock(&self.blobs).get(blob.as_str()).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.blobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn store(&self, bytes: &[u8], name: &str) -> Result<BlobRef, StoreError> {
        lock(&self.blobs).insert(name.to_string(), bytes.to_vec());
        Ok(BlobRef::new(name))
    }

    fn remove(&self, blob: &BlobRef) -> Result<(), StoreError> {
        lock(&self.blobs).remove(blob.as_str());
        Ok(())
    }
}
