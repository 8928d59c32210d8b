use chrono::NaiveTime;
use clockface_core::matcher::{DEFAULT_ACCEPT_THRESHOLD, DEFAULT_VERIFY_THRESHOLD};
use clockface_core::time::DEFAULT_UTC_OFFSET_HOURS;
use clockface_core::{MatchThresholds, ShiftPolicy};
use std::path::PathBuf;

/// Default upload size cap: 5 MiB.
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Root directory for enrollment and attendance photos.
    pub upload_dir: PathBuf,
    /// Identification acceptance and verification cutoffs.
    pub thresholds: MatchThresholds,
    /// Fixed local zone used to key sessions by day.
    pub utc_offset_hours: i32,
    /// Images larger than this are rejected before decoding.
    pub max_image_bytes: usize,
    pub shift: ShiftPolicy,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `CLOCKFACE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("clockface");

        let db_path = var("CLOCKFACE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("attendance.db"));
        let upload_dir = var("CLOCKFACE_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("uploads"));

        Self {
            db_path,
            upload_dir,
            thresholds: MatchThresholds {
                accept: threshold(&var, "CLOCKFACE_ACCEPT_THRESHOLD", DEFAULT_ACCEPT_THRESHOLD),
                verify: threshold(&var, "CLOCKFACE_VERIFY_THRESHOLD", DEFAULT_VERIFY_THRESHOLD),
            },
            utc_offset_hours: parsed(&var, "CLOCKFACE_UTC_OFFSET_HOURS", DEFAULT_UTC_OFFSET_HOURS),
            max_image_bytes: parsed(&var, "CLOCKFACE_MAX_IMAGE_BYTES", DEFAULT_MAX_IMAGE_BYTES),
            shift: ShiftPolicy {
                start: shift_time(&var, "CLOCKFACE_SHIFT_START"),
                end: shift_time(&var, "CLOCKFACE_SHIFT_END"),
                late_grace_minutes: parsed(&var, "CLOCKFACE_LATE_GRACE_MINUTES", 0),
            },
            bus: match var("CLOCKFACE_BUS").as_deref() {
                Some("system") => BusKind::System,
                _ => BusKind::Session,
            },
        }
    }
}

fn parsed<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    var(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Similarity cutoff. NaN would make every comparison false.
fn threshold(var: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    let value = parsed(var, key, default);
    if value.is_finite() {
        value
    } else {
        tracing::warn!(key, value = %value, "ignoring non-finite threshold");
        default
    }
}

fn shift_time(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<NaiveTime> {
    let raw = var(key)?;
    match NaiveTime::parse_from_str(raw.trim(), "%H:%M") {
        Ok(time) => Some(time),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid shift time");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[("HOME", "/home/ops")]);
        assert_eq!(c.db_path, PathBuf::from("/home/ops/.local/share/clockface/attendance.db"));
        assert_eq!(c.upload_dir, PathBuf::from("/home/ops/.local/share/clockface/uploads"));
        assert_eq!(c.thresholds, MatchThresholds::default());
        assert_eq!(c.utc_offset_hours, 7);
        assert_eq!(c.max_image_bytes, 5_242_880);
        assert_eq!(c.shift, ShiftPolicy::default());
        assert_eq!(c.bus, BusKind::Session);
    }

    #[test]
    fn test_overrides() {
        let c = config(&[
            ("XDG_DATA_HOME", "/data"),
            ("CLOCKFACE_UPLOAD_DIR", "/srv/uploads"),
            ("CLOCKFACE_ACCEPT_THRESHOLD", "0.55"),
            ("CLOCKFACE_VERIFY_THRESHOLD", "0.7"),
            ("CLOCKFACE_UTC_OFFSET_HOURS", "-3"),
            ("CLOCKFACE_SHIFT_START", "08:30"),
            ("CLOCKFACE_LATE_GRACE_MINUTES", "10"),
            ("CLOCKFACE_BUS", "system"),
        ]);
        assert_eq!(c.db_path, PathBuf::from("/data/clockface/attendance.db"));
        assert_eq!(c.upload_dir, PathBuf::from("/srv/uploads"));
        assert!((c.thresholds.accept - 0.55).abs() < 1e-6);
        assert!((c.thresholds.verify - 0.7).abs() < 1e-6);
        assert_eq!(c.utc_offset_hours, -3);
        assert_eq!(c.shift.start, NaiveTime::from_hms_opt(8, 30, 0));
        assert_eq!(c.shift.end, None);
        assert_eq!(c.shift.late_grace_minutes, 10);
        assert_eq!(c.bus, BusKind::System);
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let c = config(&[
            ("CLOCKFACE_ACCEPT_THRESHOLD", "high"),
            ("CLOCKFACE_SHIFT_END", "5pm"),
        ]);
        assert_eq!(c.thresholds.accept, DEFAULT_ACCEPT_THRESHOLD);
        assert_eq!(c.shift.end, None);
    }

    #[test]
    fn test_non_finite_thresholds_fall_back() {
        let c = config(&[
            ("CLOCKFACE_ACCEPT_THRESHOLD", "NaN"),
            ("CLOCKFACE_VERIFY_THRESHOLD", "inf"),
        ]);
        assert_eq!(c.thresholds.accept, DEFAULT_ACCEPT_THRESHOLD);
        assert_eq!(c.thresholds.verify, DEFAULT_VERIFY_THRESHOLD);
    }
}
