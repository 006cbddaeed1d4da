//! Persisted status record of a point and the key it is stored under.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Persisted status of one point, or of one (backup point, collect point) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointInfo {
    /// `None` until the first run completes.
    pub last_state_valid: Option<bool>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_fail: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub fail_count: u64,
    pub total_size: u64,
    pub last_message: String,
    /// Naming variables of the run that produced `last_success`.
    pub variables: BTreeMap<String, String>,
    /// Driver-owned extension payload (e.g. retained snapshot list).
    pub data: Option<serde_json::Value>,
}

impl PointInfo {
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.last_state_valid = Some(true);
        self.last_success = Some(now);
        self.success_count += 1;
        self.last_message.clear();
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>, message: impl Into<String>) {
        self.last_state_valid = Some(false);
        self.last_fail = Some(now);
        self.fail_count += 1;
        self.last_message = message.into();
    }

    /// Most recent event of either kind.
    pub fn latest_event(&self) -> Option<DateTime<Utc>> {
        self.last_success.max(self.last_fail)
    }

    /// Orders records by their most recent event; no event at all sorts first.
    pub fn recency_cmp(&self, other: &PointInfo) -> Ordering {
        self.latest_event().cmp(&other.latest_event())
    }
}

/// Storage key of a status record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InfoKey {
    Collect(String),
    Backup { backup: String, collect: String },
}

impl InfoKey {
    pub fn collect(name: &str) -> Self {
        InfoKey::Collect(name.to_string())
    }

    pub fn backup(backup: &str, collect: &str) -> Self {
        InfoKey::Backup {
            backup: backup.to_string(),
            collect: collect.to_string(),
        }
    }

    /// File-system safe stem used by file-backed stores.
    pub fn file_stem(&self) -> String {
        match self {
            InfoKey::Collect(name) => format!("collect--{}", name),
            InfoKey::Backup { backup, collect } => format!("backup--{}--{}", backup, collect),
        }
    }
}

impl fmt::Display for InfoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfoKey::Collect(name) => f.write_str(name),
            InfoKey::Backup { backup, collect } => write!(f, "({}, {})", backup, collect),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_json_round_trip() {
        let mut info = PointInfo {
            last_state_valid: Some(false),
            last_success: None,
            last_fail: Some(Utc.with_ymd_and_hms(2016, 6, 10, 1, 2, 3).unwrap()),
            success_count: 0,
            fail_count: 3,
            total_size: 4096,
            last_message: "échec de la sauvegarde: connexion refusée ✗".to_string(),
            variables: BTreeMap::new(),
            data: Some(serde_json::json!({"snapshots": [{"path": "a", "at": 1}]})),
        };
        info.variables.insert("hostname".into(), "host.example".into());
        info.variables.insert("path".into(), "{\"nested\": [1, 2]}".into());

        let text = serde_json::to_string(&info).unwrap();
        let back: PointInfo = serde_json::from_str(&text).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_missing_fields_default() {
        let info: PointInfo = serde_json::from_str("{\"success_count\": 2}").unwrap();
        assert_eq!(info.success_count, 2);
        assert_eq!(info.last_state_valid, None);
        assert!(info.variables.is_empty());
    }

    #[test]
    fn test_recency_ordering() {
        let t0 = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let empty = PointInfo::default();
        let mut failed_late = PointInfo::default();
        failed_late.record_failure(t0 + Duration::hours(2), "boom");
        let mut ok_early = PointInfo::default();
        ok_early.record_success(t0);

        assert_eq!(empty.recency_cmp(&ok_early), Ordering::Less);
        assert_eq!(failed_late.recency_cmp(&ok_early), Ordering::Greater);
    }

    #[test]
    fn test_record_transitions() {
        let now = Utc::now();
        let mut info = PointInfo::default();
        info.record_failure(now, "disk full");
        info.record_success(now);
        assert_eq!(info.last_state_valid, Some(true));
        assert_eq!((info.success_count, info.fail_count), (1, 1));
        assert!(info.last_message.is_empty());
    }
}
