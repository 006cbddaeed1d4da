//! Variable snapshot taken at the start of a run and `{key}` template rendering.

use chrono::{DateTime, Datelike, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex"));

pub type Variables = BTreeMap<String, String>;

/// Time and host values for one backup point run.
pub fn snapshot(now: DateTime<Utc>, collect_point: &str, backup_point: &str) -> Variables {
    let hostname = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
    BTreeMap::from([
        ("name".to_string(), collect_point.to_string()),
        ("backup_point".to_string(), backup_point.to_string()),
        ("Y".to_string(), format!("{:04}", now.year())),
        ("m".to_string(), format!("{:02}", now.month())),
        ("d".to_string(), format!("{:02}", now.day())),
        ("H".to_string(), format!("{:02}", now.hour())),
        ("M".to_string(), format!("{:02}", now.minute())),
        ("S".to_string(), format!("{:02}", now.second())),
        ("hostname".to_string(), hostname),
    ])
}

/// Replaces `{key}` placeholders; unknown keys are left as written.
pub fn render(template: &str, variables: &Variables) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
