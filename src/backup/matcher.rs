//! Tag-based association between collect points and backup points.

use crate::error::ConfigError;
use globset::{Glob, GlobSet, GlobSetBuilder};
use once_cell::sync::Lazy;
use std::collections::BTreeSet;

static EVERYTHING: Lazy<TagPatterns> = Lazy::new(|| TagPatterns::new(["*"]).expect("match-all pattern"));

/// Compiled set of glob patterns over tags (`?`, `*`, case-sensitive).
#[derive(Debug, Clone)]
pub struct TagPatterns {
    patterns: Vec<String>,
    set: GlobSet,
}

impl TagPatterns {
    pub fn new<I, S>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let glob = Glob::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|source| ConfigError::InvalidPattern {
            pattern: patterns.join(","),
            source,
        })?;
        Ok(Self { patterns, set })
    }

    /// Matches every tag.
    pub fn everything() -> Self {
        EVERYTHING.clone()
    }

    pub fn nothing() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn matches_any(&self, tags: &BTreeSet<String>) -> bool {
        tags.iter().any(|tag| self.set.is_match(tag.as_str()))
    }
}

/// Tags of one point plus the patterns it applies to the other side.
#[derive(Debug, Clone)]
pub struct TagPolicy {
    pub tags: BTreeSet<String>,
    pub included: TagPatterns,
    pub excluded: TagPatterns,
}

impl TagPolicy {
    /// Singleton tag, include everything, exclude nothing.
    pub fn with_default_tag(tag: &str) -> Self {
        Self {
            tags: BTreeSet::from([tag.to_string()]),
            included: TagPatterns::everything(),
            excluded: TagPatterns::nothing(),
        }
    }
}

/// Exclusions on either side win over inclusions; no rule matching means no association.
pub fn can_associate(collect: &TagPolicy, backup: &TagPolicy) -> bool {
    if backup.excluded.matches_any(&collect.tags) {
        return false;
    }
    if collect.excluded.matches_any(&backup.tags) {
        return false;
    }
    backup.included.matches_any(&collect.tags) || collect.included.matches_any(&backup.tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(tags: &[&str], included: &[&str], excluded: &[&str]) -> TagPolicy {
        TagPolicy {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            included: TagPatterns::new(included.iter().copied()).unwrap(),
            excluded: TagPatterns::new(excluded.iter().copied()).unwrap(),
        }
    }

    #[test]
    fn test_everything_matches_any_tag() {
        let all = TagPatterns::everything();
        assert_eq!(all.patterns(), ["*".to_string()]);
        assert!(all.matches_any(&BTreeSet::from(["x".to_string()])));
        assert!(all.matches_any(&BTreeSet::from(["db-prod.eu".to_string()])));
        assert!(!all.matches_any(&BTreeSet::new()));
    }

    #[test]
    fn test_defaults_associate() {
        let collect = TagPolicy::with_default_tag("collect");
        let backup = TagPolicy::with_default_tag("backup");
        assert!(can_associate(&collect, &backup));
    }

    #[test]
    fn test_exclusion_dominates() {
        let collect = policy(&["prod"], &["*"], &[]);
        let backup = policy(&["backup"], &["*"], &["prod"]);
        assert!(!can_associate(&collect, &backup));

        let collect = policy(&["prod"], &["*"], &["off?ite"]);
        let backup = policy(&["offsite"], &["*"], &[]);
        assert!(!can_associate(&collect, &backup));
    }

    #[test]
    fn test_either_inclusion_suffices() {
        let collect = policy(&["db"], &[], &[]);
        let backup = policy(&["remote"], &["d*"], &[]);
        assert!(can_associate(&collect, &backup));

        let collect = policy(&["db"], &["rem*"], &[]);
        let backup = policy(&["remote"], &[], &[]);
        assert!(can_associate(&collect, &backup));

        let collect = policy(&["db"], &["x"], &[]);
        let backup = policy(&["remote"], &["y"], &[]);
        assert!(!can_associate(&collect, &backup));
    }

    #[test]
    fn test_case_sensitive() {
        let collect = policy(&["Prod"], &[], &[]);
        let backup = policy(&["backup"], &["prod"], &[]);
        assert!(!can_associate(&collect, &backup));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = TagPatterns::new(["[unclosed"]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }
}
