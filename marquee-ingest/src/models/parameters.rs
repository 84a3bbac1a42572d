//! Admission thresholds and import parameters
//!
//! Both are plain serde structs so they can come from the `[admission]` and
//! `[import]` TOML sections, with per-key overrides from the settings table.

use marquee_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Thresholds for the quality admission filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionThresholds {
    /// Minimum popularity for `full` admission (default: 5.0)
    #[serde(default = "default_full_min_popularity")]
    pub full_min_popularity: f64,

    /// Minimum vote count for `full` admission (default: 50)
    #[serde(default = "default_full_min_votes")]
    pub full_min_votes: u32,

    /// Minimum popularity for `soft` admission (default: 1.0)
    #[serde(default = "default_soft_min_popularity")]
    pub soft_min_popularity: f64,

    /// Require an image reference for `full` (default: true)
    #[serde(default = "default_true")]
    pub require_image_for_full: bool,

    /// Require a release date for `full` movies (default: true)
    #[serde(default = "default_true")]
    pub require_release_date_for_full: bool,
}

impl Default for AdmissionThresholds {
    fn default() -> Self {
        Self {
            full_min_popularity: default_full_min_popularity(),
            full_min_votes: default_full_min_votes(),
            soft_min_popularity: default_soft_min_popularity(),
            require_image_for_full: true,
            require_release_date_for_full: true,
        }
    }
}

impl AdmissionThresholds {
    pub fn validate(&self) -> Result<()> {
        if self.soft_min_popularity < 0.0 || self.full_min_popularity < 0.0 {
            return Err(Error::Config(
                "popularity thresholds must not be negative".to_string(),
            ));
        }
        if self.full_min_popularity < self.soft_min_popularity {
            return Err(Error::Config(format!(
                "full_min_popularity ({}) is below soft_min_popularity ({})",
                self.full_min_popularity, self.soft_min_popularity
            )));
        }
        Ok(())
    }
}

/// Import workflow parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportParameters {
    /// Concurrent entity resolutions per manifest (default: 4)
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Retry budget per queued unit of work (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay in milliseconds (default: 500)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Retry delay cap in milliseconds (default: 60000)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Lease on a claimed job before another worker may take it (default: 300)
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,

    /// Idle time after which a cursor or manifest counts as stuck (default: 1800)
    #[serde(default = "default_stall_threshold_seconds")]
    pub stall_threshold_seconds: u64,

    /// External id namespaces in resolution-key preference order
    #[serde(default = "default_namespace_priority")]
    pub namespace_priority: Vec<String>,

    /// Fuzzy title matching for id-less references; disabled when unset
    #[serde(default)]
    pub fuzzy_match_threshold: Option<f64>,

    /// Listing pages fetched for one year partition (default: 50)
    #[serde(default = "default_year_max_pages")]
    pub year_max_pages: u32,
}

impl Default for ImportParameters {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            lease_seconds: default_lease_seconds(),
            stall_threshold_seconds: default_stall_threshold_seconds(),
            namespace_priority: default_namespace_priority(),
            fuzzy_match_threshold: None,
            year_max_pages: default_year_max_pages(),
        }
    }
}

impl ImportParameters {
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::Config("parallelism must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if let Some(threshold) = self.fuzzy_match_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(Error::Config(format!(
                    "fuzzy_match_threshold must be within 0.0..=1.0, got {}",
                    threshold
                )));
            }
        }
        Ok(())
    }
}

fn default_full_min_popularity() -> f64 {
    5.0
}

fn default_full_min_votes() -> u32 {
    50
}

fn default_soft_min_popularity() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_parallelism() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_lease_seconds() -> u64 {
    300
}

fn default_stall_threshold_seconds() -> u64 {
    1800
}

fn default_namespace_priority() -> Vec<String> {
    vec!["tmdb".to_string(), "imdb".to_string()]
}

fn default_year_max_pages() -> u32 {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(AdmissionThresholds::default().validate().is_ok());
        assert!(ImportParameters::default().validate().is_ok());
    }

    #[test]
    fn test_inverted_popularity_thresholds_rejected() {
        let thresholds = AdmissionThresholds {
            full_min_popularity: 0.5,
            soft_min_popularity: 2.0,
            ..Default::default()
        };
        assert!(matches!(thresholds.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_fuzzy_threshold_range() {
        let params = ImportParameters {
            fuzzy_match_threshold: Some(1.5),
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let params: ImportParameters = toml::from_str("parallelism = 8").unwrap();
        assert_eq!(params.parallelism, 8);
        assert_eq!(params.max_attempts, 5);
        assert_eq!(params.namespace_priority, vec!["tmdb", "imdb"]);
        assert!(params.fuzzy_match_threshold.is_none());
    }
}
