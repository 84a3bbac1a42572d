//! Discovery cursors

use chrono::{DateTime, Utc};
use marquee_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::catalog::EntityKind;

/// How a discovery stream is partitioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    /// Position is a listing page number
    Page,
    /// Position is a calendar year
    Year,
}

impl Partition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Page => "page",
            Partition::Year => "year",
        }
    }
}

impl FromStr for Partition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "page" => Ok(Partition::Page),
            "year" => Ok(Partition::Year),
            other => Err(Error::InvalidInput(format!("Unknown partition: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorStatus {
    InProgress,
    Complete,
    /// Retry budget exhausted or no progress; waits for an operator resume
    Stalled,
}

impl CursorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorStatus::InProgress => "in_progress",
            CursorStatus::Complete => "complete",
            CursorStatus::Stalled => "stalled",
        }
    }
}

impl FromStr for CursorStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(CursorStatus::InProgress),
            "complete" => Ok(CursorStatus::Complete),
            "stalled" => Ok(CursorStatus::Stalled),
            other => Err(Error::InvalidInput(format!("Unknown cursor status: {}", other))),
        }
    }
}

/// Persisted position within one discovery stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportCursor {
    pub stream: String,
    pub partition: Partition,
    pub entity_kind: EntityKind,
    pub start_position: i64,
    /// Inclusive upper bound; year streams stop after it
    pub end_position: Option<i64>,
    /// Next position to fetch
    pub current_position: i64,
    pub last_completed: Option<i64>,
    pub status: CursorStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportCursor {
    /// Position discovery continues from after a restart
    pub fn resume_position(&self) -> i64 {
        self.last_completed
            .map(|p| p + 1)
            .unwrap_or(self.start_position)
    }

    /// True once `position` lies beyond the configured end
    pub fn is_past_end(&self, position: i64) -> bool {
        self.end_position.map_or(false, |end| position > end)
    }
}
