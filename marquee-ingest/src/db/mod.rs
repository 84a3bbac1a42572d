//! Database access for marquee-ingest
//!
//! Free async functions over a `SqlitePool`, one module per table family.
//! Schema creation lives in `marquee_common::db`.

pub mod admissions;
pub mod cursors;
pub mod enrichment;
pub mod entities;
pub mod manifests;
pub mod nominations;
pub mod settings;

use marquee_common::{Error, Result};
use uuid::Uuid;

/// Parse a TEXT uuid column
pub(crate) fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::InvalidInput(format!("Bad uuid '{}': {}", value, e)))
}
