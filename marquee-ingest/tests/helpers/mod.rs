//! Test Helper Utilities
//!
//! Shared utilities for the marquee-ingest integration tests

#![allow(dead_code)]

pub mod fixtures;
pub mod mock_sources;
pub mod test_env;

pub use fixtures::{ceremony_payload, full_item, person_id, reject_item, soft_item};
pub use mock_sources::{MockCatalog, MockCeremonies};
pub use test_env::{test_env, test_env_with, TestEnv};
