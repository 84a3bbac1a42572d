//! Job queue collaborator
//!
//! The engine hands every unit of work (one page, one catalog item, one
//! manifest entry, one materialization pass) to a durable queue with
//! at-least-once delivery. Handlers are idempotent, so a redelivered job only
//! repeats work whose effects are already absorbed by the storage layer.

pub mod sqlite;
pub mod worker;

pub use sqlite::SqliteJobQueue;
pub use worker::Worker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marquee_common::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::models::CatalogItem;

/// Logical queue names
pub const DISCOVERY_QUEUE: &str = "discovery";
pub const ITEMS_QUEUE: &str = "items";
pub const MANIFEST_ENTITIES_QUEUE: &str = "manifest-entities";
pub const MANIFEST_MATERIALIZE_QUEUE: &str = "manifest-materialize";

pub const ALL_QUEUES: [&str; 4] = [
    DISCOVERY_QUEUE,
    ITEMS_QUEUE,
    MANIFEST_ENTITIES_QUEUE,
    MANIFEST_MATERIALIZE_QUEUE,
];

/// One unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobPayload {
    /// Fetch the next position of a discovery stream
    DiscoverPage { stream: String },
    /// Classify and resolve one catalog item
    ResolveItem {
        stream: Option<String>,
        item: CatalogItem,
    },
    /// Phase B for one manifest entry
    ResolveManifestEntity { manifest_id: Uuid, entry_key: String },
    /// Phase C for one manifest
    MaterializeManifest { manifest_id: Uuid },
}

impl JobPayload {
    /// Logical queue this payload belongs on
    pub fn queue(&self) -> &'static str {
        match self {
            JobPayload::DiscoverPage { .. } => DISCOVERY_QUEUE,
            JobPayload::ResolveItem { .. } => ITEMS_QUEUE,
            JobPayload::ResolveManifestEntity { .. } => MANIFEST_ENTITIES_QUEUE,
            JobPayload::MaterializeManifest { .. } => MANIFEST_MATERIALIZE_QUEUE,
        }
    }
}

/// A job leased to one worker
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job_id: Uuid,
    pub queue: String,
    pub payload: JobPayload,
    /// Delivery count including this one
    pub attempts: u32,
    pub max_attempts: u32,
}

/// What `fail` did with the job
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Requeued; claimable again after `run_after`
    Retrying { run_after: DateTime<Utc> },
    /// Retry budget spent; the job is dead
    Exhausted,
}

/// Per-queue counts read by the resume controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub queued: u64,
    pub in_flight: u64,
    pub dead: u64,
}

impl QueueCounts {
    /// Nothing waiting and nothing running
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.in_flight == 0
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job on `payload.queue()`
    ///
    /// A live job with the same `dedupe_key` absorbs the request. Returns true
    /// when a job was queued (new or re-armed).
    async fn enqueue(&self, payload: &JobPayload, dedupe_key: Option<&str>) -> Result<bool>;

    /// Lease the next due job of `queue` for `lease`
    async fn claim(&self, queue: &str, lease: Duration) -> Result<Option<ClaimedJob>>;

    async fn complete(&self, job_id: Uuid) -> Result<()>;

    /// Record a failed delivery and schedule the retry, if any budget is left
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<FailOutcome>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts>;
}
