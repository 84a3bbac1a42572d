//! Discovery Scheduler
//!
//! Walks one discovery stream a unit at a time. A unit is a listing page, or
//! a calendar year (every listing page of that year, fetched as a whole).
//!
//! **Ordering per unit:**
//! 1. Fetch. On failure the cursor is left where it is and the error goes
//!    back to the queue for a retry.
//! 2. Enqueue one `ResolveItem` job per item (deduplicated per item id).
//! 3. Advance the cursor with a compare-and-set on the fetched position.
//!
//! A crash between 2 and 3 repeats the unit; item-level idempotency absorbs
//! the repetition.

use marquee_common::events::IngestEvent;
use marquee_common::Error;
use tracing::{debug, info, warn};

use super::fuzzy_matcher::normalize_title;
use super::sources::ListingQuery;
use crate::db::admissions;
use crate::db::cursors::{self, NewCursor};
use crate::error::{IngestResult, SourceError};
use crate::models::manifest::TITLE_NAMESPACE;
use crate::models::{
    primary_external_id, AdmissionDecision, AdmissionSignals, AdmissionTier, CatalogPage,
    CursorStatus, ExternalId, ImportCursor, Partition,
};
use crate::queue::JobPayload;
use crate::IngestContext;

/// Result of one scheduler invocation
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryOutcome {
    AlreadyComplete,
    /// Parked by the resume controller; needs an operator resume
    Stalled,
    /// The unit at `position` was processed and the cursor moved past it
    Advanced {
        position: i64,
        items: usize,
        /// The stream completed right after this unit
        finished: bool,
    },
    /// The stream ran out at `position`
    Completed { position: i64 },
    /// Another invocation moved the cursor first; nothing was changed
    Raced,
}

pub struct DiscoveryScheduler {
    ctx: IngestContext,
}

impl DiscoveryScheduler {
    pub fn new(ctx: IngestContext) -> Self {
        Self { ctx }
    }

    /// Create the stream's cursor if needed and queue its next unit
    pub async fn register_stream(&self, new: &NewCursor) -> IngestResult<ImportCursor> {
        let cursor = cursors::ensure_cursor(&self.ctx.db, new).await?;
        if cursor.status == CursorStatus::InProgress {
            self.schedule(&cursor.stream).await?;
        }
        Ok(cursor)
    }

    /// Queue a `DiscoverPage` job for the stream's current position
    pub async fn schedule(&self, stream: &str) -> IngestResult<bool> {
        let cursor = self.require_cursor(stream).await?;
        let dedupe_key = format!("discover:{}:{}", stream, cursor.current_position);
        let queued = self
            .ctx
            .queue
            .enqueue(
                &JobPayload::DiscoverPage {
                    stream: stream.to_string(),
                },
                Some(&dedupe_key),
            )
            .await?;
        Ok(queued)
    }

    /// Process the unit at the stream's current position
    pub async fn run_once(&self, stream: &str) -> IngestResult<DiscoveryOutcome> {
        let cursor = self.require_cursor(stream).await?;

        match cursor.status {
            CursorStatus::Complete => return Ok(DiscoveryOutcome::AlreadyComplete),
            CursorStatus::Stalled => return Ok(DiscoveryOutcome::Stalled),
            CursorStatus::InProgress => {}
        }

        let position = cursor.current_position;
        if cursor.is_past_end(position) {
            return self.finish(&cursor, position).await;
        }

        let page = match self.fetch_unit(&cursor, position).await {
            Ok(page) => page,
            Err(e) => {
                warn!(stream, position, error = %e, "Discovery fetch failed, cursor unchanged");
                cursors::record_error(&self.ctx.db, stream, &e.to_string()).await?;
                return Err(e.into());
            }
        };

        // An empty year inside a bounded range is just a quiet year
        let empty_ends_stream =
            cursor.partition == Partition::Page || cursor.end_position.is_none();
        if page.items.is_empty() && empty_ends_stream {
            return self.finish(&cursor, position).await;
        }

        let items = self.emit_items(&cursor, &page).await?;

        if !cursors::advance(&self.ctx.db, stream, position).await? {
            debug!(stream, position, "Cursor moved by another invocation");
            return Ok(DiscoveryOutcome::Raced);
        }

        self.ctx.event_bus.emit_lossy(IngestEvent::CursorAdvanced {
            stream: stream.to_string(),
            completed_position: position,
            items_emitted: items,
            timestamp: chrono::Utc::now(),
        });

        let exhausted = match cursor.partition {
            Partition::Page => !page.has_more,
            Partition::Year => cursor.is_past_end(position + 1),
        };

        let finished = exhausted
            && matches!(
                self.finish(&cursor, position + 1).await?,
                DiscoveryOutcome::Completed { .. }
            );

        debug!(stream, position, items, finished, "Discovery unit done");
        Ok(DiscoveryOutcome::Advanced {
            position,
            items,
            finished,
        })
    }

    async fn require_cursor(&self, stream: &str) -> IngestResult<ImportCursor> {
        Ok(cursors::load_cursor(&self.ctx.db, stream)
            .await?
            .ok_or_else(|| Error::NotFound(format!("discovery stream '{}'", stream)))?)
    }

    /// Fetch everything one position stands for
    async fn fetch_unit(&self, cursor: &ImportCursor, position: i64) -> Result<CatalogPage, SourceError> {
        match cursor.partition {
            Partition::Page => {
                let page = u32::try_from(position)
                    .map_err(|_| SourceError::Parse(format!("page {} out of range", position)))?;
                self.ctx
                    .catalog
                    .list_page(&ListingQuery {
                        kind: cursor.entity_kind,
                        page,
                        year: None,
                    })
                    .await
            }
            Partition::Year => {
                let year = i32::try_from(position)
                    .map_err(|_| SourceError::Parse(format!("year {} out of range", position)))?;
                let mut collected = CatalogPage::default();

                for page in 1..=self.ctx.config.import.year_max_pages.max(1) {
                    let listing = self
                        .ctx
                        .catalog
                        .list_page(&ListingQuery {
                            kind: cursor.entity_kind,
                            page,
                            year: Some(year),
                        })
                        .await?;

                    let done = listing.items.is_empty() || !listing.has_more;
                    collected.items.extend(listing.items);
                    if done {
                        break;
                    }
                    if page == self.ctx.config.import.year_max_pages {
                        warn!(stream = %cursor.stream, year, page, "Year listing truncated at page limit");
                    }
                }

                Ok(collected)
            }
        }
    }

    async fn emit_items(&self, cursor: &ImportCursor, page: &CatalogPage) -> IngestResult<usize> {
        let priority = &self.ctx.config.import.namespace_priority;
        let mut emitted = 0;

        for item in &page.items {
            let Some(primary) = primary_external_id(&item.external_ids, priority) else {
                warn!(stream = %cursor.stream, title = %item.title, "Listing item without external id skipped");
                let decision = AdmissionDecision {
                    tier: AdmissionTier::Reject,
                    signals: AdmissionSignals::from_item(item),
                    reasons: vec!["no external id".to_string()],
                };
                admissions::record_decision(
                    &self.ctx.db,
                    cursor.entity_kind,
                    &ExternalId::new(TITLE_NAMESPACE, normalize_title(&item.title)),
                    &decision,
                    Some(&cursor.stream),
                )
                .await?;
                continue;
            };

            let mut item = item.clone();
            item.kind = cursor.entity_kind;
            let dedupe_key = format!("item:{}:{}", item.kind, primary);

            self.ctx
                .queue
                .enqueue(
                    &JobPayload::ResolveItem {
                        stream: Some(cursor.stream.clone()),
                        item,
                    },
                    Some(&dedupe_key),
                )
                .await?;
            emitted += 1;
        }

        Ok(emitted)
    }

    async fn finish(&self, cursor: &ImportCursor, position: i64) -> IngestResult<DiscoveryOutcome> {
        if !cursors::mark_complete(&self.ctx.db, &cursor.stream, position).await? {
            return Ok(DiscoveryOutcome::Raced);
        }

        info!(stream = %cursor.stream, position, "Discovery stream complete");
        self.ctx.event_bus.emit_lossy(IngestEvent::CursorCompleted {
            stream: cursor.stream.clone(),
            last_completed: (position > cursor.start_position).then(|| position - 1),
            timestamp: chrono::Utc::now(),
        });

        Ok(DiscoveryOutcome::Completed { position })
    }
}
