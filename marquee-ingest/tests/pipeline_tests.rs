//! Item pipeline, discovery through the queue, and operator recovery paths

mod helpers;

use helpers::{
    ceremony_payload, full_item, reject_item, soft_item, test_env, test_env_with, MockCatalog,
};
use marquee_common::events::IngestEvent;
use marquee_ingest::db::cursors::{self, NewCursor};
use marquee_ingest::db::{admissions, enrichment, entities, manifests};
use marquee_ingest::error::{IngestError, SourceError};
use marquee_ingest::models::{
    AdmissionTier, BatchStatus, CatalogItem, CatalogPage, CursorStatus, Depth, EntityKind,
    EntryStatus, ExternalId, Partition,
};
use marquee_ingest::queue::{JobPayload, Worker, ALL_QUEUES, DISCOVERY_QUEUE};
use marquee_ingest::services::{
    CeremonyImporter, DiscoveryScheduler, ItemOutcome, ItemPipeline, ResumeController,
};
use std::time::Duration;

#[tokio::test]
async fn test_item_pipeline_admits_by_tier_and_audits() {
    let env = test_env().await;
    let pipeline = ItemPipeline::new(env.ctx.clone());
    let mut events = env.ctx.event_bus.subscribe();

    let full = full_item(EntityKind::Movie, "tmdb", "1", "Full Movie");
    let soft = soft_item(EntityKind::Movie, "tmdb", "2", "Soft Movie");
    let reject = reject_item(EntityKind::Movie, "tmdb", "3", "Rejected Movie");

    let full_outcome = pipeline.process_item(Some("popular"), &full).await.unwrap();
    let soft_outcome = pipeline.process_item(Some("popular"), &soft).await.unwrap();
    let reject_outcome = pipeline.process_item(Some("popular"), &reject).await.unwrap();

    assert!(matches!(full_outcome, ItemOutcome::Admitted { tier: AdmissionTier::Full, created: true, .. }));
    assert!(matches!(soft_outcome, ItemOutcome::Admitted { tier: AdmissionTier::Soft, created: true, .. }));
    match reject_outcome {
        ItemOutcome::Rejected { reasons } => assert!(!reasons.is_empty()),
        other => panic!("expected rejection, got {:?}", other),
    }

    // Only full admission fetches detail
    assert_eq!(env.catalog.detail_calls(), 1);

    let stored_full = entities::find_by_external_id(&env.ctx.db, EntityKind::Movie, &ExternalId::new("tmdb", "1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored_full.depth, Depth::Full);
    let stored_soft = entities::find_by_external_id(&env.ctx.db, EntityKind::Movie, &ExternalId::new("tmdb", "2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored_soft.depth, Depth::Soft);
    assert!(entities::find_by_external_id(&env.ctx.db, EntityKind::Movie, &ExternalId::new("tmdb", "3"))
        .await
        .unwrap()
        .is_none());

    let rejects = admissions::list_decisions(&env.ctx.db, Some(AdmissionTier::Reject), 10)
        .await
        .unwrap();
    assert_eq!(rejects.len(), 1);
    assert_eq!(rejects[0].external_id, ExternalId::new("tmdb", "3"));
    assert_eq!(rejects[0].stream.as_deref(), Some("popular"));
    assert_eq!(admissions::list_decisions(&env.ctx.db, None, 10).await.unwrap().len(), 3);

    let mut admitted = 0;
    let mut rejected = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            IngestEvent::ItemAdmitted { .. } => admitted += 1,
            IngestEvent::ItemRejected { .. } => rejected += 1,
            _ => {}
        }
    }
    assert_eq!((admitted, rejected), (2, 1));
}

#[tokio::test]
async fn test_item_without_external_id_is_skipped() {
    let env = test_env().await;
    let item = CatalogItem::placeholder(EntityKind::Person, "Nobody", Default::default());

    let outcome = ItemPipeline::new(env.ctx.clone())
        .process_item(None, &item)
        .await
        .unwrap();

    assert_eq!(outcome, ItemOutcome::Skipped);
    assert!(admissions::list_decisions(&env.ctx.db, None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_enrichment_is_retried_and_upgraded() {
    let env = test_env().await;
    let id = ExternalId::new("tmdb", "550");
    env.catalog.fail_detail(
        EntityKind::Movie,
        &id,
        SourceError::Api { status: 502, body: "bad gateway".into() },
        usize::MAX,
    );

    let item = full_item(EntityKind::Movie, "tmdb", "550", "Fight Club");
    let outcome = ItemPipeline::new(env.ctx.clone())
        .process_item(None, &item)
        .await
        .unwrap();
    assert!(matches!(outcome, ItemOutcome::Admitted { tier: AdmissionTier::Full, .. }));

    let entity = entities::find_by_external_id(&env.ctx.db, EntityKind::Movie, &id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entity.depth, Depth::Soft, "placeholder until the detail arrives");
    assert_eq!(enrichment::count_unresolved(&env.ctx.db).await.unwrap(), 1);

    let controller = ResumeController::new(env.ctx.clone());
    let report = controller.retry_enrichment(10).await.unwrap();
    assert_eq!((report.upgraded, report.failed), (0, 1));

    env.catalog.clear_detail_failure(EntityKind::Movie, &id);
    let report = controller.retry_enrichment(10).await.unwrap();
    assert_eq!(report.upgraded, 1);

    let entity = entities::find_by_external_id(&env.ctx.db, EntityKind::Movie, &id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entity.depth, Depth::Full);
    assert_eq!(enrichment::count_unresolved(&env.ctx.db).await.unwrap(), 0);
}

#[tokio::test]
async fn test_year_stream_discovers_through_the_queue() {
    let env = test_env().await;
    env.catalog.add_page(
        EntityKind::Movie,
        1,
        Some(1999),
        CatalogPage {
            items: vec![
                full_item(EntityKind::Movie, "tmdb", "603", "The Matrix"),
                reject_item(EntityKind::Movie, "tmdb", "9999", "Home Video"),
            ],
            has_more: true,
        },
    );
    env.catalog.add_page(
        EntityKind::Movie,
        2,
        Some(1999),
        CatalogPage {
            items: vec![soft_item(EntityKind::Movie, "tmdb", "604", "Obscure")],
            has_more: false,
        },
    );
    // 2000 is a quiet year inside the range
    env.catalog.add_page(
        EntityKind::Movie,
        1,
        Some(2001),
        CatalogPage {
            items: vec![full_item(EntityKind::Movie, "tmdb", "120", "Fellowship")],
            has_more: false,
        },
    );

    DiscoveryScheduler::new(env.ctx.clone())
        .register_stream(&NewCursor {
            stream: "movies-by-year".into(),
            partition: Partition::Year,
            entity_kind: EntityKind::Movie,
            start_position: 1999,
            end_position: Some(2001),
        })
        .await
        .unwrap();

    Worker::new(env.ctx.clone())
        .run_until_idle(&ALL_QUEUES, 2)
        .await
        .unwrap();

    let cursor = cursors::load_cursor(&env.ctx.db, "movies-by-year").await.unwrap().unwrap();
    assert_eq!(cursor.status, CursorStatus::Complete);
    assert_eq!(cursor.last_completed, Some(2001));

    assert_eq!(entities::count_entities(&env.ctx.db, EntityKind::Movie).await.unwrap(), 3);
    let rejects = admissions::list_decisions(&env.ctx.db, Some(AdmissionTier::Reject), 10)
        .await
        .unwrap();
    assert_eq!(rejects.len(), 1);
    assert_eq!(rejects[0].stream.as_deref(), Some("movies-by-year"));
}

#[tokio::test]
async fn test_listing_item_without_external_id_is_audited() {
    let env = test_env().await;
    env.catalog.add_page(
        EntityKind::Movie,
        1,
        None,
        CatalogPage {
            items: vec![
                CatalogItem::placeholder(EntityKind::Movie, "The Untitled Project", Default::default()),
                full_item(EntityKind::Movie, "tmdb", "603", "The Matrix"),
            ],
            has_more: false,
        },
    );

    DiscoveryScheduler::new(env.ctx.clone())
        .register_stream(&NewCursor {
            stream: "popular".into(),
            partition: Partition::Page,
            entity_kind: EntityKind::Movie,
            start_position: 1,
            end_position: None,
        })
        .await
        .unwrap();

    Worker::new(env.ctx.clone())
        .run_until_idle(&ALL_QUEUES, 2)
        .await
        .unwrap();

    assert_eq!(entities::count_entities(&env.ctx.db, EntityKind::Movie).await.unwrap(), 1);
    let rejects = admissions::list_decisions(&env.ctx.db, Some(AdmissionTier::Reject), 10)
        .await
        .unwrap();
    assert_eq!(rejects.len(), 1);
    assert_eq!(rejects[0].stream.as_deref(), Some("popular"));
    assert_eq!(rejects[0].external_id, ExternalId::new("title", "untitled project"));
    assert_eq!(rejects[0].reasons, vec!["no external id".to_string()]);
}

#[tokio::test]
async fn test_exhausted_discovery_job_stalls_the_cursor() {
    let env = test_env().await;
    env.catalog.fail_listing(SourceError::Network("timeout".into()), usize::MAX);
    let mut events = env.ctx.event_bus.subscribe();

    DiscoveryScheduler::new(env.ctx.clone())
        .register_stream(&NewCursor {
            stream: "people".into(),
            partition: Partition::Page,
            entity_kind: EntityKind::Person,
            start_position: 1,
            end_position: None,
        })
        .await
        .unwrap();

    Worker::new(env.ctx.clone())
        .run_until_idle(&[DISCOVERY_QUEUE], 1)
        .await
        .unwrap();

    // One attempt per retry budget slot, then the job is dead
    assert_eq!(env.catalog.listing_calls(), 3);
    let counts = env.ctx.queue.counts(DISCOVERY_QUEUE).await.unwrap();
    assert_eq!((counts.queued, counts.in_flight, counts.dead), (0, 0, 1));

    let cursor = cursors::load_cursor(&env.ctx.db, "people").await.unwrap().unwrap();
    assert_eq!(cursor.status, CursorStatus::Stalled);
    assert_eq!(cursor.current_position, 1);

    let mut stalled = false;
    while let Ok(event) = events.try_recv() {
        if let IngestEvent::CursorStalled { stream, .. } = event {
            stalled |= stream == "people";
        }
    }
    assert!(stalled);

    // Operator resume after the source recovers
    env.catalog.fail_listing(SourceError::Network("timeout".into()), 0);
    assert!(ResumeController::new(env.ctx.clone()).resume_cursor("people").await.unwrap());
    Worker::new(env.ctx.clone())
        .run_until_idle(&[DISCOVERY_QUEUE], 1)
        .await
        .unwrap();

    let cursor = cursors::load_cursor(&env.ctx.db, "people").await.unwrap().unwrap();
    assert_eq!(cursor.status, CursorStatus::Complete);
}

#[tokio::test]
async fn test_stall_detection_fails_idle_batches() {
    let env = test_env().await;

    let staged = CeremonyImporter::new(env.ctx.clone())
        .collect_payload("file", "2001", &ceremony_payload(2001, 1, 2))
        .await
        .unwrap();
    cursors::ensure_cursor(
        &env.ctx.db,
        &NewCursor {
            stream: "idle".into(),
            partition: Partition::Page,
            entity_kind: EntityKind::Movie,
            start_position: 1,
            end_position: None,
        },
    )
    .await
    .unwrap();

    let controller = ResumeController::new(env.ctx.clone());

    // Fresh work is not stale yet
    let report = controller.detect_stalled(Duration::from_secs(3600)).await.unwrap();
    assert!(report.cursors.is_empty() && report.manifests.is_empty());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = controller.detect_stalled(Duration::ZERO).await.unwrap();
    assert_eq!(report.cursors, vec!["idle".to_string()]);
    assert_eq!(report.manifests, vec![staged.manifest_id]);

    let manifest = manifests::require_manifest(&env.ctx.db, staged.manifest_id).await.unwrap();
    assert_eq!(manifest.status, BatchStatus::Failed);
    assert!(manifest.error.unwrap().starts_with("stalled"));
}

#[tokio::test]
async fn test_stall_detection_waits_for_queued_work() {
    let env = test_env().await;

    let staged = CeremonyImporter::new(env.ctx.clone())
        .stage_payload("file", "2001", &ceremony_payload(2001, 1, 2))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = ResumeController::new(env.ctx.clone())
        .detect_stalled(Duration::ZERO)
        .await
        .unwrap();
    assert!(report.manifests.is_empty(), "queued entity jobs mean slow, not stuck");

    let manifest = manifests::require_manifest(&env.ctx.db, staged.manifest_id).await.unwrap();
    assert_eq!(manifest.status, BatchStatus::Resolving);
}

#[tokio::test]
async fn test_abandon_stops_the_batch() {
    let env = test_env().await;
    let importer = CeremonyImporter::new(env.ctx.clone());
    let controller = ResumeController::new(env.ctx.clone());

    let staged = importer
        .stage_payload("file", "2001", &ceremony_payload(2001, 2, 2))
        .await
        .unwrap();
    assert!(controller.abandon_manifest(staged.manifest_id, "wrong ceremony").await.unwrap());
    assert!(!controller.abandon_manifest(staged.manifest_id, "again").await.unwrap());

    // Queued jobs drain without materializing anything
    Worker::new(env.ctx.clone())
        .run_until_idle(&ALL_QUEUES, 2)
        .await
        .unwrap();

    let manifest = manifests::require_manifest(&env.ctx.db, staged.manifest_id).await.unwrap();
    assert_eq!(manifest.status, BatchStatus::Failed);
    assert_eq!(manifest.error.as_deref(), Some("abandoned: wrong ceremony"));
    assert_eq!(
        marquee_ingest::db::nominations::count_for_batch(&env.ctx.db, "ceremony:2001", None)
            .await
            .unwrap(),
        0
    );

    // A finished batch cannot be abandoned
    let done = importer
        .import_payload("file", "2002", &ceremony_payload(2002, 1, 1))
        .await
        .unwrap();
    let err = controller.abandon_manifest(done.manifest_id, "too late").await.unwrap_err();
    assert!(matches!(err, IngestError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_startup_resume_requeues_unfinished_work() {
    let env = test_env().await;

    let staged = CeremonyImporter::new(env.ctx.clone())
        .collect_payload("file", "2001", &ceremony_payload(2001, 2, 2))
        .await
        .unwrap();
    cursors::ensure_cursor(
        &env.ctx.db,
        &NewCursor {
            stream: "movies".into(),
            partition: Partition::Page,
            entity_kind: EntityKind::Movie,
            start_position: 1,
            end_position: None,
        },
    )
    .await
    .unwrap();

    let controller = ResumeController::new(env.ctx.clone());
    let report = controller.resume_all().await.unwrap();
    assert_eq!(report.manifests, 1);
    assert_eq!(report.cursors, 1);

    // Repeating is harmless: dedupe keys absorb it
    controller.resume_all().await.unwrap();
    let queued = env
        .ctx
        .queue
        .counts(marquee_ingest::queue::MANIFEST_ENTITIES_QUEUE)
        .await
        .unwrap()
        .queued;
    let entries = manifests::load_entities(&env.ctx.db, staged.manifest_id, Some(EntryStatus::Pending))
        .await
        .unwrap();
    assert_eq!(queued as usize, entries.len());

    Worker::new(env.ctx.clone())
        .run_until_idle(&ALL_QUEUES, 2)
        .await
        .unwrap();
    let manifest = manifests::require_manifest(&env.ctx.db, staged.manifest_id).await.unwrap();
    assert_eq!(manifest.status, BatchStatus::Complete);
}

#[tokio::test]
async fn test_title_only_reference_uses_fuzzy_match_when_enabled() {
    let env = test_env_with(MockCatalog::new(), |config| {
        config.import.fuzzy_match_threshold = Some(0.9);
    })
    .await;

    // Existing entity the title-only reference should land on
    ItemPipeline::new(env.ctx.clone())
        .process_item(None, &full_item(EntityKind::Movie, "tmdb", "77", "Front Page"))
        .await
        .unwrap();

    let payload = serde_json::json!({
        "ceremony": 1931,
        "categories": [{
            "category": "Outstanding Production",
            "nominees": [{ "nominee_name": "The Front Page", "movie_title": "The Front Page" }]
        }]
    });

    let report = CeremonyImporter::new(env.ctx.clone())
        .import_payload("file", "1931", &payload)
        .await
        .unwrap();
    assert_eq!(report.materialization.created, 1);
    assert_eq!(entities::count_entities(&env.ctx.db, EntityKind::Movie).await.unwrap(), 1);
}

#[tokio::test]
async fn test_title_only_reference_fails_when_fuzzy_disabled() {
    let env = test_env().await;

    let payload = serde_json::json!({
        "ceremony": 1931,
        "categories": [{
            "category": "Outstanding Production",
            "nominees": [{ "nominee_name": "The Front Page", "movie_title": "The Front Page" }]
        }]
    });

    let report = CeremonyImporter::new(env.ctx.clone())
        .import_payload("file", "1931", &payload)
        .await
        .unwrap();
    assert_eq!(report.entities_failed, 1);
    assert_eq!(report.materialization.status, Some(BatchStatus::Failed));
    assert_eq!(entities::count_entities(&env.ctx.db, EntityKind::Movie).await.unwrap(), 0);
}

#[tokio::test]
async fn test_manifest_entity_job_payload_round_trips_queue() {
    let env = test_env().await;
    let staged = CeremonyImporter::new(env.ctx.clone())
        .collect_payload("file", "2001", &ceremony_payload(2001, 1, 1))
        .await
        .unwrap();

    let entry = manifests::load_entities(&env.ctx.db, staged.manifest_id, None)
        .await
        .unwrap()
        .remove(0);
    let payload = JobPayload::ResolveManifestEntity {
        manifest_id: staged.manifest_id,
        entry_key: entry.entry_key.clone(),
    };

    Worker::new(env.ctx.clone()).handle(&payload).await.unwrap();
    // A redelivery of the same job is absorbed
    Worker::new(env.ctx.clone()).handle(&payload).await.unwrap();

    let entry = manifests::load_entity_entry(&env.ctx.db, staged.manifest_id, &entry.entry_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, EntryStatus::Resolved);
    assert_eq!(entry.attempts, 1);
}
