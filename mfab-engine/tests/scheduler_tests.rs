//! Integration tests for the worker scheduler
//!
//! **Test Coverage:**
//! - Boss dispatches chain workers and respects the worker pool
//! - Chains complete once fabrication reaches their stop time
//! - Repeated failures back off and are reported as stuck
//! - Janitor erases segments past the retention horizon, and only those
//! - Medic frees chains whose worker stopped making progress
//! - Failed dubs stay in Dubbing and are shipped again with the same picks
//! - A failed craft reverts to Planned and records why; shutdown mid-craft does not
//! - The boss never overwrites a chain state written during its tick
//! - The whole flow runs against the SQLite store

mod helpers;

use helpers::harness::long_ago;
use helpers::{FailingContent, FailingSink, Harness, InterferingStore};
use mfab_common::config::FabricationConfig;
use mfab_common::content::ProgramType;
use mfab_common::events::FabricationEvent;
use mfab_common::models::{
    ChainState, MessageSeverity, Segment, SegmentChoice, SegmentChoiceArrangementPick, SegmentMeme, SegmentMessage,
    SegmentScoped, SegmentState, SegmentType,
};
use mfab_common::time;
use mfab_engine::dub::AudioSink;
use mfab_engine::store::{get_all, EntityStore, SqliteStore};
use mfab_engine::work::{Boss, Janitor, Medic, WorkContext, WorkManager, WorkOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn drain(rx: &mut tokio::sync::broadcast::Receiver<FabricationEvent>) -> Vec<FabricationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_boss_dispatches_chain_below_buffer() {
    let harness = Harness::new();
    let chain = harness.fabricating_chain("dispatch", time::now()).await;
    let boss = Boss::new(Arc::clone(&harness.ctx));

    let dispatched = boss.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(dispatched, 1);
    assert!(harness.ctx.in_flight.wait_idle(Duration::from_secs(10)).await);

    let segments = harness.store.segments_of_chain(chain.id).await.unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].state, SegmentState::Dubbed);
    assert_eq!(boss.failures(chain.id).await, 0);
}

#[tokio::test]
async fn test_boss_skips_chain_with_full_buffer() {
    let mut config = FabricationConfig::default();
    config.work.buffer_production_seconds = 5;
    let harness = Harness::with_config(config);
    let chain = harness.fabricating_chain("full", time::now()).await;
    // one 8-second segment already reaches past the 5-second buffer
    harness.fabricate(chain.id, 1).await;

    let boss = Boss::new(Arc::clone(&harness.ctx));
    assert_eq!(boss.tick(&CancellationToken::new()).await.unwrap(), 0);

    let stored = harness.store.get_chain(chain.id).await.unwrap();
    assert!(stored.fabricated_ahead_seconds > 5.0);
}

#[tokio::test]
async fn test_boss_respects_worker_pool() {
    let mut config = FabricationConfig::default();
    config.work.worker_concurrency = 1;
    let harness = Harness::with_config(config);
    harness.fabricating_chain("first", time::now()).await;
    harness.fabricating_chain("second", time::now()).await;
    let boss = Boss::new(Arc::clone(&harness.ctx));

    assert_eq!(boss.tick(&CancellationToken::new()).await.unwrap(), 1);
    assert!(harness.ctx.in_flight.wait_idle(Duration::from_secs(10)).await);
}

#[tokio::test]
async fn test_boss_skips_in_flight_chain() {
    let harness = Harness::new();
    let chain = harness.fabricating_chain("busy", time::now()).await;
    let _lease = harness.ctx.in_flight.try_acquire(chain.id).unwrap();
    let boss = Boss::new(Arc::clone(&harness.ctx));

    assert_eq!(boss.tick(&CancellationToken::new()).await.unwrap(), 0);
    assert!(harness.store.segments_of_chain(chain.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_chain_completes_at_stop_time() {
    let harness = Harness::new();
    let start = long_ago();
    // two 8-second segments reach past a 10-second stop
    let chain = harness
        .chain_stopping_at("finite", start, Some(start + chrono::Duration::seconds(10)))
        .await;
    let mut rx = harness.events.subscribe();

    harness.fabricate(chain.id, 2).await;
    assert_eq!(harness.work_once(chain.id).await.unwrap(), WorkOutcome::Completed);

    let stored = harness.store.get_chain(chain.id).await.unwrap();
    assert_eq!(stored.state, ChainState::Complete);
    assert_eq!(harness.store.segments_of_chain(chain.id).await.unwrap().len(), 2);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, FabricationEvent::ChainCompleted { chain_id, .. } if *chain_id == chain.id)));
}

#[tokio::test]
async fn test_repeated_failures_report_stuck_chain() {
    let mut config = FabricationConfig::default();
    config.work.stuck_after_failures = 2;
    config.work.segment_requeue_seconds = 0;
    let harness = Harness::with_config(config.clone());
    let chain = harness.fabricating_chain("stuck", time::now()).await;
    let ctx = Arc::new(WorkContext::new(
        Arc::clone(&harness.store),
        Arc::new(FailingContent),
        Arc::clone(&harness.sink) as Arc<dyn AudioSink>,
        config,
        Arc::clone(&harness.events),
    ));
    let boss = Boss::new(ctx);
    let mut rx = harness.events.subscribe();
    let cancel = CancellationToken::new();

    boss.tick(&cancel).await.unwrap();
    assert_eq!(boss.failures(chain.id).await, 1);
    assert!(drain(&mut rx).is_empty());

    boss.tick(&cancel).await.unwrap();
    assert_eq!(boss.failures(chain.id).await, 2);
    let stuck: Vec<FabricationEvent> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, FabricationEvent::ChainStuck { .. }))
        .collect();
    assert_eq!(stuck.len(), 1);
    match &stuck[0] {
        FabricationEvent::ChainStuck {
            chain_id,
            consecutive_failures,
            last_error,
            ..
        } => {
            assert_eq!(*chain_id, chain.id);
            assert_eq!(*consecutive_failures, 2);
            assert!(last_error.contains("no content"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_chain_backs_off() {
    let mut config = FabricationConfig::default();
    config.work.segment_requeue_seconds = 3_600;
    let harness = Harness::with_config(config.clone());
    let chain = harness.fabricating_chain("backoff", time::now()).await;
    let ctx = Arc::new(WorkContext::new(
        Arc::clone(&harness.store),
        Arc::new(FailingContent),
        Arc::clone(&harness.sink) as Arc<dyn AudioSink>,
        config,
        Arc::clone(&harness.events),
    ));
    let boss = Boss::new(ctx);
    let cancel = CancellationToken::new();

    boss.tick(&cancel).await.unwrap();
    boss.tick(&cancel).await.unwrap();
    assert_eq!(boss.failures(chain.id).await, 1);
}

#[tokio::test]
async fn test_janitor_erases_only_old_segments() {
    let harness = Harness::new();
    let start = long_ago();
    let chain = harness.fabricating_chain("janitor", start).await;

    let mut begin_at = start;
    for offset in 0..1_000u64 {
        let mut segment = Segment::planned(&chain, offset, SegmentType::Continue, begin_at).unwrap();
        segment.end_at = Some(begin_at + chrono::Duration::seconds(8));
        harness.store.create_segment(&segment).await.unwrap();
        if offset == 0 {
            let meme = SegmentMeme::new(segment.id, "bright").unwrap();
            harness.store.put_entity(&meme.into_entity()).await.unwrap();
        }
        begin_at += chrono::Duration::seconds(8);
    }
    let first_id = harness.store.read_one_at_chain_offset(chain.id, 0).await.unwrap().unwrap().id;
    let recent = time::now() - chrono::Duration::seconds(60);
    for offset in 1_000..1_005u64 {
        let segment = Segment::planned(&chain, offset, SegmentType::Continue, recent).unwrap();
        harness.store.create_segment(&segment).await.unwrap();
    }
    let mut rx = harness.events.subscribe();

    let erased = Janitor::new(Arc::clone(&harness.ctx)).tick().await.unwrap();

    assert_eq!(erased, 1_000);
    let remaining = harness.store.segments_of_chain(chain.id).await.unwrap();
    let offsets: Vec<u64> = remaining.iter().map(|s| s.offset).collect();
    assert_eq!(offsets, (1_000..1_005).collect::<Vec<_>>());
    assert!(get_all::<SegmentMeme>(harness.store.as_ref(), first_id).await.unwrap().is_empty());
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, FabricationEvent::SegmentsErased { count: 1_000, .. })));

    assert_eq!(Janitor::new(Arc::clone(&harness.ctx)).tick().await.unwrap(), 0);
}

#[tokio::test]
async fn test_medic_restarts_stalled_worker() {
    let mut config = FabricationConfig::default();
    config.work.medic_heartbeat_timeout_seconds = 0;
    let harness = Harness::with_config(config);
    let chain = harness.fabricating_chain("stalled", time::now()).await;
    let mut rx = harness.events.subscribe();

    let lease = harness.ctx.in_flight.try_acquire(chain.id).unwrap();
    let token = lease.token();
    let handle = tokio::spawn(async move {
        let _lease = lease;
        tokio::time::sleep(Duration::from_secs(3_600)).await;
    });
    harness.ctx.in_flight.attach(chain.id, token, handle.abort_handle());

    assert_eq!(Medic::new(Arc::clone(&harness.ctx)).tick(), 1);
    assert!(handle.await.unwrap_err().is_cancelled());
    assert!(!harness.ctx.in_flight.is_in_flight(chain.id));
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, FabricationEvent::WorkerRestarted { chain_id, .. } if *chain_id == chain.id)));

    // the chain can be dispatched again
    let boss = Boss::new(Arc::clone(&harness.ctx));
    assert_eq!(boss.tick(&CancellationToken::new()).await.unwrap(), 1);
    assert!(harness.ctx.in_flight.wait_idle(Duration::from_secs(10)).await);
}

#[tokio::test]
async fn test_failed_dub_is_retried_with_same_picks() {
    let harness = Harness::new();
    let chain = harness.fabricating_chain("retry", long_ago()).await;
    let failing = harness.context_with_sink(Arc::new(FailingSink));
    let mut rx = harness.events.subscribe();

    assert!(harness.work_once_in(&failing, chain.id).await.is_err());
    let segment = harness.store.read_last_segment(chain.id).await.unwrap().unwrap();
    assert_eq!(segment.state, SegmentState::Dubbing);
    let before: Vec<SegmentChoiceArrangementPick> = get_all(harness.store.as_ref(), segment.id).await.unwrap();
    assert!(!before.is_empty());
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, FabricationEvent::DubFailed { .. })));

    let outcome = harness.work_once(chain.id).await.unwrap();
    assert_eq!(
        outcome,
        WorkOutcome::Dubbed {
            offset: 0,
            pick_count: before.len()
        }
    );
    let after: Vec<SegmentChoiceArrangementPick> = get_all(harness.store.as_ref(), segment.id).await.unwrap();
    let mut before_ids: Vec<_> = before.iter().map(|p| p.id).collect();
    let mut after_ids: Vec<_> = after.iter().map(|p| p.id).collect();
    before_ids.sort();
    after_ids.sort();
    assert_eq!(before_ids, after_ids);
    assert_eq!(harness.sink.shipped(), vec![(segment.storage_key.clone(), before.len())]);
}

#[tokio::test]
async fn test_fabrication_on_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("mfab.db")).await.unwrap();
    let harness = Harness::with(Arc::new(store), FabricationConfig::default());
    let chain = harness.fabricating_chain("durable", long_ago()).await;

    let segments = harness.fabricate(chain.id, 3).await;

    assert_eq!(segments.len(), 3);
    assert!(segments.iter().all(|s| s.state == SegmentState::Dubbed));
    for pair in segments.windows(2) {
        assert_eq!(pair[0].end_at, Some(pair[1].begin_at));
    }
    let picks: Vec<SegmentChoiceArrangementPick> =
        get_all(harness.store.as_ref(), segments[2].id).await.unwrap();
    assert!(!picks.is_empty());
}

#[tokio::test]
async fn test_work_manager_fabricates_and_shuts_down() {
    let mut config = FabricationConfig::default();
    config.work.boss_cycle_ms = 10;
    config.work.buffer_production_seconds = 20;
    let harness = Harness::with_config(config);
    let chain = harness.fabricating_chain("managed", time::now()).await;

    let mut manager = WorkManager::new(Arc::clone(&harness.ctx));
    manager.start();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let dubbed = harness
            .store
            .read_last_dubbed_segment(chain.id)
            .await
            .unwrap()
            .map_or(0, |s| s.offset + 1);
        if dubbed >= 3 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "only {} segments dubbed", dubbed);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    manager.shutdown(Duration::from_secs(5)).await;

    assert!(harness.ctx.in_flight.is_empty());
    // 20 seconds of buffer needs three 8-second segments, and no more
    let segments = harness.store.segments_of_chain(chain.id).await.unwrap();
    assert!(segments.len() <= 4, "fabricated {} segments", segments.len());
}

#[tokio::test]
async fn test_craft_failure_reverts_to_planned_and_records_error() {
    let harness = Harness::new();
    let chain = harness.fabricating_chain("no-macro", long_ago()).await;
    let mut content = harness.library.content.clone();
    content.programs.retain(|p| p.program_type != ProgramType::Macro);
    let mut rx = harness.events.subscribe();

    let result = harness.work_once_with(chain.id, content.clone()).await;
    let error = result.expect_err("craft without a Macro program must fail");
    assert!(error.to_string().contains("Macro"), "{}", error);

    let segments = harness.store.segments_of_chain(chain.id).await.unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].offset, 0);
    assert_eq!(segments[0].state, SegmentState::Planned);
    let messages: Vec<SegmentMessage> = get_all(harness.store.as_ref(), segments[0].id).await.unwrap();
    assert!(
        messages
            .iter()
            .any(|m| m.severity == MessageSeverity::Error && m.body.contains("Macro")),
        "{:?}",
        messages
    );
    let choices: Vec<SegmentChoice> = get_all(harness.store.as_ref(), segments[0].id).await.unwrap();
    assert!(choices.is_empty(), "failed craft committed {:?}", choices);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, FabricationEvent::CraftFailed { offset: 0, .. })));

    // Retrying reuses the same segment
    assert!(harness.work_once_with(chain.id, content).await.is_err());
    let segments = harness.store.segments_of_chain(chain.id).await.unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].offset, 0);
    assert_eq!(segments[0].state, SegmentState::Planned);

    let outcome = harness.work_once(chain.id).await.unwrap();
    assert!(matches!(outcome, WorkOutcome::Dubbed { offset: 0, .. }), "{:?}", outcome);
}

#[tokio::test]
async fn test_shutdown_during_craft_is_not_a_failure() {
    let cancel = CancellationToken::new();
    let store = Arc::new(InterferingStore::cancelling_on_crafting(cancel.clone()));
    let harness = Harness::with(store, FabricationConfig::default());
    let chain = harness.fabricating_chain("shutdown", long_ago()).await;
    let mut rx = harness.events.subscribe();

    let outcome = harness
        .run_worker(&harness.ctx, chain.id, Arc::clone(&harness.content), cancel.clone())
        .await
        .unwrap();
    assert!(matches!(outcome, WorkOutcome::Skipped), "{:?}", outcome);

    let segments = harness.store.segments_of_chain(chain.id).await.unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].state, SegmentState::Planned);
    let messages: Vec<SegmentMessage> = get_all(harness.store.as_ref(), segments[0].id).await.unwrap();
    assert!(messages.is_empty(), "{:?}", messages);
    assert!(!drain(&mut rx)
        .iter()
        .any(|e| matches!(e, FabricationEvent::CraftFailed { .. })));

    let outcome = harness.work_once(chain.id).await.unwrap();
    assert!(matches!(outcome, WorkOutcome::Dubbed { offset: 0, .. }), "{:?}", outcome);
}

#[tokio::test]
async fn test_boss_keeps_chain_state_written_during_tick() {
    let store = Arc::new(InterferingStore::completing_listed_chains());
    let harness = Harness::with(store, FabricationConfig::default());
    let chain = harness
        .fabricating_chain("finishing", time::now() + chrono::Duration::seconds(60))
        .await;
    let boss = Boss::new(Arc::clone(&harness.ctx));

    let dispatched = boss.tick(&CancellationToken::new()).await.unwrap();

    assert_eq!(dispatched, 0);
    let stored = harness.store.get_chain(chain.id).await.unwrap();
    assert_eq!(stored.state, ChainState::Complete);
}

#[tokio::test]
async fn test_boss_records_fabricated_ahead() {
    let harness = Harness::new();
    let chain = harness
        .fabricating_chain("ahead", time::now() + chrono::Duration::seconds(60))
        .await;
    let boss = Boss::new(Arc::clone(&harness.ctx));

    assert_eq!(boss.tick(&CancellationToken::new()).await.unwrap(), 1);
    assert!(harness.ctx.in_flight.wait_idle(Duration::from_secs(10)).await);

    let stored = harness.store.get_chain(chain.id).await.unwrap();
    assert_eq!(stored.state, ChainState::Fabricate);
    assert!(
        stored.fabricated_ahead_seconds > 55.0 && stored.fabricated_ahead_seconds <= 60.0,
        "{}",
        stored.fabricated_ahead_seconds
    );
}
