use super::{SampleReason, Sampler, SitePipeline};
use crate::mqtt::InboundMessage;
use crate::pipeline::{spawn_writer, PersistCommand, PersistHandle, PipelineStats};
use crate::telemetry::{Decoder, Measurements, TelemetryRecord};
use anyhow::Result;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::env;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

fn pipeline(every: u32) -> SitePipeline {
    SitePipeline::new(
        Sampler::new(every, 1000),
        16,
        ChronoDuration::hours(1),
        None,
        Arc::new(PipelineStats::new()),
    )
}

fn temperature(site_id: &str, value: f64) -> TelemetryRecord {
    TelemetryRecord {
        site_id: site_id.to_string(),
        measurements: Measurements {
            temperature: Some(value),
            ..Default::default()
        },
        timestamp: Utc::now(),
    }
}

async fn history_len(pipeline: &SitePipeline, site_id: &str) -> usize {
    pipeline
        .get_history(site_id, usize::MAX)
        .await
        .map(|samples| samples.len())
        .unwrap_or(0)
}

fn message(topic: &str, payload: &str) -> InboundMessage {
    InboundMessage {
        topic: topic.to_string(),
        payload: Bytes::from(payload.to_string()),
        received_at: Utc::now(),
    }
}

#[tokio::test]
async fn sampling_follows_first_then_every_nth_update() {
    let pipeline = pipeline(120);
    for i in 0..119 {
        pipeline.ingest(temperature("S1", i as f64)).await;
    }
    assert_eq!(history_len(&pipeline, "S1").await, 1);

    let outcome = pipeline.ingest(temperature("S1", 119.0)).await;
    assert_eq!(outcome.sampled, Some(SampleReason::Periodic));
    assert_eq!(history_len(&pipeline, "S1").await, 2);
    let counters = pipeline.counters().await;
    assert_eq!(counters[0].updates_since_sample, 0);
    assert_eq!(counters[0].updates_until_next_sample, Some(120));

    for i in 0..120 {
        pipeline.ingest(temperature("S1", i as f64)).await;
    }
    assert_eq!(history_len(&pipeline, "S1").await, 3);

    let history = pipeline.get_history("S1", 10).await.unwrap();
    assert_eq!(history.last().map(|s| s.reason), Some(SampleReason::First));
    assert_eq!(history[0].reason, SampleReason::Periodic);
    assert_eq!(pipeline.stats().snapshot().history_samples, 3);
    assert_eq!(pipeline.stats().snapshot().accepted, 240);
}

#[tokio::test]
async fn counters_are_scoped_per_site() {
    let pipeline = pipeline(3);
    pipeline.ingest(temperature("S1", 1.0)).await;
    pipeline.ingest(temperature("S1", 2.0)).await;
    pipeline.ingest(temperature("S2", 1.0)).await;
    let outcome = pipeline.ingest(temperature("S1", 3.0)).await;
    assert_eq!(outcome.sampled, Some(SampleReason::Periodic));
    assert_eq!(history_len(&pipeline, "S2").await, 1);
    let counters = pipeline.counters().await;
    assert_eq!(counters[1].site_id, "S2");
    assert_eq!(counters[1].updates_since_sample, 1);
}

#[tokio::test]
async fn latest_is_the_fieldwise_merge_in_arrival_order() {
    let pipeline = pipeline(120);
    let partials = [
        Measurements {
            temperature: Some(20.0),
            co2: Some(400.0),
            ..Default::default()
        },
        Measurements {
            air_humidity: Some(55.0),
            ..Default::default()
        },
        Measurements {
            temperature: Some(22.5),
            light: Some(900.0),
            ..Default::default()
        },
    ];
    let mut expected = Measurements::default();
    for partial in partials {
        expected.merge_from(&partial);
        pipeline
            .ingest(TelemetryRecord {
                site_id: "S1".to_string(),
                measurements: partial,
                timestamp: Utc::now(),
            })
            .await;
    }
    let latest = pipeline.get_latest("S1").await.unwrap();
    assert_eq!(latest.measurements, expected);
    assert_eq!(latest.measurements.soil_humidity, None);
}

#[tokio::test]
async fn concurrent_first_records_sample_once() {
    let pipeline = pipeline(1000);
    let mut handles = Vec::new();
    for i in 0..16 {
        let pipeline = pipeline.clone();
        handles.push(tokio::spawn(async move {
            pipeline.ingest(temperature("S1", i as f64)).await
        }));
    }
    let mut firsts = 0;
    for handle in handles {
        if handle.await.unwrap().sampled == Some(SampleReason::First) {
            firsts += 1;
        }
    }
    assert_eq!(firsts, 1);
    assert_eq!(history_len(&pipeline, "S1").await, 1);
}

#[tokio::test]
async fn busy_site_does_not_stall_another() {
    let pipeline = pipeline(120);
    pipeline.ingest(temperature("S1", 1.0)).await;
    let _held = pipeline.store.lock("S1").await;

    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        pipeline.ingest(temperature("S2", 1.0)),
    )
    .await
    .expect("S2 must not wait on S1");
    assert!(outcome.created);
}

#[tokio::test]
async fn new_subscriber_sees_current_state_before_live_updates() {
    let pipeline = pipeline(120);
    pipeline.ingest(temperature("S2", 2.0)).await;
    pipeline.ingest(temperature("S1", 1.0)).await;

    let mut sub = pipeline.subscribe(None).await;
    pipeline.ingest(temperature("S1", 5.0)).await;

    let first = sub.rx.recv().await.unwrap();
    let second = sub.rx.recv().await.unwrap();
    let live = sub.rx.recv().await.unwrap();
    assert_eq!(first.site_id, "S1");
    assert_eq!(first.measurements.temperature, Some(1.0));
    assert_eq!(second.site_id, "S2");
    assert_eq!(live.measurements.temperature, Some(5.0));
}

#[tokio::test]
async fn filtered_subscriber_only_sees_its_site() {
    let pipeline = pipeline(120);
    pipeline.ingest(temperature("S1", 1.0)).await;
    pipeline.ingest(temperature("S2", 2.0)).await;

    let mut sub = pipeline.subscribe(Some("S2".to_string())).await;
    pipeline.ingest(temperature("S1", 3.0)).await;
    pipeline.ingest(temperature("S2", 4.0)).await;

    assert_eq!(sub.rx.recv().await.unwrap().measurements.temperature, Some(2.0));
    assert_eq!(sub.rx.recv().await.unwrap().measurements.temperature, Some(4.0));
    assert!(sub.rx.try_recv().is_err());
}

#[tokio::test]
async fn dead_subscriber_is_dropped_and_others_still_receive() {
    let pipeline = pipeline(120);
    let dead = pipeline.subscribe(None).await;
    let mut live = pipeline.subscribe(None).await;
    drop(dead.rx);

    pipeline.ingest(temperature("S1", 1.0)).await;
    assert_eq!(pipeline.subscriber_count(), 1);
    assert_eq!(live.rx.recv().await.unwrap().site_id, "S1");

    assert!(pipeline.unsubscribe(&live.id));
    assert_eq!(pipeline.subscriber_count(), 0);
}

#[tokio::test]
async fn force_snapshot_and_reset_restart_the_period() {
    let pipeline = pipeline(3);
    assert!(pipeline.force_snapshot("S1").await.is_none());
    assert!(pipeline.reset_counter("S1").await.is_none());

    pipeline.ingest(temperature("S1", 1.0)).await;
    pipeline.ingest(temperature("S1", 2.0)).await;
    let forced = pipeline.force_snapshot("S1").await.unwrap();
    assert_eq!(forced.reason, SampleReason::Forced);
    assert_eq!(forced.record.measurements.temperature, Some(2.0));

    // Period restarts: two more updates are not enough.
    pipeline.ingest(temperature("S1", 3.0)).await;
    let outcome = pipeline.ingest(temperature("S1", 4.0)).await;
    assert_eq!(outcome.sampled, None);
    let counter = pipeline.reset_counter("S1").await.unwrap();
    assert_eq!(counter.updates_since_sample, 0);
    assert_eq!(counter.updates_until_next_sample, Some(3));
}

#[tokio::test]
async fn clear_all_forgets_everything() {
    let pipeline = pipeline(120);
    pipeline.ingest(temperature("S1", 1.0)).await;
    pipeline.ingest(temperature("S2", 1.0)).await;

    let cleared = pipeline.clear_all().await.unwrap();
    assert_eq!(cleared.sites, 2);
    assert_eq!(cleared.samples, 2);
    assert!(pipeline.get_latest("S1").await.is_none());
    assert!(pipeline.site_ids().is_empty());

    let outcome = pipeline.ingest(temperature("S1", 1.0)).await;
    assert_eq!(outcome.sampled, Some(SampleReason::First));
}

#[tokio::test]
async fn ingest_waiting_through_a_clear_lands_in_fresh_state() {
    let pipeline = pipeline(120);
    pipeline.ingest(temperature("S1", 1.0)).await;
    let held = pipeline.store.lock("S1").await;

    let clearing = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.clear_all().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let late = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.ingest(temperature("S1", 2.0)).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(held);

    let cleared = clearing.await.unwrap().unwrap();
    assert_eq!(cleared.sites, 1);
    let outcome = late.await.unwrap();
    assert!(outcome.created);
    assert_eq!(outcome.sampled, Some(SampleReason::First));
    let latest = pipeline.get_latest("S1").await.unwrap();
    assert_eq!(latest.measurements.temperature, Some(2.0));
    assert_eq!(history_len(&pipeline, "S1").await, 1);
}

#[tokio::test]
async fn clear_wipe_is_queued_after_the_last_write_of_each_site() {
    let stats = Arc::new(PipelineStats::new());
    let (tx, mut rx) = mpsc::channel::<PersistCommand>(16);
    let pipeline = SitePipeline::new(
        Sampler::new(120, 100),
        16,
        ChronoDuration::hours(1),
        Some(PersistHandle::new(tx, stats.clone())),
        stats,
    );
    pipeline.ingest(temperature("S1", 1.0)).await;

    let clearing = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.clear_all().await }
    });
    let mut seen = Vec::new();
    while let Some(command) = rx.recv().await {
        match command {
            PersistCommand::Clear(done) => {
                done.send(Ok(())).unwrap();
                seen.push("clear");
                break;
            }
            PersistCommand::Latest(_) => seen.push("latest"),
            PersistCommand::Sample(_) => seen.push("sample"),
            PersistCommand::Flush(done) => {
                let _ = done.send(Ok(()));
            }
        }
    }
    clearing.await.unwrap().unwrap();
    assert_eq!(seen, vec!["latest", "sample", "clear"]);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn clear_all_forgets_notification_windows() {
    let pipeline = pipeline(120);
    let key = super::NotificationKey {
        subscriber_id: "u1".to_string(),
        site_id: "S1".to_string(),
        category: "temperature".to_string(),
        severity: "high".to_string(),
    };
    assert!(pipeline.should_emit(&key));
    assert!(!pipeline.should_emit(&key));
    pipeline.clear_all().await.unwrap();
    assert_eq!(pipeline.health().await.tracked_notifications, 0);
    assert!(pipeline.should_emit(&key));
}

#[tokio::test]
async fn history_reads_are_capped_by_the_memory_limit() {
    let pipeline = SitePipeline::new(
        Sampler::new(1, 3),
        16,
        ChronoDuration::hours(1),
        None,
        Arc::new(PipelineStats::new()),
    );
    for i in 0..6 {
        pipeline.ingest(temperature("S1", i as f64)).await;
    }
    let history = pipeline.get_history("S1", 100).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].record.measurements.temperature, Some(5.0));
    let health = pipeline.health().await;
    assert_eq!(health.history_memory_limit, 3);
    assert_eq!(health.stats.history_samples, 6);
}

#[tokio::test]
async fn worker_skips_bad_messages_and_keeps_going() {
    let pipeline = pipeline(120);
    let decoder = Decoder::new("nutricomm", Some("KBG001".to_string()));
    let (tx, rx) = mpsc::channel(8);
    let worker = tokio::spawn(pipeline.clone().run_worker(decoder, rx));

    tx.send(message("nutricomm/sensor", "{not json")).await.unwrap();
    tx.send(message("nutricomm/sensor", r#"{"suhu":"oops"}"#)).await.unwrap();
    tx.send(message("other/topic", r#"{"suhu":20}"#)).await.unwrap();
    tx.send(message("nutricomm/sensor", r#"{"suhu":21.5}"#)).await.unwrap();
    drop(tx);
    worker.await.unwrap();

    let stats = pipeline.stats().snapshot();
    assert_eq!(stats.decode_failures, 2);
    assert_eq!(stats.accepted, 1);
    let latest = pipeline.get_latest("KBG001").await.unwrap();
    assert_eq!(latest.measurements.temperature, Some(21.5));
}

#[tokio::test]
async fn resumed_session_does_not_resample_known_sites() {
    let pipeline = pipeline(120);
    let decoder = Decoder::new("nutricomm", None);
    let (tx, rx) = mpsc::channel(16);
    let worker = tokio::spawn(pipeline.clone().run_worker(decoder, rx));

    // First session.
    for value in [20.0, 21.0] {
        tx.send(message(
            "nutricomm/sensor/KBG001",
            &format!(r#"{{"suhu":{value}}}"#),
        ))
        .await
        .unwrap();
    }
    // Broker redelivers after reconnect; the supervisor keeps feeding the same queue.
    for value in [21.0, 22.0] {
        tx.send(message(
            "nutricomm/sensor/KBG001",
            &format!(r#"{{"suhu":{value}}}"#),
        ))
        .await
        .unwrap();
    }
    drop(tx);
    worker.await.unwrap();

    let history = pipeline.get_history("KBG001", 100).await.unwrap();
    let firsts = history
        .iter()
        .filter(|s| s.reason == SampleReason::First)
        .count();
    assert_eq!(firsts, 1);
    assert_eq!(pipeline.stats().snapshot().accepted, 4);
}

#[tokio::test]
async fn full_persistence_queue_counts_failures_without_blocking() {
    let stats = Arc::new(PipelineStats::new());
    let (tx, _rx) = mpsc::channel::<PersistCommand>(1);
    let pipeline = SitePipeline::new(
        Sampler::new(120, 100),
        16,
        ChronoDuration::hours(1),
        Some(PersistHandle::new(tx, stats.clone())),
        stats.clone(),
    );

    let first = tokio::time::timeout(
        Duration::from_secs(1),
        pipeline.ingest(temperature("S1", 1.0)),
    )
    .await
    .expect("ingest never waits on persistence");
    assert_eq!(first.sampled, Some(SampleReason::First));
    pipeline.ingest(temperature("S1", 2.0)).await;

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.accepted, 2);
    assert_eq!(snapshot.snapshot_failures, 1);
    assert_eq!(snapshot.store_failures, 1);
    assert!(snapshot.last_error.is_some());
}

#[tokio::test]
async fn notification_gate_is_shared_by_clones() {
    let pipeline = pipeline(120);
    let key = super::NotificationKey {
        subscriber_id: "u1".to_string(),
        site_id: "S1".to_string(),
        category: "soil".to_string(),
        severity: "warning".to_string(),
    };
    let now = Utc::now();
    assert!(pipeline.should_emit_at(&key, now));
    assert!(!pipeline.clone().should_emit_at(&key, now + ChronoDuration::minutes(30)));
    assert_eq!(pipeline.sweep_notifications(now + ChronoDuration::hours(2)), 1);
    assert!(pipeline.should_emit_at(&key, now + ChronoDuration::hours(2)));
}

async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(&admin_pool)
        .await?;
    drop(admin_pool);

    let schema_name = schema.to_string();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .after_connect(move |conn, _meta| {
            let schema = schema_name.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {}", schema))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    super::db::ensure_schema(&pool).await?;
    Ok(pool)
}

async fn drop_test_schema(database_url: &str, schema: &str) -> Result<()> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
        .execute(&admin_pool)
        .await;
    Ok(())
}

fn persisted_pipeline(pool: &PgPool) -> SitePipeline {
    let stats = Arc::new(PipelineStats::new());
    let (tx, rx) = mpsc::channel::<PersistCommand>(64);
    let _writer = spawn_writer(
        pool.clone(),
        rx,
        stats.clone(),
        5,
        Duration::from_millis(25),
    );
    SitePipeline::new(
        Sampler::new(3, 100),
        16,
        ChronoDuration::hours(1),
        Some(PersistHandle::new(tx, stats.clone())),
        stats,
    )
}

#[tokio::test]
async fn test_persisted_state_survives_restart() -> Result<()> {
    if env::var("GARDEN_INTEGRATION_TEST").ok().as_deref() != Some("1") {
        return Ok(());
    }
    let database_url = match env::var("GARDEN_TEST_DATABASE_URL") {
        Ok(value) => value,
        Err(_) => return Ok(()),
    };
    let schema = format!("garden_test_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;

    let pipeline = persisted_pipeline(&pool);
    for value in [20.0, 21.0, 22.0] {
        pipeline.ingest(temperature("KBG001", value)).await;
    }
    pipeline
        .ingest(TelemetryRecord {
            site_id: "KBG001".to_string(),
            measurements: Measurements {
                co2: Some(415.0),
                ..Default::default()
            },
            timestamp: Utc::now(),
        })
        .await;
    pipeline.flush().await?;

    let row: (Option<f64>, Option<f64>) =
        sqlx::query_as("SELECT temperature, co2 FROM site_latest WHERE site_id = $1")
            .bind("KBG001")
            .fetch_one(&pool)
            .await?;
    assert_eq!(row, (Some(22.0), Some(415.0)));
    let reasons: Vec<String> =
        sqlx::query_scalar("SELECT reason FROM site_history WHERE site_id = $1 ORDER BY id")
            .bind("KBG001")
            .fetch_all(&pool)
            .await?;
    assert_eq!(reasons, vec!["first", "periodic"]);

    let restarted = persisted_pipeline(&pool);
    assert_eq!(restarted.hydrate(&pool, 100).await?, 1);
    assert_eq!(restarted.get_history("KBG001", 10).await.map(|h| h.len()), Some(2));
    let outcome = restarted.ingest(temperature("KBG001", 23.0)).await;
    assert!(!outcome.created);
    assert_ne!(outcome.sampled, Some(SampleReason::First));
    let latest = restarted.get_latest("KBG001").await.unwrap();
    assert_eq!(latest.measurements.co2, Some(415.0));

    let cleared = restarted.clear_all().await?;
    assert_eq!(cleared.sites, 1);
    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM site_history")
        .fetch_one(&pool)
        .await?;
    assert_eq!(remaining, 0);

    drop_test_schema(&database_url, &schema).await?;
    Ok(())
}
