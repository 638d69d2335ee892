mod config;
mod error;
mod http;
mod ingest;
mod mqtt;
mod pipeline;
mod telemetry;

use crate::config::Config;
use crate::ingest::{Sampler, SitePipeline};
use crate::mqtt::{generate_client_id, InboundMessage, TransportMonitor};
use crate::pipeline::{build_pool, spawn_writer, PersistCommand, PersistHandle, PipelineStats};
use crate::telemetry::Decoder;
use anyhow::{Context, Result};
use chrono::Utc;
use futures::future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,garden_telemetry=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "garden-telemetry"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn wait_optional<T>(handle: &mut Option<tokio::task::JoinHandle<T>>, name: &'static str) {
    match handle.as_mut() {
        Some(handle) => {
            if let Err(err) = handle.await {
                tracing::error!(error=%err, task = name, "task failed");
            }
        }
        None => future::pending::<()>().await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let stats = Arc::new(PipelineStats::new());
    let (persist_handle, writer_handle, pool) = match config.database_url.as_deref() {
        Some(database_url) => {
            let pool = build_pool(database_url, config.db_pool_size)
                .await
                .context("connecting to the telemetry database")?;
            ingest::db::ensure_schema(&pool).await?;
            let (tx, rx) = mpsc::channel::<PersistCommand>(config.persist_queue.max(1));
            let writer = spawn_writer(
                pool.clone(),
                rx,
                stats.clone(),
                config.batch_size,
                config.flush_interval(),
            );
            (
                Some(PersistHandle::new(tx, stats.clone())),
                Some(writer),
                Some(pool),
            )
        }
        None => {
            tracing::warn!("no database configured; site state is kept in memory only");
            (None, None, None)
        }
    };

    let pipeline = SitePipeline::new(
        Sampler::new(config.sample_every, config.history_memory_limit),
        config.subscriber_buffer,
        config.notify_window(),
        persist_handle,
        stats.clone(),
    );
    if let Some(pool) = pool.as_ref() {
        pipeline
            .hydrate(pool, config.history_memory_limit)
            .await
            .context("loading persisted site state")?;
    }

    let decoder = Decoder::new(
        config.mqtt_topic_prefix.clone(),
        config.default_site_id.clone(),
    );
    let (ingest_tx, ingest_rx) = mpsc::channel::<InboundMessage>(config.ingest_queue);
    let worker_handle = tokio::spawn(pipeline.clone().run_worker(decoder.clone(), ingest_rx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (monitor, mqtt_handle) = if config.enable_mqtt {
        let monitor = Arc::new(TransportMonitor::new(generate_client_id(
            &config.mqtt_client_prefix,
        )));
        tracing::info!(
            client_id = %monitor.client_id(),
            topics = ?config.mqtt_topics,
            "starting MQTT supervisor"
        );
        let handle = tokio::spawn(mqtt::run_supervisor(
            config.clone(),
            ingest_tx,
            monitor.clone(),
            shutdown_rx,
        ));
        (Some(monitor), Some(handle))
    } else {
        tracing::warn!("MQTT listener disabled; only HTTP ingest is available");
        drop(ingest_tx);
        (None, None)
    };

    let sweep_pipeline = pipeline.clone();
    let sweep_every = config.notify_sweep_interval();
    let sweep_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            let removed = sweep_pipeline.sweep_notifications(Utc::now());
            if removed > 0 {
                tracing::debug!(removed, "expired notification windows purged");
            }
        }
    });

    let app = http::router(http::HttpState {
        pipeline: pipeline.clone(),
        decoder: Arc::new(decoder),
        transport: monitor,
    });
    let addr = config.http_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding HTTP listener on {addr}"))?;
    tracing::info!(bind=%addr, "garden-telemetry HTTP listening");
    let http_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    let mut mqtt_handle = mqtt_handle;
    tokio::select! {
        res = http_handle => {
            match res {
                Ok(Err(err)) => tracing::error!(error=%err, "HTTP server exited"),
                Err(err) => tracing::error!(error=%err, "HTTP task failed"),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_optional(&mut mqtt_handle, "mqtt") => {
            mqtt_handle = None;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    let shutdown_timeout = config.shutdown_timeout();
    if let Some(handle) = mqtt_handle {
        let bound = shutdown_timeout + std::time::Duration::from_secs(1);
        if tokio::time::timeout(bound, handle).await.is_err() {
            tracing::warn!("MQTT supervisor did not stop in time");
        }
    }
    sweep_handle.abort();

    // The supervisor owned the last queue sender, so the worker drains and exits.
    if tokio::time::timeout(shutdown_timeout, worker_handle)
        .await
        .is_err()
    {
        tracing::warn!("ingest worker did not drain in time");
    }
    if let Err(err) = pipeline.flush().await {
        tracing::warn!(error=%err, "final persistence flush failed");
    }
    if let Some(writer) = writer_handle {
        writer.abort();
    }

    Ok(())
}
