use anyhow::{Context, Result};
use futures::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use weather_ingest::config::Config;
use weather_ingest::http::{self, HttpState};
use weather_ingest::ingest::WeatherIngestor;
use weather_ingest::latest::LatestIndex;
use weather_ingest::mqtt;
use weather_ingest::pipeline::{spawn_workers, Batch, PipelineHandle};
use weather_ingest::store::RecordStore;
use weather_ingest::telemetry;

const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    telemetry::init(&config)?;

    let store_options = config.store_options();
    let store = tokio::task::spawn_blocking(move || RecordStore::open(store_options))
        .await?
        .with_context(|| format!("failed to open record store in {}", config.data_dir.display()))?;
    let store = Arc::new(store);
    let latest = {
        let store = store.clone();
        tokio::task::spawn_blocking(move || LatestIndex::rebuild_from(&store)).await??
    };
    let stats = store.stats();
    tracing::info!(
        records = stats.records,
        segments = stats.segments,
        devices = latest.len(),
        data_dir = %config.data_dir.display(),
        "record store opened"
    );

    let ingestor = WeatherIngestor::new(store, Arc::new(latest));
    let (tx, rx) = mpsc::channel::<Batch>(config.max_queue);
    let pipeline = PipelineHandle::new(tx, ingestor.stats());
    let workers = spawn_workers(
        ingestor.clone(),
        rx,
        config.ingest_workers,
        config.retry_policy(),
    );

    let mqtt_handle = if config.enable_mqtt_listener {
        let config_clone = config.clone();
        let pipeline_clone = pipeline.clone();
        Some(tokio::spawn(async move {
            mqtt::run_listener(config_clone, pipeline_clone).await
        }))
    } else {
        None
    };

    let listener = TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", config.http_bind))?;
    tracing::info!(addr = %config.http_bind, "HTTP API listening");
    let app = http::router(HttpState {
        ingestor: ingestor.clone(),
    });
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
        _ = async {
            if let Some(handle) = mqtt_handle.as_mut() {
                match handle.await {
                    Ok(Err(err)) => tracing::error!(error=%err, "MQTT listener exited"),
                    Err(err) => tracing::warn!(error=%err, "MQTT task failed"),
                    Ok(Ok(())) => {}
                }
            } else {
                future::pending::<()>().await;
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    if let Some(handle) = mqtt_handle {
        handle.abort();
    }
    drop(pipeline);
    if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, future::join_all(workers))
        .await
        .is_err()
    {
        tracing::warn!("ingest workers did not drain before shutdown");
    }

    Ok(())
}
