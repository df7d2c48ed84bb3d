mod actions;
mod config;
mod mqtt;
mod registry;
mod schedule;
mod storage;
mod weather;
mod web;
mod worker;

use std::env;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use registry::Scheduler;
use storage::{StorageClient, YamlClient};
use worker::Worker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = if std::path::Path::new(&config_path).exists() {
        config::load(&config_path)?
    } else {
        info!(path = %config_path, "no config file, using defaults");
        config::Config::default()
    };
    if let Ok(host) = env::var("MQTT_HOST") {
        cfg.mqtt.host = host;
    }
    if let Some(port) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
        cfg.mqtt.port = port;
    }
    if let Some(port) = env::var("WEB_PORT").ok().and_then(|s| s.parse().ok()) {
        cfg.web.port = port;
    }

    // ── Storage ─────────────────────────────────────────────────────
    let storage = Arc::new(YamlClient::new(&cfg.storage.path)?) as Arc<dyn StorageClient>;
    info!(path = %cfg.storage.path, "storage loaded");

    // ── MQTT ────────────────────────────────────────────────────────
    let (client, event_loop) = mqtt::Client::connect(&cfg.mqtt);
    tokio::spawn(mqtt::run_event_loop(event_loop));

    // ── Worker + jobs ───────────────────────────────────────────────
    let worker = Worker::new(Arc::clone(&storage), client, Scheduler::new());
    worker.rebuild()?;
    let scheduler_handle = worker.start();

    // ── Web API ─────────────────────────────────────────────────────
    let state = web::AppState { worker: worker.clone(), storage };
    let result = web::serve(state, cfg.web.port).await;

    worker.stop();
    let _ = scheduler_handle.await;
    result
}
