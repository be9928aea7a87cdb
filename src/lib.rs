pub mod aggregator;
pub mod config;
pub mod db;
pub mod error;
pub mod overlay;
pub mod pipeline;
pub mod rules;
pub mod slot;
pub mod snapshot;
pub mod structured;
pub mod suggestion;
pub mod tailer;
pub mod vision;

use anyhow::Result;
use config::AppConfig;
use pipeline::Pipeline;
use rules::{RuleEngine, RuleRegistry};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

pub fn run() -> Result<()> {
    // -----------------------------------------------------------------------
    // Logging: rolling log file in <config dir>\logs, one file per day.
    // -----------------------------------------------------------------------
    //
    // Initialised first so config and registry errors land in the log.
    let config_dir = config::config_dir();
    let log_dir = config_dir.join("logs");
    let _ = std::fs::create_dir_all(&log_dir);

    let file_appender = tracing_appender::rolling::daily(&log_dir, "hud-coach.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Keep _guard alive for the process lifetime (drop = flush)
    // We leak it intentionally; it lives as long as the app does.
    std::mem::forget(_guard);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hud_coach_lib=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false) // log files should not contain ANSI colour codes
        .init();

    // -----------------------------------------------------------------------
    // Panic hook: log panics through tracing before the process dies.
    // Without this, panic messages only appear on stderr (invisible in prod).
    // -----------------------------------------------------------------------
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());
        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        tracing::error!("PANIC at {}: {}", location, message);
    }));

    tracing::info!("HUD Coach starting — logs → {}", log_dir.display());

    // --- Load config (or create default on first run) ---
    let cfg = match config::load_or_default(&config_dir) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("{} — using defaults", e);
            AppConfig::default()
        }
    };
    if !config_dir.join("config.toml").exists() {
        if let Err(e) = config::save(&cfg, &config_dir) {
            tracing::warn!("Could not write default config: {}", e);
        }
    }

    let registry = RuleRegistry::from_config(&cfg);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("hud-coach")
        .build()?;
    let res = runtime.block_on(serve(cfg, config_dir, registry));

    // Blocking workers (tailer, abandoned advisor calls) get a bounded grace
    // period instead of holding the process open.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    res
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Spawns the feed and sink tasks, then drives the pipeline until the feed
/// closes or Ctrl-C.
async fn serve(cfg: AppConfig, config_dir: PathBuf, registry: RuleRegistry) -> Result<()> {
    // --- Build inter-module async channels ---
    // Pipeline: tailer -> snapshot parser -> pipeline -> overlay / session log
    let (line_tx, line_rx) = mpsc::channel::<String>(1024);
    let (snap_tx, snap_rx) = mpsc::channel::<snapshot::Snapshot>(64);
    let (overlay_sink, overlay_rx) = overlay::channel(cfg.critical_priority, 8);

    let mut pipeline = Pipeline::from_config(&cfg, RuleEngine::new(registry))
        .with_sink(Box::new(overlay_sink));

    // --- SQLite (optional: the pipeline runs without it) ---
    let session = open_session(&cfg, &config_dir).await;
    if let Some((writer, session_id)) = &session {
        pipeline = pipeline.with_sink(Box::new(db::SessionLogSink::new(writer.clone(), *session_id)));
    }

    let feed_path = cfg.feed_path(&config_dir);
    tokio::spawn(async move {
        if let Err(e) = tailer::run(feed_path, line_tx).await {
            tracing::error!("Tailer stopped: {}", e);
        }
    });
    tokio::spawn(snapshot::run(line_rx, snap_tx));
    let overlay_task = tokio::spawn(overlay::run(overlay_rx, cfg.overlay_path(&config_dir)));

    tokio::select! {
        res = pipeline.run(snap_rx) => {
            if let Err(e) = res {
                tracing::error!("Pipeline stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl-C received — shutting down");
        }
    }

    // Pipeline dropped → overlay sink dropped → writer drains and exits.
    match overlay_task.await {
        Ok(Err(e)) => tracing::warn!("Overlay writer: {}", e),
        Err(e)     => tracing::warn!("Overlay writer task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Some((writer, session_id)) = session {
        writer.end_session(session_id, now_ms());
        if let Err(e) = writer.flush().await {
            tracing::warn!("Session log flush failed: {}", e);
        }
        writer.shutdown();
    }
    tracing::info!("HUD Coach stopped");
    Ok(())
}

async fn open_session(cfg: &AppConfig, config_dir: &Path) -> Option<(db::DbWriter, i64)> {
    let writer = match db::spawn_db_writer(&cfg.db_path(config_dir)) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!("Session log disabled: {}", e);
            return None;
        }
    };
    match writer.insert_session(now_ms(), cfg.game.clone()).await {
        Ok(id) => {
            tracing::info!("Session {} started", id);
            Some((writer, id))
        }
        Err(e) => {
            tracing::warn!("Session log disabled: {}", e);
            None
        }
    }
}
