// src/main.rs

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use courtcam_node::alarm::{AlarmPoller, CgiEventClient, PollSettings};
use courtcam_node::capture::{CaptureSupervisor, FfmpegLauncher, TokioClock};
use courtcam_node::config::{self, Config};
use courtcam_node::delivery::{ClipDelivery, HttpBroadcast, LogDelivery};
use courtcam_node::http::start_http_server;
use courtcam_node::media::FfmpegTool;
use courtcam_node::store::{RingRetention, SegmentStore};
use courtcam_node::ComposePipeline;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // ------------------------------------------------------------
    // Config
    // ------------------------------------------------------------
    let cfg_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".into());

    let cfg: Config = config::load(&cfg_path)?;
    info!(
        "[courtcam] loaded {} ({} sources, ring {}x{}s)",
        cfg_path,
        cfg.sources.len(),
        cfg.buffer.ring_size,
        cfg.buffer.segment_seconds
    );

    // ------------------------------------------------------------
    // Graceful shutdown
    // ------------------------------------------------------------
    let (stop_tx, stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("[courtcam] shutdown requested");
        stop_tx.send_replace(true);
    })?;

    let rt = Runtime::new()?;

    // ------------------------------------------------------------
    // Store / Compose
    // ------------------------------------------------------------
    let store = SegmentStore::from_config(&cfg.buffer);
    let pipeline = Arc::new(ComposePipeline::new(
        store.clone(),
        FfmpegTool::new(&cfg.media),
        cfg.buffer.work_dir.clone(),
        cfg.media.watermarks.clone(),
    ));
    // leftovers of a run that did not shut down cleanly
    if let Err(e) = pipeline.sweep_work_dir() {
        warn!("[courtcam] failed to sweep {:?}: {}", cfg.buffer.work_dir, e);
    }

    // ------------------------------------------------------------
    // HTTP
    // ------------------------------------------------------------
    if let Some(http) = &cfg.http {
        let addr = start_http_server(
            &http.bind,
            pipeline.clone(),
            cfg.sources.clone(),
            rt.handle().clone(),
        )?;
        info!("[courtcam] control port on {}", addr);
    }

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    {
        let _guard = rt.enter();
        start_capture(&cfg, &store, &stop_rx, &mut tasks);
        start_alarm(&cfg, &pipeline, &stop_rx, &mut tasks);
    }

    info!("[courtcam] running – Ctrl+C to stop");

    let mut stop = stop_rx.clone();
    rt.block_on(async {
        while !*stop.borrow() {
            if stop.changed().await.is_err() {
                break;
            }
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!("[courtcam] task failed: {}", e);
            }
        }
    });

    // ------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------
    info!("[courtcam] shutting down…");
    // remaining compose children are killed when their tasks are dropped
    rt.shutdown_timeout(Duration::from_secs(2));
    info!("[courtcam] shutdown complete");

    Ok(())
}

//
// ============================================================
// START_* HELPERS
// ============================================================
//

fn start_capture(
    cfg: &Config,
    store: &SegmentStore,
    stop_rx: &watch::Receiver<bool>,
    tasks: &mut Vec<JoinHandle<()>>,
) {
    for source in &cfg.sources {
        let supervisor = CaptureSupervisor::new(
            source.clone(),
            FfmpegLauncher::new(cfg.media.ffmpeg.clone(), store.clone()),
            TokioClock,
            cfg.media.restart_backoff(),
            cfg.buffer.pid_dir.clone(),
        )
        .with_retention(RingRetention::new(store.clone()));

        let stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            supervisor.run(stop).await;
        }));

        info!("[courtcam] capture enabled for {} ({})", source.name, source.id);
    }
}

fn start_alarm(
    cfg: &Config,
    pipeline: &Arc<ComposePipeline<FfmpegTool>>,
    stop_rx: &watch::Receiver<bool>,
    tasks: &mut Vec<JoinHandle<()>>,
) {
    let Some(alarm) = &cfg.alarm else {
        return;
    };
    if alarm.channels.is_empty() {
        warn!("[courtcam] alarm configured without channels");
        return;
    }

    let events = Arc::new(CgiEventClient::new(alarm));
    let delivery: Arc<dyn ClipDelivery> = match &cfg.delivery {
        Some(d) => Arc::new(HttpBroadcast::new(d)),
        None => Arc::new(LogDelivery),
    };
    let settings = PollSettings::from_config(alarm);

    for channel in &alarm.channels {
        let poller = AlarmPoller::new(
            channel.clone(),
            events.clone(),
            pipeline.clone(),
            delivery.clone(),
            settings.clone(),
        );

        let stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            poller.run(stop).await;
        }));

        info!(
            "[courtcam] alarm polling channel {} → source {}",
            channel.channel, channel.source_id
        );
    }
}
