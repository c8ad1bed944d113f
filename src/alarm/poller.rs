// src/alarm/poller.rs

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use super::{AlarmState, EventQuery, EventSource, latest_cluster};
use crate::compose::ComposePipeline;
use crate::config::{AlarmChannelConfig, AlarmConfig};
use crate::delivery::{ClipDelivery, ClipNotice};
use crate::error::PollError;
use crate::media::MediaTool;
use crate::types::ComposeRequest;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub lookback: chrono::Duration,
    pub skew: chrono::Duration,
    pub clip_secs: u64,
    pub event_tag: String,
    pub storage_path: String,
    pub page_size: u32,
    /// How long in-flight clips may finish after shutdown was requested.
    pub shutdown_grace: Duration,
}

impl PollSettings {
    pub fn from_config(cfg: &AlarmConfig) -> Self {
        Self {
            interval: cfg.poll_interval(),
            lookback: chrono::Duration::minutes(cfg.lookback_minutes),
            skew: chrono::Duration::minutes(cfg.skew_minutes),
            clip_secs: cfg.clip_seconds,
            event_tag: cfg.event_tag.clone(),
            storage_path: cfg.storage_path.clone(),
            page_size: cfg.page_size,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

/// Watches one NVR channel and turns each new alarm cluster into a delivered clip.
pub struct AlarmPoller<E, T> {
    channel: AlarmChannelConfig,
    events: Arc<E>,
    pipeline: Arc<ComposePipeline<T>>,
    delivery: Arc<dyn ClipDelivery>,
    settings: PollSettings,
    state: AlarmState,
}

impl<E, T> AlarmPoller<E, T>
where
    E: EventSource + 'static,
    T: MediaTool + 'static,
{
    pub fn new(
        channel: AlarmChannelConfig,
        events: Arc<E>,
        pipeline: Arc<ComposePipeline<T>>,
        delivery: Arc<dyn ClipDelivery>,
        settings: PollSettings,
    ) -> Self {
        Self {
            channel,
            events,
            pipeline,
            delivery,
            settings,
            state: AlarmState::default(),
        }
    }

    pub fn state(&self) -> &AlarmState {
        &self.state
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> AlarmState {
        let tag = format!("alarm:ch{}", self.channel.channel);
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inflight: JoinSet<bool> = JoinSet::new();

        info!(
            "[{}] polling every {:?} for source {}",
            tag, self.settings.interval, self.channel.source_id
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = done {
                        error!("[{}] delivery task failed: {}", tag, e);
                    }
                    continue;
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            match self.poll_once().await {
                Ok(Some(cluster)) => {
                    info!("[{}] new alarm cluster {}", tag, cluster);
                    let pipeline = self.pipeline.clone();
                    let delivery = self.delivery.clone();
                    let channel = self.channel.clone();
                    let clip_secs = self.settings.clip_secs;
                    inflight.spawn(async move {
                        deliver_alarm_clip(&pipeline, delivery, &channel, cluster, clip_secs).await
                    });
                }
                Ok(None) => {}
                Err(e) => warn!("[{}] poll failed: {}", tag, e),
            }
        }

        self.finish_inflight(&tag, &mut inflight).await;
        info!("[{}] stopped", tag);
        self.state
    }

    /// Gives running deliveries a grace period, then aborts the rest.
    /// Aborted tasks remove their files through their cleanup guards.
    async fn finish_inflight(&self, tag: &str, inflight: &mut JoinSet<bool>) {
        if inflight.is_empty() {
            return;
        }
        info!("[{}] waiting for {} clip(s) in flight", tag, inflight.len());

        let drained = tokio::time::timeout(self.settings.shutdown_grace, async {
            while inflight.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "[{}] aborting {} clip(s) after {:?}",
                tag,
                inflight.len(),
                self.settings.shutdown_grace
            );
            inflight.shutdown().await;
        }
    }

    /// One query round-trip. Returns the cluster to act on, already recorded as seen.
    pub async fn poll_once(&mut self) -> Result<Option<u64>, PollError> {
        let now = Local::now().naive_local();
        let query = EventQuery {
            channel: self.channel.channel,
            start: now - self.settings.lookback,
            end: now + self.settings.skew,
            storage_path: self.settings.storage_path.clone(),
        };

        let events = self.events.clone();
        let tag = self.settings.event_tag.clone();
        let page_size = self.settings.page_size;
        let cluster = tokio::task::spawn_blocking(move || {
            latest_cluster(events.as_ref(), &query, &tag, page_size)
        })
        .await
        .map_err(|e| PollError::Join(e.to_string()))??;

        // recorded before compose/delivery runs, so a slow delivery cannot re-trigger
        if self.state.observe(cluster) {
            Ok(cluster)
        } else {
            Ok(None)
        }
    }
}

/// Compose the lookback clip, hand it to delivery, then delete both artifacts.
pub async fn deliver_alarm_clip<T: MediaTool>(
    pipeline: &ComposePipeline<T>,
    delivery: Arc<dyn ClipDelivery>,
    channel: &AlarmChannelConfig,
    cluster: u64,
    clip_secs: u64,
) -> bool {
    let tag = format!("alarm:ch{}", channel.channel);
    let req = ComposeRequest::recent(
        channel.source_id,
        format!("alarm-{}-{}", channel.channel, cluster),
        clip_secs,
    );

    let clip = match pipeline.compose(&req).await {
        Ok(clip) => clip,
        Err(e) if e.is_empty_buffer() => {
            info!("[{}] cluster {}: {}", tag, cluster, e);
            return false;
        }
        Err(e) => {
            error!("[{}] cluster {}: {}", tag, cluster, e);
            return false;
        }
    };

    let cleanup = clip.cleanup_guard();
    let notice = ClipNotice {
        channel: channel.channel,
        source_id: channel.source_id,
        cluster,
        path: clip.output.clone(),
    };
    let delivered = tokio::task::spawn_blocking(move || delivery.deliver(&notice)).await;
    drop(cleanup);

    match delivered {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("[{}] delivery of cluster {} failed: {}", tag, cluster, e);
            false
        }
        Err(e) => {
            error!("[{}] delivery task failed: {}", tag, e);
            false
        }
    }
}
