// src/delivery.rs

use std::path::PathBuf;
use std::time::Duration;

use log::info;

use crate::config::DeliveryConfig;
use crate::types::SourceId;

/// A finished alarm clip handed to the delivery collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipNotice {
    pub channel: u32,
    pub source_id: SourceId,
    pub cluster: u64,
    pub path: PathBuf,
}

/// Broadcast side of the alarm path. Called from a blocking context;
/// the file is deleted by the caller once this returns.
pub trait ClipDelivery: Send + Sync + 'static {
    fn deliver(&self, clip: &ClipNotice) -> anyhow::Result<()>;
}

/// Uploads the clip bytes to a broadcast endpoint.
pub struct HttpBroadcast {
    url: String,
    agent: ureq::Agent,
}

impl HttpBroadcast {
    pub fn new(cfg: &DeliveryConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build();
        Self {
            url: cfg.url.clone(),
            agent,
        }
    }
}

impl ClipDelivery for HttpBroadcast {
    fn deliver(&self, clip: &ClipNotice) -> anyhow::Result<()> {
        let body = std::fs::read(&clip.path)?;

        self.agent
            .post(&self.url)
            .set("Content-Type", "video/mp4")
            .set("X-Channel", &clip.channel.to_string())
            .set("X-Source", &clip.source_id.to_string())
            .set("X-Cluster", &clip.cluster.to_string())
            .send_bytes(&body)
            .map_err(|e| anyhow::anyhow!("broadcast to {} failed: {}", self.url, e))?;

        info!(
            "[delivery] channel {} cluster {} → {} ({} bytes)",
            clip.channel,
            clip.cluster,
            self.url,
            body.len()
        );
        Ok(())
    }
}

/// Used when no `[delivery]` endpoint is configured.
pub struct LogDelivery;

impl ClipDelivery for LogDelivery {
    fn deliver(&self, clip: &ClipNotice) -> anyhow::Result<()> {
        info!(
            "[delivery] channel {} cluster {}: {:?} (no endpoint configured, discarding)",
            clip.channel, clip.cluster, clip.path
        );
        Ok(())
    }
}
