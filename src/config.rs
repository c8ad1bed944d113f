use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{Source, SourceId};

/// Sequence numbers are written with three digits.
pub const MAX_RING_SIZE: u32 = 1000;

// ---------- Buffer ----------
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BufferConfig {
    pub segment_dir: PathBuf,
    pub pid_dir: PathBuf,
    pub work_dir: PathBuf,
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u64,
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl BufferConfig {
    /// Total span of footage the ring keeps per source.
    pub fn retention_secs(&self) -> u64 {
        self.segment_seconds * self.ring_size as u64
    }
}

fn default_segment_seconds() -> u64 {
    5
}

fn default_ring_size() -> u32 {
    15
}

fn default_extension() -> String {
    "mp4".into()
}

// ---------- Media tool ----------
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct WatermarkVariant {
    /// Smallest frame height this variant is used for.
    pub min_height: u32,
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MediaConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_restart_backoff_secs")]
    pub restart_backoff_secs: u64,
    #[serde(default = "default_overlay_position")]
    pub overlay_position: String,
    #[serde(default = "default_watermarks")]
    pub watermarks: Vec<WatermarkVariant>,
}

impl MediaConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_secs)
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            tool_timeout_secs: default_tool_timeout_secs(),
            restart_backoff_secs: default_restart_backoff_secs(),
            overlay_position: default_overlay_position(),
            watermarks: default_watermarks(),
        }
    }
}

fn default_ffmpeg() -> String {
    "ffmpeg".into()
}

fn default_ffprobe() -> String {
    "ffprobe".into()
}

fn default_tool_timeout_secs() -> u64 {
    60
}

fn default_restart_backoff_secs() -> u64 {
    5
}

fn default_overlay_position() -> String {
    "W-w-10:10".into()
}

fn default_watermarks() -> Vec<WatermarkVariant> {
    vec![
        WatermarkVariant {
            min_height: 0,
            path: PathBuf::from("assets/watermark.png"),
        },
        WatermarkVariant {
            min_height: 1080,
            path: PathBuf::from("assets/watermark_1080.png"),
        },
    ]
}

// ---------- Alarm ----------
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct AlarmChannelConfig {
    pub channel: u32,
    pub source_id: SourceId,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AlarmConfig {
    pub base_url: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_lookback_minutes")]
    pub lookback_minutes: i64,
    #[serde(default = "default_skew_minutes")]
    pub skew_minutes: i64,
    #[serde(default = "default_clip_seconds")]
    pub clip_seconds: u64,
    #[serde(default = "default_event_tag")]
    pub event_tag: String,
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub channels: Vec<AlarmChannelConfig>,
}

impl AlarmConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_lookback_minutes() -> i64 {
    15
}

fn default_skew_minutes() -> i64 {
    5
}

fn default_clip_seconds() -> u64 {
    60
}

fn default_event_tag() -> String {
    "AlarmLocal".into()
}

fn default_storage_path() -> String {
    "/mnt/dvr/sda0".into()
}

fn default_page_size() -> u32 {
    100
}

fn default_request_timeout_secs() -> u64 {
    10
}

// ---------- Delivery ----------
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeliveryConfig {
    pub url: String,
    #[serde(default = "default_delivery_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_delivery_timeout_secs() -> u64 {
    60
}

// ---------- HTTP ----------
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub bind: String,
}

// ---------- Root ----------
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub buffer: BufferConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub sources: Vec<Source>,
    pub alarm: Option<AlarmConfig>,
    pub delivery: Option<DeliveryConfig>,
    pub http: Option<HttpConfig>,
}

// ---------- Loader ----------
pub fn load(path: &str) -> anyhow::Result<Config> {
    let txt = std::fs::read_to_string(path)?;
    let cfg: Config = toml::from_str(&txt)?;
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    pub fn source(&self, id: SourceId) -> Option<&Source> {
        self.sources.iter().find(|s| s.id == id)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.buffer.segment_seconds == 0 {
            anyhow::bail!("buffer.segment_seconds must be > 0");
        }
        if self.buffer.ring_size == 0 || self.buffer.ring_size > MAX_RING_SIZE {
            anyhow::bail!(
                "buffer.ring_size must be within 1..={} (got {})",
                MAX_RING_SIZE,
                self.buffer.ring_size
            );
        }
        if self.buffer.extension.is_empty() || self.buffer.extension.contains('.') {
            anyhow::bail!("buffer.extension must be a bare extension like 'mp4'");
        }
        if self.media.watermarks.is_empty() {
            anyhow::bail!("media.watermarks requires at least one variant");
        }

        let mut ids = BTreeSet::new();
        for source in &self.sources {
            if !ids.insert(source.id) {
                anyhow::bail!("duplicate source id {}", source.id);
            }
            if source.url.is_empty() {
                anyhow::bail!("source {} requires url", source.id);
            }
        }

        if let Some(alarm) = &self.alarm {
            if alarm.poll_interval_secs == 0 {
                anyhow::bail!("alarm.poll_interval_secs must be > 0");
            }
            if alarm.page_size == 0 {
                anyhow::bail!("alarm.page_size must be > 0");
            }
            let mut channels = BTreeSet::new();
            for ch in &alarm.channels {
                if !ids.contains(&ch.source_id) {
                    anyhow::bail!(
                        "alarm channel {} references unknown source {}",
                        ch.channel,
                        ch.source_id
                    );
                }
                if !channels.insert(ch.channel) {
                    anyhow::bail!("duplicate alarm channel {}", ch.channel);
                }
            }
        }

        Ok(())
    }
}
