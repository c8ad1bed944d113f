// src/capture/process.rs

use std::io;
use std::process::Stdio;

use log::{debug, error, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::{CaptureLauncher, CaptureProcess};
use crate::error::mentions_disk_full;
use crate::media::ffmpeg::capture_args;
use crate::store::SegmentStore;
use crate::types::Source;

/// Launches the segmenting ffmpeg capture for a source.
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    ffmpeg: String,
    store: SegmentStore,
}

impl FfmpegLauncher {
    pub fn new(ffmpeg: impl Into<String>, store: SegmentStore) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            store,
        }
    }
}

impl CaptureLauncher for FfmpegLauncher {
    type Process = CaptureChild;

    fn launch(&self, source: &Source) -> io::Result<CaptureChild> {
        std::fs::create_dir_all(self.store.dir())?;

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(capture_args(source, &self.store));
        CaptureChild::spawn(cmd, &source.name)
    }
}

/// What the diagnostic stream of one run contained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub lines: u64,
    pub disk_full: u64,
}

pub struct CaptureChild {
    child: Child,
    forwarder: Option<JoinHandle<Diagnostics>>,
    diagnostics: Option<Diagnostics>,
}

impl CaptureChild {
    /// Spawns `cmd` with stderr forwarded into the log under `capture:<name>`.
    pub fn spawn(mut cmd: Command, name: &str) -> io::Result<Self> {
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // stderr must be drained continuously or ffmpeg blocks on a full pipe
        let forwarder = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_diagnostics(name.to_string(), stderr)));

        Ok(Self {
            child,
            forwarder,
            diagnostics: None,
        })
    }

    /// Summary of the diagnostic stream, available once `wait` has returned.
    pub fn diagnostics(&self) -> Option<Diagnostics> {
        self.diagnostics
    }
}

impl CaptureProcess for CaptureChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        if let Some(forwarder) = self.forwarder.take() {
            self.diagnostics = forwarder.await.ok();
        }
        Ok(status.code())
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("[capture] kill failed: {}", e);
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

/// Logs every line of `reader` until EOF. Bytes are decoded lossily, device
/// output is not guaranteed to be UTF-8.
pub async fn forward_diagnostics<R>(name: String, reader: R) -> Diagnostics
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut seen = Diagnostics::default();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                seen.lines += 1;
                if log_diagnostic(&name, line) {
                    seen.disk_full += 1;
                }
            }
            Err(e) => {
                // keep the pipe drained even if the stream cannot be logged anymore
                warn!("[capture:{}] diagnostic stream error: {}", name, e);
                if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    warn!("[capture:{}] diagnostic stream lost: {}", name, e);
                }
                break;
            }
        }
    }

    seen
}

/// Returns `true` for a disk-exhaustion line.
fn log_diagnostic(name: &str, line: &str) -> bool {
    if mentions_disk_full(line) {
        error!("[capture:{}] DISK FULL: {}", name, line);
        true
    } else if line.to_ascii_lowercase().contains("error") {
        warn!("[capture:{}] {}", name, line);
        false
    } else {
        debug!("[capture:{}] {}", name, line);
        false
    }
}
