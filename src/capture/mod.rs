// src/capture/mod.rs
//
// One supervisor per source keeps a single capture process alive forever:
// Starting -> Running -> Exited -> Starting -> ...
// Shutdown comes from outside through the watch channel.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::store::RingRetention;
use crate::types::Source;

pub mod clock;
pub mod process;

pub use clock::{Clock, TokioClock};
pub use process::{CaptureChild, Diagnostics, FfmpegLauncher};

/// A run shorter than this counts as a failed start.
pub const HEALTHY_RUN: Duration = Duration::from_secs(30);
/// Every n-th consecutive failure is reported as an unreachable source.
const UNREACHABLE_REPORT_EVERY: u32 = 10;

pub trait CaptureProcess: Send {
    fn id(&self) -> Option<u32>;
    /// Exit code, `None` when terminated by a signal.
    fn wait(&mut self) -> impl Future<Output = io::Result<Option<i32>>> + Send;
    fn kill(&mut self) -> impl Future<Output = ()> + Send;
}

pub trait CaptureLauncher: Send + Sync {
    type Process: CaptureProcess;
    fn launch(&self, source: &Source) -> io::Result<Self::Process>;
}

pub enum CaptureState<P> {
    Starting,
    Running(P),
    /// Exit code of the last run; `None` for a signal or a failed spawn.
    Exited(Option<i32>),
}

/// Counters handed back when the supervisor stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub launches: u64,
    pub exits: u64,
    pub consecutive_failures: u32,
}

pub struct CaptureSupervisor<L, C> {
    source: Source,
    launcher: L,
    clock: C,
    backoff: Duration,
    pid_dir: PathBuf,
    retention: Option<RingRetention>,
    last_start: Option<Instant>,
    stats: CaptureStats,
}

impl<L: CaptureLauncher, C: Clock> CaptureSupervisor<L, C> {
    pub fn new(
        source: Source,
        launcher: L,
        clock: C,
        backoff: Duration,
        pid_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            launcher,
            clock,
            backoff,
            pid_dir: pid_dir.into(),
            retention: None,
            last_start: None,
            stats: CaptureStats::default(),
        }
    }

    pub fn with_retention(mut self, retention: RingRetention) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn pid_path(&self) -> PathBuf {
        pid_file(&self.pid_dir, &self.source)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> CaptureStats {
        let tag = format!("capture:{}", self.source.name);
        let mut state: CaptureState<L::Process> = CaptureState::Starting;

        loop {
            if *shutdown.borrow() {
                break;
            }

            state = match state {
                CaptureState::Starting => self.start(&tag),

                CaptureState::Running(mut process) => {
                    let exit = tokio::select! {
                        res = process.wait() => Some(res),
                        _ = shutdown.changed() => None,
                    };
                    self.remove_pid_file(&tag);

                    match exit {
                        Some(Ok(code)) => CaptureState::Exited(code),
                        Some(Err(e)) => {
                            warn!("[{}] wait failed: {}", tag, e);
                            CaptureState::Exited(None)
                        }
                        None => {
                            info!("[{}] stopping capture process", tag);
                            process.kill().await;
                            break;
                        }
                    }
                }

                CaptureState::Exited(code) => {
                    self.record_exit(&tag, code);
                    let resumed = tokio::select! {
                        _ = self.clock.sleep(self.backoff) => true,
                        _ = shutdown.changed() => false,
                    };
                    if !resumed {
                        break;
                    }
                    CaptureState::Starting
                }
            };
        }

        info!("[{}] stopped after {} launches", tag, self.stats.launches);
        self.stats
    }

    fn start(&mut self, tag: &str) -> CaptureState<L::Process> {
        if let Some(retention) = &self.retention {
            if let Err(e) = retention.run(self.source.id) {
                warn!("[{}] retention failed: {}", tag, e);
            }
        }

        self.stats.launches += 1;
        self.last_start = Some(self.clock.now());

        match self.launcher.launch(&self.source) {
            Ok(process) => {
                match process.id() {
                    Some(pid) => {
                        info!("[{}] started pid {}", tag, pid);
                        self.write_pid_file(tag, pid);
                    }
                    None => info!("[{}] started", tag),
                }
                CaptureState::Running(process)
            }
            Err(e) => {
                error!("[{}] launch failed: {}", tag, e);
                CaptureState::Exited(None)
            }
        }
    }

    fn record_exit(&mut self, tag: &str, code: Option<i32>) {
        self.stats.exits += 1;

        let ran_for = self
            .last_start
            .map(|t| self.clock.now().saturating_duration_since(t))
            .unwrap_or_default();

        if ran_for >= HEALTHY_RUN {
            self.stats.consecutive_failures = 0;
        } else {
            self.stats.consecutive_failures += 1;
        }

        match code {
            Some(0) => info!("[{}] exited after {:?}, restarting in {:?}", tag, ran_for, self.backoff),
            Some(c) => warn!(
                "[{}] exited with code {} after {:?}, restarting in {:?}",
                tag, c, ran_for, self.backoff
            ),
            None => warn!("[{}] terminated after {:?}, restarting in {:?}", tag, ran_for, self.backoff),
        }

        let failures = self.stats.consecutive_failures;
        if failures > 0 && failures % UNREACHABLE_REPORT_EVERY == 0 {
            warn!(
                "[{}] source unreachable: {} consecutive short runs ({})",
                tag, failures, self.source.url
            );
        }
    }

    fn write_pid_file(&self, tag: &str, pid: u32) {
        let path = self.pid_path();
        let res = std::fs::create_dir_all(&self.pid_dir)
            .and_then(|_| std::fs::write(&path, pid.to_string()));
        if let Err(e) = res {
            warn!("[{}] failed to write {:?}: {}", tag, path, e);
        }
    }

    fn remove_pid_file(&self, tag: &str) {
        let path = self.pid_path();
        match std::fs::remove_file(&path) {
            Ok(_) => debug!("[{}] removed {:?}", tag, path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("[{}] failed to remove {:?}: {}", tag, path, e),
        }
    }
}

/// `<pid_dir>/<source id>.pid`, read by admin tooling for forced termination.
pub fn pid_file(pid_dir: &Path, source: &Source) -> PathBuf {
    pid_dir.join(format!("{}.pid", source.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    struct FakeProcess {
        pid: u32,
        exit: Option<Option<i32>>,
        killed: Arc<AtomicBool>,
    }

    impl CaptureProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            Some(self.pid)
        }

        async fn wait(&mut self) -> io::Result<Option<i32>> {
            match self.exit {
                Some(code) => {
                    tokio::task::yield_now().await;
                    Ok(code)
                }
                None => std::future::pending().await,
            }
        }

        async fn kill(&mut self) {
            self.killed.store(true, Ordering::SeqCst);
        }
    }

    /// Hands out processes that exit with the scripted codes, then one that runs until killed.
    struct ScriptedLauncher {
        exits: Mutex<VecDeque<Option<i32>>>,
        launched: mpsc::UnboundedSender<u32>,
        killed: Arc<AtomicBool>,
        next_pid: Mutex<u32>,
    }

    impl CaptureLauncher for ScriptedLauncher {
        type Process = FakeProcess;

        fn launch(&self, _source: &Source) -> io::Result<FakeProcess> {
            let mut pid = self.next_pid.lock().unwrap();
            *pid += 1;
            let exit = self.exits.lock().unwrap().pop_front();
            let _ = self.launched.send(*pid);
            Ok(FakeProcess {
                pid: *pid,
                exit,
                killed: self.killed.clone(),
            })
        }
    }

    struct FailingLauncher;

    impl CaptureLauncher for FailingLauncher {
        type Process = FakeProcess;

        fn launch(&self, _source: &Source) -> io::Result<FakeProcess> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no ffmpeg"))
        }
    }

    /// Sleeping advances virtual time instead of waiting.
    #[derive(Clone)]
    struct FakeClock {
        base: Instant,
        elapsed: Arc<Mutex<Duration>>,
        sleeps: Arc<Mutex<Vec<Duration>>>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                elapsed: Arc::new(Mutex::new(Duration::ZERO)),
                sleeps: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            self.base + *self.elapsed.lock().unwrap()
        }

        async fn sleep(&self, dur: Duration) {
            *self.elapsed.lock().unwrap() += dur;
            self.sleeps.lock().unwrap().push(dur);
            tokio::task::yield_now().await;
        }
    }

    fn source() -> Source {
        Source {
            id: 7,
            name: "court-7".into(),
            url: "rtsp://cam7/stream".into(),
            transcode: false,
        }
    }

    #[tokio::test]
    async fn restarts_once_after_every_exit() {
        let pid_dir = tempfile::tempdir().unwrap();
        let (tx, mut launched) = mpsc::unbounded_channel();
        let killed = Arc::new(AtomicBool::new(false));
        let launcher = ScriptedLauncher {
            exits: Mutex::new(VecDeque::from([Some(1), Some(0), Some(1)])),
            launched: tx,
            killed: killed.clone(),
            next_pid: Mutex::new(100),
        };
        let clock = FakeClock::new();
        let (stop_tx, stop_rx) = watch::channel(false);

        let supervisor = CaptureSupervisor::new(
            source(),
            launcher,
            clock.clone(),
            Duration::from_secs(5),
            pid_dir.path(),
        );
        let pid_path = supervisor.pid_path();
        let task = tokio::spawn(supervisor.run(stop_rx));

        let mut pids = Vec::new();
        for _ in 0..4 {
            pids.push(launched.recv().await.unwrap());
        }
        assert_eq!(pids, vec![101, 102, 103, 104]);

        // the fourth process stays up: its pid is published for admin tooling
        tokio::task::yield_now().await;
        assert_eq!(std::fs::read_to_string(&pid_path).unwrap(), "104");

        stop_tx.send(true).unwrap();
        let stats = task.await.unwrap();

        assert_eq!(stats.launches, 4);
        assert_eq!(stats.exits, 3);
        assert_eq!(stats.consecutive_failures, 3);
        assert_eq!(*clock.sleeps.lock().unwrap(), vec![Duration::from_secs(5); 3]);
        assert!(killed.load(Ordering::SeqCst));
        assert!(!pid_path.exists());
        assert!(launched.try_recv().is_err());
    }

    #[tokio::test]
    async fn launch_failures_keep_retrying() {
        let pid_dir = tempfile::tempdir().unwrap();
        let clock = FakeClock::new();
        let (stop_tx, stop_rx) = watch::channel(false);

        let supervisor = CaptureSupervisor::new(
            source(),
            FailingLauncher,
            clock.clone(),
            Duration::from_secs(5),
            pid_dir.path(),
        );
        let task = tokio::spawn(supervisor.run(stop_rx));

        while clock.sleeps.lock().unwrap().len() < 12 {
            tokio::task::yield_now().await;
        }
        stop_tx.send(true).unwrap();
        let stats = task.await.unwrap();

        assert!(stats.launches >= 12);
        assert!(stats.consecutive_failures >= 12);
    }

    #[tokio::test]
    async fn stops_immediately_when_already_shut_down() {
        let pid_dir = tempfile::tempdir().unwrap();
        let (_stop_tx, stop_rx) = watch::channel(true);

        let stats = CaptureSupervisor::new(
            source(),
            FailingLauncher,
            FakeClock::new(),
            Duration::from_secs(5),
            pid_dir.path(),
        )
        .run(stop_rx)
        .await;

        assert_eq!(stats, CaptureStats::default());
    }
}
