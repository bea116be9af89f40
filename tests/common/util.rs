use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time;

use rdma_pacer::admission::AdmissionServer;
use rdma_pacer::monitor::{Completion, ProbeChannel};
use rdma_pacer::{Config, ControlBlock, PacerResult, Shutdown};

/// A config small enough for tests: tiny sketch, fast ticks.
pub fn test_config(max_flows: usize) -> Config {
    let mut config = Config {
        max_flows,
        tick_period_ms: 5,
        min_link_cap_mb: 100,
        ..Default::default()
    };
    config.sketch.width = 1024;
    config.sketch.depth = 4;
    config.probe.spin_polls = 0;
    config.probe.backoff_max_us = 200;
    config.probe.completion_timeout_ms = 50;
    config
}

/// An admission server running on its own thread, stopped on drop.
pub struct AdmissionHarness {
    pub cb: Arc<ControlBlock>,
    pub path: PathBuf,
    shutdown: Shutdown,
    thread: Option<thread::JoinHandle<PacerResult<()>>>,
    _dir: tempfile::TempDir,
}

impl AdmissionHarness {
    pub fn start(max_flows: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pacer.sock");

        let cb = ControlBlock::new(&test_config(max_flows)).unwrap();
        let mut server = AdmissionServer::bind(&path, cb.admission_port().unwrap()).unwrap();

        let shutdown = Shutdown::new();
        let thread = {
            let shutdown = shutdown.clone();
            thread::spawn(move || server.run(&shutdown))
        };

        Self {
            cb,
            path,
            shutdown,
            thread: Some(thread),
            _dir: dir,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AdmissionHarness {
    fn drop(&mut self) {
        self.shutdown.trigger();
        if let Some(thread) = self.thread.take() {
            let result = thread.join().unwrap();
            // Don't double-panic while unwinding from a failed assertion
            if !thread::panicking() {
                result.unwrap();
            }
        }
    }
}

/// Sends raw bytes and returns the raw reply.
pub fn raw_request(path: &Path, message: &[u8]) -> io::Result<Vec<u8>> {
    let mut stream = UnixStream::connect(path)?;
    stream.write_all(message)?;
    stream.shutdown(std::net::Shutdown::Write)?;

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply)?;
    Ok(reply)
}

/// Probe channel whose round trip time is set from outside.
pub struct FakeLink {
    latency_us: Arc<AtomicU64>,
    posted_at: Option<time::Instant>,
}

impl FakeLink {
    pub fn new(latency_us: u64) -> (Self, Arc<AtomicU64>) {
        let latency_us = Arc::new(AtomicU64::new(latency_us));
        let link = Self {
            latency_us: Arc::clone(&latency_us),
            posted_at: None,
        };
        (link, latency_us)
    }
}

impl ProbeChannel for FakeLink {
    fn post_probe(&mut self) -> io::Result<()> {
        self.posted_at = Some(time::Instant::now());
        Ok(())
    }

    fn poll_completion(&mut self) -> io::Result<Option<Completion>> {
        let latency = time::Duration::from_micros(self.latency_us.load(Ordering::Relaxed));

        match self.posted_at {
            Some(posted_at) if posted_at.elapsed() >= latency => {
                self.posted_at = None;
                Ok(Some(Completion::Success))
            }
            _ => Ok(None),
        }
    }
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_until<F>(timeout: time::Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = time::Instant::now() + timeout;

    while time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(time::Duration::from_millis(1));
    }

    cond()
}
