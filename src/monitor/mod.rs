//! Latency probing loop.
//!
//! Each iteration posts one probe on a [`ProbeChannel`], waits for its completion, and feeds the
//! round trip time into a hierarchical sketch. The sketch's cumulative p99 and p99.9 drive the
//! AIMD controller that adjusts the virtual link cap.
//!
//! Completions are awaited with a short spin, then exponential backoff through
//! [`ProbeChannel::wait`], up to a timeout. A probe that fails, or does not complete in time, is
//! dropped and the cap is left alone for that iteration.

mod aimd;
pub mod udp;

use std::io;
use std::thread;
use std::time;

use tracing::{debug, info, warn};

use super::config::{Config, ProbeConfig};
use super::control::MonitorPort;
use super::error::PacerResult;
use super::shutdown::Shutdown;
use super::sketch::Sketch;

pub use aimd::{Adjustment, AimdController, AimdState, TailLatency};

const P99: f64 = 0.99;
const P999: f64 = 0.999;

/// Status of a completed probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    Success,
    Failed(String),
}

/// Transport over which round trip probes are sent. Only one probe is outstanding at a time.
pub trait ProbeChannel {
    /// Posts one fixed-size probe.
    fn post_probe(&mut self) -> io::Result<()>;

    /// Checks, without blocking, whether the outstanding probe has completed.
    fn poll_completion(&mut self) -> io::Result<Option<Completion>>;

    /// Blocks for up to `timeout`, returning early if the channel may have made progress.
    fn wait(&mut self, timeout: time::Duration) -> io::Result<()> {
        thread::sleep(timeout);
        Ok(())
    }
}

/// How long, and how patiently, to wait for a completion.
#[derive(Clone, Debug)]
pub struct WaitPolicy {
    pub spin_polls: u32,
    pub backoff_initial: time::Duration,
    pub backoff_max: time::Duration,
    pub timeout: time::Duration,
}

impl From<&ProbeConfig> for WaitPolicy {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            spin_polls: config.spin_polls,
            backoff_initial: time::Duration::from_micros(config.backoff_initial_us),
            backoff_max: time::Duration::from_micros(config.backoff_max_us),
            timeout: time::Duration::from_millis(config.completion_timeout_ms),
        }
    }
}

#[derive(Debug)]
pub enum ProbeOutcome {
    Sampled {
        latency_ns: u64,
        tails: TailLatency,
        adjustment: Adjustment,
    },
    PostFailed(io::Error),
    PollFailed(io::Error),
    CompletionFailed(String),
    TimedOut,
    Cancelled,
}

pub struct LatencyMonitor<C> {
    channel: C,
    // Cumulative latency distribution, never decays
    sketch: Sketch,
    aimd: AimdController,
    port: MonitorPort,
    wait: WaitPolicy,
}

impl<C> LatencyMonitor<C>
where
    C: ProbeChannel,
{
    pub fn new(channel: C, port: MonitorPort, config: &Config) -> PacerResult<Self> {
        let sketch = Sketch::from_config(&config.sketch)?;

        info!(bytes = sketch.size_bytes(), "allocated latency sketch");

        Ok(Self {
            channel,
            sketch,
            aimd: AimdController::new(&config.aimd),
            port,
            wait: WaitPolicy::from(&config.probe),
        })
    }

    fn wait_completion(&mut self, shutdown: &Shutdown) -> Result<Completion, ProbeOutcome> {
        let start = time::Instant::now();
        let mut polls = 0;
        let mut backoff = self.wait.backoff_initial;

        loop {
            match self.channel.poll_completion() {
                Ok(Some(completion)) => return Ok(completion),
                Ok(None) => {}
                Err(err) => return Err(ProbeOutcome::PollFailed(err)),
            }

            if polls < self.wait.spin_polls {
                polls += 1;
                std::hint::spin_loop();
                continue;
            }

            if shutdown.is_triggered() {
                return Err(ProbeOutcome::Cancelled);
            }

            let elapsed = start.elapsed();
            if elapsed >= self.wait.timeout {
                return Err(ProbeOutcome::TimedOut);
            }

            let nap = backoff.min(self.wait.timeout - elapsed);
            if let Err(err) = self.channel.wait(nap) {
                return Err(ProbeOutcome::PollFailed(err));
            }

            backoff = (backoff * 2).min(self.wait.backoff_max);
        }
    }

    /// Sends one probe and, if it completes, records its round trip time.
    pub fn step(&mut self, shutdown: &Shutdown) -> ProbeOutcome {
        let start = time::Instant::now();

        if let Err(err) = self.channel.post_probe() {
            return ProbeOutcome::PostFailed(err);
        }

        match self.wait_completion(shutdown) {
            Ok(Completion::Success) => {}
            Ok(Completion::Failed(status)) => return ProbeOutcome::CompletionFailed(status),
            Err(outcome) => return outcome,
        }

        let latency_ns = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.observe(latency_ns)
    }

    /// Records one latency sample and runs the AIMD controller on the updated tails.
    pub fn observe(&mut self, latency_ns: u64) -> ProbeOutcome {
        // Saturated to the sketch domain
        let value = u32::try_from(latency_ns).unwrap_or(u32::MAX);
        self.sketch.update(value, 1);

        let tails = TailLatency {
            p99: self.sketch.quantile(P99),
            p999: self.sketch.quantile(P999),
        };
        let adjustment = self.aimd.on_sample(tails, &self.port);

        ProbeOutcome::Sampled {
            latency_ns,
            tails,
            adjustment,
        }
    }

    pub fn run(&mut self, shutdown: &Shutdown) {
        info!("latency monitor started");

        while !shutdown.is_triggered() {
            let failed = match self.step(shutdown) {
                ProbeOutcome::Sampled {
                    latency_ns,
                    tails,
                    adjustment,
                } => {
                    if let Adjustment::Decrease { from, to } = adjustment {
                        debug!(
                            latency_ns,
                            p99 = tails.p99,
                            p999 = tails.p999,
                            from,
                            to,
                            "link cap decreased"
                        );
                    }
                    false
                }
                ProbeOutcome::PostFailed(err) => {
                    warn!(%err, "failed to post probe");
                    true
                }
                ProbeOutcome::PollFailed(err) => {
                    warn!(%err, "failed to poll probe completion");
                    true
                }
                ProbeOutcome::CompletionFailed(status) => {
                    warn!(%status, "probe completed with error");
                    true
                }
                ProbeOutcome::TimedOut => {
                    warn!("probe completion timed out, sample dropped");
                    false
                }
                ProbeOutcome::Cancelled => break,
            };

            // A broken channel is retried once per completion timeout
            if failed && shutdown.wait_timeout(self.wait.timeout) {
                break;
            }
        }

        info!("latency monitor stopped");
    }

    pub fn sketch(&self) -> &Sketch {
        &self.sketch
    }

    pub fn aimd(&self) -> &AimdController {
        &self.aimd
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{AllocatorPort, ControlBlock};
    use std::collections::VecDeque;

    // Completes each probe after a scripted number of empty polls
    struct ScriptedChannel {
        script: VecDeque<Step>,
        pending: Option<Step>,
        posted: usize,
    }

    #[derive(Clone)]
    enum Step {
        CompleteAfter(u32),
        FailPost,
        FailStatus,
        Never,
    }

    impl ScriptedChannel {
        fn new(script: Vec<Step>) -> Self {
            Self {
                script: script.into(),
                pending: None,
                posted: 0,
            }
        }
    }

    impl ProbeChannel for ScriptedChannel {
        fn post_probe(&mut self) -> io::Result<()> {
            let step = self.script.pop_front().unwrap_or(Step::CompleteAfter(0));
            if let Step::FailPost = step {
                return Err(io::Error::new(io::ErrorKind::Other, "queue pair down"));
            }
            self.posted += 1;
            self.pending = Some(step);
            Ok(())
        }

        fn poll_completion(&mut self) -> io::Result<Option<Completion>> {
            match self.pending.take() {
                Some(Step::CompleteAfter(0)) => Ok(Some(Completion::Success)),
                Some(Step::CompleteAfter(n)) => {
                    self.pending = Some(Step::CompleteAfter(n - 1));
                    Ok(None)
                }
                Some(Step::FailStatus) => Ok(Some(Completion::Failed("remote access".into()))),
                Some(Step::Never) => {
                    self.pending = Some(Step::Never);
                    Ok(None)
                }
                Some(Step::FailPost) | None => Ok(None),
            }
        }

        fn wait(&mut self, _timeout: time::Duration) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.sketch.width = 1024;
        config.sketch.depth = 4;
        config.probe.spin_polls = 4;
        config.probe.completion_timeout_ms = 20;
        config
    }

    fn monitor(script: Vec<Step>) -> (LatencyMonitor<ScriptedChannel>, AllocatorPort) {
        let config = test_config();
        let cb = ControlBlock::new(&config).unwrap();
        let allocator = cb.allocator_port().unwrap();
        let monitor = LatencyMonitor::new(
            ScriptedChannel::new(script),
            cb.monitor_port().unwrap(),
            &config,
        )
        .unwrap();

        (monitor, allocator)
    }

    #[test]
    fn completed_probe_is_sampled() {
        let (mut monitor, _allocator) = monitor(vec![Step::CompleteAfter(10)]);

        match monitor.step(&Shutdown::new()) {
            ProbeOutcome::Sampled { adjustment, .. } => {
                assert_eq!(adjustment, Adjustment::BaselineRecorded)
            }
            outcome => panic!("unexpected outcome {:?}", outcome),
        }
        assert_eq!(monitor.sketch().count(), 1);
    }

    #[test]
    fn failures_drop_the_sample() {
        let (mut monitor, _allocator) = monitor(vec![Step::FailPost, Step::FailStatus]);
        let shutdown = Shutdown::new();

        assert!(matches!(monitor.step(&shutdown), ProbeOutcome::PostFailed(_)));
        assert!(matches!(
            monitor.step(&shutdown),
            ProbeOutcome::CompletionFailed(_)
        ));
        assert_eq!(monitor.sketch().count(), 0);

        // The loop carries on afterwards
        assert!(matches!(monitor.step(&shutdown), ProbeOutcome::Sampled { .. }));
        assert_eq!(monitor.channel_mut().posted, 2);
    }

    #[test]
    fn stalled_probe_times_out() {
        let (mut monitor, _allocator) = monitor(vec![Step::Never]);

        assert!(matches!(
            monitor.step(&Shutdown::new()),
            ProbeOutcome::TimedOut
        ));
        assert_eq!(monitor.sketch().count(), 0);
    }

    #[test]
    fn stalled_probe_is_cancellable() {
        let (mut monitor, _allocator) = monitor(vec![Step::Never]);
        let shutdown = Shutdown::new();
        shutdown.trigger();

        assert!(matches!(monitor.step(&shutdown), ProbeOutcome::Cancelled));
    }

    #[test]
    fn congestion_halves_cap() {
        let (mut monitor, allocator) = monitor(vec![]);

        for _ in 0..100 {
            monitor.observe(1000);
        }
        assert_eq!(
            monitor.aimd().baseline().map(|b| b.p99 >= 900 && b.p99 <= 1100),
            Some(true)
        );

        allocator.publish_counts(1, 1, 0);

        // Uninflated sample, additive increase
        match monitor.observe(1000) {
            ProbeOutcome::Sampled { adjustment, .. } => {
                assert_eq!(adjustment, Adjustment::Increase { from: 6000, to: 6001 })
            }
            outcome => panic!("unexpected outcome {:?}", outcome),
        }

        // Enough slow samples to move p99 past twice the baseline
        let mut decreased = false;
        for _ in 0..10 {
            if let ProbeOutcome::Sampled {
                adjustment: Adjustment::Decrease { .. },
                ..
            } = monitor.observe(5000)
            {
                decreased = true;
            }
        }
        assert!(decreased);
        assert!(allocator.virtual_link_cap() < 6001);
    }
}
