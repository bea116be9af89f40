use std::path::PathBuf;
use std::time;

use super::error::{PacerError, PacerResult};

const LINE_RATE_DEFAULT_MB: u32 = 6000;
const CHUNK_SIZE_DEFAULT: u32 = 1_048_576;
const MARGIN_DEFAULT_MB: u32 = 10;
const TICK_PERIOD_DEFAULT_MS: u64 = 100;
const MIN_LINK_CAP_DEFAULT_MB: u32 = 1;

pub const MAX_FLOWS: usize = 512;
// Largest table whose slot numbers fit a "quit NNN" frame
const MAX_FLOWS_MAX: usize = 1000;

const SOCKET_PATH_DEFAULT: &str = "/tmp/rdma_socket";
const SHM_NAME_DEFAULT: &str = "/rdma-fairness";

const SKETCH_WIDTH_DEFAULT: u32 = 32768;
const SKETCH_DEPTH_DEFAULT: u32 = 16;
const SKETCH_DOMAIN_BITS_DEFAULT: u32 = 32;
const SKETCH_GRANULARITY_DEFAULT: u32 = 1;
const SKETCH_SEED_DEFAULT: u64 = 12784;

const PROBE_PORT_DEFAULT: u16 = 18515;
const PROBE_SIZE_DEFAULT: usize = 64;
const PROBE_SIZE_MIN: usize = 16;
const PROBE_SIZE_MAX: usize = 1472;

/// Parameters of the hierarchical latency sketch.
#[derive(Clone, Debug)]
pub struct SketchConfig {
    /// Counters per row in each hashed level.
    ///
    /// Default value: 32,768
    pub width: u32,

    /// Rows (independent hash functions) in each hashed level.
    ///
    /// Default value: 16
    pub depth: u32,

    /// Log2 of the value domain, `U`.
    ///
    /// Minimum value: 1 \
    /// Maximum value: 32 \
    /// Default value: 32
    pub domain_bits: u32,

    /// Bits consumed per dyadic level.
    ///
    /// Minimum value: 1 \
    /// Maximum value: `domain_bits` \
    /// Default value: 1
    pub granularity: u32,

    /// Seed for drawing hash coefficients.
    pub seed: u64,
}

impl Default for SketchConfig {
    fn default() -> Self {
        Self {
            width: SKETCH_WIDTH_DEFAULT,
            depth: SKETCH_DEPTH_DEFAULT,
            domain_bits: SKETCH_DOMAIN_BITS_DEFAULT,
            granularity: SKETCH_GRANULARITY_DEFAULT,
            seed: SKETCH_SEED_DEFAULT,
        }
    }
}

/// Parameters of the AIMD capacity controller.
#[derive(Clone, Debug)]
pub struct AimdConfig {
    /// Added to the virtual link cap per uncongested sample, in MB/s.
    ///
    /// Default value: 1
    pub additive_step: u32,

    /// Tail latency inflation over baseline that signals congestion.
    ///
    /// Minimum value: 1 \
    /// Default value: 2
    pub inflation_factor: u64,
}

impl Default for AimdConfig {
    fn default() -> Self {
        Self {
            additive_step: 1,
            inflation_factor: 2,
        }
    }
}

/// Parameters of the latency probe.
#[derive(Clone, Debug)]
pub struct ProbeConfig {
    /// UDP port of the server role; the client role binds `port + 1`.
    pub port: u16,

    /// Size of each probe, in bytes.
    ///
    /// Minimum value: 16 \
    /// Maximum value: 1,472 \
    /// Default value: 64
    pub probe_size: usize,

    /// Completion polls issued back to back before backing off.
    pub spin_polls: u32,

    /// First backoff interval, in microseconds.
    pub backoff_initial_us: u64,

    /// Largest backoff interval, in microseconds.
    pub backoff_max_us: u64,

    /// A probe not completed within this time is dropped, in milliseconds.
    pub completion_timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            port: PROBE_PORT_DEFAULT,
            probe_size: PROBE_SIZE_DEFAULT,
            spin_polls: 1024,
            backoff_initial_us: 1,
            backoff_max_us: 1_000,
            completion_timeout_ms: 100,
        }
    }
}

/// Pacer configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Link rate ceiling; initial virtual link cap and initial per-flow target, in MB/s.
    ///
    /// Default value: 6,000
    pub line_rate_mb: u32,

    /// Send granularity copied into each newly admitted flow, in bytes.
    ///
    /// Default value: 1,048,576
    pub default_chunk_size: u32,

    /// Tolerance between requested and observed throughput, in MB/s.
    ///
    /// Default value: 10
    pub margin_mb: u32,

    /// Allocator period, in milliseconds.
    ///
    /// Default value: 100
    pub tick_period_ms: u64,

    /// Size of the flow table.
    ///
    /// Minimum value: 1 \
    /// Maximum value: 1,000 \
    /// Default value: 512
    pub max_flows: usize,

    /// Multiplicative decrease never takes the virtual link cap below this, in MB/s.
    ///
    /// Default value: 1
    pub min_link_cap_mb: u32,

    /// Path of the admission socket.
    pub socket_path: PathBuf,

    /// Name of the shared memory region holding the flow table.
    pub shm_name: String,

    pub sketch: SketchConfig,
    pub aimd: AimdConfig,
    pub probe: ProbeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            line_rate_mb: LINE_RATE_DEFAULT_MB,
            default_chunk_size: CHUNK_SIZE_DEFAULT,
            margin_mb: MARGIN_DEFAULT_MB,
            tick_period_ms: TICK_PERIOD_DEFAULT_MS,
            max_flows: MAX_FLOWS,
            min_link_cap_mb: MIN_LINK_CAP_DEFAULT_MB,
            socket_path: PathBuf::from(SOCKET_PATH_DEFAULT),
            shm_name: SHM_NAME_DEFAULT.to_string(),
            sketch: Default::default(),
            aimd: Default::default(),
            probe: Default::default(),
        }
    }
}

fn invalid(message: String) -> PacerError {
    PacerError::InvalidConfig { message }
}

impl Config {
    pub fn validate(&self) -> PacerResult<()> {
        if self.line_rate_mb == 0 {
            return Err(invalid("line_rate_mb == 0".into()));
        }
        if self.tick_period_ms == 0 {
            return Err(invalid("tick_period_ms == 0".into()));
        }
        if self.max_flows == 0 || self.max_flows > MAX_FLOWS_MAX {
            return Err(invalid(format!(
                "max_flows must be in 1..={}, got {}",
                MAX_FLOWS_MAX, self.max_flows
            )));
        }
        if self.min_link_cap_mb > self.line_rate_mb {
            return Err(invalid("min_link_cap_mb > line_rate_mb".into()));
        }
        if self.aimd.inflation_factor == 0 {
            return Err(invalid("aimd.inflation_factor == 0".into()));
        }
        if self.probe.probe_size < PROBE_SIZE_MIN || self.probe.probe_size > PROBE_SIZE_MAX {
            return Err(invalid(format!(
                "probe_size must be in {}..={}, got {}",
                PROBE_SIZE_MIN, PROBE_SIZE_MAX, self.probe.probe_size
            )));
        }
        if self.probe.port == u16::MAX {
            return Err(invalid("probe port leaves no room for the client port".into()));
        }
        if self.probe.backoff_initial_us == 0
            || self.probe.backoff_max_us < self.probe.backoff_initial_us
        {
            return Err(invalid("probe backoff bounds out of order".into()));
        }

        // Sketch bounds are re-checked by the sketch itself
        crate::sketch::Sketch::check_params(
            self.sketch.width,
            self.sketch.depth,
            self.sketch.domain_bits,
            self.sketch.granularity,
        )
    }

    pub fn tick_period(&self) -> time::Duration {
        time::Duration::from_millis(self.tick_period_ms)
    }
}
