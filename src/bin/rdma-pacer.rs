use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use clap::{builder::BoolishValueParser, ArgAction, Parser};
use tracing::{error, info};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    FmtSubscriber,
};

use rdma_pacer::admission::AdmissionServer;
use rdma_pacer::config::ProbeConfig;
use rdma_pacer::monitor::udp::{Role, UdpProbeChannel};
use rdma_pacer::shutdown::{self, Shutdown};
use rdma_pacer::{Allocator, Config, ControlBlock, LatencyMonitor, PacerError, PacerResult};

/// Fairness controller for RDMA elephant and mouse flows sharing a link.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Address of the peer pacer.
    peer: String,

    /// Whether this end plays the server role of the probe channel (1/0, true/false).
    #[arg(action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    server: bool,

    /// Link rate ceiling, in MB/s.
    #[arg(long)]
    line_rate_mb: Option<u32>,

    /// Chunk size handed to newly admitted flows, in bytes.
    #[arg(long)]
    chunk_size: Option<u32>,

    /// Tolerance between target and observed throughput, in MB/s.
    #[arg(long)]
    margin_mb: Option<u32>,

    /// Allocator period, in milliseconds.
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Size of the flow table.
    #[arg(long)]
    max_flows: Option<usize>,

    /// Floor of the virtual link cap, in MB/s.
    #[arg(long)]
    min_link_cap_mb: Option<u32>,

    /// Path of the admission socket.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Name of the shared memory region holding the flow table.
    #[arg(long)]
    shm_name: Option<String>,

    /// Counters per row of each hashed sketch level.
    #[arg(long)]
    sketch_width: Option<u32>,

    /// Rows per hashed sketch level.
    #[arg(long)]
    sketch_depth: Option<u32>,

    /// UDP port of the probe channel's server role.
    #[arg(long)]
    probe_port: Option<u16>,

    /// Probe size, in bytes.
    #[arg(long)]
    probe_size: Option<usize>,

    /// Probe completion timeout, in milliseconds.
    #[arg(long)]
    probe_timeout_ms: Option<u64>,
}

impl Args {
    fn config(&self) -> Config {
        let mut config = Config::default();

        if let Some(v) = self.line_rate_mb {
            config.line_rate_mb = v;
        }
        if let Some(v) = self.chunk_size {
            config.default_chunk_size = v;
        }
        if let Some(v) = self.margin_mb {
            config.margin_mb = v;
        }
        if let Some(v) = self.tick_ms {
            config.tick_period_ms = v;
        }
        if let Some(v) = self.max_flows {
            config.max_flows = v;
        }
        if let Some(v) = self.min_link_cap_mb {
            config.min_link_cap_mb = v;
        }
        if let Some(v) = &self.socket {
            config.socket_path = v.clone();
        }
        if let Some(v) = &self.shm_name {
            config.shm_name = v.clone();
        }
        if let Some(v) = self.sketch_width {
            config.sketch.width = v;
        }
        if let Some(v) = self.sketch_depth {
            config.sketch.depth = v;
        }
        if let Some(v) = self.probe_port {
            config.probe.port = v;
        }
        if let Some(v) = self.probe_size {
            config.probe.probe_size = v;
        }
        if let Some(v) = self.probe_timeout_ms {
            config.probe.completion_timeout_ms = v;
        }

        config
    }
}

fn open_probe_channel(
    peer: &str,
    server: bool,
    config: &ProbeConfig,
) -> PacerResult<UdpProbeChannel> {
    let role = if server { Role::Server } else { Role::Client };

    UdpProbeChannel::connect(peer, role, config).map_err(PacerError::Probe)
}

fn run(args: &Args, config: &Config, cb: &std::sync::Arc<ControlBlock>) -> PacerResult<bool> {
    let shutdown = Shutdown::new();

    // Admission is load-bearing, a bind failure stops the daemon before anything else starts
    let mut admission = AdmissionServer::bind(&config.socket_path, cb.admission_port()?)?;
    let mut allocator = Allocator::new(cb.allocator_port()?, config);
    let monitor_port = cb.monitor_port()?;

    let admission_thread = {
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            let result = admission.run(&shutdown);
            if let Err(err) = &result {
                error!(%err, "admission server failed");
                shutdown.trigger();
            }
            result.is_ok()
        })
    };

    let monitor_thread = {
        let shutdown = shutdown.clone();
        let peer = args.peer.clone();
        let server = args.server;
        let config = config.clone();
        thread::spawn(move || {
            let channel = match open_probe_channel(&peer, server, &config.probe) {
                Ok(channel) => channel,
                Err(err) => {
                    error!(%err, %peer, "failed to open probe channel, link cap is frozen");
                    return;
                }
            };

            match LatencyMonitor::new(channel, monitor_port, &config) {
                Ok(mut monitor) => monitor.run(&shutdown),
                Err(err) => error!(%err, "failed to start latency monitor"),
            }
        })
    };

    info!(
        line_rate_mb = config.line_rate_mb,
        max_flows = config.max_flows,
        "pacer running"
    );

    allocator.run(&shutdown);
    shutdown.trigger();

    info!("shutting down");

    let admission_ok = admission_thread.join().unwrap_or(false);
    let _ = monitor_thread.join();

    Ok(admission_ok)
}

fn main() -> ExitCode {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .finish();

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install log subscriber: {}", err);
    }

    let args = Args::parse();
    let config = args.config();

    shutdown::install_signal_handlers();

    let cb = match ControlBlock::create_shared(&config) {
        Ok(cb) => cb,
        Err(err) => {
            error!(%err, "failed to create control block");
            return ExitCode::FAILURE;
        }
    };

    let result = run(&args, &config, &cb);

    if let Err(err) = cb.unlink_shared() {
        error!(%err, "failed to unlink flow table");
    }
    if let Err(err) = std::fs::remove_file(&config.socket_path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            error!(%err, "failed to remove admission socket");
        }
    }

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!(%err, "fatal error");
            ExitCode::FAILURE
        }
    }
}
