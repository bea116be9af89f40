// AIMD on the virtual link cap, driven by tail latency inflation:
//
// While no elephant is active, every sample becomes the new baseline. While elephants and mice
// are both active, a p99 or p99.9 above `inflation_factor` times its baseline halves the cap,
// anything else adds `additive_step`. Elephants without mice leave the cap alone, since tail
// latency only matters when latency-sensitive traffic is competing.

use crate::config::AimdConfig;
use crate::control::MonitorPort;

/// Tail latency quantiles, in nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TailLatency {
    pub p99: u64,
    pub p999: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AimdState {
    // No elephants, tracking the idle baseline
    Baseline,
    // Elephants competing with mice, adjusting the cap
    Steady,
    // Elephants alone, cap untouched
    Uncontended,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Adjustment {
    BaselineRecorded,
    Decrease { from: u32, to: u32 },
    Increase { from: u32, to: u32 },
    Hold,
}

pub struct AimdController {
    additive_step: u32,
    inflation_factor: u64,
    baseline: Option<TailLatency>,
    state: AimdState,
}

impl AimdController {
    pub fn new(config: &AimdConfig) -> Self {
        Self {
            additive_step: config.additive_step,
            inflation_factor: config.inflation_factor,
            baseline: None,
            state: AimdState::Baseline,
        }
    }

    pub fn on_sample(&mut self, tails: TailLatency, port: &MonitorPort) -> Adjustment {
        let (big, small) = port.active_flow_counts();

        if big == 0 {
            self.state = AimdState::Baseline;
            self.baseline = Some(tails);
            return Adjustment::BaselineRecorded;
        }

        if small == 0 {
            self.state = AimdState::Uncontended;
            return Adjustment::Hold;
        }

        self.state = AimdState::Steady;

        // Elephants were already running when the monitor started
        let Some(baseline) = self.baseline else {
            return Adjustment::Hold;
        };

        let factor = self.inflation_factor;
        if tails.p99 > baseline.p99.saturating_mul(factor)
            || tails.p999 > baseline.p999.saturating_mul(factor)
        {
            let (from, to) = port.halve_link_cap();
            Adjustment::Decrease { from, to }
        } else {
            let (from, to) = port.increase_link_cap(self.additive_step);
            Adjustment::Increase { from, to }
        }
    }

    pub fn state(&self) -> AimdState {
        self.state
    }

    pub fn baseline(&self) -> Option<TailLatency> {
        self.baseline
    }
}
