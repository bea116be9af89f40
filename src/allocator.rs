//! Periodic fair-share allocation of the virtual link cap among elephant flows.
//!
//! Each tick sweeps the flow table once. Elephants running more than `margin` below their target
//! are under-target and the gap is collected as unused bandwidth; the rest are saturated. After a
//! membership change every elephant gets an equal share of the cap. Otherwise the unused
//! bandwidth is split among the saturated elephants, and the under-target ones are shrunk down to
//! what they actually send.

use std::time;

use tracing::{debug, info, trace};

use super::config::Config;
use super::control::AllocatorPort;
use super::shutdown::Shutdown;

/// What a tick did to the elephants' targets.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TickAction {
    /// No active elephants.
    Idle,
    /// Every elephant got `target`.
    EqualSplit { target: u32 },
    /// Saturated elephants gained `redistributed` each, the rest were clamped.
    Redistribute { redistributed: f64 },
    /// Targets unchanged.
    Stable,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TickReport {
    pub num_big: u16,
    pub num_small: u16,
    pub num_saturated: u16,
    pub unused: f64,
    pub redistributed: f64,
    pub action: TickAction,
}

pub struct Allocator {
    // Write access to targets and counters
    port: AllocatorPort,
    // Tolerance band between measured and target throughput
    margin: u32,
    period: time::Duration,
    // Scratch accumulators, valid for the current tick only
    unused: f64,
    redistributed: f64,
}

impl Allocator {
    pub fn new(port: AllocatorPort, config: &Config) -> Self {
        Self {
            port,
            margin: config.margin_mb,
            period: config.tick_period(),
            unused: 0.0,
            redistributed: 0.0,
        }
    }

    pub fn tick(&mut self) -> TickReport {
        let margin = self.margin;

        self.unused = 0.0;
        self.redistributed = 0.0;

        let mut num_big: u16 = 0;
        let mut num_small: u16 = 0;
        let mut num_saturated: u16 = 0;

        for slot in 0..self.port.max_flows() {
            let view = self.port.view(slot);
            if !view.active {
                continue;
            }

            trace!(slot, measured = view.measured, target = view.target, small = view.small);

            if view.small {
                num_small += 1;
                continue;
            }

            num_big += 1;

            let adjusted = view.measured.saturating_add(margin);
            if adjusted < view.target.saturating_sub(margin) {
                self.unused += (view.target - adjusted) as f64;
            } else {
                num_saturated += 1;
            }
        }

        // Published whole so the monitor never sees a half-counted sweep
        self.port.publish_counts(num_big, num_small, num_saturated);

        let action = if num_big == 0 {
            TickAction::Idle
        } else if self.port.take_rebalance() {
            let target = self.port.virtual_link_cap() / num_big as u32;
            self.equal_split(target);
            TickAction::EqualSplit { target }
        } else if num_saturated > 0 && self.unused > 0.0 {
            self.redistributed = self.unused / num_saturated as f64;
            self.redistribute();
            TickAction::Redistribute {
                redistributed: self.redistributed,
            }
        } else {
            TickAction::Stable
        };

        TickReport {
            num_big,
            num_small,
            num_saturated,
            unused: self.unused,
            redistributed: self.redistributed,
            action,
        }
    }

    fn equal_split(&self, target: u32) {
        for slot in 0..self.port.max_flows() {
            let view = self.port.view(slot);
            if view.active && !view.small {
                self.port.set_target(slot, target);
            }
        }
    }

    fn redistribute(&self) {
        let share = self.redistributed as u32;

        for slot in 0..self.port.max_flows() {
            let view = self.port.view(slot);
            if !view.active || view.small {
                continue;
            }

            let adjusted = view.measured.saturating_add(self.margin);
            if adjusted >= view.target {
                self.port.add_target(slot, share);
            } else {
                self.port.set_target(slot, adjusted);
            }
        }
    }

    /// Ticks once per period until shut down.
    pub fn run(&mut self, shutdown: &Shutdown) {
        info!(period_ms = self.period.as_millis() as u64, "allocator started");

        while !shutdown.wait_timeout(self.period) {
            let report = self.tick();

            match report.action {
                TickAction::Idle | TickAction::Stable => {}
                TickAction::EqualSplit { target } => {
                    debug!(
                        elephants = report.num_big,
                        mice = report.num_small,
                        target,
                        "enforcing equal split"
                    );
                }
                TickAction::Redistribute { redistributed } => {
                    debug!(
                        elephants = report.num_big,
                        saturated = report.num_saturated,
                        unused = report.unused,
                        redistributed,
                        "redistributing unused bandwidth"
                    );
                }
            }
        }

        info!("allocator stopped");
    }
}
