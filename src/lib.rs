/*

Pacer keeps large RDMA transfers (elephants) from inflating the tail latency of small,
latency-sensitive ones (mice) that share the same link.

# Control block

All state lives in one control block: a table of flow slots plus a handful of global counters.
Every field has exactly one writer, so plain relaxed atomics suffice and no lock spans two fields.

  field                  writer
  ---------------------  -----------------------
  slot state, class      admission (reserve, free), sender (activate, class)
  slot bytes, measured   sender
  slot target            allocator
  flow counters          allocator
  virtual_link_cap       latency monitor
  next_slot              admission
  rebalance              admission (set), allocator (consume)

Each writer gets a port that exposes only its own stores. Ports are handed out once per control
block, so a second allocator cannot appear by accident. The daemon maps the flow table into POSIX
shared memory so the senders, which live in other processes, see the same slots.

# Virtual link cap (AIMD)

The latency monitor sends one fixed-size probe at a time and records its round trip time in a
hierarchical Count-Min sketch. Whenever no elephant is running, the sketch's p99 and p99.9 are
recorded as the baseline. Whenever elephants and mice run together:

  p99 > 2 * base_p99  or  p999 > 2 * base_p999   =>  cap <- cap / 2
  otherwise                                      =>  cap <- cap + 1

The cap never drops below a configured floor. With elephants alone the cap is left as it is.

# Fair share

Every tick the allocator sweeps the flow table. An elephant whose measured throughput, plus a
margin, is still below its target minus the margin is under-target, and the gap counts as unused
bandwidth. Every other elephant is saturated.

If a flow joined or quit since the last tick, every elephant gets cap / elephants. Otherwise, if
there is unused bandwidth and a saturated elephant, each saturated elephant gains
unused / saturated and each under-target one is shrunk to measured + margin.

# Sketch

The sketch has one level per bit of the value domain (divided by the granularity). Level i counts
values by their top bits, i.e. by value >> (i * gran). Low levels have far more distinct items
than counters, so they are hashed Count-Min rows; once a level has few enough items it is stored
exactly. A range sum walks up the levels, adding the partial dyadic blocks at each end and passing
the middle up, so it touches at most two blocks per level. Quantiles binary-search the range sums
from both ends and average the two answers.

*/

pub mod admission;
pub mod allocator;
pub mod config;
pub mod control;
pub mod error;
pub mod monitor;
pub mod shutdown;
pub mod sketch;

pub use allocator::Allocator;
pub use config::Config;
pub use control::ControlBlock;
pub use error::{PacerError, PacerResult};
pub use monitor::LatencyMonitor;
pub use shutdown::Shutdown;
pub use sketch::Sketch;
