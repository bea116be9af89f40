//! The shared control block.
//!
//! One table of per-flow slots plus a handful of global scalars, shared by the admission server,
//! the allocator, the latency monitor, and the external send path. Every field has exactly one
//! writer role, and every access is a single relaxed atomic operation; no lock spans two fields.
//! Write access is only handed out through the role ports in [`ports`], and the three loop roles
//! may each be claimed once.
//!
//! | Field                | Writer                          |
//! |----------------------|---------------------------------|
//! | slot `state`         | admission (reserve, free), sender (activate) |
//! | slot `small`         | sender (cleared by admission)   |
//! | slot `bytes`, `measured` | sender                      |
//! | slot `target`        | allocator                       |
//! | slot `chunk_size`    | admission                       |
//! | `virtual_link_cap`   | monitor                         |
//! | flow counters        | allocator                       |
//! | `next_slot`          | admission                       |
//! | rebalance flag       | admission sets, allocator consumes |

mod ports;
mod shm;

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use super::config::Config;
use super::error::{PacerError, PacerResult};

pub use ports::{AdmissionPort, AllocatorPort, FlowPort, MonitorPort};

const RELAXED: Ordering = Ordering::Relaxed;

// Slot states, stored where external readers expect the `active` byte
pub(crate) const SLOT_FREE: u8 = 0;
pub(crate) const SLOT_ACTIVE: u8 = 1;
pub(crate) const SLOT_RESERVED: u8 = 2;

pub(crate) const NO_SLOT: u32 = u32::MAX;

/// One flow table entry. All-zero bytes are a valid (free) slot, so the table may live in freshly
/// truncated shared memory.
#[repr(C)]
#[derive(Default)]
pub(crate) struct FlowSlot {
    pub(crate) bytes: AtomicU64,
    pub(crate) measured: AtomicU32,
    pub(crate) target: AtomicU32,
    pub(crate) chunk_size: AtomicU32,
    pub(crate) state: AtomicU8,
    pub(crate) small: AtomicU8,
}

/// Point-in-time copy of one flow table entry. Fields are loaded one at a time, so a snapshot
/// taken during a sweep may mix values from before and after it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowInfo {
    pub active: bool,
    pub reserved: bool,
    pub small: bool,
    pub bytes: u64,
    pub measured: u32,
    pub target: u32,
    pub chunk_size: u32,
}

enum FlowTable {
    Heap(Box<[FlowSlot]>),
    Shared(shm::SharedRegion),
}

impl FlowTable {
    fn slots(&self) -> &[FlowSlot] {
        match self {
            Self::Heap(slots) => slots,
            Self::Shared(region) => region.slots(),
        }
    }
}

pub struct ControlBlock {
    // Per-flow table, possibly shared with sender processes
    flows: FlowTable,
    // Budget shared by all elephants
    pub(crate) virtual_link_cap: AtomicU32,
    // Chunk size copied into newly admitted flows
    pub(crate) active_chunk_size: AtomicU32,
    // Next admission candidate, NO_SLOT when the table was full at last search
    pub(crate) next_slot: AtomicU32,
    // Published once per allocator sweep
    pub(crate) num_active_big_flows: AtomicU16,
    pub(crate) num_active_small_flows: AtomicU16,
    pub(crate) num_saturated: AtomicU16,
    // One-shot request for an equal split
    pub(crate) rebalance: AtomicBool,
    // Floor for multiplicative decrease
    min_link_cap: u32,
    // Single-writer roles already handed out
    allocator_claimed: AtomicBool,
    admission_claimed: AtomicBool,
    monitor_claimed: AtomicBool,
}

impl ControlBlock {
    /// Creates a control block whose flow table lives on the heap.
    pub fn new(config: &Config) -> PacerResult<Arc<Self>> {
        config.validate()?;

        let slots = (0..config.max_flows)
            .map(|_| FlowSlot::default())
            .collect::<Vec<_>>();

        Ok(Self::with_table(FlowTable::Heap(slots.into_boxed_slice()), config))
    }

    /// Creates a control block whose flow table lives in the named shared memory region, so that
    /// sender processes can map it.
    pub fn create_shared(config: &Config) -> PacerResult<Arc<Self>> {
        config.validate()?;

        let region = shm::SharedRegion::create(&config.shm_name, config.max_flows)?;

        Ok(Self::with_table(FlowTable::Shared(region), config))
    }

    fn with_table(flows: FlowTable, config: &Config) -> Arc<Self> {
        for slot in flows.slots() {
            slot.target.store(config.line_rate_mb, RELAXED);
            slot.state.store(SLOT_FREE, RELAXED);
            slot.small.store(0, RELAXED);
            slot.bytes.store(0, RELAXED);
            slot.measured.store(0, RELAXED);
        }

        Arc::new(Self {
            flows,
            virtual_link_cap: AtomicU32::new(config.line_rate_mb),
            active_chunk_size: AtomicU32::new(config.default_chunk_size),
            next_slot: AtomicU32::new(0),
            num_active_big_flows: AtomicU16::new(0),
            num_active_small_flows: AtomicU16::new(0),
            num_saturated: AtomicU16::new(0),
            rebalance: AtomicBool::new(false),
            min_link_cap: config.min_link_cap_mb,
            allocator_claimed: AtomicBool::new(false),
            admission_claimed: AtomicBool::new(false),
            monitor_claimed: AtomicBool::new(false),
        })
    }

    /// Removes the shared memory name, if the table is shared. Existing mappings stay valid.
    pub fn unlink_shared(&self) -> PacerResult<()> {
        match &self.flows {
            FlowTable::Heap(_) => Ok(()),
            FlowTable::Shared(region) => region.unlink(),
        }
    }

    fn claim(flag: &AtomicBool, role: &'static str) -> PacerResult<()> {
        flag.compare_exchange(false, true, RELAXED, RELAXED)
            .map(|_| ())
            .map_err(|_| PacerError::RoleClaimed { role })
    }

    pub fn allocator_port(self: &Arc<Self>) -> PacerResult<AllocatorPort> {
        Self::claim(&self.allocator_claimed, "allocator")?;
        Ok(AllocatorPort::new(Arc::clone(self)))
    }

    pub fn admission_port(self: &Arc<Self>) -> PacerResult<AdmissionPort> {
        Self::claim(&self.admission_claimed, "admission")?;
        Ok(AdmissionPort::new(Arc::clone(self)))
    }

    pub fn monitor_port(self: &Arc<Self>) -> PacerResult<MonitorPort> {
        Self::claim(&self.monitor_claimed, "monitor")?;
        Ok(MonitorPort::new(Arc::clone(self), self.min_link_cap))
    }

    /// Handle for the send path of the flow admitted at `slot`.
    pub fn flow_port(self: &Arc<Self>, slot: u16) -> PacerResult<FlowPort> {
        self.slot(slot as usize)?;
        Ok(FlowPort::new(Arc::clone(self), slot))
    }

    pub(crate) fn slots(&self) -> &[FlowSlot] {
        self.flows.slots()
    }

    pub(crate) fn slot(&self, slot: usize) -> PacerResult<&FlowSlot> {
        self.slots().get(slot).ok_or(PacerError::InvalidSlot {
            slot,
            max_flows: self.max_flows(),
        })
    }

    pub fn max_flows(&self) -> usize {
        self.slots().len()
    }

    pub fn flow(&self, slot: usize) -> Option<FlowInfo> {
        self.slots().get(slot).map(|entry| {
            let state = entry.state.load(RELAXED);
            FlowInfo {
                active: state == SLOT_ACTIVE,
                reserved: state == SLOT_RESERVED,
                small: entry.small.load(RELAXED) != 0,
                bytes: entry.bytes.load(RELAXED),
                measured: entry.measured.load(RELAXED),
                target: entry.target.load(RELAXED),
                chunk_size: entry.chunk_size.load(RELAXED),
            }
        })
    }

    pub fn virtual_link_cap(&self) -> u32 {
        self.virtual_link_cap.load(RELAXED)
    }

    pub fn active_chunk_size(&self) -> u32 {
        self.active_chunk_size.load(RELAXED)
    }

    pub fn num_active_big_flows(&self) -> u16 {
        self.num_active_big_flows.load(RELAXED)
    }

    pub fn num_active_small_flows(&self) -> u16 {
        self.num_active_small_flows.load(RELAXED)
    }

    pub fn num_saturated(&self) -> u16 {
        self.num_saturated.load(RELAXED)
    }

    pub fn rebalance_pending(&self) -> bool {
        self.rebalance.load(RELAXED)
    }
}
