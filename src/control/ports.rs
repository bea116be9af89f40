use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{ControlBlock, FlowSlot, NO_SLOT, SLOT_ACTIVE, SLOT_FREE, SLOT_RESERVED};
use crate::error::{PacerError, PacerResult};

const RELAXED: Ordering = Ordering::Relaxed;

/// Read-only view of one slot, as the allocator sees it during a sweep.
#[derive(Clone, Copy, Debug)]
pub struct SlotView {
    pub active: bool,
    pub small: bool,
    pub measured: u32,
    pub target: u32,
}

/// Allocator role: owns `target` and the per-sweep counters, consumes the rebalance flag.
pub struct AllocatorPort {
    cb: Arc<ControlBlock>,
}

impl AllocatorPort {
    pub(super) fn new(cb: Arc<ControlBlock>) -> Self {
        Self { cb }
    }

    pub fn max_flows(&self) -> usize {
        self.cb.max_flows()
    }

    pub fn view(&self, slot: usize) -> SlotView {
        let entry = &self.cb.slots()[slot];
        SlotView {
            active: entry.state.load(RELAXED) == SLOT_ACTIVE,
            small: entry.small.load(RELAXED) != 0,
            measured: entry.measured.load(RELAXED),
            target: entry.target.load(RELAXED),
        }
    }

    pub fn set_target(&self, slot: usize, target: u32) {
        self.cb.slots()[slot].target.store(target, RELAXED);
    }

    pub fn add_target(&self, slot: usize, amount: u32) {
        let target = &self.cb.slots()[slot].target;
        let _ = target.fetch_update(RELAXED, RELAXED, |t| Some(t.saturating_add(amount)));
    }

    pub fn publish_counts(&self, big: u16, small: u16, saturated: u16) {
        self.cb.num_active_big_flows.store(big, RELAXED);
        self.cb.num_active_small_flows.store(small, RELAXED);
        self.cb.num_saturated.store(saturated, RELAXED);
    }

    /// Consumes a pending rebalance request. Requests raised before this call collapse into one.
    pub fn take_rebalance(&self) -> bool {
        self.cb
            .rebalance
            .compare_exchange(true, false, RELAXED, RELAXED)
            .is_ok()
    }

    pub fn virtual_link_cap(&self) -> u32 {
        self.cb.virtual_link_cap()
    }
}

/// Latency monitor role: owns `virtual_link_cap`, reads the flow counters.
pub struct MonitorPort {
    cb: Arc<ControlBlock>,
    min_link_cap: u32,
}

impl MonitorPort {
    pub(super) fn new(cb: Arc<ControlBlock>, min_link_cap: u32) -> Self {
        Self { cb, min_link_cap }
    }

    /// Elephant and mouse counts from the last allocator sweep.
    pub fn active_flow_counts(&self) -> (u16, u16) {
        (
            self.cb.num_active_big_flows.load(RELAXED),
            self.cb.num_active_small_flows.load(RELAXED),
        )
    }

    pub fn virtual_link_cap(&self) -> u32 {
        self.cb.virtual_link_cap()
    }

    /// Halves the cap, stopping at the configured floor. Returns the old and new cap.
    pub fn halve_link_cap(&self) -> (u32, u32) {
        let floor = self.min_link_cap;
        let old = self
            .cb
            .virtual_link_cap
            .fetch_update(RELAXED, RELAXED, |cap| Some((cap / 2).max(floor.min(cap))))
            .unwrap_or_else(|cap| cap);
        (old, (old / 2).max(floor.min(old)))
    }

    /// Adds `step` to the cap. Returns the old and new cap.
    pub fn increase_link_cap(&self, step: u32) -> (u32, u32) {
        let old = self
            .cb
            .virtual_link_cap
            .fetch_update(RELAXED, RELAXED, |cap| Some(cap.saturating_add(step)))
            .unwrap_or_else(|cap| cap);
        (old, old.saturating_add(step))
    }
}

/// Admission role: reserves and frees slots, raises the rebalance flag.
pub struct AdmissionPort {
    cb: Arc<ControlBlock>,
}

impl AdmissionPort {
    pub(super) fn new(cb: Arc<ControlBlock>) -> Self {
        Self { cb }
    }

    fn is_free(entry: &FlowSlot) -> bool {
        entry.state.load(RELAXED) == SLOT_FREE
    }

    // Linear search from `from`, wrapping once around the table
    fn find_free(&self, from: usize) -> Option<usize> {
        let slots = self.cb.slots();
        let n = slots.len();

        (0..n)
            .map(|k| (from + k) % n)
            .find(|&i| Self::is_free(&slots[i]))
    }

    /// Current admission candidate, if the table had room at the last search.
    pub fn next_slot(&self) -> Option<u16> {
        match self.cb.next_slot.load(RELAXED) {
            NO_SLOT => None,
            slot => Some(slot as u16),
        }
    }

    /// Reserves a slot for a new flow. The slot becomes active on the flow's first send.
    pub fn join(&mut self) -> PacerResult<u16> {
        let candidate = match self.cb.next_slot.load(RELAXED) {
            NO_SLOT => 0,
            slot => slot as usize,
        };

        // The candidate is re-checked, a departure may have freed an earlier slot or the table
        // may have filled since the last search
        let slot = self.find_free(candidate).ok_or(PacerError::CapacityExceeded {
            max_flows: self.cb.max_flows(),
        })?;

        let entry = &self.cb.slots()[slot];
        entry.small.store(0, RELAXED);
        entry
            .chunk_size
            .store(self.cb.active_chunk_size.load(RELAXED), RELAXED);
        entry.state.store(SLOT_RESERVED, RELAXED);

        let next = self
            .find_free((slot + 1) % self.cb.max_flows())
            .map_or(NO_SLOT, |next| next as u32);
        self.cb.next_slot.store(next, RELAXED);

        // Membership changed, ask for an equal split
        self.cb.rebalance.store(true, RELAXED);

        Ok(slot as u16)
    }

    /// Frees a reserved or active slot.
    pub fn quit(&mut self, slot: u16) -> PacerResult<()> {
        let entry = self.cb.slot(slot as usize)?;

        if Self::is_free(entry) {
            return Err(PacerError::InvalidSlot {
                slot: slot as usize,
                max_flows: self.cb.max_flows(),
            });
        }

        entry.state.store(SLOT_FREE, RELAXED);
        entry.small.store(0, RELAXED);

        if self.cb.next_slot.load(RELAXED) == NO_SLOT {
            self.cb.next_slot.store(slot as u32, RELAXED);
        }

        self.cb.rebalance.store(true, RELAXED);

        Ok(())
    }
}

/// Send path role for one admitted flow: owns `bytes`, `measured` and the flow class.
pub struct FlowPort {
    cb: Arc<ControlBlock>,
    slot: u16,
}

impl FlowPort {
    pub(super) fn new(cb: Arc<ControlBlock>, slot: u16) -> Self {
        Self { cb, slot }
    }

    fn entry(&self) -> &FlowSlot {
        &self.cb.slots()[self.slot as usize]
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }

    /// Marks a reserved slot active. Returns false if the slot was never admitted.
    ///
    /// A fresh activation drops the rate sample left by the slot's previous flow.
    pub fn activate(&self) -> bool {
        let entry = self.entry();
        match entry
            .state
            .compare_exchange(SLOT_RESERVED, SLOT_ACTIVE, RELAXED, RELAXED)
        {
            Ok(_) => {
                entry.measured.store(0, RELAXED);
                true
            }
            Err(state) => state == SLOT_ACTIVE,
        }
    }

    pub fn set_small(&self, small: bool) {
        self.entry().small.store(small as u8, RELAXED);
    }

    pub fn record_sample(&self, measured: u32) {
        self.entry().measured.store(measured, RELAXED);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.entry().bytes.fetch_add(bytes, RELAXED);
    }

    pub fn target(&self) -> u32 {
        self.entry().target.load(RELAXED)
    }

    pub fn chunk_size(&self) -> u32 {
        self.entry().chunk_size.load(RELAXED)
    }
}
