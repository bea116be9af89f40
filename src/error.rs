//! Pacer error types.

use std::io;

/// Pacer error type.
#[derive(Debug, thiserror::Error)]
pub enum PacerError {
    /// Sketch construction parameters out of range.
    #[error("invalid sketch parameters: {message}")]
    InvalidSketch {
        /// Error message.
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },

    /// Every slot of the flow table is active or reserved.
    #[error("flow table full: all {max_flows} slots are in use")]
    CapacityExceeded {
        /// Size of the flow table.
        max_flows: usize,
    },

    /// Slot index outside of the flow table.
    #[error("slot {slot} out of range (max flows {max_flows})")]
    InvalidSlot {
        /// The slot index.
        slot: usize,
        /// Size of the flow table.
        max_flows: usize,
    },

    /// A single-writer role was requested twice.
    #[error("{role} role already claimed")]
    RoleClaimed {
        /// Name of the role.
        role: &'static str,
    },

    /// Shared memory region could not be created or mapped.
    #[error("shared memory {op} failed for {name}: {source}")]
    SharedMemory {
        /// The failed operation.
        op: &'static str,
        /// Region name.
        name: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Admission endpoint I/O failure.
    #[error("admission endpoint: {0}")]
    Admission(#[source] io::Error),

    /// Admission message could not be parsed.
    #[error("malformed admission message: {message}")]
    Protocol {
        /// Error message.
        message: String,
    },

    /// Probe channel I/O failure.
    #[error("probe channel: {0}")]
    Probe(#[source] io::Error),
}

/// Result type for pacer operations.
pub type PacerResult<T> = Result<T, PacerError>;
