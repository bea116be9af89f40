//! Flow admission over a local stream socket.
//!
//! A sender connects, writes one 8-byte request and reads back one reply:
//!
//! | request    | reply                                  |
//! |------------|----------------------------------------|
//! | `join`     | decimal slot index, or `ERR FULL`      |
//! | `quit NNN` | `ok`, or `ERR SLOT`                    |
//! | `read`     | `ERR PEER` (answered by the remote pacer) |
//! | other      | `ERR CMD`                              |
//!
//! A joined slot is reserved until the sender's first send activates it through its
//! [`FlowPort`](crate::control::FlowPort).

pub mod client;
mod listener;
mod protocol;
mod server;

pub use protocol::{Reply, Request, MSG_LEN};
pub use server::AdmissionServer;
