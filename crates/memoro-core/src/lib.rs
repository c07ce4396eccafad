// Memoro core engine — offline-tolerant task sync, real-time event
// distribution, resilient RPC, and the multi-provider AI router.
//
// Component graph (strict DAG): the event bus is a leaf; the hub and push
// registry subscribe to it; the sync engine and AI router publish to it.
// Nothing calls back into the sync engine. Every component takes its
// configuration at construction; there is no process-wide state.

pub mod ai;
pub mod bus;
pub mod checksum;
pub mod config;
pub mod context;
pub mod error;
pub mod hub;
pub mod push;
pub mod remote;
pub mod rpc;
pub mod store;
pub mod sync;
pub mod types;

pub use context::{CancelHandle, Ctx};
pub use error::{Error, Result};
