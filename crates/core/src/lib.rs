//! Trawler core: a distributed indexing pipeline orchestrator.
//!
//! Cooperating background workers decide when each connector-credential pair
//! should be indexed, fence the attempt in a shared key-value store, spawn
//! and supervise an out-of-process document fetcher, and fan per-batch
//! processing out across a worker pool. The fence protocol gives at-most-one
//! active attempt per `(cc_pair, search_settings)` composite; heartbeat
//! leases are the liveness signal, and a single-assignment completion marker
//! coordinates the fetcher, the processors, the watchdog and the monitor
//! without shared memory.

#[macro_use]
extern crate tracing;

#[macro_use]
mod mac;

pub mod batch;
pub mod cnf;
pub mod db;
pub mod err;
pub mod fence;
pub mod job;
pub mod kvs;
pub mod obs;
pub mod options;
pub mod pipeline;
pub mod queue;
pub mod rpc;
pub mod tasks;

pub use err::Error;
pub use options::EngineOptions;
pub use tasks::Orchestrator;
