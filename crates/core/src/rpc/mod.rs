//! The coordination endpoint between a worker and its spawned processes.
//!
//! A spawned fetch process must observe the same fences, rows, queues and
//! batches as the worker that spawned it. The worker serves its backing
//! stores over a line-delimited JSON protocol on a local TCP endpoint, and
//! the child connects with a [`Client`] which implements the same traits
//! the worker's own backends do. The endpoint is unauthenticated and meant
//! for loopback use only; deployments with networked shared stores connect
//! those directly instead.

mod client;
mod msg;
mod server;

pub use client::Client;
pub use server::Server;
