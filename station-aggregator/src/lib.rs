//! Station reading aggregator.
//!
//! Independent station producers publish readings to a single aggregation
//! point over a small line-oriented protocol; readers fetch either a specific
//! station's latest reading or the most recently active one.
//!
//! # Architecture
//!
//! - **Aggregator** ([`server`]): accepts TCP connections and hands each one to a
//!   bounded pool of session tasks. Every session runs the [`session`] state
//!   machine against a shared [`server::ServerContext`].
//! - **Shared state**: a Lamport [`clock`], the liveness [`registry`], and the
//!   on-disk [`store`] of latest payloads.
//! - **Sweeper** ([`sweeper`]): periodically evicts stations that stopped
//!   contacting the aggregator.
//! - **Clients**: the [`producer`] publishes a source file, re-publishes on
//!   change and heartbeats; [`query`] performs one-shot reads. Both go through
//!   [`transport`] for connect/retry.
//!
//! The [`payload`] module holds the text helpers the core treats as external
//! collaborators (flattening `key: value` sources, extracting the `id` field).

pub mod cli;
pub mod clock;
pub mod config;
pub mod payload;
pub mod producer;
pub mod protocol;
pub mod query;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;
pub mod sweeper;
pub mod transport;
