//! # saltpeter
//!
//! Distributed cron scheduler. Jobs are declared in a directory of YAML
//! files; each firing is fanned out to a set of machines through a
//! remote-execution bus, and every target is observed live over a
//! persistent websocket channel the on-target agent opens back to the
//! scheduler: connect → start → sequenced output → heartbeat → complete,
//! with acks, retransmission and server-initiated kill.
//!
//! ## Modules
//!
//! - [`config`] — YAML config loading, maintenance merging, hot reload
//! - [`schedule`] — cron-style firing time computation
//! - [`state`] — process-wide store: per-job state, running instances,
//!   command queue
//! - [`scheduler`] — the 1 Hz firing loop
//! - [`dispatch`] — target resolution and the two-phase launch
//! - [`monitor`] — per-instance heartbeat and timeout enforcement
//! - [`server`] — agent channel server and external HTTP API
//! - [`agent`] — the on-target agent
//! - [`bus`] — remote-execution bus interface (Salt CLI implementation)
//! - [`protocol`] — the channel wire messages

pub mod agent;
pub mod bus;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod joblog;
pub mod logging;
pub mod monitor;
pub mod protocol;
pub mod schedule;
pub mod scheduler;
pub mod server;
pub mod state;
