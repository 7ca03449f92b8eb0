//! Fleetward - phased configuration rollout for managed node fleets
//!
//! Fleetward rolls configuration out to groups of managed compute nodes and
//! keeps the shared broker credentials those nodes use alive until no node
//! depends on them any more. It provides:
//!
//! - Rollout requests driven through per-service jobs with retry and backoff
//! - Per-node tracking of which credential material each node received
//! - Guard markers that block deletion of credentials still in use
//! - Change fingerprints so unchanged work is never re-run
//! - A level-triggered reconcile loop over an in-memory record store

pub mod config;
pub mod controller;
pub mod error;
pub mod fingerprint;
pub mod fleet;
pub mod guard;
pub mod inventory;
pub mod job;
pub mod manifest;
pub mod nodegroup;
pub mod rollout;
pub mod store;
pub mod tracking;

#[cfg(test)]
mod testing;

pub use error::{FleetError, Result};
