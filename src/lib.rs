//! Atlas - configuration management database with a relational store of
//! record synchronized into a graph projection.
//!
//! The crate's core is the cross-store synchronization pipeline: change
//! capture at the relational store, a durable event queue with a Redis
//! mirror, a worker pool applying idempotent merges to the graph store,
//! conflict detection and resolution, health monitoring, and fallback
//! strategies for persistent failures.

pub mod config;
pub mod error;
pub mod services;
pub mod types;

pub use config::Config;
pub use error::{Result, SyncError};
pub use services::{CmdbRuntime, CmdbService, WriteRequest, WriteResponse};
