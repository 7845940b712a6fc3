//! gantry-scheduler: Session dispatch for gantry
//!
//! This crate provides the scheduling core:
//! - Filter-driven session matching with adapter affinity
//! - The session queue with single-delivery takes
//! - Local model instance pool and capacity accounting
//! - The controller façade used by the transport

pub mod capacity;
pub mod controller;
pub mod locks;
pub mod matcher;
pub mod pool;
pub mod queue;

pub use capacity::MemoryAllocator;
pub use controller::Controller;
pub use locks::SessionLocks;
pub use matcher::{accepts_bound, matches, AffinityMatchStrategy, MatchStrategy};
pub use pool::{InstanceFactory, ModelInstancePool, PoolConfig, ReconcileReport, RunnerInstanceFactory};
pub use queue::{QueueTake, SessionQueue};
