//! gantry-runtime: Worker runtime and model instance lifecycle
//!
//! This crate provides:
//! - The `Runtime` abstraction over worker processes, with a process-based implementation
//! - The `ModelInstance` state machine that binds a worker to one model, mode and adapter

pub mod instance;
pub mod process;
pub mod traits;

pub use instance::{DoneSignal, InstanceSpec, ModelInstance, RunnerModelInstance};
pub use process::{ProcessRuntime, ProcessRuntimeConfig};
pub use traits::Runtime;
