//! gantry-core: Core types for the gantry control plane
//!
//! This crate provides the fundamental types used throughout gantry:
//! - Sessions, interactions and their lifecycle
//! - The model catalog
//! - Runner filters, task responses and state reports
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod filter;
pub mod model;
pub mod runner;
pub mod session;
pub mod units;
pub mod worker;

pub use config::*;
pub use error::*;
pub use filter::*;
pub use model::*;
pub use runner::*;
pub use session::*;
pub use units::*;
pub use worker::*;
