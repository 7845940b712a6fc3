//! gantry-api: REST API server for gantry
//!
//! This crate exposes the controller over HTTP:
//! - Session management for clients
//! - Poll, result and state endpoints for runners
//! - Task pulls for local workers
//! - Instance, dashboard and status views

pub mod error;
pub mod rest;

pub use error::{ApiError, ApiResult};
pub use rest::{create_router, Caller, OWNER_HEADER, OWNER_TYPE_HEADER};
