//! gantry-store: Session persistence
//!
//! This crate provides the storage contract the control plane relies on:
//! - The `Store` trait
//! - An in-memory store
//! - A JSON file store

pub mod file;
pub mod memory;
pub mod store;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::{GetSessionsQuery, Store};
