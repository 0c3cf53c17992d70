//! Domain types shared by every podflow crate.
//!
//! This crate has zero internal dependencies: job and request models,
//! the error taxonomy for external calls, artifact types exchanged with
//! collaborators, and small hashing helpers.

pub mod artifacts;
pub mod circuit;
pub mod error;
pub mod hashing;
pub mod job;
pub mod request;
pub mod types;
