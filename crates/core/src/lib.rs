//! Shared domain types for the sagelab job platform.
//!
//! This crate holds the job record model, its status state machine, and
//! the payload/mode types. It has no internal dependencies so that the
//! sandbox and scheduler crates (and any future API layer) can all
//! depend on it without cycles.

pub mod job;
pub mod payload;
pub mod types;
