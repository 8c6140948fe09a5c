//! Container sandbox management for sagelab jobs.
//!
//! Provides the lifecycle manager for the Docker-based execution
//! sandbox (create / start / readiness probe / stop), a port allocator
//! for resolving host-port conflicts, a thin wrapper around the
//! `docker` CLI, and the line-delimited TCP [`channel::CommandChannel`]
//! used to talk to the companion command server inside the sandbox.

pub mod bootstrap;
pub mod channel;
pub mod cli;
pub mod config;
pub mod lifecycle;
pub mod ports;
