//! Core library for a distributed DAG task executor: the DAG and resource
//! models, wire protocol and transport, coordinator event loop, FD cache,
//! workflow-event listeners, and the independent shared-memory task
//! cluster. The three CLI binaries in `wrangler-cli` are thin wrappers over
//! this crate.

pub mod cluster;
pub mod coordinator;
pub mod dag;
pub mod engine;
pub mod fdcache;
pub mod listeners;
pub mod protocol;
pub mod resource;
pub mod transport;
