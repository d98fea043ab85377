//! ergon - terminal agent execution core
//!
//! The pieces, leaves first: an immutable tool registry, a sandboxed tool
//! executor backed by a TTL read cache and a background process manager, a
//! protocol-tolerant tool-call parser, a permission gate, a retrying model
//! client, the per-task agent loop, and an orchestrator that fans a task
//! out across parallel panes.

pub mod agent;
pub mod cache;
pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod parser;
pub mod permissions;
pub mod process;
pub mod prompt;
pub mod registry;
pub mod session;
pub mod tools;
