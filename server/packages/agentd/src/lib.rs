//! Agent session and tool-orchestration engine.

pub mod approval;
pub mod backend;
pub mod cli;
pub mod config;
pub mod mcp;
pub mod orchestrator;
pub mod router;
pub mod sandbox;
pub mod session;
pub mod store;
pub mod tools;
