//! algo-runner library
//!
//! This crate provides the core functionality for the algo-runner service:
//! - Configuration loading with environment overrides
//! - Per-request scratch workspaces
//! - Docker sandbox and local fallback backends behind one trait
//! - The orchestrator that picks a backend and normalizes results
//! - HTTP and MCP surfaces, plus the run reporter

pub mod backend;
pub mod config;
pub mod error;
pub mod http;
pub mod identity;
pub mod mcp;
pub mod orchestrator;
pub mod report;
pub mod types;
pub mod workspace;
