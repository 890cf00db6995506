//! shellgate: approval-gated shell sessions over HTTP and WebSocket
//!
//! The binary wires the policy, execution backend and session registry
//! together and exposes them through the management API and the stream
//! multiplexer.

pub mod app;
pub mod cli;
pub mod config;
pub mod logging;
pub mod web;

pub use cli::{Cli, Commands};
pub use config::ShellgateConfig;
