//! Frontdoor - a supervised reverse proxy for a single backend server
//!
//! This library provides a front door that:
//! - Launches the backend server as a child process and owns its lifecycle
//! - Polls the backend until it accepts connections, then marks it ready
//! - Forwards HTTP requests to the backend with a bounded timeout
//! - Answers with a JSON `503` whenever the backend is not ready
//! - Detects backend crashes and optionally restarts the process
//! - Drains open connections before stopping the backend on shutdown

pub mod admin;
pub mod config;
pub mod error;
pub mod pool;
pub mod process;
pub mod proxy;
