//! # tetherproxy-server
//!
//! Daemon library for tetherproxy: the CONNECT relay, shared state, the run
//! loop, and the HTTP API that reports proxy and client state.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod daemon;
pub mod logging;
pub mod relay;
pub mod state;
