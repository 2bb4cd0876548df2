//! REST API module for health checks, metrics and read-only Database summaries

mod dto;
mod handlers;
mod server;

pub use server::{router, run_server, ApiState};
