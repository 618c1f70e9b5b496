//! # MeetSync Server Library
//!
//! HTTP host for the job runtime: health probes, Prometheus metrics and
//! the queue administration API.

pub mod controllers;
pub mod middleware;
pub mod responses;
pub mod router;
pub mod startup;
pub mod state;
pub mod telemetry;

pub use router::create_router;
pub use state::AppState;
