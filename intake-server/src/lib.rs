//! # Intake Server
//!
//! Library half of the `intaked` daemon: builds processing capabilities and
//! availability policy from a loaded [`intake_config::Config`] and serves the
//! read-only status routes.

pub mod capabilities;
pub mod routes;

pub use capabilities::{build_checker, build_table, runtime_config};
pub use routes::{AppState, create_router, spawn_status_server};
