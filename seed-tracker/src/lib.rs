//! Seed tracker: registers peers and the files they serve, answers lookups, records completed downloads.

pub mod config;
pub mod server;
pub mod session;

pub use config::{ConfigError, TrackerConfig};
pub use server::Tracker;
pub use session::{run_session, SessionLimits, SharedRegistry};
