//! Local port lease daemon: hands out TCP ports to named services, tracks the
//! owning process, and reclaims ports when leases expire or owners die.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod liveness;
pub mod probe;
pub mod reservation;
pub mod store;
pub mod sweeper;
