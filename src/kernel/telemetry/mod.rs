//! Status reporting: heartbeat log lines and the metrics textfile.
//!
//! # SAFETY INVARIANT
//! Telemetry is a READ-ONLY side-effect layer.
//! It consumes `StatusSnapshot`s published by the reactor and must **NEVER**
//! feed anything back into detection or dispatch.

pub mod metrics;
pub mod reporter;
