//! Detection kernel. Pure state and decisions; the only async code is the
//! reactor's driver loop.

pub mod activity;
pub mod classifier;
pub mod dispatch;
pub mod event;
pub mod machine;
pub mod reactor;
pub mod reset;
pub mod state;
pub mod telemetry;
pub mod time;
