pub mod config;
pub mod error;
pub mod io;
pub mod kernel;

// Re-export specific items for convenient access
pub use config::MonitorConfig;
pub use error::MonitorError;
pub use kernel::reactor::Reactor;
