//! Hardware edges of the monitor: digital inputs and the printer's serial
//! port. Everything here produces or consumes `kernel::event::Event`.

pub mod gpio;
pub mod serial;
pub mod sources;
