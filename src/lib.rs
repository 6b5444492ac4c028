//! `gmc-logger` library.
//!
//! The binary (`src/main.rs`) is responsible for logging setup and process exit codes.
//! The device protocol lives in [`crate::device`], the poll loop in
//! [`crate::poller`] and the sinks in [`crate::output`]; [`crate::app`] wires
//! them together and can be tested with an injected fake device.

pub mod app;
pub mod device;
pub mod duration;
pub mod output;
pub mod poller;
pub mod reading;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use device::{
    Command, Connector, DeviceError, DeviceState, GmcDriver, Link, ProtocolError, decode_cpm,
    decode_temperature, decode_version,
};
pub use duration::parse_duration;
pub use output::influxdb::{DataPoint, data_points};
pub use output::{PublishError, Publisher};
pub use poller::{PollError, Poller, sample};
pub use reading::Reading;
