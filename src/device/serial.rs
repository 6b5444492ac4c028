//! Serial port backend for the GMC driver.
//!
//! GMC counters enumerate as a CH340 USB serial adapter and talk 8N1,
//! 115200 baud on current firmware (57600 on older GMC-300 units).

use super::{Connector, DeviceError, Link};
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use std::io;
use std::time::Duration;

impl Link for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Opens the configured serial port with a bounded read timeout.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialConnector {
    /// # Arguments
    /// * `port` - Device path, e.g. `/dev/ttyUSB0` or `COM3`
    /// * `baud_rate` - Line speed configured on the counter
    /// * `timeout` - Upper bound for a single read
    pub fn new(port: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout,
        }
    }
}

impl Connector for SerialConnector {
    type Link = Box<dyn SerialPort>;

    fn endpoint(&self) -> &str {
        &self.port
    }

    fn connect(&self) -> Result<Self::Link, DeviceError> {
        serialport::new(&self.port, self.baud_rate)
            .timeout(self.timeout)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .open()
            .map_err(|err| DeviceError::Open {
                port: self.port.clone(),
                source: err.into(),
            })
    }
}
