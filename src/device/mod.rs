//! Driver for GQ GMC Geiger counters.
//!
//! The driver speaks the request/response half of the GQ-RFC1201 protocol:
//! it writes an ASCII command frame and reads back a fixed number of raw
//! bytes. There is no framing on the wire, so a stray byte desynchronizes
//! every later exchange. Call [`GmcDriver::flush_bus`] before a batch of
//! fetches to start from a clean buffer.
//!
//! A single link is owned at a time behind a mutex, which makes every
//! command/response exchange atomic. A failed fetch drops the link; the caller
//! decides when to [`GmcDriver::reconnect`].

#[cfg(feature = "serial")]
pub mod serial;

mod commands;

pub use commands::Command;

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

/// The device answered, but not with what the protocol promises.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The read timed out before the full response arrived
    #[error("short {command} response: expected {expected} bytes")]
    ShortResponse { command: Command, expected: usize },
    /// The response arrived but could not be decoded
    #[error("malformed {command} response: {reason}")]
    Malformed { command: Command, reason: String },
    /// Writing `<HEARTBEAT0>>` or discarding its leftovers failed
    #[error("failed to disable heartbeat: {0}")]
    Heartbeat(#[source] io::Error),
}

/// Error type for device operations.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The serial port could not be opened
    #[error("unable to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: io::Error,
    },
    /// I/O failure on an open link
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// No link is open; call `open` or `reconnect` first
    #[error("device is not connected")]
    NotConnected,
}

/// Observable connection state of a [`GmcDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Open,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Closed => write!(f, "closed"),
            DeviceState::Open => write!(f, "open"),
        }
    }
}

/// A byte-oriented duplex connection to the device.
///
/// Reads must be bounded by a timeout. Responses are not delimited, so a read
/// that blocks forever would hang the poller.
pub trait Link: Read + Write + Send {
    /// Drop bytes that were received but not read yet.
    fn discard_input(&mut self) -> io::Result<()>;
}

/// Opens fresh [`Link`]s. The driver calls it on every (re)connect.
pub trait Connector: Send + Sync {
    type Link: Link;

    /// Name of the endpoint, for logs.
    fn endpoint(&self) -> &str;

    fn connect(&self) -> Result<Self::Link, DeviceError>;
}

/// Decode a `GETCPM` response.
pub fn decode_cpm(response: [u8; 2]) -> u16 {
    u16::from_be_bytes(response)
}

/// Decode a `GETTEMP` response.
///
/// Byte 0 is the integer part, byte 1 the fraction, byte 2 the sign flag and
/// byte 3 is unused. The fraction byte is written out as decimal digits after
/// the point, so `5` and `50` both read as `.5` while `15` reads as `.15`.
pub fn decode_temperature(response: [u8; 4]) -> Result<f64, ProtocolError> {
    let [integer, fraction, sign, _] = response;
    let value: f64 = format!("{integer}.{fraction}")
        .parse()
        .map_err(|err: std::num::ParseFloatError| ProtocolError::Malformed {
            command: Command::GetTemp,
            reason: err.to_string(),
        })?;
    Ok(if sign != 0 { -value } else { value })
}

/// Decode a `GETVER` response, keeping any NUL or space padding.
///
/// Each byte maps to the char with the same code point (Latin-1), so every
/// response decodes and the original bytes can be recovered.
pub fn decode_version(response: [u8; 14]) -> String {
    response.iter().copied().map(char::from).collect()
}

/// GMC Geiger counter driver.
///
/// All methods take `&self`; the link lives behind a mutex so the driver can
/// be shared with blocking worker threads.
pub struct GmcDriver<C: Connector> {
    connector: C,
    link: Mutex<Option<C::Link>>,
}

impl<C: Connector> GmcDriver<C> {
    /// Create a driver in the [`DeviceState::Closed`] state.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            link: Mutex::new(None),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn state(&self) -> DeviceState {
        if self.lock().is_some() {
            DeviceState::Open
        } else {
            DeviceState::Closed
        }
    }

    /// Open the link and switch the device to polling mode.
    ///
    /// A link that is already open is dropped first. When disabling the
    /// heartbeat fails the new link stays open and the error is returned.
    ///
    /// # Errors
    /// `DeviceError::Open` if the port cannot be opened,
    /// `DeviceError::Protocol` if the heartbeat cannot be disabled.
    pub fn open(&self) -> Result<(), DeviceError> {
        let mut guard = self.lock();
        if guard.take().is_some() {
            debug!(endpoint = self.connector.endpoint(), "dropped previous connection");
        }

        let link = guard.insert(self.connector.connect()?);
        debug!(endpoint = self.connector.endpoint(), "device connected");

        disable_heartbeat(link)
    }

    /// Drop the link. Does nothing when already closed.
    pub fn close(&self) {
        if self.lock().take().is_some() {
            debug!(endpoint = self.connector.endpoint(), "device connection closed");
        }
    }

    /// Close, then open again. There is no retry here.
    pub fn reconnect(&self) -> Result<(), DeviceError> {
        self.close();
        self.open()
    }

    /// Send `<HEARTBEAT0>>` and discard whatever the device pushed before.
    pub fn disable_heartbeat(&self) -> Result<(), DeviceError> {
        let mut guard = self.lock();
        let link = guard.as_mut().ok_or(DeviceError::NotConnected)?;
        disable_heartbeat(link)
    }

    /// Discard unread input, e.g. the tail of a response that timed out.
    pub fn flush_bus(&self) -> Result<(), DeviceError> {
        let mut guard = self.lock();
        let link = guard.as_mut().ok_or(DeviceError::NotConnected)?;
        link.discard_input()?;
        Ok(())
    }

    /// Model and firmware string, e.g. `GMC-320Re 4.22`, untrimmed.
    pub fn fetch_version(&self) -> Result<String, DeviceError> {
        self.exchange(Command::GetVer, |response| Ok(decode_version(response)))
    }

    pub fn fetch_cpm(&self) -> Result<u16, DeviceError> {
        self.exchange(Command::GetCpm, |response| Ok(decode_cpm(response)))
    }

    /// Temperature in degrees Celsius.
    pub fn fetch_temperature(&self) -> Result<f64, DeviceError> {
        self.exchange(Command::GetTemp, decode_temperature)
    }

    fn exchange<const N: usize, T>(
        &self,
        command: Command,
        decode: impl FnOnce([u8; N]) -> Result<T, ProtocolError>,
    ) -> Result<T, DeviceError> {
        debug_assert_eq!(N, command.response_len());

        let mut guard = self.lock();
        let link = guard.as_mut().ok_or(DeviceError::NotConnected)?;

        let result = transact::<_, N>(link, command)
            .and_then(|response| decode(response).map_err(DeviceError::from));

        if let Err(error) = &result {
            warn!(%command, %error, "exchange failed, dropping device connection");
            *guard = None;
        }
        result
    }

    fn lock(&self) -> MutexGuard<'_, Option<C::Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn transact<L: Link, const N: usize>(link: &mut L, command: Command) -> Result<[u8; N], DeviceError> {
    link.write_all(command.frame())?;
    link.flush()?;

    let mut response = [0u8; N];
    link.read_exact(&mut response).map_err(|err| match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::UnexpectedEof | io::ErrorKind::WouldBlock => {
            DeviceError::from(ProtocolError::ShortResponse {
                command,
                expected: N,
            })
        }
        _ => DeviceError::Connection(err),
    })?;
    Ok(response)
}

fn disable_heartbeat<L: Link>(link: &mut L) -> Result<(), DeviceError> {
    link.write_all(Command::Heartbeat0.frame())
        .and_then(|()| link.flush())
        .and_then(|()| link.discard_input())
        .map_err(ProtocolError::Heartbeat)?;
    Ok(())
}
