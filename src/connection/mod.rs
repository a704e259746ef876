//! The byte stream a detector runs against
//!
//! The [DetectorContext] trait abstracts over the receive buffer, the write
//! side of the transport and the clock used to time probes. [SerialContext]
//! implements it for any `Read + Write` transport, e.g. a boxed
//! `serialport::SerialPort`.

use std::{
    io::{ErrorKind, Read, Write},
    time::Duration,
};

use log::{debug, trace};
use regex::bytes::Regex;

pub use self::{
    buffer::{RxBuffer, DEFAULT_RX_CAPACITY},
    clock::{Clock, ManualClock, SystemClock},
};
use crate::error::Error;

mod buffer;
mod clock;

const READ_CHUNK_SIZE: usize = 1024;

/// Everything a probe may do with a connected device
///
/// Passive probes only ever receive a shared borrow, so they can inspect the
/// buffer but can neither write to the transport nor wait.
pub trait DetectorContext {
    /// The last `max_bytes` received bytes
    fn snapshot(&self, max_bytes: usize) -> &[u8];

    /// Discard everything received so far
    fn clear(&mut self);

    /// Write raw bytes to the transport
    fn write(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Monotonic timestamp from the injected clock
    fn now(&self) -> Duration;

    /// Suspend for `period`, letting incoming bytes accumulate in the buffer
    fn idle(&mut self, period: Duration) -> Result<(), Error>;

    /// Search the last `max_bytes` received bytes, returning the matched text
    fn match_regex(&self, pattern: &Regex, max_bytes: usize) -> Option<String> {
        pattern
            .find(self.snapshot(max_bytes))
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
    }

    /// Whether the buffer contains `needle` verbatim
    fn includes_ascii(&self, needle: &str) -> bool {
        contains(self.snapshot(usize::MAX), needle.as_bytes())
    }
}

pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}

/// A [DetectorContext] over a byte transport
///
/// Bytes only reach the buffer when [SerialContext::pump] or
/// [DetectorContext::idle] runs. [identify](crate::identify) does this once
/// before its passive phase.
pub struct SerialContext<P, C = SystemClock> {
    port: P,
    buffer: RxBuffer,
    clock: C,
}

impl<P> SerialContext<P, SystemClock>
where
    P: Read + Write,
{
    /// Wrap a transport, timing probes with the system clock
    pub fn from_port(port: P) -> Self {
        Self::new(port, SystemClock::default())
    }
}

impl<P, C> SerialContext<P, C>
where
    P: Read + Write,
    C: Clock,
{
    pub fn new(port: P, clock: C) -> Self {
        Self::with_buffer(port, RxBuffer::default(), clock)
    }

    pub fn with_buffer(port: P, buffer: RxBuffer, clock: C) -> Self {
        SerialContext {
            port,
            buffer,
            clock,
        }
    }

    /// Move every byte the transport has ready into the receive buffer.
    ///
    /// Read timeouts are treated as an empty read, so a port configured with
    /// a short timeout returns promptly. Returns the number of bytes moved.
    pub fn pump(&mut self) -> Result<usize, Error> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut total = 0;

        loop {
            match self.port.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => {
                    self.buffer.push(&chunk[..read]);
                    total += read;
                    if read < chunk.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    break
                }
                Err(e) => return Err(e.into()),
            }
        }

        if total > 0 {
            trace!("Received {} bytes", total);
        }

        Ok(total)
    }

    pub fn buffer(&self) -> &RxBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut RxBuffer {
        &mut self.buffer
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Hand the transport back to the caller
    pub fn into_port(self) -> P {
        self.port
    }
}

impl<P, C> DetectorContext for SerialContext<P, C>
where
    P: Read + Write,
    C: Clock,
{
    fn snapshot(&self, max_bytes: usize) -> &[u8] {
        self.buffer.snapshot(max_bytes)
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        debug!("Writing {} bytes: {:02x?}", data.len(), data);
        self.port.write_all(data)?;
        self.port.flush()?;

        Ok(())
    }

    fn now(&self) -> Duration {
        self.clock.now()
    }

    fn idle(&mut self, period: Duration) -> Result<(), Error> {
        self.clock.sleep(period);
        self.pump()?;

        Ok(())
    }
}
