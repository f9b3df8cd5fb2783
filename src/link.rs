/*  This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License
    along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! Byte transport to the printer.
//!
//! [`Link`] is generic over the port it drives, so the protocol layers above it
//! (firmware manager, executor, translator) can run against a loopback double
//! in tests. The real port is a `serialport` TTY configured 8N1 at 115 200 baud
//! with exclusive access, standing in for a write lock on the device node.

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits, TTYPort};

use crate::error::Result;
use crate::gcode::Command;

pub const BAUD_RATE: u32 = 115_200;

/// 1 ms poll slots in the initial response window (200 ms total).
const RESPONSE_POLLS: u32 = 200;

/// Gap between greedy reads once a response has started.
const DRAIN_GAP: Duration = Duration::from_micros(50);

/// Minimal port surface the link needs.
pub trait SerialIo: Read + Write {
    /// Discard anything pending in both directions.
    fn clear_buffers(&mut self) -> io::Result<()>;

    /// Block until queued output has left the device.
    fn drain(&mut self) -> io::Result<()>;

    /// Fetch one byte, waiting at most about a millisecond. `Ok(None)` means
    /// nothing arrived in the slot.
    fn read_byte(&mut self) -> io::Result<Option<u8>>;
}

/// A `serialport` TTY implementing [`SerialIo`].
pub struct DevicePort {
    port: TTYPort,
}

impl DevicePort {
    /// Open and lock the device node, configured 8N1 at the protocol baud rate.
    pub fn open(path: &str) -> Result<DevicePort> {
        let mut port = serialport::new(path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(1))
            .open_native()?;
        port.set_exclusive(true)?;
        Ok(DevicePort { port })
    }
}

impl Read for DevicePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for DevicePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl SerialIo for DevicePort {
    fn clear_buffers(&mut self) -> io::Result<()> {
        self.port
            .clear(ClearBuffer::All)
            .map_err(|e| io::Error::other(e.to_string()))
    }

    fn drain(&mut self) -> io::Result<()> {
        self.port.flush()
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Request/response framing over one exclusively-owned port.
///
/// ASCII framing serves the bootloader, binary framing the runtime firmware.
/// The link itself is mode-agnostic; the session picks the framing.
pub struct Link<P: SerialIo> {
    port: P,
}

impl<P: SerialIo> Link<P> {
    pub fn new(port: P) -> Self {
        Link { port }
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Flush both buffers, write the bytes, and drain.
    pub fn send_ascii(&mut self, data: &[u8]) -> Result<()> {
        self.port.clear_buffers()?;
        self.port.write_all(data)?;
        self.port.drain()?;
        Ok(())
    }

    /// Send a command in its binary wire encoding.
    pub fn send_binary(&mut self, command: &Command) -> Result<()> {
        self.send_ascii(&command.get_binary())
    }

    /// Collect a response: wait up to 200 ms for the first byte, then read
    /// greedily until the line goes quiet. Bootloader responses may carry raw
    /// binary payloads (EEPROM dumps, CRC words), so this returns bytes. May
    /// return an empty buffer on timeout.
    pub fn receive_ascii(&mut self) -> Result<Vec<u8>> {
        let mut response = Vec::new();
        let Some(first) = self.wait_first_byte()? else {
            return Ok(response);
        };

        let mut byte = first;
        loop {
            response.push(byte);
            thread::sleep(DRAIN_GAP);
            match self.port.read_byte()? {
                Some(next) => byte = next,
                None => break,
            }
        }
        Ok(response)
    }

    /// Collect a newline-terminated response, stripping the newline. Empty on
    /// initial timeout.
    pub fn receive_binary(&mut self) -> Result<String> {
        let mut response = String::new();
        let Some(first) = self.wait_first_byte()? else {
            return Ok(response);
        };

        let mut byte = first;
        while byte != b'\n' {
            response.push(byte as char);
            byte = loop {
                if let Some(next) = self.port.read_byte()? {
                    break next;
                }
            };
        }
        Ok(response)
    }

    /// One non-blocking poll for a pending byte.
    pub fn try_read_byte(&mut self) -> Result<Option<u8>> {
        Ok(self.port.read_byte()?)
    }

    fn wait_first_byte(&mut self) -> Result<Option<u8>> {
        for _ in 0..RESPONSE_POLLS {
            if let Some(byte) = self.port.read_byte()? {
                return Ok(Some(byte));
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod loopback {
    //! In-memory port double used by the protocol tests.

    use std::collections::VecDeque;
    use std::io::{self, Read, Write};

    use super::SerialIo;

    #[derive(Default)]
    pub struct LoopbackPort {
        /// Queued device answers. Each entry is one response; a quiet gap
        /// separates entries, so one greedy read never swallows the next
        /// response.
        pub responses: VecDeque<VecDeque<u8>>,
        /// Everything the host wrote.
        pub written: Vec<u8>,
        pub cleared: usize,
    }

    impl LoopbackPort {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn queue_response(&mut self, bytes: &[u8]) {
            self.responses.push_back(bytes.iter().copied().collect());
        }

        fn pop_byte(&mut self) -> Option<u8> {
            let segment = self.responses.front_mut()?;
            match segment.pop_front() {
                Some(byte) => Some(byte),
                None => {
                    self.responses.pop_front();
                    None
                }
            }
        }
    }

    impl Read for LoopbackPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.pop_byte() {
                Some(byte) if !buf.is_empty() => {
                    buf[0] = byte;
                    Ok(1)
                }
                _ => Err(io::Error::new(io::ErrorKind::TimedOut, "no data")),
            }
        }
    }

    impl Write for LoopbackPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialIo for LoopbackPort {
        fn clear_buffers(&mut self) -> io::Result<()> {
            self.cleared += 1;
            Ok(())
        }

        fn drain(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn read_byte(&mut self) -> io::Result<Option<u8>> {
            Ok(self.pop_byte())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::loopback::LoopbackPort;
    use super::*;

    #[test]
    fn ascii_send_flushes_then_writes() {
        let mut link = Link::new(LoopbackPort::new());
        link.send_ascii(b"M115").unwrap();
        assert_eq!(link.port_mut().written, b"M115");
        assert_eq!(link.port_mut().cleared, 1);
    }

    #[test]
    fn binary_send_uses_wire_encoding() {
        let mut command = Command::new();
        command.parse_line("G4 S2");
        let expected = command.get_binary();

        let mut link = Link::new(LoopbackPort::new());
        link.send_binary(&command).unwrap();
        assert_eq!(link.port_mut().written, expected);
    }

    #[test]
    fn ascii_receive_collects_until_quiet() {
        let mut port = LoopbackPort::new();
        port.queue_response(b"ok\r");
        let mut link = Link::new(port);
        assert_eq!(link.receive_ascii().unwrap(), b"ok\r");
    }

    #[test]
    fn ascii_receive_times_out_to_empty() {
        let mut link = Link::new(LoopbackPort::new());
        assert!(link.receive_ascii().unwrap().is_empty());
    }

    #[test]
    fn binary_receive_strips_newline() {
        let mut port = LoopbackPort::new();
        port.queue_response(b"ok 12\nrest");
        let mut link = Link::new(port);
        assert_eq!(link.receive_binary().unwrap(), "ok 12");
        // The remainder stays queued for the next read
        assert_eq!(link.try_read_byte().unwrap(), Some(b'r'));
    }
}
