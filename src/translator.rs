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

//! Translator mode: exposes the printer to third-party host software through a
//! pseudo-terminal published as the lowest free `/dev/ttyACM<n>`.
//!
//! The printer's 16-bit line numbers wrap every 65536 commands, which confuses
//! hosts that expect an unbounded count. The translator keeps a wrap counter
//! and rewrites `ok`/`skip`/`Resend` responses so the far side sees monotonic
//! numbers; an incoming `N0 M110` resets the counter.

use std::ffi::CStr;
use std::fs;
use std::io;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::gcode::Command;
use crate::link::{Link, SerialIo};

const LINE_NUMBER_WRAP: u64 = 0x10000;

/// Pseudo-terminal master published behind a `/dev/ttyACM<n>` symlink.
/// Closing it removes the symlink.
pub struct VirtualPort {
    master: libc::c_int,
    public: PathBuf,
}

impl VirtualPort {
    /// Allocate the PTY, pick the lowest unused `/dev/ttyACM<n>` name, link it
    /// to the slave side and open it up to everyone.
    pub fn open() -> Result<VirtualPort> {
        let master = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NONBLOCK) };
        if master == -1 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        // From here on the port's Drop closes the descriptor on error paths
        let mut port = VirtualPort {
            master,
            public: PathBuf::new(),
        };

        if unsafe { libc::grantpt(master) } == -1 || unsafe { libc::unlockpt(master) } == -1 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let slave = unsafe { libc::ptsname(master) };
        if slave.is_null() {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let slave = unsafe { CStr::from_ptr(slave) }
            .to_str()
            .map_err(|_| Error::Io(io::Error::other("unrepresentable pty name")))?
            .to_string();
        for n in 0..u16::MAX {
            let candidate = PathBuf::from(format!("/dev/ttyACM{n}"));
            if !candidate.exists() {
                port.public = candidate;
                break;
            }
        }
        if port.public.as_os_str().is_empty() {
            return Err(Error::Io(io::Error::other("no free ttyACM name")));
        }

        symlink(&slave, &port.public)?;
        fs::set_permissions(&port.public, fs::Permissions::from_mode(0o666))?;
        Ok(port)
    }

    pub fn public_path(&self) -> &Path {
        &self.public
    }

    fn read_byte(&mut self) -> Option<u8> {
        let mut byte = 0u8;
        let read =
            unsafe { libc::read(self.master, (&mut byte as *mut u8).cast(), 1) };
        if read == 1 {
            Some(byte)
        } else {
            None
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        unsafe {
            libc::tcflush(self.master, libc::TCIOFLUSH);
        }
        let written =
            unsafe { libc::write(self.master, data.as_ptr().cast(), data.len()) };
        if written != data.len() as isize {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        unsafe {
            libc::tcdrain(self.master);
        }
        Ok(())
    }
}

impl Drop for VirtualPort {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.master);
        }
        if !self.public.as_os_str().is_empty() {
            let _ = fs::remove_file(&self.public);
        }
    }
}

/// Rewrite one printer response, folding the wrap counter into the reported
/// line number. Non-matching responses pass through unchanged.
fn rewrite_response(buffer: &str, wrap_counter: &mut u64) -> String {
    let bytes = buffer.as_bytes();
    if buffer.len() >= 4 && buffer.starts_with("ok") && bytes[3].is_ascii_digit() {
        if let Ok(number) = buffer[3..].trim().parse::<u64>() {
            if number == u64::from(u16::MAX) {
                *wrap_counter += 1;
                return format!("ok {}\n", number + (*wrap_counter - 1) * LINE_NUMBER_WRAP);
            }
            return format!("ok {}\n", number + *wrap_counter * LINE_NUMBER_WRAP);
        }
    } else if buffer.len() >= 6 && buffer.starts_with("skip") {
        if let Ok(number) = buffer[5..].trim().parse::<u64>() {
            let rewritten = number + *wrap_counter * LINE_NUMBER_WRAP;
            if number == u64::from(u16::MAX) {
                *wrap_counter += 1;
            }
            return format!("ok {rewritten}\n");
        }
    } else if buffer.len() >= 8 && buffer.starts_with("Resend") {
        if let Ok(number) = buffer[7..].trim().parse::<u64>() {
            return format!("Resend:{}\n", number + *wrap_counter * LINE_NUMBER_WRAP);
        }
    }
    buffer.to_string()
}

/// Relay traffic between the virtual port and the printer forever. Returns
/// only on I/O failure against either side.
pub fn run<P: SerialIo>(link: &mut Link<P>, virtual_port: &mut VirtualPort) -> Result<()> {
    let mut wrap_counter: u64 = 0;
    let mut command = Command::new();

    loop {
        // Host to printer
        if let Some(first) = virtual_port.read_byte() {
            let mut buffer = vec![first];
            while let Some(byte) = virtual_port.read_byte() {
                buffer.push(byte);
            }
            let buffer = String::from_utf8_lossy(&buffer).into_owned();

            if buffer == "M110\n" || buffer == "M21\n" {
                // No-ops for this firmware; answer locally
                virtual_port.write_all(b"ok\n")?;
            } else if command.parse_line(&buffer) {
                if command.value('N') == "0" && command.value('M') == "110" {
                    debug!("host reset line numbering");
                    wrap_counter = 0;
                }
                link.send_binary(&command)?;
            }
        }

        // Printer to host
        if let Some(first) = link.try_read_byte()? {
            let mut buffer = String::new();
            buffer.push(first as char);
            while let Some(byte) = link.try_read_byte()? {
                buffer.push(byte as char);
            }
            let rewritten = rewrite_response(&buffer, &mut wrap_counter);
            virtual_port.write_all(rewritten.as_bytes())?;
        }

        thread::sleep(Duration::from_micros(200));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_numbers_gain_the_wrap_offset() {
        let mut wraps = 2;
        assert_eq!(rewrite_response("ok 7", &mut wraps), "ok 131079\n");
        assert_eq!(wraps, 2);
    }

    #[test]
    fn hitting_the_wrap_boundary_increments_the_counter() {
        let mut wraps = 0;
        assert_eq!(rewrite_response("ok 65535", &mut wraps), "ok 65535\n");
        assert_eq!(wraps, 1);
        assert_eq!(rewrite_response("ok 0", &mut wraps), "ok 65536\n");
    }

    #[test]
    fn skip_is_reported_as_ok() {
        let mut wraps = 1;
        assert_eq!(rewrite_response("skip 3", &mut wraps), "ok 65539\n");
    }

    #[test]
    fn resend_keeps_its_own_prefix() {
        let mut wraps = 1;
        assert_eq!(rewrite_response("Resend 10", &mut wraps), "Resend:65546\n");
    }

    #[test]
    fn chatter_passes_through() {
        let mut wraps = 3;
        assert_eq!(rewrite_response("T:210", &mut wraps), "T:210");
        assert_eq!(wraps, 3);
    }

    #[test]
    fn rewritten_stream_is_monotonic_across_wraps() {
        let mut wraps = 0;
        let mut last: u64 = 0;
        for round in 0..3u64 {
            for n in (0..=u64::from(u16::MAX)).step_by(8191) {
                let rewritten = rewrite_response(&format!("ok {n}"), &mut wraps);
                let value: u64 = rewritten.trim()[3..].parse().unwrap();
                assert!(value >= last, "stream went backwards at round {round}");
                last = value;
            }
            // Make sure each round ends exactly on the boundary
            let rewritten = rewrite_response("ok 65535", &mut wraps);
            let value: u64 = rewritten.trim()[3..].parse().unwrap();
            assert!(value >= last);
            last = value;
        }
    }
}
