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

//! Error type shared by every fallible operation in the crate.

use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No byte arrived within the protocol's 200 ms response window.
    #[error("printer did not respond in time")]
    Timeout,

    /// A response arrived but did not have the expected shape.
    #[error("unexpected response from printer: {0:?}")]
    Protocol(String),

    /// The model leaves the printable volume.
    #[error("print exceeds the printer's dimensions")]
    Dimensions,

    /// Firmware ROM file names must begin with the 10-digit firmware version.
    #[error("invalid firmware rom name {0:?}")]
    RomName(String),

    /// The ROM image does not fit in chip memory.
    #[error("firmware rom is larger than the chip's {0} bytes of memory")]
    RomTooLarge(usize),

    /// The CRC reported by the chip disagrees with the CRC of the flashed image.
    #[error("chip crc {chip:#010X} does not match rom crc {rom:#010X}")]
    CrcMismatch { chip: u32, rom: u32 },

    /// The serial device never appeared, or could not be locked and configured.
    #[error("could not connect to the printer")]
    Connect,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),
}
