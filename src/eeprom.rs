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

//! EEPROM address map and bootloader-mode writes.
//!
//! Offsets below 0x80 are the typed settings slots read back over `M619` in
//! runtime mode; the high offsets are raw locations inside the 0x300-byte image
//! returned by the bootloader's `S` command.

use crate::error::{Error, Result};
use crate::link::{Link, SerialIo};

// Typed settings slots (M619 S<offset>)
pub const BACKLASH_X: u16 = 0;
pub const BACKLASH_Y: u16 = 1;
pub const BACK_RIGHT_ORIENTATION: u16 = 2;
pub const BACK_LEFT_ORIENTATION: u16 = 3;
pub const FRONT_LEFT_ORIENTATION: u16 = 4;
pub const FRONT_RIGHT_ORIENTATION: u16 = 5;
pub const FILAMENT_COLOR: u16 = 6;
pub const FILAMENT_TYPE: u16 = 7;
pub const FILAMENT_TEMPERATURE: u16 = 8;
pub const BACK_LEFT_OFFSET: u16 = 16;
pub const BACK_RIGHT_OFFSET: u16 = 17;
pub const FRONT_RIGHT_OFFSET: u16 = 18;
pub const FRONT_LEFT_OFFSET: u16 = 19;
pub const BACKLASH_SPEED: u16 = 22;
pub const BED_HEIGHT_OFFSET: u16 = 32;

// Raw image locations
pub const FIRMWARE_VERSION: usize = 0x00;
pub const FIRMWARE_CRC: usize = 0x04;
pub const FAN_TYPE: usize = 0x2AB;
pub const FAN_OFFSET: usize = 0x2AC;
pub const FAN_SCALE: usize = 0x2AD;
pub const EXTRUDER_CURRENT: usize = 0x2E8;
pub const SERIAL_NUMBER: usize = 0x2EF;
pub const SERIAL_NUMBER_LENGTH: usize = 13;

/// Size of the image returned by the bootloader's `S` command.
pub const IMAGE_SIZE: usize = 0x300;

/// Write bytes at an EEPROM address in bootloader mode: `U`, big-endian
/// address, big-endian length, payload; the chip acknowledges with `\r`.
pub fn write<P: SerialIo>(link: &mut Link<P>, address: u16, data: &[u8]) -> Result<()> {
    let length = data.len() as u16;
    let mut request = vec![
        b'U',
        (address >> 8) as u8,
        address as u8,
        (length >> 8) as u8,
        length as u8,
    ];
    request.extend_from_slice(data);
    link.send_ascii(&request)?;

    let response = link.receive_ascii()?;
    if response != b"\r" {
        return Err(Error::Protocol(
            String::from_utf8_lossy(&response).into_owned(),
        ));
    }
    Ok(())
}

/// Single-byte write.
pub fn write_byte<P: SerialIo>(link: &mut Link<P>, address: u16, data: u8) -> Result<()> {
    write(link, address, &[data])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::loopback::LoopbackPort;

    #[test]
    fn write_frames_address_and_length_big_endian() {
        let mut port = LoopbackPort::new();
        port.queue_response(b"\r");
        let mut link = Link::new(port);
        write(&mut link, 0x02AD, &[0x10, 0x20]).unwrap();
        assert_eq!(
            link.port_mut().written,
            vec![b'U', 0x02, 0xAD, 0x00, 0x02, 0x10, 0x20]
        );
    }

    #[test]
    fn missing_acknowledgement_is_a_protocol_error() {
        let mut link = Link::new(LoopbackPort::new());
        assert!(write_byte(&mut link, 0, 0).is_err());
    }
}
