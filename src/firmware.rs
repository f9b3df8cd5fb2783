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

//! Firmware management over the bootloader protocol: chip erase, page
//! programming, CRC verification and the EEPROM fixups that keep old units
//! usable. All operations here require the printer to be in bootloader mode;
//! the session guarantees that before calling in.

use std::fs;
use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::eeprom;
use crate::error::{Error, Result};
use crate::link::{Link, SerialIo};
use crate::rom;

/// Units whose firmware may run before this version are rejected outright.
pub const DEPRECATION_FLOOR: u32 = 150_994_944;

/// Serial numbers of early units shipped with an extruder current below spec.
const LOW_CURRENT_SERIALS: [&str; 12] = [
    "BK15033001100",
    "BK15040201050",
    "BK15040301050",
    "BK15040602050",
    "BK15040801050",
    "BK15040802100",
    "GR15032702100",
    "GR15033101100",
    "GR15040601100",
    "GR15040701100",
    "OR15032701100",
    "SL15032601050",
];

const EXTRUDER_CURRENT_TARGET: u16 = 500;

/// Heater fan models fitted across production runs.
#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FanType {
    Henglixin = 0x01,
    Listener = 0x02,
    Shenzhew = 0x03,
    NoFan = 0xFF,
}

impl FanType {
    /// Calibration pair (offset, scale) for the fan's PWM curve.
    fn calibration(self) -> (u8, f32) {
        match self {
            FanType::Henglixin => (200, 0.216_535_4),
            FanType::Listener => (145, 0.333_333_3),
            FanType::Shenzhew | FanType::NoFan => (82, 0.384_313_7),
        }
    }

    /// Default fan for units that never had one recorded: production switched
    /// suppliers at serial date 150602.
    fn default_for_serial(serial: &str) -> FanType {
        let date: u32 = serial.get(2..8).and_then(|s| s.parse().ok()).unwrap_or(0);
        if date >= 150_602 {
            FanType::Shenzhew
        } else {
            FanType::Henglixin
        }
    }
}

/// Outcome of a successful flash.
#[derive(Clone, Copy, Debug)]
pub struct FlashReport {
    pub version: u32,
    pub crc: u32,
}

/// Read back the 0x300-byte EEPROM image (`S` command). The chip terminates
/// the dump with `\r`.
fn read_eeprom_image<P: SerialIo>(link: &mut Link<P>) -> Result<Vec<u8>> {
    link.send_ascii(b"S")?;
    let mut response = link.receive_ascii()?;
    if response.last() != Some(&b'\r') {
        return Err(Error::Protocol(
            String::from_utf8_lossy(&response).into_owned(),
        ));
    }
    response.pop();
    Ok(response)
}

/// Request the chip's CRC of its own flash (`C A`), big-endian on the wire.
fn read_chip_crc<P: SerialIo>(link: &mut Link<P>) -> Result<u32> {
    link.send_ascii(b"C")?;
    link.send_ascii(b"A")?;
    let response = link.receive_ascii()?;
    if response.len() < 4 {
        return Err(Error::Protocol(
            String::from_utf8_lossy(&response).into_owned(),
        ));
    }
    Ok(u32::from_be_bytes([
        response[0],
        response[1],
        response[2],
        response[3],
    ]))
}

/// Wait for the single `\r` acknowledgement the bootloader sends after erase,
/// address and page operations. Erase can take longer than one response
/// window, so empty reads retry.
fn wait_acknowledgement<P: SerialIo>(link: &mut Link<P>) -> Result<()> {
    let response = loop {
        let response = link.receive_ascii()?;
        if !response.is_empty() {
            break response;
        }
    };
    if response != b"\r" {
        return Err(Error::Protocol(
            String::from_utf8_lossy(&response).into_owned(),
        ));
    }
    Ok(())
}

/// Pages are counted in whole words; an odd trailing byte never starts a page
/// of its own.
fn pages_to_write(image_len: usize) -> usize {
    let words = image_len / 2;
    let mut pages = words / rom::CHIP_PAGE_SIZE;
    if words % rom::CHIP_PAGE_SIZE != 0 {
        pages += 1;
    }
    pages
}

fn send_address_zero<P: SerialIo>(link: &mut Link<P>) -> Result<()> {
    link.send_ascii(b"A")?;
    link.send_ascii(&[0x00])?;
    link.send_ascii(&[0x00])?;
    let response = link.receive_ascii()?;
    if response != b"\r" {
        return Err(Error::Protocol(
            String::from_utf8_lossy(&response).into_owned(),
        ));
    }
    Ok(())
}

/// Flash a ROM file: erase, program page by page, then verify the chip CRC
/// against the decrypted image and refresh the version/CRC EEPROM fields.
pub fn update<P: SerialIo>(link: &mut Link<P>, file: &Path) -> Result<FlashReport> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let version = rom::version_from_name(name).ok_or_else(|| Error::RomName(name.to_string()))?;

    let mut image = fs::read(file)?;
    if rom::is_decrypted(&image) {
        debug!("rom is decrypted, encrypting before flash");
        image = rom::encrypt(&image);
    }
    if image.len() > rom::CHIP_TOTAL_MEMORY {
        return Err(Error::RomTooLarge(rom::CHIP_TOTAL_MEMORY));
    }

    info!("erasing chip");
    link.send_ascii(b"E")?;
    wait_acknowledgement(link)?;

    send_address_zero(link)?;

    let page_bytes = rom::CHIP_PAGE_SIZE * 2;
    let pages = pages_to_write(image.len());

    let progress = ProgressBar::new(pages as u64).with_style(
        ProgressStyle::with_template("programming {wide_bar} {pos}/{len} pages")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    for page in 0..pages {
        let mut request = vec![b'B', (page_bytes >> 8) as u8, page_bytes as u8];
        for offset in 0..page_bytes {
            let position = offset + page * page_bytes;
            if position < image.len() {
                // Pairwise-swapped traversal, same as the cipher
                let swapped = if position % 2 != 0 {
                    position - 1
                } else {
                    position + 1
                };
                request.push(if swapped < image.len() {
                    image[swapped]
                } else {
                    rom::padding_byte()
                });
            } else {
                request.push(rom::padding_byte());
            }
        }
        link.send_ascii(&request)?;
        wait_acknowledgement(link)?;
        progress.inc(1);
    }
    progress.finish_and_clear();

    send_address_zero(link)?;

    let eeprom_image = read_eeprom_image(link)?;
    if eeprom_image.get(0x2E6) == Some(&0) {
        debug!("clearing stale crc words");
        for address in 0x08..=0x0Bu16 {
            eeprom::write_byte(link, address, 0)?;
        }
    }

    let chip_crc = read_chip_crc(link)?;
    let decrypted = rom::decrypt_padded(&image);
    let rom_crc = rom::CRC32.checksum(&decrypted);
    if chip_crc != rom_crc.swap_bytes() {
        return Err(Error::CrcMismatch {
            chip: chip_crc,
            rom: rom_crc,
        });
    }

    for address in 0x2D6..=0x2E5u16 {
        eeprom::write_byte(link, address, 0)?;
    }

    eeprom::write(link, eeprom::FIRMWARE_VERSION as u16, &version.to_le_bytes())?;
    eeprom::write(link, eeprom::FIRMWARE_CRC as u16, &rom_crc.to_le_bytes())?;

    info!("firmware {version} flashed, crc {rom_crc:#010X}");
    Ok(FlashReport {
        version,
        crc: rom_crc,
    })
}

/// Validate the installed firmware and repair the EEPROM records old units
/// ship without.
///
/// Fails when the chip CRC disagrees with the recorded CRC or the version is
/// below the deprecation floor. Returns the installed version on success.
pub fn validate<P: SerialIo>(link: &mut Link<P>) -> Result<u32> {
    let chip_crc = read_chip_crc(link)?;
    let image = read_eeprom_image(link)?;
    if image.len() < eeprom::IMAGE_SIZE {
        return Err(Error::Protocol(format!(
            "short eeprom image: {} bytes",
            image.len()
        )));
    }

    let recorded_crc = u32::from_be_bytes([image[4], image[5], image[6], image[7]]);
    if chip_crc != recorded_crc {
        return Err(Error::CrcMismatch {
            chip: chip_crc,
            rom: recorded_crc,
        });
    }

    let version = u32::from_le_bytes([image[0], image[1], image[2], image[3]]);
    if version < DEPRECATION_FLOOR {
        return Err(Error::Protocol(format!("firmware {version} is deprecated")));
    }

    let serial: String = image[eeprom::SERIAL_NUMBER..eeprom::SERIAL_NUMBER + eeprom::SERIAL_NUMBER_LENGTH]
        .iter()
        .map(|&b| b as char)
        .collect();

    // Only the erased markers get the default treatment; any other byte,
    // recognized or not, is left alone
    let fan_byte = image[eeprom::FAN_TYPE];
    if fan_byte == 0 || fan_byte == u8::from(FanType::NoFan) {
        let fan = FanType::default_for_serial(&serial);
        let (offset, scale) = fan.calibration();
        warn!("no fan recorded, defaulting to {fan:?}");
        eeprom::write(link, eeprom::FAN_SCALE as u16, &scale.to_le_bytes())?;
        eeprom::write_byte(link, eeprom::FAN_OFFSET as u16, offset)?;
        eeprom::write_byte(link, eeprom::FAN_TYPE as u16, fan.into())?;
    }

    let current = u16::from_le_bytes([
        image[eeprom::EXTRUDER_CURRENT],
        image[eeprom::EXTRUDER_CURRENT + 1],
    ]);
    if LOW_CURRENT_SERIALS.contains(&serial.as_str()) && current != EXTRUDER_CURRENT_TARGET {
        warn!("raising extruder current from {current} to {EXTRUDER_CURRENT_TARGET}");
        eeprom::write(
            link,
            eeprom::EXTRUDER_CURRENT as u16,
            &EXTRUDER_CURRENT_TARGET.to_le_bytes(),
        )?;
    }

    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::loopback::LoopbackPort;

    fn eeprom_image(version: u32, crc: u32, fan: u8, serial: &str) -> Vec<u8> {
        let mut image = vec![0u8; eeprom::IMAGE_SIZE];
        image[..4].copy_from_slice(&version.to_le_bytes());
        image[4..8].copy_from_slice(&crc.to_be_bytes());
        image[eeprom::FAN_TYPE] = fan;
        image[eeprom::EXTRUDER_CURRENT..eeprom::EXTRUDER_CURRENT + 2]
            .copy_from_slice(&EXTRUDER_CURRENT_TARGET.to_le_bytes());
        image[eeprom::SERIAL_NUMBER..eeprom::SERIAL_NUMBER + serial.len()]
            .copy_from_slice(serial.as_bytes());
        image
    }

    fn queue_validate_responses(port: &mut LoopbackPort, image: &[u8], chip_crc: u32) {
        port.queue_response(&chip_crc.to_be_bytes());
        let mut terminated = image.to_vec();
        terminated.push(b'\r');
        port.queue_response(&terminated);
    }

    #[test]
    fn validate_accepts_matching_crcs() {
        let image = eeprom_image(2015_06_24_01, 0xDEAD_BEEF, FanType::Shenzhew.into(), "BK16000000000");
        let mut port = LoopbackPort::new();
        queue_validate_responses(&mut port, &image, 0xDEAD_BEEF);
        let mut link = Link::new(port);
        assert_eq!(validate(&mut link).unwrap(), 2015_06_24_01);
    }

    #[test]
    fn validate_rejects_crc_mismatch() {
        let image = eeprom_image(2015_06_24_01, 0xDEAD_BEEF, FanType::Shenzhew.into(), "BK16000000000");
        let mut port = LoopbackPort::new();
        queue_validate_responses(&mut port, &image, 0x1234_5678);
        let mut link = Link::new(port);
        assert!(matches!(
            validate(&mut link),
            Err(Error::CrcMismatch { .. })
        ));
    }

    #[test]
    fn validate_rejects_deprecated_firmware() {
        let image = eeprom_image(1000, 0xDEAD_BEEF, FanType::Shenzhew.into(), "BK16000000000");
        let mut port = LoopbackPort::new();
        queue_validate_responses(&mut port, &image, 0xDEAD_BEEF);
        let mut link = Link::new(port);
        assert!(validate(&mut link).is_err());
    }

    #[test]
    fn flash_happy_path_verifies_crc_and_writes_version() {
        let dir = std::env::temp_dir().join("micro-print-flash-test");
        std::fs::create_dir_all(&dir).unwrap();
        let rom_path = dir.join("2015062401.rom");
        // Decrypted marker byte first, so update() re-encrypts before flashing
        let decrypted = vec![0x0C, 0x01, 0x02, 0x03];
        std::fs::write(&rom_path, &decrypted).unwrap();

        let encrypted = rom::encrypt(&decrypted);
        let rom_crc = rom::CRC32.checksum(&rom::decrypt_padded(&encrypted));

        let mut port = LoopbackPort::new();
        port.queue_response(b"\r"); // erase
        port.queue_response(b"\r"); // address
        port.queue_response(b"\r"); // single page
        port.queue_response(b"\r"); // address again
        let mut image = vec![0u8; eeprom::IMAGE_SIZE];
        image[0x2E6] = 1; // crc words valid, no zeroing pass
        image.push(b'\r');
        port.queue_response(&image);
        // Chip reports the byte-swapped image crc
        port.queue_response(&rom_crc.to_le_bytes());
        for _ in 0..16 {
            port.queue_response(b"\r"); // 0x2D6..=0x2E5 zeroing
        }
        port.queue_response(b"\r"); // version write
        port.queue_response(b"\r"); // crc write

        let mut link = Link::new(port);
        let report = update(&mut link, &rom_path).unwrap();
        assert_eq!(report.version, 2015062401);
        assert_eq!(report.crc, rom_crc);

        let written = &link.port_mut().written;
        assert_eq!(written[0], b'E');
        // Page frame: 'B', big-endian byte count of 256
        let page = written
            .iter()
            .position(|&b| b == b'B')
            .expect("page frame present");
        assert_eq!(&written[page..page + 3], &[b'B', 0x01, 0x00]);

        std::fs::remove_file(&rom_path).ok();
    }

    #[test]
    fn page_count_ignores_an_odd_trailing_byte() {
        assert_eq!(pages_to_write(0), 0);
        assert_eq!(pages_to_write(255), 1);
        assert_eq!(pages_to_write(256), 1);
        // The dangling 257th byte has no word partner and no page
        assert_eq!(pages_to_write(257), 1);
        assert_eq!(pages_to_write(258), 2);
        assert_eq!(pages_to_write(rom::CHIP_TOTAL_MEMORY), rom::CHIP_NUMBER_OF_PAGES);
    }

    #[test]
    fn unrecognized_fan_byte_is_left_alone() {
        // 0x05 names no fan model, but only 0 and 0xFF mark an erased record
        let image = eeprom_image(2015_06_24_01, 0xDEAD_BEEF, 0x05, "BK16000000000");
        let mut port = LoopbackPort::new();
        queue_validate_responses(&mut port, &image, 0xDEAD_BEEF);
        let mut link = Link::new(port);
        assert_eq!(validate(&mut link).unwrap(), 2015_06_24_01);
        // No EEPROM rewrite went out
        assert!(!link.port_mut().written.contains(&b'U'));
    }

    #[test]
    fn missing_fan_is_elected_from_serial_date() {
        assert_eq!(
            FanType::default_for_serial("BK15060201050"),
            FanType::Shenzhew
        );
        assert_eq!(
            FanType::default_for_serial("BK15050201050"),
            FanType::Henglixin
        );
    }

    #[test]
    fn fan_calibration_pairs_are_fixed() {
        assert_eq!(FanType::Henglixin.calibration().0, 200);
        assert_eq!(FanType::Listener.calibration().0, 145);
        assert_eq!(FanType::Shenzhew.calibration().0, 82);
    }
}
