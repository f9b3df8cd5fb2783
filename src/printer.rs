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

//! The printer session: owns the serial link, tracks which mode the firmware
//! is in, and exposes the high-level operations (information collection,
//! calibration, processing, printing, flashing).
//!
//! The printer speaks two disjoint protocols. The bootloader answers
//! single-letter ASCII commands; the runtime firmware consumes the binary
//! framing and answers newline-terminated text. `M115 S628` (binary) drops the
//! firmware back into the bootloader, an ASCII `Q` boots the firmware; both
//! sides of the switch force a reconnect because the USB device node drops and
//! reappears.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::executor;
use crate::firmware;
use crate::gcode::Command;
use crate::link::{DevicePort, Link};
use crate::preprocess::{Pipeline, StageSet, WorkDir};
use crate::settings::{FilamentLocation, FilamentType, PrinterSettings};
use crate::{eeprom, translator};

/// Device node the udev rule publishes for the printer.
pub const DEVICE_NODE: &str = "/dev/micro_3d";

const CONNECT_ATTEMPTS: u32 = 8;
const CONNECT_PAUSE: Duration = Duration::from_millis(250);

/// Bit pattern of 1500.0f32, the backlash-speed factory default.
const BACKLASH_SPEED_DEFAULT_BITS: u32 = 1_153_138_688;

pub struct Printer {
    link: Option<Link<DevicePort>>,
    device: String,
    bootloader_mode: bool,

    pub settings: PrinterSettings,
    pub stages: StageSet,

    firmware_version: String,
    serial_number: String,
    status: u8,
    valid_z: bool,
    valid_bed_orientation: bool,

    work_dir: WorkDir,
}

impl Printer {
    /// Create a session with its own scratch directory, not yet connected.
    pub fn new() -> Result<Printer> {
        Ok(Printer {
            link: None,
            device: DEVICE_NODE.to_string(),
            bootloader_mode: true,
            settings: PrinterSettings::default(),
            stages: StageSet::default(),
            firmware_version: String::new(),
            serial_number: String::new(),
            status: 0,
            valid_z: false,
            valid_bed_orientation: false,
            work_dir: WorkDir::new()?,
        })
    }

    /// Use a different device node (tests, multiple machines).
    pub fn with_device(mut self, device: impl Into<String>) -> Printer {
        self.device = device.into();
        self
    }

    /// Open and lock the serial node, retrying for about two seconds while the
    /// device enumerates.
    pub fn connect(&mut self) -> Result<()> {
        self.link = None;
        for _ in 0..CONNECT_ATTEMPTS {
            thread::sleep(CONNECT_PAUSE);
            if let Ok(port) = DevicePort::open(&self.device) {
                self.link = Some(Link::new(port));
                return Ok(());
            }
        }
        Err(Error::Connect)
    }

    fn link(&mut self) -> Result<&mut Link<DevicePort>> {
        self.link.as_mut().ok_or(Error::Connect)
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn firmware_version(&self) -> &str {
        &self.firmware_version
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn is_z_valid(&self) -> bool {
        self.valid_z
    }

    pub fn is_bed_orientation_valid(&self) -> bool {
        self.valid_bed_orientation
    }

    /// Ask the printer which mode it is in (`M115` answers start with `B` in
    /// the bootloader).
    pub fn is_bootloader_mode(&mut self) -> Result<bool> {
        self.send_request_ascii(b"M115")?;
        let response = self.link()?.receive_ascii()?;
        self.bootloader_mode = response.first() == Some(&b'B');
        Ok(self.bootloader_mode)
    }

    /// Send a textual request in whichever framing the current mode expects.
    pub fn send_request(&mut self, data: &str) -> Result<()> {
        if self.bootloader_mode {
            self.send_request_ascii(data.as_bytes())
        } else {
            self.send_request_binary_str(data)
        }
    }

    pub fn send_request_ascii(&mut self, data: &[u8]) -> Result<()> {
        self.link()?.send_ascii(data)
    }

    /// Parse and send in the binary framing. Sending `M115 S628` switches the
    /// printer into the bootloader, so the session reconnects afterwards.
    pub fn send_request_binary_str(&mut self, data: &str) -> Result<()> {
        let mut command = Command::new();
        if !command.parse_line(data) {
            return Ok(());
        }
        self.send_request_binary(&command)
    }

    pub fn send_request_binary(&mut self, command: &Command) -> Result<()> {
        self.link()?.send_binary(command)?;
        if command.value('M') == "115" && command.value('S') == "628" {
            self.bootloader_mode = true;
            while self.connect().is_err() {}
        }
        Ok(())
    }

    /// Receive in whichever framing the current mode expects.
    pub fn receive_response(&mut self) -> Result<String> {
        if self.bootloader_mode {
            let raw = self.link()?.receive_ascii()?;
            Ok(String::from_utf8_lossy(&raw).into_owned())
        } else {
            self.link()?.receive_binary()
        }
    }

    /// Drop from the runtime firmware into the bootloader.
    pub fn enter_bootloader(&mut self) -> Result<()> {
        if self.bootloader_mode {
            return Ok(());
        }
        self.send_request_binary_str("M115 S628")
    }

    /// Boot the firmware, reconnecting once the device re-enumerates. Probes
    /// with `M115` until the runtime (`e`-prefixed) response appears.
    pub fn exit_bootloader(&mut self) -> Result<()> {
        loop {
            self.send_request_ascii(b"M115")?;
            let first = loop {
                if let Some(byte) = self.link()?.try_read_byte()? {
                    break byte;
                }
            };
            if first == b'e' {
                break;
            }
            self.send_request_ascii(b"Q")?;
            self.connect()?;
        }
        self.bootloader_mode = false;
        Ok(())
    }

    /// Check firmware integrity, repairing the fan and extruder-current
    /// records where needed. The checks only exist in the bootloader; in
    /// runtime mode there is nothing to inspect and the firmware is reported
    /// valid.
    pub fn is_firmware_valid(&mut self) -> Result<bool> {
        if !self.is_bootloader_mode()? {
            return Ok(true);
        }
        match firmware::validate(self.link()?) {
            Ok(version) => {
                self.firmware_version = version.to_string();
                Ok(true)
            }
            Err(Error::Io(e)) => Err(Error::Io(e)),
            Err(e) => {
                warn!("firmware validation failed: {e}");
                Ok(false)
            }
        }
    }

    /// Flash a firmware ROM. A printer that is not in bootloader mode cannot
    /// accept flash commands and is left untouched.
    pub fn update_firmware(&mut self, rom: &Path) -> Result<()> {
        if !self.is_bootloader_mode()? {
            warn!("not in bootloader mode, skipping firmware update");
            return Ok(());
        }
        let report = firmware::update(self.link()?, rom)?;
        self.firmware_version = report.version.to_string();
        Ok(())
    }

    fn read_eeprom_u32(&mut self, offset: u16) -> Result<u32> {
        self.send_request(&format!("M619 S{offset}"))?;
        let response = self.receive_response()?;
        let position = response
            .find("DT:")
            .ok_or_else(|| Error::Protocol(response.clone()))?;
        response[position + 3..]
            .trim()
            .split(' ')
            .next()
            .and_then(|token| token.parse().ok())
            .ok_or(Error::Protocol(response))
    }

    fn read_eeprom_float(&mut self, offset: u16) -> Result<f32> {
        Ok(f32::from_bits(self.read_eeprom_u32(offset)?))
    }

    /// Boot into runtime mode and pull every setting the pipeline needs off
    /// the printer, then persist the snapshot to the settings file.
    pub fn collect_information(&mut self) -> Result<()> {
        self.exit_bootloader()?;

        self.send_request("M115")?;
        let response = self.receive_response()?;
        self.firmware_version = token_after(&response, "FIRMWARE_VERSION:")
            .ok_or_else(|| Error::Protocol(response.clone()))?;
        self.serial_number = response
            .find("SERIAL_NUMBER:")
            .map(|p| response[p + 14..].trim().to_string())
            .ok_or_else(|| Error::Protocol(response.clone()))?;
        info!("firmware version: {}", self.firmware_version);
        info!("serial number: {}", self.serial_number);

        self.settings.back_right_offset =
            f64::from(self.read_eeprom_float(eeprom::BACK_RIGHT_OFFSET)?);
        self.settings.back_left_offset =
            f64::from(self.read_eeprom_float(eeprom::BACK_LEFT_OFFSET)?);
        self.settings.front_left_offset =
            f64::from(self.read_eeprom_float(eeprom::FRONT_LEFT_OFFSET)?);
        self.settings.front_right_offset =
            f64::from(self.read_eeprom_float(eeprom::FRONT_RIGHT_OFFSET)?);
        self.settings.bed_height_offset =
            f64::from(self.read_eeprom_float(eeprom::BED_HEIGHT_OFFSET)?);

        info!(
            "bed offsets: BR {} BL {} FL {} FR {} height {}",
            self.settings.back_right_offset,
            self.settings.back_left_offset,
            self.settings.front_left_offset,
            self.settings.front_right_offset,
            self.settings.bed_height_offset
        );

        self.settings.backlash_x = f64::from(self.read_eeprom_float(eeprom::BACKLASH_X)?);
        self.settings.backlash_y = f64::from(self.read_eeprom_float(eeprom::BACKLASH_Y)?);
        self.settings.backlash_speed =
            f64::from(self.read_eeprom_float(eeprom::BACKLASH_SPEED)?);
        if self.settings.backlash_speed <= 1.0 || self.settings.backlash_speed >= 5000.0 {
            warn!("implausible backlash speed, restoring the factory default");
            self.send_request_binary_str(&format!("M618 S22 P{BACKLASH_SPEED_DEFAULT_BITS}"))?;
            self.receive_response()?;
            self.settings.backlash_speed = 1500.0;
        }

        self.settings.back_right_orientation =
            f64::from(self.read_eeprom_float(eeprom::BACK_RIGHT_ORIENTATION)?);
        self.settings.back_left_orientation =
            f64::from(self.read_eeprom_float(eeprom::BACK_LEFT_ORIENTATION)?);
        self.settings.front_left_orientation =
            f64::from(self.read_eeprom_float(eeprom::FRONT_LEFT_ORIENTATION)?);
        self.settings.front_right_orientation =
            f64::from(self.read_eeprom_float(eeprom::FRONT_RIGHT_ORIENTATION)?);
        self.valid_bed_orientation = self.settings.orientation_valid();
        info!(
            "backlash: X {} Y {} speed {}; orientations: BR {} BL {} FL {} FR {}",
            self.settings.backlash_x,
            self.settings.backlash_y,
            self.settings.backlash_speed,
            self.settings.back_right_orientation,
            self.settings.back_left_orientation,
            self.settings.front_left_orientation,
            self.settings.front_right_orientation
        );

        self.send_request_binary_str("M117")?;
        let response = self.receive_response()?;
        self.valid_z = response.contains("ZV:1");
        self.status = response
            .find("S:")
            .and_then(|p| response[p + 2..].trim().split(' ').next())
            .and_then(|token| token.parse().ok())
            .unwrap_or(0);

        let filament = self.read_eeprom_u32(eeprom::FILAMENT_TYPE)?;
        self.settings.filament_location = match filament & 0xC0 {
            0x00 => FilamentLocation::NoLocation,
            0x40 => FilamentLocation::Internal,
            _ => FilamentLocation::External,
        };
        self.settings.filament_type = if filament & 0x3F < 4 {
            FilamentType::try_from((filament & 0x3F) as u8).unwrap_or(FilamentType::NoType)
        } else {
            FilamentType::NoType
        };
        self.settings.filament_color = self.read_eeprom_u32(eeprom::FILAMENT_COLOR)?;
        self.settings.filament_temperature =
            (self.read_eeprom_u32(eeprom::FILAMENT_TEMPERATURE)? as u16).saturating_add(100);

        info!(
            "filament: {:?} {:?} at {} degrees",
            self.settings.filament_type,
            self.settings.filament_location,
            self.settings.filament_temperature
        );

        if let Err(e) = self.settings.save() {
            warn!("could not persist settings: {e}");
        }
        Ok(())
    }

    /// Issue a command and wait for an `ok`, retrying the command until the
    /// firmware accepts it. Temperature chatter is skipped when asked.
    fn command_until_ok(&mut self, command: &str, skip_temperatures: bool) -> Result<()> {
        loop {
            self.send_request(command)?;
            let response = loop {
                let mut response = self.receive_response()?;
                if skip_temperatures {
                    while response.starts_with("T:") {
                        response = self.receive_response()?;
                    }
                }
                if !response.is_empty() {
                    break response;
                }
            };
            if response.starts_with("ok") {
                return Ok(());
            }
        }
    }

    fn run_probe_sequence(&mut self) -> Result<()> {
        self.command_until_ok("M104 S0", true)?;
        self.command_until_ok("G4 S10", false)?;
        self.command_until_ok("G91", false)?;
        self.command_until_ok("G0 Y20 Z2 F150", false)?;
        self.command_until_ok("M109 S150", false)?;
        self.command_until_ok("M104 S0", true)?;
        self.command_until_ok("M106 S0", false)?;
        self.command_until_ok("G30", false)?;
        self.command_until_ok("M577 F0", false)?;
        Ok(())
    }

    /// Re-measure the nozzle height above the bed.
    pub fn calibrate_z(&mut self) -> Result<()> {
        self.run_probe_sequence()?;
        self.valid_z = true;
        Ok(())
    }

    /// Re-measure the bed plane.
    pub fn calibrate_bed_orientation(&mut self) -> Result<()> {
        self.run_probe_sequence()?;
        self.valid_bed_orientation = true;
        Ok(())
    }

    /// Copy the input into the scratch directory, run the configured pipeline
    /// stages, and optionally export the processed result.
    pub fn process_file(&mut self, input: &Path, output: Option<&Path>) -> Result<PathBuf> {
        let scratch = self.work_dir.scratch_file();
        fs::copy(input, &scratch)?;
        info!("processing {}", input.display());

        let mut pipeline = Pipeline::new(&self.settings, self.stages);
        pipeline.run(&scratch)?;

        if let Some(output) = output {
            fs::copy(&scratch, output)?;
            fs::set_permissions(output, fs::Permissions::from_mode(0o644))?;
            fs::remove_file(&scratch)?;
            info!("{} was successfully created", output.display());
            return Ok(output.to_path_buf());
        }
        Ok(scratch)
    }

    /// Process and stream a file to the printer.
    pub fn print_file(&mut self, input: &Path) -> Result<()> {
        let scratch = self.process_file(input, None)?;
        info!("starting print");
        let link = self.link()?;
        let processed = executor::stream(link, &scratch)?;
        fs::remove_file(&scratch)?;
        info!("print finished, {processed} commands acknowledged");
        Ok(())
    }

    /// Bridge a virtual serial port to the printer until the far side closes.
    pub fn translator_mode(&mut self) -> Result<()> {
        let mut virtual_port = translator::VirtualPort::open()?;
        info!(
            "translation port established at {}",
            virtual_port.public_path().display()
        );
        let link = self.link.as_mut().ok_or(Error::Connect)?;
        translator::run(link, &mut virtual_port)
    }
}

/// Extract the whitespace-terminated token following `key`.
fn token_after(response: &str, key: &str) -> Option<String> {
    let position = response.find(key)? + key.len();
    let tail = &response[position..];
    let token = tail.split_whitespace().next()?;
    Some(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_extraction_from_device_info() {
        let response =
            "ok PROTOCOL:RepRap FIRMWARE_NAME:iMe FIRMWARE_VERSION:1900000001 SERIAL_NUMBER:BK15033001100";
        assert_eq!(
            token_after(response, "FIRMWARE_VERSION:").as_deref(),
            Some("1900000001")
        );
        assert_eq!(
            token_after(response, "SERIAL_NUMBER:").as_deref(),
            Some("BK15033001100")
        );
        assert_eq!(token_after(response, "MISSING:"), None);
    }
}
