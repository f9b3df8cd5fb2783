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

//! Printer settings snapshot and its on-disk persistence.
//!
//! The settings file is a plain `Key: value` list at a fixed location,
//! owner-writable and world-readable, so third-party frontends can read the
//! calibration data without talking to the printer.

use std::fs;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::Result;

/// Fixed, well-known settings location.
pub const SETTINGS_PATH: &str = "/usr/share/micro-print/settings";

#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FilamentType {
    NoType = 0,
    Abs = 1,
    Pla = 2,
    Hips = 3,
    Other = 4,
}

impl Default for FilamentType {
    fn default() -> Self {
        Self::Pla
    }
}

impl FilamentType {
    /// Parse the user-facing name used by the CLI and slicer profiles.
    pub fn from_name(name: &str) -> FilamentType {
        match name {
            "ABS" => FilamentType::Abs,
            "PLA" => FilamentType::Pla,
            "HIPS" => FilamentType::Hips,
            "OTHER" => FilamentType::Other,
            _ => FilamentType::NoType,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FilamentLocation {
    NoLocation = 0,
    Internal = 1,
    External = 2,
}

impl Default for FilamentLocation {
    fn default() -> Self {
        Self::NoLocation
    }
}

/// Snapshot of every printer-derived value the pipeline and the session use.
#[derive(Clone, Debug)]
pub struct PrinterSettings {
    // Bed offsets
    pub back_right_offset: f64,
    pub back_left_offset: f64,
    pub front_left_offset: f64,
    pub front_right_offset: f64,
    pub bed_height_offset: f64,

    // Backlash
    pub backlash_x: f64,
    pub backlash_y: f64,
    pub backlash_speed: f64,

    // Bed orientation
    pub back_right_orientation: f64,
    pub back_left_orientation: f64,
    pub front_left_orientation: f64,
    pub front_right_orientation: f64,

    // Filament
    pub filament_type: FilamentType,
    pub filament_location: FilamentLocation,
    /// Raw color code as stored in the EEPROM; codes above 0x2C collapse to
    /// the generic "other" bucket when read back from the device.
    pub filament_color: u32,
    pub filament_temperature: u16,
}

impl Default for PrinterSettings {
    fn default() -> Self {
        PrinterSettings {
            back_right_offset: 0.0,
            back_left_offset: 0.0,
            front_left_offset: 0.0,
            front_right_offset: 0.0,
            bed_height_offset: 0.0,
            backlash_x: 0.3,
            backlash_y: 0.6,
            backlash_speed: 1500.0,
            back_right_orientation: 0.0,
            back_left_orientation: 0.0,
            front_left_orientation: 0.0,
            front_right_orientation: 0.0,
            filament_type: FilamentType::default(),
            filament_location: FilamentLocation::default(),
            filament_color: 0,
            filament_temperature: 200,
        }
    }
}

impl PrinterSettings {
    /// Whether the orientation readings look like a completed calibration:
    /// at least one corner non-zero and every corner within ±3 mm.
    pub fn orientation_valid(&self) -> bool {
        let corners = [
            self.back_right_orientation,
            self.back_left_orientation,
            self.front_left_orientation,
            self.front_right_orientation,
        ];
        corners.iter().any(|&c| c != 0.0) && corners.iter().all(|&c| (-3.0..=3.0).contains(&c))
    }

    /// Serialize to the given path, 0644, creating the parent directory.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
                fs::set_permissions(parent, fs::Permissions::from_mode(0o775))?;
            }
        }

        let mut file = fs::File::create(path)?;
        write!(file, "{}", self.serialize())?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(Path::new(SETTINGS_PATH))
    }

    fn serialize(&self) -> String {
        let mut out = String::new();
        let mut line = |key: &str, value: String| {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(&value);
            out.push('\n');
        };
        line("Back Right Offset", self.back_right_offset.to_string());
        line("Back Left Offset", self.back_left_offset.to_string());
        line("Front Left Offset", self.front_left_offset.to_string());
        line("Front Right Offset", self.front_right_offset.to_string());
        line("Bed Height Offset", self.bed_height_offset.to_string());
        line("Backlash X", self.backlash_x.to_string());
        line("Backlash Y", self.backlash_y.to_string());
        line("Backlash Speed", self.backlash_speed.to_string());
        line(
            "Back Right Orientation",
            self.back_right_orientation.to_string(),
        );
        line(
            "Back Left Orientation",
            self.back_left_orientation.to_string(),
        );
        line(
            "Front Left Orientation",
            self.front_left_orientation.to_string(),
        );
        line(
            "Front Right Orientation",
            self.front_right_orientation.to_string(),
        );
        line(
            "Filament Location",
            u8::from(self.filament_location).to_string(),
        );
        line("Filament Type", u8::from(self.filament_type).to_string());
        line("Filament Color", self.filament_color.to_string());
        line(
            "Filament Temperature",
            self.filament_temperature.to_string(),
        );
        out
    }

    /// Merge values from the given path into `self`, ignoring unknown lines.
    pub fn load_from(&mut self, path: &Path) -> Result<()> {
        let contents = fs::read_to_string(path)?;
        for line in contents.lines() {
            let Some(colon) = line.find(':') else {
                continue;
            };
            let value = line[colon + 1..].trim();
            match line[..colon].trim() {
                "Back Right Offset" => parse_into(value, &mut self.back_right_offset),
                "Back Left Offset" => parse_into(value, &mut self.back_left_offset),
                "Front Left Offset" => parse_into(value, &mut self.front_left_offset),
                "Front Right Offset" => parse_into(value, &mut self.front_right_offset),
                "Bed Height Offset" => parse_into(value, &mut self.bed_height_offset),
                "Backlash X" => parse_into(value, &mut self.backlash_x),
                "Backlash Y" => parse_into(value, &mut self.backlash_y),
                "Backlash Speed" => parse_into(value, &mut self.backlash_speed),
                "Back Right Orientation" => parse_into(value, &mut self.back_right_orientation),
                "Back Left Orientation" => parse_into(value, &mut self.back_left_orientation),
                "Front Left Orientation" => parse_into(value, &mut self.front_left_orientation),
                "Front Right Orientation" => parse_into(value, &mut self.front_right_orientation),
                "Filament Location" => {
                    if let Ok(code) = value.parse::<u8>() {
                        self.filament_location =
                            FilamentLocation::try_from(code).unwrap_or_default();
                    }
                }
                "Filament Type" => {
                    if let Ok(code) = value.parse::<u8>() {
                        self.filament_type = FilamentType::try_from(code).unwrap_or_default();
                    }
                }
                "Filament Color" => {
                    if let Ok(code) = value.parse::<u32>() {
                        self.filament_color = code;
                    }
                }
                "Filament Temperature" => {
                    if let Ok(temperature) = value.parse::<u16>() {
                        self.filament_temperature = temperature;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn load(&mut self) -> Result<()> {
        self.load_from(Path::new(SETTINGS_PATH))
    }
}

fn parse_into(value: &str, slot: &mut f64) {
    if let Ok(parsed) = value.parse() {
        *slot = parsed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip_through_file() {
        let mut original = PrinterSettings::default();
        original.backlash_x = 0.45;
        original.bed_height_offset = -0.2;
        original.filament_type = FilamentType::Abs;
        original.filament_temperature = 245;
        original.front_left_orientation = 1.25;

        let path = std::env::temp_dir().join("micro-print-settings-test");
        original.save_to(&path).unwrap();

        let mut loaded = PrinterSettings::default();
        loaded.load_from(&path).unwrap();
        assert_eq!(loaded.backlash_x, 0.45);
        assert_eq!(loaded.bed_height_offset, -0.2);
        assert_eq!(loaded.filament_type, FilamentType::Abs);
        assert_eq!(loaded.filament_temperature, 245);
        assert_eq!(loaded.front_left_orientation, 1.25);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn unknown_lines_are_ignored() {
        let path = std::env::temp_dir().join("micro-print-settings-unknown");
        std::fs::write(&path, "Nonsense: 42\nBacklash Y: 0.7\n").unwrap();
        let mut settings = PrinterSettings::default();
        settings.load_from(&path).unwrap();
        assert_eq!(settings.backlash_y, 0.7);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn orientation_validity_window() {
        let mut settings = PrinterSettings::default();
        assert!(!settings.orientation_valid());
        settings.back_left_orientation = 1.0;
        assert!(settings.orientation_valid());
        settings.front_right_orientation = 3.5;
        assert!(!settings.orientation_valid());
    }

    #[test]
    fn filament_type_names() {
        assert_eq!(FilamentType::from_name("PLA"), FilamentType::Pla);
        assert_eq!(FilamentType::from_name("HIPS"), FilamentType::Hips);
        assert_eq!(FilamentType::from_name("nylon"), FilamentType::NoType);
    }
}
