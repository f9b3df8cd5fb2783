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

//! Host-side driver and G-code toolchain for Micro 3D-class printers.
//!
//! # Usage
//! Create a [`printer::Printer`], call [`printer::Printer::connect`], collect the
//! device settings and either stream a sliced file to the device or run one of the
//! maintenance operations (firmware flashing, calibration, translation).
//!
//! The G-code handling is usable without a device: [`gcode::Command`] parses and
//! serializes single commands (including the binary wire encoding), and
//! [`preprocess::Pipeline`] runs the file-to-file pre-processor stages against a
//! settings snapshot.

pub mod bed;
pub mod eeprom;
pub mod error;
pub mod executor;
pub mod firmware;
pub mod gcode;
pub mod geometry;
pub mod link;
pub mod motion;
pub mod preprocess;
pub mod printer;
pub mod rom;
pub mod settings;
pub mod translator;

pub use error::{Error, Result};
pub use gcode::Command;
pub use printer::Printer;
