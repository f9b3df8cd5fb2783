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

//! Thermal-bonding stage: runs the first layer hotter than the target
//! temperature so it fuses to the bed, then drops back at the second layer and
//! strips any further temperature or fan fiddling the slicer emitted. When
//! wave bonding is off, the first layer also gets the sharp-corner tack points.

use std::io::{BufRead, Write};
use std::path::Path;

use crate::error::Result;
use crate::gcode::Command;
use crate::geometry::{create_tack_point, is_sharp_corner};
use crate::preprocess::{finish_stage, swap_in};
use crate::settings::{FilamentType, PrinterSettings};

/// Safe extruder range.
fn bounded_temperature(temperature: u16) -> u16 {
    temperature.clamp(150, 285)
}

pub(super) fn run(
    file: &Path,
    settings: &PrinterSettings,
    wave_bonding_active: bool,
) -> Result<()> {
    let (temp, input, mut output) = swap_in(file)?;

    let mut previous = Command::new();
    let mut reference = Command::new();
    let mut layer_counter = 0u32;
    let mut corner_counter = 0u32;
    let mut relative_mode = false;

    for line in input.lines() {
        let line = line?;

        if layer_counter < 2 && line.contains(";LAYER:") {
            if layer_counter == 0 {
                let boost = if settings.filament_type == FilamentType::Pla {
                    10
                } else {
                    15
                };
                writeln!(
                    output,
                    "M109 S{}",
                    bounded_temperature(settings.filament_temperature + boost)
                )?;
            } else {
                writeln!(output, "M104 S{}", settings.filament_temperature)?;
            }
            layer_counter += 1;
        }

        let mut command = Command::new();
        if command.parse_line(&line) {
            if layer_counter > 0
                && command.has_value('M')
                && matches!(
                    command.value('M'),
                    "104" | "105" | "106" | "107" | "109"
                )
            {
                continue;
            }

            if layer_counter == 1 {
                if !wave_bonding_active && command.has_value('G') {
                    if matches!(command.value('G'), "0" | "1") && !relative_mode {
                        let bonds = matches!(
                            settings.filament_type,
                            FilamentType::Abs | FilamentType::Hips | FilamentType::Pla
                        );
                        if !previous.is_empty() && bonds {
                            if corner_counter <= 1 {
                                if is_sharp_corner(&command, &previous) {
                                    if reference.is_empty() {
                                        let tack = create_tack_point(&command, &previous);
                                        if !tack.is_empty() {
                                            writeln!(output, "{tack}")?;
                                        }
                                    }
                                    reference = command.clone();
                                    corner_counter += 1;
                                }
                            } else if is_sharp_corner(&command, &reference) {
                                let tack = create_tack_point(&command, &reference);
                                if !tack.is_empty() {
                                    writeln!(output, "{tack}")?;
                                }
                                reference = command.clone();
                            }
                        }
                    } else if command.value('G') == "90" {
                        relative_mode = false;
                    } else if command.value('G') == "91" {
                        relative_mode = true;
                    }
                }

                previous = command.clone();
            }
        }

        writeln!(output, "{command}")?;
    }

    finish_stage(&temp, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::testutil::{cleanup, lines, scratch};

    #[test]
    fn first_layer_runs_hotter_then_drops_back() {
        let file = scratch(
            "thermal-basic",
            ";LAYER:0\nG1 X10 E1\n;LAYER:1\nG1 X20 E2\n",
        );
        let settings = PrinterSettings::default();
        run(&file, &settings, true).unwrap();
        let rewritten = lines(&file);
        // PLA boosts by 10 over the 200 degree default
        assert_eq!(rewritten[0], "M109 S210");
        assert!(rewritten.contains(&"M104 S200".to_string()));
        let m104_at = rewritten.iter().position(|l| l == "M104 S200").unwrap();
        assert_eq!(rewritten[m104_at + 1], ";LAYER:1");
        cleanup(&file);
    }

    #[test]
    fn abs_boost_is_fifteen_and_clamped() {
        let file = scratch("thermal-abs", ";LAYER:0\n");
        let mut settings = PrinterSettings::default();
        settings.filament_type = FilamentType::Abs;
        settings.filament_temperature = 280;
        run(&file, &settings, true).unwrap();
        // 280 + 15 clamps to 285
        assert_eq!(lines(&file)[0], "M109 S285");
        cleanup(&file);
    }

    #[test]
    fn slicer_temperature_commands_are_stripped_after_layer_zero() {
        let file = scratch(
            "thermal-strip",
            "M104 S230\n;LAYER:0\nM106 S255\nG1 X10 E1\nM109 S240\n",
        );
        let settings = PrinterSettings::default();
        run(&file, &settings, true).unwrap();
        let rewritten = lines(&file);
        // The pre-layer M104 survives, the in-layer fan and heat commands go
        assert!(rewritten.contains(&"M104 S230".to_string()));
        assert!(!rewritten.contains(&"M106 S255".to_string()));
        assert!(!rewritten.contains(&"M109 S240".to_string()));
        cleanup(&file);
    }

    #[test]
    fn sharp_corners_get_tack_points_when_wave_bonding_is_off() {
        // Two long unit-angle moves around a corner; the second forms a sharp
        // corner with the first under the raw-vector test
        let file = scratch(
            "thermal-tack",
            ";LAYER:0\nG90\nG1 X1 Y0 E1\nG1 X1 Y1 E2\n",
        );
        let settings = PrinterSettings::default();
        run(&file, &settings, false).unwrap();
        let rewritten = lines(&file);
        // Corner detected but the points are a fraction of a millimeter apart,
        // so no dwell is long enough to emit
        assert!(!rewritten.iter().any(|l| l.starts_with("G4 P")));

        // Far-apart sharp corner does emit a dwell
        let file2 = scratch(
            "thermal-tack-far",
            ";LAYER:0\nG90\nG1 X20 Y0 E1\nG1 X0.3 Y0.2 E2\n",
        );
        run(&file2, &settings, false).unwrap();
        let rewritten = lines(&file2);
        assert!(rewritten.iter().any(|l| l.starts_with("G4 P")));
        cleanup(&file);
        cleanup(&file2);
    }
}
