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

//! Bed-compensation stage: lifts every Z by the stored bed height offset and
//! warps extruding moves to follow the measured bed plane. Extrusions are cut
//! into short segments and each segment's Z picks up the interpolated height
//! of the bed under its physical position.

use std::io::{BufRead, Write};
use std::path::Path;

use crate::error::Result;
use crate::gcode::Command;
use crate::geometry::{height_adjustment, CornerHeights};
use crate::motion::MotionState;
use crate::preprocess::{finish_stage, swap_in};
use crate::settings::PrinterSettings;

const SEGMENT_LENGTH: f64 = 2.0;

pub(super) fn run(file: &Path, settings: &PrinterSettings) -> Result<()> {
    let (temp, input, mut output) = swap_in(file)?;

    let corners = CornerHeights {
        back_right: settings.back_right_orientation + settings.back_right_offset,
        back_left: settings.back_left_orientation + settings.back_left_offset,
        front_left: settings.front_left_orientation + settings.front_left_offset,
        front_right: settings.front_right_orientation + settings.front_right_offset,
    };

    let mut state = MotionState::new();
    let mut changes_plane = false;

    for line in input.lines() {
        let line = line?;
        let mut command = Command::new();
        if command.parse_line(&line) && command.has_value('G') {
            match command.value('G') {
                "0" | "1" if !state.relative_mode => {
                    if command.has_value('X') || command.has_value('Y') {
                        changes_plane = true;
                    }
                    if command.has_value('Z') {
                        let z: f64 = command.value('Z').parse().unwrap_or(0.0);
                        command
                            .set_value('Z', format!("{:.6}", z + settings.bed_height_offset));
                    }

                    let before = state;
                    let delta = state.apply(&command);

                    let segments = if delta.distance > SEGMENT_LENGTH {
                        (delta.distance / SEGMENT_LENGTH).ceil() as u32
                    } else {
                        1
                    };
                    let (ratio_x, ratio_y, ratio_z, ratio_e) = if delta.distance != 0.0 {
                        (
                            delta.dx / delta.distance,
                            delta.dy / delta.distance,
                            delta.dz / delta.distance,
                            delta.de / delta.distance,
                        )
                    } else {
                        (0.0, 0.0, 0.0, 0.0)
                    };

                    if delta.de > 0.0 {
                        for i in 1..=segments {
                            let step = f64::from(i) * SEGMENT_LENGTH;
                            let (physical_x, physical_y, temp_x, temp_y, temp_z, temp_e) =
                                if i == segments {
                                    (
                                        state.absolute_x,
                                        state.absolute_y,
                                        state.x,
                                        state.y,
                                        state.z,
                                        state.e,
                                    )
                                } else {
                                    (
                                        before.absolute_x + step * ratio_x,
                                        before.absolute_y + step * ratio_y,
                                        before.x + step * ratio_x,
                                        before.y + step * ratio_y,
                                        before.z + step * ratio_z,
                                        before.e + step * ratio_e,
                                    )
                                };

                            let height = height_adjustment(physical_x, physical_y, &corners);

                            if i != segments {
                                let mut extra = Command::new();
                                extra.set_value('G', command.value('G'));
                                if command.has_value('X') {
                                    extra.set_value('X', format!("{temp_x:.6}"));
                                }
                                if command.has_value('Y') {
                                    extra.set_value('Y', format!("{temp_y:.6}"));
                                }
                                if command.has_value('F') && i == 1 {
                                    extra.set_value('F', command.value('F'));
                                }
                                if changes_plane {
                                    extra.set_value('Z', format!("{:.6}", temp_z + height));
                                } else if command.has_value('Z') && delta.dz != f64::EPSILON {
                                    extra.set_value('Z', format!("{temp_z:.6}"));
                                }
                                extra.set_value('E', format!("{temp_e:.6}"));
                                writeln!(output, "{extra}")?;
                            } else if changes_plane {
                                if command.has_value('Z') {
                                    let z: f64 = command.value('Z').parse().unwrap_or(0.0);
                                    command.set_value('Z', format!("{:.6}", z + height));
                                } else {
                                    command.set_value(
                                        'Z',
                                        format!("{:.6}", before.z + delta.dz + height),
                                    );
                                }
                            }
                        }
                    } else if changes_plane {
                        // Non-extruding move: one adjustment at the destination
                        let height =
                            height_adjustment(state.absolute_x, state.absolute_y, &corners);
                        if command.has_value('Z') {
                            let z: f64 = command.value('Z').parse().unwrap_or(0.0);
                            command.set_value('Z', format!("{:.6}", z + height));
                        } else {
                            command.set_value('Z', format!("{:.6}", state.z + height));
                        }
                    }
                }
                "92" => {
                    if !command.has_value('X')
                        && !command.has_value('Y')
                        && !command.has_value('Z')
                        && !command.has_value('E')
                    {
                        command.set_value('X', "0");
                        command.set_value('Y', "0");
                        command.set_value('Z', "0");
                        command.set_value('E', "0");
                    }
                    state.apply(&command);
                }
                _ => {
                    state.apply(&command);
                }
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
    fn flat_bed_only_applies_the_height_offset() {
        let file = scratch("bed-flat", "G90\nG1 X4 Y0 Z0.4 E1\n");
        let mut settings = PrinterSettings::default();
        settings.bed_height_offset = 0.1;
        run(&file, &settings).unwrap();
        let rewritten = lines(&file);
        // Distance 4 -> two segments: one synthetic, then the original with
        // offset Z
        let moves: Vec<&String> = rewritten.iter().filter(|l| l.starts_with("G1")).collect();
        assert_eq!(moves.len(), 2);
        assert!(moves[0].contains("X2.000000"));
        assert!(moves[1].contains("Z0.500000"));
        cleanup(&file);
    }

    #[test]
    fn short_extrusions_stay_single_commands() {
        let file = scratch("bed-short", "G90\nG1 X1 Y0 Z0.4 E1\n");
        let settings = PrinterSettings::default();
        run(&file, &settings).unwrap();
        let rewritten = lines(&file);
        assert_eq!(
            rewritten.iter().filter(|l| l.starts_with("G1")).count(),
            1
        );
        cleanup(&file);
    }

    #[test]
    fn travel_moves_get_one_destination_adjustment() {
        let file = scratch("bed-travel", "G90\nG1 X99 Y95\n");
        let mut settings = PrinterSettings::default();
        settings.back_right_orientation = 1.0;
        run(&file, &settings).unwrap();
        let rewritten = lines(&file);
        let with_z = rewritten
            .iter()
            .find(|l| l.starts_with("G1") && l.contains('Z'))
            .expect("adjusted move");
        // Destination sits on the raised back-right corner
        let z: f64 = with_z
            .split_whitespace()
            .find(|t| t.starts_with('Z'))
            .map(|t| t[1..].parse().unwrap())
            .unwrap();
        assert!(z > 0.4);
        cleanup(&file);
    }
}
