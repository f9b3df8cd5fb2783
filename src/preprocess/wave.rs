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

//! Wave-bonding stage: modulates first-layer extrusions with a square-ish Z
//! wave so the filament is pressed into the bed at regular intervals, and
//! inserts tack-point dwells ahead of sharp corners so fresh filament can set.
//!
//! Only the first slicer layer (between the first and second `;LAYER:` markers)
//! is touched. Extruding moves are split into quarter-period sub-segments with
//! interpolated X/Y/E; each sub-segment's Z runs through the repeating offset
//! pattern `{+1, 0, -1.5, 0} x WAVE_SIZE`.

use std::io::{BufRead, Write};
use std::path::Path;

use crate::error::Result;
use crate::gcode::Command;
use crate::geometry::{create_tack_point, is_sharp_corner};
use crate::motion::MotionState;
use crate::preprocess::{finish_stage, swap_in};

const WAVE_PERIOD: f64 = 5.0;
const WAVE_PERIOD_QUARTER: f64 = WAVE_PERIOD / 4.0;
const WAVE_SIZE: f64 = 0.15;

/// Next Z offset in the four-step wave pattern.
fn current_adjustment_z(wave_step: &mut u8) -> f64 {
    let adjustment = match *wave_step {
        0 => 1.0,
        2 => -1.5,
        _ => 0.0,
    };
    *wave_step = (*wave_step + 1) % 4;
    adjustment * WAVE_SIZE
}

pub(super) fn run(file: &Path) -> Result<()> {
    let (temp, input, mut output) = swap_in(file)?;

    let mut state = MotionState::new();
    let mut previous = Command::new();
    let mut reference = Command::new();
    let mut changes_plane = false;
    let mut corner_counter = 0u32;
    let mut layer_counter = 0u32;
    let mut wave_step = 0u8;

    for line in input.lines() {
        let line = line?;
        if line.contains(";LAYER:") {
            layer_counter += 1;
        }

        let mut command = Command::new();
        if command.parse_line(&line) && layer_counter == 1 && command.has_value('G') {
            match command.value('G') {
                "0" | "1" if !state.relative_mode => {
                    if command.has_value('X') || command.has_value('Y') {
                        changes_plane = true;
                    }

                    let before = state;
                    let delta = state.apply(&command);

                    let wave_ratio = if delta.distance > WAVE_PERIOD_QUARTER {
                        (delta.distance / WAVE_PERIOD_QUARTER).ceil() as u32
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
                        if !previous.is_empty() {
                            if corner_counter <= 1 && is_sharp_corner(&command, &previous) {
                                if reference.is_empty() {
                                    let tack = create_tack_point(&command, &previous);
                                    if !tack.is_empty() {
                                        writeln!(output, "{tack}")?;
                                    }
                                }
                                reference = command.clone();
                                corner_counter += 1;
                            } else if corner_counter >= 1 && is_sharp_corner(&command, &reference)
                            {
                                let tack = create_tack_point(&command, &reference);
                                if !tack.is_empty() {
                                    writeln!(output, "{tack}")?;
                                }
                                reference = command.clone();
                            }
                        }

                        for i in 1..=wave_ratio {
                            let step = f64::from(i) * WAVE_PERIOD_QUARTER;
                            let (temp_x, temp_y, temp_z, temp_e) = if i == wave_ratio {
                                (state.x, state.y, state.z, state.e)
                            } else {
                                (
                                    before.x + step * ratio_x,
                                    before.y + step * ratio_y,
                                    before.z + step * ratio_z,
                                    before.e + step * ratio_e,
                                )
                            };

                            if i != wave_ratio {
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
                                    extra.set_value(
                                        'Z',
                                        format!(
                                            "{:.6}",
                                            temp_z + current_adjustment_z(&mut wave_step)
                                        ),
                                    );
                                } else if command.has_value('Z') && delta.dz != f64::EPSILON {
                                    extra.set_value('Z', format!("{temp_z:.6}"));
                                }
                                extra.set_value('E', format!("{temp_e:.6}"));
                                writeln!(output, "{extra}")?;
                            } else if changes_plane {
                                let adjustment = current_adjustment_z(&mut wave_step);
                                if command.has_value('Z') {
                                    let z: f64 = command.value('Z').parse().unwrap_or(0.0);
                                    command.set_value('Z', format!("{:.6}", z + adjustment));
                                } else {
                                    command.set_value(
                                        'Z',
                                        format!("{:.6}", before.z + delta.dz + adjustment),
                                    );
                                }
                            }
                        }
                    }

                    previous = command.clone();
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
