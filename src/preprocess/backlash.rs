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

//! Backlash-compensation stage: whenever an axis reverses travel direction, a
//! short extra move takes up the mechanical slack before the real move runs.
//! The compensation is cumulative, so every following coordinate on that axis
//! is shifted by the total slack taken up so far.

use std::io::{BufRead, Write};
use std::path::Path;

use crate::error::Result;
use crate::gcode::Command;
use crate::motion::{Direction, MotionState};
use crate::preprocess::{finish_stage, swap_in};
use crate::settings::PrinterSettings;

pub(super) fn run(file: &Path, settings: &PrinterSettings) -> Result<()> {
    let (temp, input, mut output) = swap_in(file)?;

    let mut state = MotionState::new();
    let mut value_f = String::from("1000");
    let mut previous_x = Direction::Neither;
    let mut previous_y = Direction::Neither;
    let mut compensation_x = 0.0f64;
    let mut compensation_y = 0.0f64;

    for line in input.lines() {
        let line = line?;
        let mut command = Command::new();
        if command.parse_line(&line) && command.has_value('G') {
            match command.value('G') {
                "0" | "1" if !state.relative_mode => {
                    if command.has_value('F') {
                        value_f = command.value('F').to_string();
                    }

                    let before = state;
                    let delta = state.apply(&command);

                    // A still axis keeps its previous direction
                    let direction_x = match delta.direction_x {
                        Direction::Neither => previous_x,
                        moved => moved,
                    };
                    let direction_y = match delta.direction_y {
                        Direction::Neither => previous_y,
                        moved => moved,
                    };

                    let reversed_x =
                        direction_x != previous_x && previous_x != Direction::Neither;
                    let reversed_y =
                        direction_y != previous_y && previous_y != Direction::Neither;

                    if reversed_x || reversed_y {
                        let mut extra = Command::new();
                        extra.set_value('G', command.value('G'));
                        if reversed_x {
                            compensation_x += settings.backlash_x
                                * if direction_x == Direction::Positive {
                                    1.0
                                } else {
                                    -1.0
                                };
                        }
                        if reversed_y {
                            compensation_y += settings.backlash_y
                                * if direction_y == Direction::Positive {
                                    1.0
                                } else {
                                    -1.0
                                };
                        }
                        extra.set_value('X', format!("{:.6}", before.x + compensation_x));
                        extra.set_value('Y', format!("{:.6}", before.y + compensation_y));
                        extra.set_value('F', format!("{:.6}", settings.backlash_speed));
                        writeln!(output, "{extra}")?;

                        command.set_value('F', value_f.clone());
                    }

                    if command.has_value('X') {
                        let x: f64 = command.value('X').parse().unwrap_or(0.0);
                        command.set_value('X', format!("{:.6}", x + compensation_x));
                    }
                    if command.has_value('Y') {
                        let y: f64 = command.value('Y').parse().unwrap_or(0.0);
                        command.set_value('Y', format!("{:.6}", y + compensation_y));
                    }

                    previous_x = direction_x;
                    previous_y = direction_y;
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
