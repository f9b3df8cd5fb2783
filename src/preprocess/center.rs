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

//! Center-model stage: measures the model's overall footprint, then shifts
//! every X/Y so the bounding box sits centered on the low-tier print area.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::bed::{PrintBounds, Tier, BED_LOW};
use crate::error::Result;
use crate::gcode::Command;
use crate::motion::MotionState;
use crate::preprocess::{finish_stage, swap_in};

/// Rewrite the file centered on the bed. Returns the extents *after* the
/// displacement, so the dimension check can reuse them.
pub(super) fn run(file: &Path) -> Result<PrintBounds> {
    // First pass: measure. The centering scan seeds Z at the bed surface.
    let mut bounds = measure(file)?;

    let displacement_x = (BED_LOW.max_x - bounds.overall_max_x() - bounds.overall_min_x()
        + BED_LOW.min_x)
        / 2.0;
    let displacement_y = (BED_LOW.max_y - bounds.overall_max_y() - bounds.overall_min_y()
        + BED_LOW.min_y)
        / 2.0;
    bounds.displace(displacement_x, displacement_y);

    // Second pass: shift every G command carrying X or Y
    let (temp, input, mut output) = swap_in(file)?;
    let mut command = Command::new();
    for line in input.lines() {
        let line = line?;
        if command.parse_line(&line) && command.has_value('G') {
            if command.has_value('X') {
                let x: f64 = command.value('X').parse().unwrap_or(0.0);
                command.set_value('X', format!("{:.6}", x + displacement_x));
            }
            if command.has_value('Y') {
                let y: f64 = command.value('Y').parse().unwrap_or(0.0);
                command.set_value('Y', format!("{:.6}", y + displacement_y));
            }
        }
        writeln!(output, "{command}")?;
    }
    finish_stage(&temp, output)?;
    Ok(bounds)
}

fn measure(file: &Path) -> Result<PrintBounds> {
    let input = BufReader::new(File::open(file)?);
    let mut state = MotionState::seeded(0.0);
    let mut tier = Tier::Low;
    let mut bounds = PrintBounds::new();
    let mut command = Command::new();

    for line in input.lines() {
        let line = line?;
        if !command.parse_line(&line) || !command.has_value('G') {
            continue;
        }
        let delta = state.apply(&command);
        if !delta.moved {
            continue;
        }
        if command.has_value('Z') {
            tier = Tier::for_z(state.absolute_z);
        }
        bounds.update(tier, state.absolute_x, state.absolute_y, state.absolute_z);
    }
    Ok(bounds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::testutil::{cleanup, lines, scratch};

    #[test]
    fn model_is_centered_on_the_low_tier() {
        let file = scratch(
            "center-basic",
            "G90\nG1 X10 Y10 Z0.4 E1\nG1 X30 Y20 E2\n",
        );
        let bounds = run(&file).unwrap();

        // Midpoint of the shifted extents must be the bed midpoint
        let mid_x = (bounds.min_x(Tier::Low) + bounds.max_x(Tier::Low)) / 2.0;
        let mid_y = (bounds.min_y(Tier::Low) + bounds.max_y(Tier::Low)) / 2.0;
        assert!((mid_x - (BED_LOW.min_x + BED_LOW.max_x) / 2.0).abs() < 1e-9);
        assert!((mid_y - (BED_LOW.min_y + BED_LOW.max_y) / 2.0).abs() < 1e-9);

        // The file was rewritten with the displacement applied
        let rewritten = lines(&file);
        assert_eq!(rewritten[0], "G90");
        assert!(rewritten[1].starts_with("G1 X46.5"));
        cleanup(&file);
    }

    #[test]
    fn comments_and_unparsed_lines_survive() {
        let file = scratch("center-comments", ";LAYER:0\nG1 X10 Y10 E1\n\n");
        run(&file).unwrap();
        let rewritten = lines(&file);
        assert_eq!(rewritten[0], ";LAYER:0");
        assert_eq!(rewritten[2], "");
        cleanup(&file);
    }
}
