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

//! Print-dimension scan. Reads the file without rewriting it, accumulating the
//! extruder's extents per tier, and optionally rejects the first motion that
//! leaves the printable volume.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::bed::{PrintBounds, Tier, BED_HIGH, BED_LOW};
use crate::error::{Error, Result};
use crate::gcode::Command;
use crate::motion::MotionState;

/// Scan the file tracking motion from the physical start position, collecting
/// per-tier extents. With `enforce` set, any motion outside its tier (or any Z
/// outside the machine's total height range) fails with [`Error::Dimensions`].
pub(super) fn scan(file: &Path, enforce: bool) -> Result<PrintBounds> {
    let input = BufReader::new(File::open(file)?);
    let mut state = MotionState::seeded(0.4);
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
            if enforce
                && (state.absolute_z < BED_LOW.min_z || state.absolute_z > BED_HIGH.max_z)
            {
                return Err(Error::Dimensions);
            }
            tier = Tier::for_z(state.absolute_z);
        }

        if enforce {
            let limits = tier.bounds();
            if state.absolute_x < limits.min_x
                || state.absolute_x > limits.max_x
                || state.absolute_y < limits.min_y
                || state.absolute_y > limits.max_y
            {
                return Err(Error::Dimensions);
            }
        }

        bounds.update(tier, state.absolute_x, state.absolute_y, state.absolute_z);
    }
    Ok(bounds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::testutil::{cleanup, scratch};

    #[test]
    fn in_bounds_file_passes_and_reports_extents() {
        let file = scratch(
            "dimension-ok",
            "G90\nG1 X10 Y10 Z0.4\nG1 X100 Y100\nG1 Z10 X50 Y50\n",
        );
        let bounds = scan(&file, true).unwrap();
        assert_eq!(bounds.min_x(Tier::Low), 10.0);
        assert_eq!(bounds.max_x(Tier::Low), 100.0);
        assert_eq!(bounds.max_x(Tier::Medium), 50.0);
        assert_eq!(bounds.max_z, 10.0);
        cleanup(&file);
    }

    #[test]
    fn z_above_machine_height_is_rejected() {
        let file = scratch("dimension-z", "G90\nG1 Z120\n");
        assert!(matches!(scan(&file, true), Err(Error::Dimensions)));
        cleanup(&file);
    }

    #[test]
    fn xy_outside_tier_is_rejected() {
        // 113 is fine in the low tier but far outside the medium tier
        let file = scratch("dimension-xy", "G90\nG1 X112 Y50 Z0.4\nG1 Z10\n");
        assert!(matches!(scan(&file, true), Err(Error::Dimensions)));
        cleanup(&file);
    }

    #[test]
    fn ignoring_limits_still_collects_bounds() {
        let file = scratch("dimension-ignore", "G90\nG1 Z120 X50 Y50\n");
        let bounds = scan(&file, false).unwrap();
        assert_eq!(bounds.max_z, 120.0);
        cleanup(&file);
    }

    #[test]
    fn relative_moves_accumulate_in_the_scan() {
        let file = scratch("dimension-relative", "G91\nG1 X10\nG1 X10\nG90\n");
        let bounds = scan(&file, true).unwrap();
        // Seeded at X=54, two relative 10 mm moves
        assert_eq!(bounds.max_x(Tier::Low), 74.0);
        cleanup(&file);
    }
}
