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

//! Validation stage: strips slicer commands the firmware does not implement
//! (`M82`/`M83` extruder modes, `G21` unit selection) and tool-change
//! parameters from everything else.

use std::io::{BufRead, Write};
use std::path::Path;

use crate::error::Result;
use crate::gcode::Command;
use crate::preprocess::{finish_stage, swap_in};

pub(super) fn run(file: &Path) -> Result<()> {
    let (temp, input, mut output) = swap_in(file)?;
    let mut command = Command::new();

    for line in input.lines() {
        let line = line?;
        if command.parse_line(&line) {
            if (command.has_value('M')
                && (command.value('M') == "82" || command.value('M') == "83"))
                || (command.has_value('G') && command.value('G') == "21")
            {
                continue;
            }
            if command.has_parameter('T') {
                command.remove_parameter('T');
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
    fn unsupported_commands_are_dropped() {
        let file = scratch("validation", "M82\nG21\nG1 X5 T0\nM83\nG28\n");
        run(&file).unwrap();
        assert_eq!(lines(&file), vec!["G1 X5", "G28"]);
        cleanup(&file);
    }

    #[test]
    fn bare_tool_selection_collapses_to_an_empty_line() {
        let file = scratch("validation-tool", "T1\nG28\n");
        run(&file).unwrap();
        assert_eq!(lines(&file), vec!["", "G28"]);
        cleanup(&file);
    }
}
