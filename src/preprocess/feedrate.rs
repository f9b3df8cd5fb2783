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

//! Feed-rate conversion stage: maps slicer feed rates (mm/min) onto the
//! inverted speed scale the firmware expects.

use std::io::{BufRead, Write};
use std::path::Path;

use crate::error::Result;
use crate::gcode::Command;
use crate::preprocess::{finish_stage, swap_in};

const MAX_FEED_RATE: f64 = 60.0001;

pub(super) fn run(file: &Path) -> Result<()> {
    let (temp, input, mut output) = swap_in(file)?;
    let mut command = Command::new();

    for line in input.lines() {
        let line = line?;
        if command.parse_line(&line) && command.has_value('G') && command.has_value('F') {
            let mut feed_rate: f64 = command.value('F').parse().unwrap_or(0.0) / 60.0;
            if feed_rate > MAX_FEED_RATE {
                feed_rate = MAX_FEED_RATE;
            }
            command.set_value(
                'F',
                format!("{:.6}", 30.0 + (1.0 - feed_rate / MAX_FEED_RATE) * 800.0),
            );
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
    fn mid_range_feed_rate_maps_onto_the_inverted_scale() {
        let file = scratch("feedrate-mid", "G1 X1 F3000\n");
        run(&file).unwrap();
        let rewritten = lines(&file);
        let f: f64 = rewritten[0]
            .split_whitespace()
            .find(|t| t.starts_with('F'))
            .map(|t| t[1..].parse().unwrap())
            .unwrap();
        // 3000/60 = 50; 30 + (1 - 50/60.0001) * 800
        assert!((f - 163.335).abs() < 1e-3);
        cleanup(&file);
    }

    #[test]
    fn feed_rates_at_the_cap_clamp_to_the_floor() {
        let file = scratch("feedrate-cap", "G0 X1 F99999\n");
        run(&file).unwrap();
        let rewritten = lines(&file);
        assert!(rewritten[0].contains("F30.000000"));
        cleanup(&file);
    }

    #[test]
    fn commands_without_g_or_f_pass_through() {
        let file = scratch("feedrate-passthrough", "M104 S200\nG28\n;comment\n");
        run(&file).unwrap();
        assert_eq!(lines(&file), vec!["M104 S200", "G28", ";comment"]);
        cleanup(&file);
    }
}
