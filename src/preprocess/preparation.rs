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

//! Preparation stage: wraps the sliced body in the machine's intro and outro.
//!
//! The intro heats, homes and primes the extruder. When the model does not
//! span the low-tier print area there is room to prime against a corner, which
//! leaves the priming excess off the part; otherwise the plain heat-soak
//! primer is used. The outro retracts, parks clear of the part and shuts
//! heaters, motors and fan down.

use std::io::{self, Write};
use std::path::Path;

use crate::bed::{PrintBounds, Tier, BED_LOW};
use crate::error::Result;
use crate::preprocess::{finish_stage, swap_in};
use crate::settings::{FilamentType, PrinterSettings};

pub(super) fn run(
    file: &Path,
    settings: &PrinterSettings,
    bounds: &PrintBounds,
    override_corner_excess: bool,
) -> Result<()> {
    let (temp, mut input, mut output) = swap_in(file)?;

    let mut corner_x = 0.0;
    let mut corner_y = 0.0;
    if !override_corner_excess {
        if bounds.max_x(Tier::Low) < BED_LOW.max_x {
            corner_x = (BED_LOW.max_x - BED_LOW.min_x) / 2.0;
        } else if bounds.min_x(Tier::Low) > BED_LOW.min_x {
            corner_x = -(BED_LOW.max_x - BED_LOW.min_x) / 2.0;
        }
        if bounds.max_y(Tier::Low) < BED_LOW.max_y {
            corner_y = (BED_LOW.max_y - BED_LOW.min_y - 10.0) / 2.0;
        } else if bounds.min_y(Tier::Low) > BED_LOW.min_y {
            corner_y = -(BED_LOW.max_y - BED_LOW.min_y - 10.0) / 2.0;
        }
    }

    let temperature = settings.filament_temperature;
    let fan = if settings.filament_type == FilamentType::Pla {
        "255"
    } else {
        "50"
    };

    writeln!(output, "M106 S{fan}")?;
    writeln!(output, "M17")?;
    writeln!(output, "G90")?;
    writeln!(output, "M104 S{temperature}")?;
    writeln!(output, "G0 Z5 F2900")?;
    writeln!(output, "G28")?;

    if corner_x == 0.0 || corner_y == 0.0 {
        // Standard heat-soak primer
        writeln!(output, "M18")?;
        writeln!(output, "M109 S{temperature}")?;
        writeln!(output, "G4 S2")?;
        writeln!(output, "M17")?;
        writeln!(output, "G91")?;
    } else {
        // Prime against the free corner and drag the excess away
        writeln!(output, "G91")?;
        writeln!(output, "G0 X{:.6} Y{:.6} F2900", -corner_x, -corner_y)?;
        writeln!(output, "M18")?;
        writeln!(output, "M109 S{temperature}")?;
        writeln!(output, "M17")?;
        writeln!(output, "G0 Z-4 F2900")?;
        writeln!(output, "G0 E7.5 F2000")?;
        writeln!(output, "G4 S3")?;
        writeln!(
            output,
            "G0 X{:.6} Y{:.6} Z-0.999 F2900",
            corner_x * 0.1,
            corner_y * 0.1
        )?;
        writeln!(
            output,
            "G0 X{:.6} Y{:.6} F1000",
            corner_x * 0.9,
            corner_y * 0.9
        )?;
    }

    writeln!(output, "G92 E0")?;
    writeln!(output, "G90")?;
    writeln!(output, "G0 Z0.4 F2400")?;

    // Body passes through untouched
    io::copy(&mut input, &mut output)?;

    writeln!(output, "G91")?;
    writeln!(output, "G0 E-1 F2000")?;
    writeln!(output, "G0 X5 Y5 F2000")?;
    writeln!(output, "G0 E-8 F2000")?;
    writeln!(output, "M104 S0")?;
    if bounds.max_z > 60.0 {
        if bounds.max_z < 110.0 {
            writeln!(output, "G0 Z3 F2900")?;
        }
        writeln!(output, "G90")?;
        writeln!(output, "G0 X90 Y84")?;
    } else {
        writeln!(output, "G0 Z3 F2900")?;
        writeln!(output, "G90")?;
        writeln!(output, "G0 X95 Y95")?;
    }
    writeln!(output, "M18")?;
    writeln!(output, "M107")?;

    finish_stage(&temp, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::testutil::{cleanup, lines, scratch};

    fn bounds_with_low(min_x: f64, max_x: f64, min_y: f64, max_y: f64, max_z: f64) -> PrintBounds {
        let mut bounds = PrintBounds::new();
        bounds.update(Tier::Low, min_x, min_y, 0.4);
        bounds.update(Tier::Low, max_x, max_y, max_z);
        bounds
    }

    #[test]
    fn spanning_model_gets_the_plain_primer() {
        let file = scratch("preparation-plain", "G1 X10 E1\n");
        let settings = PrinterSettings::default();
        // Spans the full low tier in both axes
        let bounds = bounds_with_low(0.0, 113.0, 0.0, 107.0, 0.4);
        run(&file, &settings, &bounds, false).unwrap();

        let rewritten = lines(&file);
        assert_eq!(rewritten[0], "M106 S255");
        assert_eq!(rewritten[3], "M104 S200");
        assert!(rewritten.contains(&"G4 S2".to_string()));
        assert!(!rewritten.iter().any(|l| l.starts_with("G0 E7.5")));
        // Body preserved between intro and outro
        assert!(rewritten.contains(&"G1 X10 E1".to_string()));
        // Short print parks at the near corner
        assert!(rewritten.contains(&"G0 X95 Y95".to_string()));
        cleanup(&file);
    }

    #[test]
    fn small_model_primes_against_a_corner() {
        let file = scratch("preparation-corner", "G1 X10 E1\n");
        let mut settings = PrinterSettings::default();
        settings.filament_type = FilamentType::Abs;
        let bounds = bounds_with_low(40.0, 70.0, 40.0, 60.0, 0.4);
        run(&file, &settings, &bounds, false).unwrap();

        let rewritten = lines(&file);
        assert_eq!(rewritten[0], "M106 S50");
        assert!(rewritten.iter().any(|l| l.starts_with("G0 E7.5")));
        assert!(rewritten
            .contains(&format!("G0 X{:.6} Y{:.6} F2900", -56.5, -48.5)));
        cleanup(&file);
    }

    #[test]
    fn tall_print_parks_without_z_hop() {
        let file = scratch("preparation-tall", "G1 X10 E1\n");
        let settings = PrinterSettings::default();
        let bounds = bounds_with_low(0.0, 113.0, 0.0, 107.0, 111.0);
        run(&file, &settings, &bounds, false).unwrap();

        let rewritten = lines(&file);
        assert!(rewritten.contains(&"G0 X90 Y84".to_string()));
        // Between 60 and 110 the outro lifts; above 110 it must not
        let outro = &rewritten[rewritten.len() - 8..];
        assert!(!outro.contains(&"G0 Z3 F2900".to_string()));
        cleanup(&file);
    }
}
