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

//! The G-code pre-processor pipeline.
//!
//! Every stage is a file-to-file rewrite of the scratch copy inside the working
//! directory: the current file is renamed aside, read line by line, and a new
//! file is written in its place; the temporary is removed on success. Stages
//! share the motion tracker and run in a fixed order:
//!
//! 1. center model
//! 2. print-dimension check (verdict only, never rewrites)
//! 3. validation
//! 4. preparation (intro/outro)
//! 5. wave bonding
//! 6. thermal bonding
//! 7. bed compensation
//! 8. backlash compensation
//! 9. feed-rate conversion

mod backlash;
mod bed_level;
mod center;
mod dimension;
mod feedrate;
mod preparation;
mod thermal;
mod validation;
mod wave;

use std::env;
use std::ffi::CString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use derive_builder::Builder;
use log::info;

use crate::bed::PrintBounds;
use crate::error::{Error, Result};
use crate::settings::PrinterSettings;

/// Which stages a processing run applies, plus the bounds-enforcement switch.
#[derive(Default, Builder, Clone, Copy)]
#[builder(default, setter(into))]
pub struct StageSet {
    pub center_model: bool,
    pub validation: bool,
    pub preparation: bool,
    pub wave_bonding: bool,
    pub thermal_bonding: bool,
    pub bed_compensation: bool,
    pub backlash_compensation: bool,
    pub feed_rate_conversion: bool,
    /// Skip the printable-volume rejection (the scan still collects bounds).
    pub ignore_print_dimensions: bool,
}

/// Runs the enabled stages over one scratch file.
pub struct Pipeline<'a> {
    settings: &'a PrinterSettings,
    stages: StageSet,
    bounds: PrintBounds,
}

impl<'a> Pipeline<'a> {
    pub fn new(settings: &'a PrinterSettings, stages: StageSet) -> Self {
        Pipeline {
            settings,
            stages,
            bounds: PrintBounds::new(),
        }
    }

    /// Model extents, valid after [`Pipeline::run`].
    pub fn bounds(&self) -> &PrintBounds {
        &self.bounds
    }

    /// Apply the enabled stages to `file` in order. Fails on I/O errors or
    /// when the model leaves the printable volume.
    pub fn run(&mut self, file: &Path) -> Result<()> {
        if self.stages.center_model {
            self.bounds = center::run(file)?;
            info!("center model pre-processor done");
        }

        if self.stages.center_model {
            // Centering already measured the (displaced) extents
            if !self.bounds.within_limits() {
                return Err(Error::Dimensions);
            }
        } else {
            self.bounds = dimension::scan(file, !self.stages.ignore_print_dimensions)?;
        }

        if self.stages.validation {
            validation::run(file)?;
            info!("validation pre-processor done");
        }
        if self.stages.preparation {
            preparation::run(file, self.settings, &self.bounds, false)?;
            info!("preparation pre-processor done");
        }
        if self.stages.wave_bonding {
            wave::run(file)?;
            info!("wave bonding pre-processor done");
        }
        if self.stages.thermal_bonding {
            thermal::run(file, self.settings, self.stages.wave_bonding)?;
            info!("thermal bonding pre-processor done");
        }
        if self.stages.bed_compensation {
            bed_level::run(file, self.settings)?;
            info!("bed compensation pre-processor done");
        }
        if self.stages.backlash_compensation {
            backlash::run(file, self.settings)?;
            info!("backlash compensation pre-processor done");
        }
        if self.stages.feed_rate_conversion {
            feedrate::run(file)?;
            info!("feed rate conversion pre-processor done");
        }
        Ok(())
    }
}

/// Scoped temporary directory holding the scratch files of one session.
/// Removed with everything in it when dropped.
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    pub fn new() -> Result<WorkDir> {
        let template = env::temp_dir().join("micro-print-XXXXXX");
        let template = CString::new(template.as_os_str().as_bytes())
            .map_err(|_| Error::Io(std::io::Error::other("bad temp dir template")))?;
        let raw = template.into_raw();
        // mkdtemp rewrites the template in place
        let created = unsafe { libc::mkdtemp(raw) };
        let template = unsafe { CString::from_raw(raw) };
        if created.is_null() {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let path = PathBuf::from(std::ffi::OsStr::from_bytes(template.as_bytes()));
        Ok(WorkDir { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Location of the scratch copy the pipeline rewrites.
    pub fn scratch_file(&self) -> PathBuf {
        self.path.join("output.gcode")
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Move the stage's input aside and open a fresh output in its place.
/// Returns the temporary path so the stage can unlink it once done.
pub(crate) fn swap_in(file: &Path) -> Result<(PathBuf, BufReader<File>, BufWriter<File>)> {
    let temp = file.with_extension("stage");
    fs::rename(file, &temp)?;
    let input = BufReader::new(File::open(&temp)?);
    let output = BufWriter::new(File::create(file)?);
    Ok((temp, input, output))
}

/// Flush the stage output and drop its input file.
pub(crate) fn finish_stage(temp: &Path, mut output: BufWriter<File>) -> Result<()> {
    output.flush()?;
    drop(output);
    fs::remove_file(temp)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    /// Drop a scratch file with the given contents under a unique name.
    pub fn scratch(name: &str, contents: &str) -> PathBuf {
        let path = env::temp_dir().join(format!("micro-print-test-{name}.gcode"));
        fs::write(&path, contents).expect("write scratch file");
        path
    }

    pub fn lines(path: &std::path::Path) -> Vec<String> {
        fs::read_to_string(path)
            .expect("read scratch file")
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn cleanup(path: &std::path::Path) {
        let _ = fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{cleanup, lines, scratch};
    use super::*;

    #[test]
    fn work_dir_is_removed_on_drop() {
        let dir = WorkDir::new().unwrap();
        let path = dir.path().to_path_buf();
        fs::write(dir.scratch_file(), "G28\n").unwrap();
        assert!(path.exists());
        drop(dir);
        assert!(!path.exists());
    }

    #[test]
    fn pipeline_rejects_out_of_bounds_model() {
        let file = scratch("pipeline-reject", "G90\nG1 Z120\n");
        let settings = PrinterSettings::default();
        let mut pipeline = Pipeline::new(&settings, StageSet::default());
        assert!(matches!(pipeline.run(&file), Err(Error::Dimensions)));
        cleanup(&file);
    }

    #[test]
    fn pipeline_with_no_stages_leaves_file_alone() {
        let file = scratch("pipeline-noop", "G90\nG1 X10 Y10 Z0.4 E1\n");
        let settings = PrinterSettings::default();
        let mut pipeline = Pipeline::new(&settings, StageSet::default());
        pipeline.run(&file).unwrap();
        assert_eq!(lines(&file), vec!["G90", "G1 X10 Y10 Z0.4 E1"]);
        cleanup(&file);
    }

    #[test]
    fn full_chain_wraps_cleans_and_converts() {
        let file = scratch(
            "pipeline-chain",
            "M82\nG90\n;LAYER:0\nG1 X60 Y50 Z0.4 E1 F3000\n;LAYER:1\nG1 X61 E2 F3000\n",
        );
        let settings = PrinterSettings::default();
        let stages = StageSetBuilder::default()
            .validation(true)
            .preparation(true)
            .thermal_bonding(true)
            .feed_rate_conversion(true)
            .build()
            .unwrap();
        let mut pipeline = Pipeline::new(&settings, stages);
        pipeline.run(&file).unwrap();

        let rewritten = lines(&file);
        // Validation dropped the extruder-mode command
        assert!(!rewritten.contains(&"M82".to_string()));
        // Preparation put the fan command first; thermal bonding then strips
        // the outro's heater and fan shutdown because they sit past layer zero,
        // leaving the motor disable as the final command
        assert_eq!(rewritten[0], "M106 S255");
        assert_eq!(rewritten.last().unwrap(), "M18");
        assert!(!rewritten.contains(&"M107".to_string()));
        // Thermal bonding bracketed the first layer
        assert!(rewritten.contains(&"M109 S210".to_string()));
        assert!(rewritten.contains(&"M104 S200".to_string()));
        // Feed-rate conversion rewrote every F value out of mm/min range
        assert!(rewritten.iter().all(|l| !l.contains("F3000")));
        cleanup(&file);
    }

    #[test]
    fn stage_set_builder_defaults_to_everything_off() {
        let stages = StageSetBuilder::default()
            .validation(true)
            .feed_rate_conversion(true)
            .build()
            .unwrap();
        assert!(stages.validation);
        assert!(stages.feed_rate_conversion);
        assert!(!stages.wave_bonding);
        assert!(!stages.ignore_print_dimensions);
    }
}
