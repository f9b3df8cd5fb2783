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

//! Command-line frontend: pre-process and print G-code files, flash firmware
//! ROMs, bridge third-party hosts, or poke the printer interactively.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use micro_print::gcode::Command;
use micro_print::preprocess::StageSetBuilder;
use micro_print::settings::FilamentType;
use micro_print::Printer;

#[derive(Parser, Debug)]
#[command(
    name = "micro-print",
    version,
    about = "Host-side driver and G-code toolchain for Micro 3D-class printers"
)]
struct Args {
    /// Center the model on the print bed
    #[arg(short = 'm', long = "centermodel")]
    center_model: bool,

    /// Strip commands the firmware does not implement
    #[arg(short = 'v', long = "validation")]
    validation: bool,

    /// Wrap the file in the machine intro and outro
    #[arg(short = 'p', long = "preparation")]
    preparation: bool,

    /// Modulate first-layer extrusions with a Z wave
    #[arg(short = 'w', long = "wavebonding")]
    wave_bonding: bool,

    /// Run the first layer hotter, then settle back
    #[arg(short = 't', long = "thermalbonding")]
    thermal_bonding: bool,

    /// Warp moves to follow the measured bed plane
    #[arg(short = 'b', long = "bedcompensation")]
    bed_compensation: bool,

    /// Take up mechanical slack on axis reversals
    #[arg(short = 'l', long = "backlashcompensation")]
    backlash_compensation: bool,

    /// Convert slicer feed rates to the firmware's speed scale
    #[arg(short = 'f', long = "feedrateconversion")]
    feed_rate_conversion: bool,

    /// Firmware ROM to flash (file name must begin with the 10-digit version)
    #[arg(short = 'r', long = "firmwarerom", value_name = "PATH")]
    firmware_rom: Option<PathBuf>,

    /// Flash even when the installed firmware validates
    #[arg(short = 'c', long = "forceflash")]
    force_flash: bool,

    /// G-code file to process and print
    #[arg(short = 'i', long = "inputfile", value_name = "PATH")]
    input_file: Option<PathBuf>,

    /// Write the processed G-code here instead of printing it
    #[arg(short = 'o', long = "outputfile", value_name = "PATH")]
    output_file: Option<PathBuf>,

    /// Bridge a virtual serial port to the printer for other host software
    #[arg(short = 's', long = "translate")]
    translate: bool,

    /// Load the saved settings file before anything else
    #[arg(short = 'e', long = "settings")]
    use_settings: bool,

    /// Trust the provided settings instead of querying the printer
    #[arg(short = 'd', long = "provided")]
    provided: bool,

    #[arg(long = "backlashX", value_name = "MM")]
    backlash_x: Option<f64>,

    #[arg(long = "backlashY", value_name = "MM")]
    backlash_y: Option<f64>,

    #[arg(long = "backlashSpeed", value_name = "MM_MIN")]
    backlash_speed: Option<f64>,

    /// ABS, PLA, HIPS or OTHER
    #[arg(long = "filamentType", value_name = "TYPE")]
    filament_type: Option<String>,

    #[arg(long = "filamentTemperature", value_name = "CELSIUS")]
    filament_temperature: Option<u16>,

    #[arg(long = "backLeftOffset", value_name = "MM")]
    back_left_offset: Option<f64>,

    #[arg(long = "backRightOffset", value_name = "MM")]
    back_right_offset: Option<f64>,

    #[arg(long = "frontLeftOffset", value_name = "MM")]
    front_left_offset: Option<f64>,

    #[arg(long = "frontRightOffset", value_name = "MM")]
    front_right_offset: Option<f64>,
}

fn apply_overrides(printer: &mut Printer, args: &Args) {
    let settings = &mut printer.settings;
    if let Some(value) = args.backlash_x {
        settings.backlash_x = value;
    }
    if let Some(value) = args.backlash_y {
        settings.backlash_y = value;
    }
    if let Some(value) = args.backlash_speed {
        settings.backlash_speed = value;
    }
    if let Some(name) = &args.filament_type {
        settings.filament_type = FilamentType::from_name(name);
    }
    if let Some(value) = args.filament_temperature {
        settings.filament_temperature = value;
    }
    if let Some(value) = args.back_left_offset {
        settings.back_left_offset = value;
    }
    if let Some(value) = args.back_right_offset {
        settings.back_right_offset = value;
    }
    if let Some(value) = args.front_left_offset {
        settings.front_left_offset = value;
    }
    if let Some(value) = args.front_right_offset {
        settings.front_right_offset = value;
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut printer = Printer::new().context("creating printer session")?;

    if args.use_settings {
        printer
            .settings
            .load()
            .context("loading the settings file")?;
    }
    apply_overrides(&mut printer, &args);

    printer.stages = StageSetBuilder::default()
        .center_model(args.center_model)
        .validation(args.validation)
        .preparation(args.preparation)
        .wave_bonding(args.wave_bonding)
        .thermal_bonding(args.thermal_bonding)
        .bed_compensation(args.bed_compensation)
        .backlash_compensation(args.backlash_compensation)
        .feed_rate_conversion(args.feed_rate_conversion)
        .build()
        .context("assembling the pre-processor stages")?;

    // Offline processing needs no hardware at all
    let offline = args.provided
        && args.input_file.is_some()
        && args.output_file.is_some()
        && args.firmware_rom.is_none()
        && !args.translate;
    if offline {
        let input = args.input_file.as_deref().context("input file")?;
        printer.process_file(input, args.output_file.as_deref())?;
        return Ok(());
    }

    printer.connect().context("connecting to the printer")?;

    if let Some(rom) = &args.firmware_rom {
        if !printer.is_bootloader_mode()? {
            printer.enter_bootloader()?;
        }
        let valid = printer.is_firmware_valid()?;
        if args.force_flash || !valid {
            printer.update_firmware(rom).context("flashing firmware")?;
            info!("firmware is now {}", printer.firmware_version());
        } else {
            info!("installed firmware {} is valid", printer.firmware_version());
        }
        if args.input_file.is_none() && !args.translate {
            return Ok(());
        }
    }

    if args.provided {
        printer.exit_bootloader()?;
        info!("using provided settings");
    } else {
        printer
            .collect_information()
            .context("collecting printer information")?;
        // Explicit command-line values win over collected ones
        apply_overrides(&mut printer, &args);
    }

    if args.translate {
        return printer.translator_mode().map_err(Into::into);
    }

    match (&args.input_file, &args.output_file) {
        (Some(input), Some(output)) => {
            printer.process_file(input, Some(output))?;
        }
        (Some(input), None) => {
            printer.print_file(input)?;
        }
        _ => manual_console(&mut printer)?,
    }
    Ok(())
}

/// Interactive G-code prompt: each line is sent to the printer and retried
/// until the firmware acknowledges it.
fn manual_console(printer: &mut Printer) -> anyhow::Result<()> {
    println!("Entering manual G-code mode");
    println!("Enter 'quit' to exit");

    let stdin = io::stdin();
    loop {
        print!("Enter command: ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line == "quit" {
            break;
        }
        let mut command = Command::new();
        if !command.parse_line(line) {
            continue;
        }

        loop {
            println!("Send: {line}");
            printer.send_request(line)?;
            let mut response = printer.receive_response()?;
            // Undersized G0 moves answer twice
            if line.starts_with("G0") && response == "Info:Too small" {
                response = printer.receive_response()?;
            }
            println!("Receive: {response}");
            println!();
            if response.starts_with("ok") {
                break;
            }
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();
    // Benign refusals print a diagnostic and still exit zero
    if let Err(e) = run(args) {
        error!("{e:#}");
    }
}
