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

//! Print executor: streams a fully processed file to the printer.
//!
//! Commands are numbered with a wrapping 16-bit `N` parameter and sent binary,
//! keeping a small rolling window in flight. The firmware acknowledges each
//! head-of-window command with `ok <n>` (or `skip <n>` for commands it elided);
//! `Resend <n>` asks for the head of the window again. Numbering starts with an
//! `M110` reset before the first file line.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::thread;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

use crate::error::Result;
use crate::gcode::Command;
use crate::link::{Link, SerialIo};

/// Most commands allowed in flight before we stop feeding.
const WINDOW: usize = 3;

/// Pause between poll iterations.
const POLL_GAP: Duration = Duration::from_micros(500);

fn is_processed(response: &str) -> bool {
    let bytes = response.as_bytes();
    (response.len() >= 4 && response.starts_with("ok") && bytes[3].is_ascii_digit())
        || (response.len() >= 6 && response.starts_with("skip"))
}

fn is_resend(response: &str) -> bool {
    response.len() >= 8 && response.starts_with("Resend")
}

/// Stream the file. Returns the number of acknowledged commands.
pub fn stream<P: SerialIo>(link: &mut Link<P>, file: &Path) -> Result<u64> {
    // Every valid command costs one line number, plus the M110 reset and one
    // more reset per 65536 lines
    let mut total: u64 = 0;
    {
        let input = BufReader::new(File::open(file)?);
        let mut probe = Command::new();
        for line in input.lines() {
            if probe.parse_line(&line?) {
                total += 1;
            }
        }
    }
    total += 1 + total / u64::from(u16::MAX);

    let mut input = BufReader::new(File::open(file)?).lines();
    let mut buffer: VecDeque<String> = VecDeque::new();
    let mut command = Command::new();
    let mut line_number: u16 = 0;
    let mut processed: u64 = 0;
    let mut first_sent = false;
    let mut exhausted = false;

    let progress = ProgressBar::new(total).with_style(
        ProgressStyle::with_template("printing {wide_bar} {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    while !exhausted || !buffer.is_empty() {
        let line = if !exhausted && buffer.len() <= WINDOW {
            if first_sent {
                match input.next() {
                    Some(line) => Some(line?),
                    None => {
                        exhausted = true;
                        None
                    }
                }
            } else {
                first_sent = true;
                Some("M110".to_string())
            }
        } else {
            None
        };

        if let Some(line) = line {
            if command.parse_line(&line) {
                command.set_value('N', line_number.to_string());
                line_number = line_number.wrapping_add(1);
                link.send_binary(&command)?;
                buffer.push_back(command.get_ascii());
            }
        }

        thread::sleep(POLL_GAP);

        // Drain whatever responses are pending
        while let Some(first) = link.try_read_byte()? {
            let mut response = String::new();
            response.push(first as char);
            response.push_str(&link.receive_binary()?);

            if is_processed(&response) {
                if let Some(done) = buffer.pop_front() {
                    debug!("processed {done}");
                }
                processed += 1;
                progress.inc(1);
            } else if is_resend(&response) {
                if let Some(front) = buffer.front() {
                    let mut resend = Command::new();
                    if resend.parse_line(front) {
                        link.send_binary(&resend)?;
                    }
                }
            }
            // Anything else (temperature reports, chatter) is ignored

            thread::sleep(POLL_GAP);
        }
    }

    progress.finish_and_clear();
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::testutil::{cleanup, scratch};
    use crate::link::loopback::LoopbackPort;

    #[test]
    fn streams_numbered_commands_and_counts_acks() {
        let file = scratch("executor-stream", "G28\nG1 X10 Y10 F1000\n;comment\n");
        let mut port = LoopbackPort::new();
        port.queue_response(b"ok 0\n");
        port.queue_response(b"ok 1\n");
        port.queue_response(b"ok 2\n");
        let mut link = Link::new(port);

        let processed = stream(&mut link, &file).unwrap();
        assert_eq!(processed, 3);

        // First frame on the wire is the numbered M110 reset
        let mut reset = Command::new();
        reset.parse_line("N0 M110");
        let expected = reset.get_binary();
        assert_eq!(&link.port_mut().written[..expected.len()], &expected[..]);
        cleanup(&file);
    }

    #[test]
    fn skip_counts_like_ok() {
        let file = scratch("executor-skip", "G28\n");
        let mut port = LoopbackPort::new();
        port.queue_response(b"ok 0\n");
        port.queue_response(b"skip 1\n");
        let mut link = Link::new(port);
        assert_eq!(stream(&mut link, &file).unwrap(), 2);
        cleanup(&file);
    }

    #[test]
    fn resend_repeats_the_head_of_the_window() {
        let file = scratch("executor-resend", "");
        let mut port = LoopbackPort::new();
        port.queue_response(b"Resend 0\n");
        port.queue_response(b"ok 0\n");
        let mut link = Link::new(port);
        assert_eq!(stream(&mut link, &file).unwrap(), 1);

        // M110 went out twice: once fresh, once on the resend
        let mut reset = Command::new();
        reset.parse_line("N0 M110");
        let frame = reset.get_binary();
        let written = link.port_mut().written.clone();
        let occurrences = written
            .windows(frame.len())
            .filter(|chunk| *chunk == &frame[..])
            .count();
        assert_eq!(occurrences, 2);
        cleanup(&file);
    }

    #[test]
    fn unknown_chatter_is_ignored() {
        let file = scratch("executor-chatter", "G28\n");
        let mut port = LoopbackPort::new();
        port.queue_response(b"T:210.0\n");
        port.queue_response(b"ok 0\n");
        port.queue_response(b"ok 1\n");
        let mut link = Link::new(port);
        assert_eq!(stream(&mut link, &file).unwrap(), 2);
        cleanup(&file);
    }
}
