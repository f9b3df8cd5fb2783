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

//! Abstract interpreter for the motion-affecting commands (`G0`/`G1`, `G28`,
//! `G90`/`G91`, `G92`). Every pre-processor stage and the print executor share
//! this tracker instead of keeping their own ad-hoc position state.

use crate::gcode::Command;

/// Home position the firmware snaps to on `G28`.
pub const HOME_X: f64 = 54.0;
pub const HOME_Y: f64 = 50.0;

/// Axis travel classification for one move.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    Positive,
    Negative,
    Neither,
}

impl Direction {
    fn of(delta: f64) -> Direction {
        if delta > f64::EPSILON {
            Direction::Positive
        } else if delta < -f64::EPSILON {
            Direction::Negative
        } else {
            Direction::Neither
        }
    }
}

/// Per-move change produced by [`MotionState::apply`].
#[derive(Clone, Copy, Default, Debug)]
pub struct MotionDelta {
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
    pub de: f64,
    /// XY travel of the move.
    pub distance: f64,
    pub direction_x: Direction,
    pub direction_y: Direction,
    /// Whether the command was a motion command at all.
    pub moved: bool,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Neither
    }
}

/// Position state advanced line by line.
///
/// Two position sets are kept: the *logical* positions `x`/`y`/`z`/`e`, which
/// `G92` rewrites, and the *physical* positions `absolute_x`/`absolute_y`/
/// `absolute_z`, which only actual motion moves. The compensation stages need
/// the physical set to look up bed geometry while emitting logical
/// coordinates.
#[derive(Clone, Copy, Debug)]
pub struct MotionState {
    pub relative_mode: bool,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: f64,
    pub absolute_x: f64,
    pub absolute_y: f64,
    pub absolute_z: f64,
    /// Sticky feed rate, updated whenever a motion command carries F.
    pub feed_rate: f64,
}

impl Default for MotionState {
    fn default() -> Self {
        MotionState {
            relative_mode: false,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            e: 0.0,
            absolute_x: 0.0,
            absolute_y: 0.0,
            absolute_z: 0.0,
            feed_rate: 0.0,
        }
    }
}

impl MotionState {
    /// Fresh state at the coordinate origin in absolute mode.
    pub fn new() -> Self {
        Self::default()
    }

    /// State seeded at the physical start position used by the file scans.
    pub fn seeded(z: f64) -> Self {
        MotionState {
            x: HOME_X,
            y: HOME_Y,
            z,
            absolute_x: HOME_X,
            absolute_y: HOME_Y,
            absolute_z: z,
            ..Self::default()
        }
    }

    /// Advance over one command, returning the per-axis change.
    ///
    /// `G0`/`G1` apply X/Y/Z/E according to the current mode, `G28` snaps to
    /// the home position, `G90`/`G91` switch modes, and `G92` rewrites the
    /// logical positions (all four reset to 0 when the command names none).
    pub fn apply(&mut self, command: &Command) -> MotionDelta {
        let mut delta = MotionDelta::default();
        if !command.has_value('G') {
            return delta;
        }

        match command.value('G') {
            "0" | "1" => {
                delta.moved = true;
                delta.dx = self.target(command, 'X', self.x) - self.x;
                delta.dy = self.target(command, 'Y', self.y) - self.y;
                delta.dz = self.target(command, 'Z', self.z) - self.z;
                delta.de = self.target(command, 'E', self.e) - self.e;
                self.x += delta.dx;
                self.y += delta.dy;
                self.z += delta.dz;
                self.e += delta.de;
                self.absolute_x += delta.dx;
                self.absolute_y += delta.dy;
                self.absolute_z += delta.dz;
                if command.has_value('F') {
                    self.feed_rate = parse(command.value('F'));
                }
                delta.distance = (delta.dx * delta.dx + delta.dy * delta.dy).sqrt();
                delta.direction_x = Direction::of(delta.dx);
                delta.direction_y = Direction::of(delta.dy);
            }
            "28" => {
                self.x = HOME_X;
                self.y = HOME_Y;
                self.absolute_x = HOME_X;
                self.absolute_y = HOME_Y;
            }
            "90" => self.relative_mode = false,
            "91" => self.relative_mode = true,
            "92" => {
                if !command.has_value('X')
                    && !command.has_value('Y')
                    && !command.has_value('Z')
                    && !command.has_value('E')
                {
                    self.x = 0.0;
                    self.y = 0.0;
                    self.z = 0.0;
                    self.e = 0.0;
                } else {
                    if command.has_value('X') {
                        self.x = parse(command.value('X'));
                    }
                    if command.has_value('Y') {
                        self.y = parse(command.value('Y'));
                    }
                    if command.has_value('Z') {
                        self.z = parse(command.value('Z'));
                    }
                    if command.has_value('E') {
                        self.e = parse(command.value('E'));
                    }
                }
            }
            _ => {}
        }
        delta
    }

    fn target(&self, command: &Command, identifier: char, current: f64) -> f64 {
        if !command.has_value(identifier) {
            return current;
        }
        let value = parse(command.value(identifier));
        if self.relative_mode {
            current + value
        } else {
            value
        }
    }
}

fn parse(value: &str) -> f64 {
    value.parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(line: &str) -> Command {
        let mut parsed = Command::new();
        assert!(parsed.parse_line(line));
        parsed
    }

    #[test]
    fn absolute_moves_replace_position() {
        let mut state = MotionState::new();
        let delta = state.apply(&command("G1 X10 Y4 E0.2"));
        assert!(delta.moved);
        assert_eq!(state.x, 10.0);
        assert_eq!(state.y, 4.0);
        assert_eq!(delta.de, 0.2);
        assert!((delta.distance - (116.0f64).sqrt()).abs() < 1e-12);
        assert_eq!(delta.direction_x, Direction::Positive);
    }

    #[test]
    fn relative_moves_accumulate() {
        let mut state = MotionState::new();
        state.apply(&command("G91"));
        state.apply(&command("G1 X5"));
        state.apply(&command("G1 X-2"));
        assert_eq!(state.x, 3.0);
        state.apply(&command("G90"));
        state.apply(&command("G1 X1"));
        assert_eq!(state.x, 1.0);
    }

    #[test]
    fn homing_snaps_to_bed_center_front() {
        let mut state = MotionState::new();
        state.apply(&command("G1 X80 Y90"));
        state.apply(&command("G28"));
        assert_eq!(state.x, HOME_X);
        assert_eq!(state.y, HOME_Y);
    }

    #[test]
    fn bare_g92_zeroes_every_logical_axis() {
        let mut state = MotionState::seeded(0.4);
        state.apply(&command("G1 E12 Z3"));
        state.apply(&command("G92"));
        assert_eq!(state.x, 0.0);
        assert_eq!(state.y, 0.0);
        assert_eq!(state.z, 0.0);
        assert_eq!(state.e, 0.0);
        // Physical position is untouched by a coordinate rewrite
        assert_eq!(state.absolute_x, HOME_X);
        assert_eq!(state.absolute_z, 3.0);
    }

    #[test]
    fn g92_with_values_rewrites_only_those() {
        let mut state = MotionState::new();
        state.apply(&command("G1 X10 Y10 E5"));
        state.apply(&command("G92 E0"));
        assert_eq!(state.e, 0.0);
        assert_eq!(state.x, 10.0);
    }

    #[test]
    fn feed_rate_is_sticky() {
        let mut state = MotionState::new();
        state.apply(&command("G1 X1 F1200"));
        state.apply(&command("G1 X2"));
        assert_eq!(state.feed_rate, 1200.0);
    }

    #[test]
    fn still_axes_report_neither() {
        let mut state = MotionState::new();
        let delta = state.apply(&command("G1 Z0.4"));
        assert_eq!(delta.direction_x, Direction::Neither);
        assert_eq!(delta.direction_y, Direction::Neither);
    }
}
