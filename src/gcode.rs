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

//! Fixed-schema representation of a single G-code command.
//!
//! A [`Command`] holds one line in a 16-slot parameter table with a parallel
//! `data_type` bitmask. The bit assignments are wire-visible: the binary request
//! framing (see [`Command::get_binary`]) sends the mask verbatim, so slots cannot
//! be renumbered.

use std::fmt;

/// Base value of the `data_type` word. Bits 7 and 12 are always set.
const DATA_TYPE_BASE: u32 = 0x1080;

/// Wire bit carried when the string slot is populated.
const STRING_BIT: u32 = 1 << 15;

const STRING_SLOT: usize = 15;
const SLOT_M: usize = 1;

/// Parameter identifiers with their slot index and `data_type` bit, in canonical
/// serialization order.
///
/// | Identifier | Slot | Bit | Wire width |
/// |------------|------|-----|------------|
/// | N, M, G    | 0–2  | 0–2 | u16        |
/// | X, Y, Z, E | 3–6  | 3–6 | f32        |
/// | F          | 7    | 8   | f32        |
/// | T          | 8    | 9   | u8         |
/// | S, P       | 9–10 | 10–11 | u32      |
/// | I, J, R, D | 11–14 | 16–19 | f32     |
const SLOTS: [(u8, u32); 15] = [
    (b'N', 1),
    (b'M', 1 << 1),
    (b'G', 1 << 2),
    (b'X', 1 << 3),
    (b'Y', 1 << 4),
    (b'Z', 1 << 5),
    (b'E', 1 << 6),
    (b'F', 1 << 8),
    (b'T', 1 << 9),
    (b'S', 1 << 10),
    (b'P', 1 << 11),
    (b'I', 1 << 16),
    (b'J', 1 << 17),
    (b'R', 1 << 18),
    (b'D', 1 << 19),
];

fn slot_of(identifier: u8) -> Option<(usize, u32)> {
    SLOTS
        .iter()
        .position(|&(id, _)| id == identifier)
        .map(|slot| (slot, SLOTS[slot].1))
}

/// M commands whose argument is a free-form string running to the end of the line.
const STRING_COMMANDS: [&str; 6] = ["23", "28", "29", "30", "32", "117"];

/// One parsed G-code command.
///
/// Constructed empty, populated by [`Command::parse_line`] or [`Command::set_value`].
/// Lines starting with `@` are host commands and bypass the parameter table
/// entirely.
#[derive(Clone, PartialEq)]
pub struct Command {
    data_type: u32,
    values: [String; 16],
    host_command: String,
    original: String,
    parsed: bool,
    empty: bool,
}

impl Default for Command {
    fn default() -> Self {
        Self::new()
    }
}

impl Command {
    pub fn new() -> Self {
        Command {
            data_type: DATA_TYPE_BASE,
            values: Default::default(),
            host_command: String::new(),
            original: String::new(),
            parsed: false,
            empty: true,
        }
    }

    /// Parse one line, replacing the previous contents of the record.
    ///
    /// Any uppercase letter, `;`, `*`, space, or end of input ends the current
    /// parameter. Parsing stops at `;` (comment) and `*` (checksum). Returns
    /// whether at least one parameter or a host command was populated.
    pub fn parse_line(&mut self, line: &str) -> bool {
        self.values = Default::default();
        self.data_type = DATA_TYPE_BASE;
        self.parsed = false;
        self.empty = false;
        self.host_command.clear();

        let command = line.trim_start_matches([' ', '\t', '\r', '\n']);
        self.original = command.trim_end_matches([' ', '\t', '\r', '\n']).to_string();

        // Host commands pass through verbatim, minus any trailing comment
        if command.starts_with('@') {
            let mut host = self.original.clone();
            if let Some(comment) = host.find(';') {
                host.truncate(comment);
            }
            self.host_command = host.trim_end_matches([' ', '\t', '\r', '\n']).to_string();
            self.parsed = true;
            return true;
        }

        let bytes = command.as_bytes();
        let mut identifier = 0u8;
        let mut current = String::new();
        let mut i = 0;
        while i <= bytes.len() {
            let byte = bytes.get(i).copied();
            let boundary = i == 0
                || matches!(byte, None | Some(b'A'..=b'Z') | Some(b';') | Some(b'*') | Some(b' '));
            if boundary {
                if i > 0 {
                    if let Some((slot, bit)) = slot_of(identifier) {
                        self.data_type |= bit;
                        self.values[slot] = current.clone();
                    }
                }
                current.clear();

                // M commands carrying a file name or display text consume the
                // rest of the line as the string slot
                if identifier == b'M' && STRING_COMMANDS.contains(&self.values[SLOT_M].as_str()) {
                    while i < bytes.len() && !matches!(bytes[i], b';' | b'\r' | b'\n') {
                        current.push(bytes[i] as char);
                        i += 1;
                    }
                    if !current.is_empty() {
                        self.data_type |= STRING_BIT;
                        self.values[STRING_SLOT] = current.clone();
                        current.clear();
                    }
                }

                if matches!(bytes.get(i), Some(b';') | Some(b'*')) {
                    break;
                }
                identifier = bytes.get(i).copied().unwrap_or(0);
            } else if !matches!(byte, Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n')) {
                current.push(byte.unwrap_or(0) as char);
            }
            i += 1;
        }

        self.parsed = self.data_type != DATA_TYPE_BASE;
        self.parsed
    }

    /// Canonical ASCII form: parameters in the fixed order
    /// `N M [string] G X Y Z E F T S P I J R D`, space separated.
    pub fn get_ascii(&self) -> String {
        if !self.host_command.is_empty() {
            return self.host_command.clone();
        }

        let mut request = String::new();
        for (slot, &(id, bit)) in SLOTS.iter().enumerate() {
            if self.data_type & bit != 0 {
                request.push(id as char);
                request.push_str(&self.values[slot]);
                request.push(' ');
                // The string slot rides directly behind M
                if id == b'M' && self.data_type & STRING_BIT != 0 {
                    request.push_str(&self.values[STRING_SLOT]);
                    request.push(' ');
                }
            }
        }
        if !request.is_empty() {
            request.pop();
        }
        request
    }

    /// Binary wire form: 4-byte little-endian `data_type`, optional string
    /// length, parameter values at their fixed widths, then the Fletcher-16
    /// checksum. Host commands are sent as their raw ASCII bytes.
    pub fn get_binary(&self) -> Vec<u8> {
        if !self.host_command.is_empty() {
            return self.host_command.as_bytes().to_vec();
        }

        let mut request = self.data_type.to_le_bytes().to_vec();
        if self.data_type & STRING_BIT != 0 {
            request.push(self.values[STRING_SLOT].len() as u8);
        }

        for (slot, &(_, bit)) in SLOTS.iter().enumerate() {
            if self.data_type & bit == 0 || self.values[slot].is_empty() {
                continue;
            }
            let value = &self.values[slot];
            match slot {
                // N, M, G
                0..=2 => {
                    let number = int_prefix(value) as u16;
                    request.extend_from_slice(&number.to_le_bytes());
                }
                // T
                8 => request.push(int_prefix(value) as u8),
                // S, P
                9 | 10 => {
                    let number = int_prefix(value) as u32;
                    request.extend_from_slice(&number.to_le_bytes());
                }
                // X, Y, Z, E, F, I, J, R, D
                _ => {
                    let number = value.parse::<f32>().unwrap_or(0.0);
                    request.extend_from_slice(&number.to_le_bytes());
                }
            }
        }

        if self.data_type & STRING_BIT != 0 {
            request.extend_from_slice(self.values[STRING_SLOT].as_bytes());
        }

        let (sum1, sum2) = fletcher16(&request);
        request.push(sum1);
        request.push(sum2);
        request
    }

    pub fn data_type(&self) -> u32 {
        self.data_type
    }

    /// Whether the `data_type` bit for `identifier` is set.
    pub fn has_parameter(&self, identifier: char) -> bool {
        slot_of(identifier as u8).is_some_and(|(_, bit)| self.data_type & bit != 0)
    }

    /// Whether the parameter carries a non-empty textual value.
    pub fn has_value(&self, identifier: char) -> bool {
        slot_of(identifier as u8).is_some_and(|(slot, _)| !self.values[slot].is_empty())
    }

    pub fn value(&self, identifier: char) -> &str {
        match slot_of(identifier as u8) {
            Some((slot, _)) => &self.values[slot],
            None => "",
        }
    }

    pub fn set_value(&mut self, identifier: char, value: impl Into<String>) {
        self.empty = false;
        self.parsed = true;
        if let Some((slot, bit)) = slot_of(identifier as u8) {
            self.data_type |= bit;
            self.values[slot] = value.into();
        }
    }

    pub fn remove_parameter(&mut self, identifier: char) {
        if let Some((slot, bit)) = slot_of(identifier as u8) {
            self.data_type &= !bit;
            self.values[slot].clear();
        }
    }

    pub fn has_string(&self) -> bool {
        self.data_type & STRING_BIT != 0
    }

    pub fn string(&self) -> &str {
        &self.values[STRING_SLOT]
    }

    pub fn set_string(&mut self, value: impl Into<String>) {
        self.empty = false;
        self.parsed = true;
        self.data_type |= STRING_BIT;
        self.values[STRING_SLOT] = value.into();
    }

    /// Reset to the freshly-constructed state.
    pub fn clear(&mut self) {
        self.values = Default::default();
        self.data_type = DATA_TYPE_BASE;
        self.parsed = false;
        self.empty = true;
        self.host_command.clear();
        self.original.clear();
    }

    pub fn is_parsed(&self) -> bool {
        self.parsed
    }

    pub fn is_host_command(&self) -> bool {
        !self.host_command.is_empty()
    }

    pub fn host_command(&self) -> &str {
        &self.host_command
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// The input line as given, minus surrounding whitespace.
    pub fn original(&self) -> &str {
        &self.original
    }
}

impl fmt::Display for Command {
    /// Parsed commands render canonically; everything else (comments, blank
    /// lines) echoes the original text so rewritten files keep their markers.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parsed {
            write!(f, "{}", self.get_ascii())
        } else {
            write!(f, "{}", self.original)
        }
    }
}

/// Fletcher-16 with both accumulators folded modulo 255, low sum first.
pub fn fletcher16(data: &[u8]) -> (u8, u8) {
    let mut sum1: u16 = 0;
    let mut sum2: u16 = 0;
    for &byte in data {
        sum1 = (sum1 + u16::from(byte)) % 0xFF;
        sum2 = (sum1 + sum2) % 0xFF;
    }
    (sum1 as u8, sum2 as u8)
}

/// Integer prefix of a value, `strtol`-style: sign plus leading digits, 0 when
/// the value has no digit prefix at all.
fn int_prefix(value: &str) -> i64 {
    let trimmed = value.trim_start();
    let (sign, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let digits: &str = {
        let end = rest
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit())
            .map_or(rest.len(), |(i, _)| i);
        &rest[..end]
    };
    digits.parse::<i64>().map_or(0, |v| sign * v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(line: &str) -> Command {
        let mut command = Command::new();
        assert!(command.parse_line(line), "failed to parse {line:?}");
        command
    }

    #[test]
    fn parses_motion_command() {
        let command = parsed("G1 X10.0 Y20.5 E0.123 F1500");
        assert_eq!(command.value('G'), "1");
        assert_eq!(command.value('X'), "10.0");
        assert_eq!(command.value('Y'), "20.5");
        assert_eq!(command.value('E'), "0.123");
        assert_eq!(command.value('F'), "1500");
        // G, X, Y, E, F
        assert_eq!(command.data_type() & 0x01E8, 0x01E8);
    }

    #[test]
    fn binary_layout_of_motion_command() {
        let command = parsed("G1 X10.0 Y20.5 E0.123 F1500");
        let binary = command.get_binary();
        // 4 header + 2 (G) + 4 * 4 (X Y E F) + 2 checksum
        assert_eq!(binary.len(), 24);
        let header = u32::from_le_bytes([binary[0], binary[1], binary[2], binary[3]]);
        assert_eq!(header, command.data_type());
        let (sum1, sum2) = fletcher16(&binary[..binary.len() - 2]);
        assert_eq!(&binary[binary.len() - 2..], &[sum1, sum2]);
        // First value slot is the u16 G number
        assert_eq!(u16::from_le_bytes([binary[4], binary[5]]), 1);
        // Then the f32 X
        assert_eq!(
            f32::from_le_bytes([binary[6], binary[7], binary[8], binary[9]]),
            10.0
        );
    }

    #[test]
    fn host_command_passes_through() {
        let command = parsed("@pause ; breakpoint");
        assert!(command.is_host_command());
        assert_eq!(command.host_command(), "@pause");
        assert_eq!(command.get_binary(), b"@pause".to_vec());
        assert_eq!(command.get_ascii(), "@pause");
    }

    #[test]
    fn ascii_round_trip_is_stable() {
        let first = parsed("  N12 G1 X1.5 Y-2  Z0.3 E0.01 F90\t");
        let canonical = first.get_ascii();
        let second = parsed(&canonical);
        assert_eq!(second.get_ascii(), canonical);
        for id in ['N', 'G', 'X', 'Y', 'Z', 'E', 'F'] {
            assert_eq!(first.value(id), second.value(id));
        }
    }

    #[test]
    fn comment_terminates_parsing() {
        let mut command = Command::new();
        assert!(!command.parse_line("; pure comment"));
        assert!(!command.is_parsed());
        assert_eq!(command.to_string(), "; pure comment");

        let command = parsed("G28 ; home all");
        assert!(command.has_value('G'));
        assert!(!command.has_parameter('X'));
    }

    #[test]
    fn string_parameter_follows_m117() {
        // The string slot starts at the boundary character, so it keeps the
        // separator space
        let command = parsed("M117 hello world");
        assert!(command.has_string());
        assert_eq!(command.string(), " hello world");
        assert_eq!(command.get_ascii(), "M117  hello world");

        let binary = command.get_binary();
        // Header, length byte, u16 M value, string bytes, checksum
        assert_eq!(binary[4] as usize, " hello world".len());
        assert_eq!(u16::from_le_bytes([binary[5], binary[6]]), 117);
        assert_eq!(&binary[7..7 + 12], b" hello world");
    }

    #[test]
    fn data_type_bit_tracks_slot_content() {
        let mut command = Command::new();
        command.set_value('X', "1.0");
        assert!(command.has_parameter('X'));
        assert!(command.has_value('X'));
        command.remove_parameter('X');
        assert!(!command.has_parameter('X'));
        assert!(!command.has_value('X'));
        assert_eq!(command.data_type(), DATA_TYPE_BASE);
    }

    #[test]
    fn empty_until_populated() {
        let mut command = Command::new();
        assert!(command.is_empty());
        command.set_value('G', "4");
        assert!(!command.is_empty());
        command.clear();
        assert!(command.is_empty());
        assert_eq!(command.data_type(), DATA_TYPE_BASE);
    }

    #[test]
    fn checksum_matches_known_vector() {
        // M110 alone: header 82 10 00 00, M value 6E 00
        let command = parsed("M110");
        let binary = command.get_binary();
        assert_eq!(&binary[..6], &[0x82, 0x10, 0x00, 0x00, 0x6E, 0x00]);
        let (sum1, sum2) = fletcher16(&binary[..6]);
        assert_eq!(binary[6], sum1);
        assert_eq!(binary[7], sum2);
    }
}
