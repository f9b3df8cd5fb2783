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

//! Printable volume of the machine.
//!
//! The volume narrows with height and is modeled as three stacked tiers with
//! distinct axis-aligned XY bounds. Tier selection depends on Z only.

/// Axis-aligned bounds of one tier (millimeters).
#[derive(Clone, Copy, Debug)]
pub struct TierBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub min_z: f64,
    pub max_z: f64,
}

pub const BED_LOW: TierBounds = TierBounds {
    min_x: 0.0,
    max_x: 113.0,
    min_y: 0.0,
    max_y: 107.0,
    min_z: 0.0,
    max_z: 5.0,
};

pub const BED_MEDIUM: TierBounds = TierBounds {
    min_x: 2.8,
    max_x: 110.2,
    min_y: -6.6,
    max_y: 107.0,
    min_z: 5.0,
    max_z: 73.5,
};

pub const BED_HIGH: TierBounds = TierBounds {
    min_x: 2.35,
    max_x: 82.0,
    min_y: 20.05,
    max_y: 92.95,
    min_z: 73.5,
    max_z: 112.0,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Tier {
    Low,
    Medium,
    High,
}

impl Tier {
    /// Tier containing the given height.
    pub fn for_z(z: f64) -> Tier {
        if z < BED_LOW.max_z {
            Tier::Low
        } else if z < BED_MEDIUM.max_z {
            Tier::Medium
        } else {
            Tier::High
        }
    }

    pub fn bounds(self) -> TierBounds {
        match self {
            Tier::Low => BED_LOW,
            Tier::Medium => BED_MEDIUM,
            Tier::High => BED_HIGH,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Extent {
    min_x: f64,
    max_x: f64,
    min_y: f64,
    max_y: f64,
}

impl Default for Extent {
    fn default() -> Self {
        Extent {
            min_x: f64::MAX,
            max_x: 0.0,
            min_y: f64::MAX,
            max_y: 0.0,
        }
    }
}

/// Extruder travel extents per tier, accumulated during a file scan.
#[derive(Clone, Copy, Debug)]
pub struct PrintBounds {
    extents: [Extent; 3],
    pub min_z: f64,
    pub max_z: f64,
}

impl Default for PrintBounds {
    fn default() -> Self {
        PrintBounds {
            extents: [Extent::default(); 3],
            min_z: f64::MAX,
            max_z: 0.0,
        }
    }
}

impl PrintBounds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one visited position into the extents of its tier.
    pub fn update(&mut self, tier: Tier, x: f64, y: f64, z: f64) {
        let extent = &mut self.extents[tier as usize];
        extent.min_x = extent.min_x.min(x);
        extent.max_x = extent.max_x.max(x);
        extent.min_y = extent.min_y.min(y);
        extent.max_y = extent.max_y.max(y);
        self.min_z = self.min_z.min(z);
        self.max_z = self.max_z.max(z);
    }

    /// Shift every tracked X/Y extent, mirroring a displacement applied to the
    /// file itself.
    pub fn displace(&mut self, dx: f64, dy: f64) {
        for extent in &mut self.extents {
            extent.min_x += dx;
            extent.max_x += dx;
            extent.min_y += dy;
            extent.max_y += dy;
        }
    }

    pub fn min_x(&self, tier: Tier) -> f64 {
        self.extents[tier as usize].min_x
    }

    pub fn max_x(&self, tier: Tier) -> f64 {
        self.extents[tier as usize].max_x
    }

    pub fn min_y(&self, tier: Tier) -> f64 {
        self.extents[tier as usize].min_y
    }

    pub fn max_y(&self, tier: Tier) -> f64 {
        self.extents[tier as usize].max_y
    }

    /// Smallest X visited in any tier.
    pub fn overall_min_x(&self) -> f64 {
        self.extents.iter().fold(f64::MAX, |acc, e| acc.min(e.min_x))
    }

    pub fn overall_max_x(&self) -> f64 {
        self.extents.iter().fold(0.0f64, |acc, e| acc.max(e.max_x))
    }

    pub fn overall_min_y(&self) -> f64 {
        self.extents.iter().fold(f64::MAX, |acc, e| acc.min(e.min_y))
    }

    pub fn overall_max_y(&self) -> f64 {
        self.extents.iter().fold(0.0f64, |acc, e| acc.max(e.max_y))
    }

    /// Whether every recorded extent fits inside its tier, and Z stays between
    /// the floor of the low tier and the ceiling of the high tier.
    pub fn within_limits(&self) -> bool {
        if self.min_z < BED_LOW.min_z || self.max_z > BED_HIGH.max_z {
            return false;
        }
        for tier in [Tier::Low, Tier::Medium, Tier::High] {
            let extent = self.extents[tier as usize];
            let bounds = tier.bounds();
            if extent.min_x == f64::MAX {
                // Tier never visited
                continue;
            }
            if extent.min_x < bounds.min_x
                || extent.max_x > bounds.max_x
                || extent.min_y < bounds.min_y
                || extent.max_y > bounds.max_y
            {
                return false;
            }
        }
        true
    }
}
