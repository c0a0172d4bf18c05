use std::hash::Hash;

/// An axis-aligned box over integer map coordinates, bounds inclusive.
///
/// Quad-tree nodes partition the coordinate space with these boxes. The
/// four quadrants of a box never overlap, so every coordinate belongs to
/// exactly one leaf.
///
/// # Examples
///
/// ```rust
/// use tilecache::BoundingBox;
///
/// let world = BoundingBox::world();
/// assert!(world.contains(0, 0));
/// let q = world.quadrant(world.quadrant_of(10, -10));
/// assert!(q.contains(10, -10));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, serde::Deserialize, serde::Serialize)]
pub struct BoundingBox {
    pub min_lat: i32,
    pub min_lon: i32,
    pub max_lat: i32,
    pub max_lon: i32,
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BoundingBox({}, {}, {}, {})",
            self.min_lat, self.min_lon, self.max_lat, self.max_lon
        )
    }
}

impl BoundingBox {
    pub fn new(min_lat: i32, min_lon: i32, max_lat: i32, max_lon: i32) -> BoundingBox {
        BoundingBox {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        }
    }

    /// The whole coordinate space, covered by the quad-tree root.
    pub fn world() -> BoundingBox {
        BoundingBox::new(i32::MIN, i32::MIN, i32::MAX, i32::MAX)
    }

    pub fn is_valid(&self) -> bool {
        self.min_lat <= self.max_lat && self.min_lon <= self.max_lon
    }

    pub fn contains(&self, lat: i32, lon: i32) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }

    /// Whether `other` lies completely inside this box.
    pub fn encloses(&self, other: &BoundingBox) -> bool {
        self.min_lat <= other.min_lat
            && self.min_lon <= other.min_lon
            && self.max_lat >= other.max_lat
            && self.max_lon >= other.max_lon
    }

    /// A box can be split while both axes span more than one coordinate.
    pub fn can_split(&self) -> bool {
        self.max_lat > self.min_lat && self.max_lon > self.min_lon
    }

    fn mid_lat(&self) -> i32 {
        midpoint(self.min_lat, self.max_lat)
    }

    fn mid_lon(&self) -> i32 {
        midpoint(self.min_lon, self.max_lon)
    }

    /// Index (0..4) of the quadrant holding a coordinate: bit 1 is set for
    /// the upper latitude half, bit 0 for the upper longitude half.
    pub fn quadrant_of(&self, lat: i32, lon: i32) -> usize {
        let upper_lat = lat > self.mid_lat();
        let upper_lon = lon > self.mid_lon();
        ((upper_lat as usize) << 1) | (upper_lon as usize)
    }

    /// The box of one quadrant. Lower halves end at the midpoint, upper
    /// halves start right after it.
    pub fn quadrant(&self, index: usize) -> BoundingBox {
        let mid_lat = self.mid_lat();
        let mid_lon = self.mid_lon();
        let (min_lat, max_lat) = if index & 2 == 0 {
            (self.min_lat, mid_lat)
        } else {
            (mid_lat + 1, self.max_lat)
        };
        let (min_lon, max_lon) = if index & 1 == 0 {
            (self.min_lon, mid_lon)
        } else {
            (mid_lon + 1, self.max_lon)
        };
        BoundingBox::new(min_lat, min_lon, max_lat, max_lon)
    }
}

/// Floor of the midpoint, computed without overflow. Always `< max` for
/// `min < max`, so `mid + 1` never overflows.
fn midpoint(min: i32, max: i32) -> i32 {
    ((min as i64 + max as i64).div_euclid(2)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_contains_extremes() {
        let world = BoundingBox::world();
        assert!(world.contains(i32::MIN, i32::MIN));
        assert!(world.contains(i32::MAX, i32::MAX));
        assert!(world.contains(0, 0));
        assert!(world.can_split());
    }

    #[test]
    fn test_quadrants_partition_the_box() {
        let bbox = BoundingBox::new(0, 0, 9, 9);
        let quads: Vec<BoundingBox> = (0..4).map(|i| bbox.quadrant(i)).collect();
        for lat in 0..=9 {
            for lon in 0..=9 {
                let owners = quads.iter().filter(|q| q.contains(lat, lon)).count();
                assert_eq!(owners, 1, "({}, {}) owned by {} quadrants", lat, lon, owners);
                let q = bbox.quadrant_of(lat, lon);
                assert!(quads[q].contains(lat, lon));
            }
        }
    }

    #[test]
    fn test_world_quadrants_do_not_overflow() {
        let world = BoundingBox::world();
        for i in 0..4 {
            let q = world.quadrant(i);
            assert!(q.is_valid());
            assert!(world.encloses(&q));
        }
        assert_eq!(world.quadrant_of(i32::MAX, i32::MAX), 3);
        assert_eq!(world.quadrant_of(i32::MIN, i32::MIN), 0);
        assert_eq!(world.quadrant_of(-1, 0), 1);
    }

    #[test]
    fn test_negative_midpoint_rounds_down() {
        let bbox = BoundingBox::new(-3, -3, 0, 0);
        assert_eq!(bbox.quadrant(0), BoundingBox::new(-3, -3, -2, -2));
        assert_eq!(bbox.quadrant(3), BoundingBox::new(-1, -1, 0, 0));
    }

    #[test]
    fn test_single_cell_cannot_split() {
        assert!(!BoundingBox::new(5, 5, 5, 9).can_split());
        assert!(BoundingBox::new(5, 5, 6, 6).can_split());
    }

    #[test]
    fn test_display() {
        let bbox = BoundingBox::new(1, 2, 3, 4);
        assert_eq!(bbox.to_string(), "BoundingBox(1, 2, 3, 4)");
    }
}
