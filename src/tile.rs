//! Quadtree tile addressing (XYZ, Web Mercator).
//!
//! Tiles follow the slippy-map convention: `(0, 0)` is the north-west corner
//! and `y` increases southward.

use crate::crs::Bounds;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Deepest zoom level the planner and resolver will address.
pub const MAX_ZOOM: u8 = 30;

/// Earth radius used by Web Mercator (meters).
pub const EARTH_RADIUS: f64 = 6_378_137.0;

/// Half the Web Mercator extent in meters.
pub const HALF_EXTENT: f64 = PI * EARTH_RADIUS;

/// Pixel width of a tile at scale 1.
pub const TILE_SIZE: u32 = 256;

/// A single tile in the quadtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tile {
    /// Zoom level
    pub z: u8,
    /// Column
    pub x: u32,
    /// Row
    pub y: u32,
}

impl Tile {
    /// Create a tile, checking that it exists at its zoom.
    pub fn new(z: u8, x: u32, y: u32) -> Result<Self, Error> {
        let tile = Self { z, x, y };
        if tile.is_valid() {
            Ok(tile)
        } else {
            Err(Error::InvalidTile { z, x, y })
        }
    }

    /// Number of tiles along one axis at a zoom level.
    pub fn tiles_across(z: u8) -> u64 {
        1u64 << z
    }

    /// Whether the tile's coordinates fall inside the grid for its zoom.
    pub fn is_valid(&self) -> bool {
        self.z <= MAX_ZOOM
            && u64::from(self.x) < Self::tiles_across(self.z)
            && u64::from(self.y) < Self::tiles_across(self.z)
    }

    /// The four children at `z + 1`, clockwise from the north-west child.
    pub fn children(&self) -> [Tile; 4] {
        let (z, x, y) = (self.z + 1, self.x * 2, self.y * 2);
        [
            Tile { z, x, y },
            Tile { z, x: x + 1, y },
            Tile { z, x: x + 1, y: y + 1 },
            Tile { z, x, y: y + 1 },
        ]
    }

    /// Bounds in Web Mercator meters [min_x, min_y, max_x, max_y].
    pub fn xy_bounds(&self) -> Bounds {
        let size = tile_extent(self.z);
        let min_x = -HALF_EXTENT + f64::from(self.x) * size;
        let max_y = HALF_EXTENT - f64::from(self.y) * size;
        [min_x, max_y - size, min_x + size, max_y]
    }

    /// Bounds in WGS84 degrees [west, south, east, north].
    pub fn bounds(&self) -> Bounds {
        let n = Self::tiles_across(self.z) as f64;
        let west = f64::from(self.x) / n * 360.0 - 180.0;
        let east = f64::from(self.x + 1) / n * 360.0 - 180.0;
        let north = row_to_lat(f64::from(self.y), n);
        let south = row_to_lat(f64::from(self.y + 1), n);
        [west, south, east, north]
    }

    /// The `z/x/y` path used for archive keys and metadata.
    pub fn path(&self) -> String {
        format!("{}/{}/{}", self.z, self.x, self.y)
    }
}

impl std::fmt::Display for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

fn row_to_lat(row: f64, n: f64) -> f64 {
    (PI * (1.0 - 2.0 * row / n)).sinh().atan().to_degrees()
}

/// Width (and height) of a tile in Web Mercator meters at a zoom level.
pub fn tile_extent(z: u8) -> f64 {
    2.0 * HALF_EXTENT / Tile::tiles_across(z) as f64
}

/// Ground sample distance (meters/pixel) of a tile rendered at `scale`.
pub fn tile_resolution(z: u8, scale: u32) -> f64 {
    tile_extent(z) / (f64::from(TILE_SIZE) * f64::from(scale.max(1)))
}

/// Zoom level whose 256px tiles best match a ground resolution.
///
/// Rounds to the nearest level and clamps into `0..=MAX_ZOOM`.
pub fn zoom_for_resolution(resolution: f64) -> u8 {
    let zoom = ((2.0 * HALF_EXTENT) / (resolution * f64::from(TILE_SIZE)))
        .log2()
        .round();
    if zoom.is_nan() || zoom < 0.0 {
        0
    } else if zoom > f64::from(MAX_ZOOM) {
        MAX_ZOOM
    } else {
        zoom as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_new_validates_grid() {
        assert!(Tile::new(0, 0, 0).is_ok());
        assert!(Tile::new(2, 3, 3).is_ok());
        assert!(matches!(
            Tile::new(2, 4, 0),
            Err(Error::InvalidTile { z: 2, x: 4, y: 0 })
        ));
    }

    #[test]
    fn test_children_order() {
        let children = Tile { z: 1, x: 1, y: 0 }.children();
        assert_eq!(
            children,
            [
                Tile { z: 2, x: 2, y: 0 },
                Tile { z: 2, x: 3, y: 0 },
                Tile { z: 2, x: 3, y: 1 },
                Tile { z: 2, x: 2, y: 1 },
            ]
        );
    }

    #[test]
    fn test_world_bounds() {
        let world = Tile { z: 0, x: 0, y: 0 };
        let b = world.bounds();
        assert!((b[0] + 180.0).abs() < 1e-9);
        assert!((b[2] - 180.0).abs() < 1e-9);
        assert!((b[3] - 85.051_128_779_806_59).abs() < 1e-6);
        assert!((b[1] + 85.051_128_779_806_59).abs() < 1e-6);

        let xy = world.xy_bounds();
        assert!((xy[0] + HALF_EXTENT).abs() < 1e-6);
        assert!((xy[3] - HALF_EXTENT).abs() < 1e-6);
    }

    #[test]
    fn test_quadrant_bounds() {
        // North-east quadrant at zoom 1
        let b = Tile { z: 1, x: 1, y: 0 }.bounds();
        assert!(b[0].abs() < 1e-9);
        assert!(b[1].abs() < 1e-9);
        assert!((b[2] - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_zoom_for_resolution_round_trip() {
        for z in [0u8, 3, 7, 12, 18] {
            assert_eq!(zoom_for_resolution(tile_resolution(z, 1)), z);
        }
        // Scale 2 tiles are one zoom finer
        assert_eq!(zoom_for_resolution(tile_resolution(5, 2)), 6);
    }

    #[test]
    fn test_huge_scale_does_not_overflow() {
        let res = tile_resolution(0, u32::MAX);
        assert!(res.is_finite() && res > 0.0);
        assert_eq!(zoom_for_resolution(res), MAX_ZOOM);
    }

    #[test]
    fn test_zoom_for_resolution_clamps() {
        assert_eq!(zoom_for_resolution(1e12), 0);
        assert_eq!(zoom_for_resolution(1e-12), MAX_ZOOM);
    }

    #[test]
    fn test_display_and_path() {
        let tile = Tile { z: 4, x: 5, y: 6 };
        assert_eq!(tile.to_string(), "4/5/6");
        assert_eq!(tile.path(), "4/5/6");
    }
}
