//! Quadtree traversal and sub-pyramid planning.
//!
//! A job starts from a root tile and descends to `max_zoom`. Zoom levels
//! listed as "materialize" zooms start new archives: every tile at such a
//! level whose x and y are multiples of the metatile size roots its own
//! sub-pyramid, and that archive holds its metatile block plus all
//! descendants down to the level before the next materialize zoom.

use crate::crs::{union_bounds, Bounds};
use crate::error::Error;
use crate::tile::{Tile, MAX_ZOOM};
use crate::Result;
use serde::Serialize;

/// Walks the quadtree below a root, one zoom level at a time.
#[derive(Debug, Clone)]
pub struct PyramidPlanner {
    root: Tile,
    max_zoom: u8,
    metatile: u32,
    materialize_zooms: Option<Vec<u8>>,
}

impl PyramidPlanner {
    /// Create a planner emitting every level from `root.z` to `max_zoom`.
    ///
    /// `metatile` must be a power of two.
    pub fn new(root: Tile, max_zoom: u8, metatile: u32) -> Result<Self> {
        if !metatile.is_power_of_two() {
            return Err(Error::InvalidMetatile(metatile));
        }
        Ok(Self {
            root,
            max_zoom: max_zoom.min(MAX_ZOOM),
            metatile,
            materialize_zooms: None,
        })
    }

    /// Only emit tiles at the given zoom levels.
    pub fn with_materialize_zooms(mut self, zooms: Vec<u8>) -> Self {
        self.materialize_zooms = Some(zooms);
        self
    }

    pub fn root(&self) -> Tile {
        self.root
    }

    /// Metatile size actually used for the starting block.
    ///
    /// A root at zoom `z` has only `2^z` tiles per axis, so larger requests
    /// are clamped.
    pub fn effective_metatile(&self) -> u32 {
        let across = Tile::tiles_across(self.root.z).min(u64::from(u32::MAX)) as u32;
        self.metatile.min(across)
    }

    /// The `metatile × metatile` block anchored at the root.
    ///
    /// Ordered column by column; tiles past the edge of the grid are dropped.
    pub fn root_block(&self) -> Vec<Tile> {
        let size = self.effective_metatile();
        let mut block = Vec::with_capacity((size * size) as usize);
        for dx in 0..size {
            for dy in 0..size {
                let tile = Tile {
                    z: self.root.z,
                    x: self.root.x.saturating_add(dx),
                    y: self.root.y.saturating_add(dy),
                };
                if tile.is_valid() {
                    block.push(tile);
                }
            }
        }
        block
    }

    /// WGS84 bounds of the root block; every emitted tile lies inside.
    pub fn root_block_bounds(&self) -> Bounds {
        self.root_block()
            .iter()
            .map(Tile::bounds)
            .fold(self.root.bounds(), |acc, b| union_bounds(&acc, &b))
    }

    /// Every emitted tile, level by level.
    ///
    /// Lazy across levels: a level's children are only computed once the
    /// previous level has been consumed.
    pub fn tiles(&self) -> PyramidTiles<'_> {
        PyramidTiles {
            level: self.root_block(),
            z: self.root.z,
            max_zoom: self.max_zoom,
            pos: 0,
            filter: self.materialize_zooms.as_deref(),
            finished: self.root.z > self.max_zoom,
        }
    }

    /// Emitted tiles aligned to the requested metatile grid.
    pub fn subpyramid_roots(&self) -> impl Iterator<Item = Tile> + '_ {
        let metatile = self.metatile;
        self.tiles()
            .filter(move |t| t.x % metatile == 0 && t.y % metatile == 0)
    }
}

/// Iterator returned by [`PyramidPlanner::tiles`].
pub struct PyramidTiles<'a> {
    level: Vec<Tile>,
    z: u8,
    max_zoom: u8,
    pos: usize,
    filter: Option<&'a [u8]>,
    finished: bool,
}

impl PyramidTiles<'_> {
    fn emits(&self, z: u8) -> bool {
        self.filter.map_or(true, |zooms| zooms.contains(&z))
    }
}

impl Iterator for PyramidTiles<'_> {
    type Item = Tile;

    fn next(&mut self) -> Option<Tile> {
        loop {
            if self.finished {
                return None;
            }

            if self.emits(self.z) {
                if let Some(tile) = self.level.get(self.pos) {
                    self.pos += 1;
                    return Some(*tile);
                }
            }

            if self.z >= self.max_zoom || self.level.is_empty() {
                self.finished = true;
                self.level = Vec::new();
                return None;
            }

            self.level = self.level.iter().flat_map(Tile::children).collect();
            self.z += 1;
            self.pos = 0;
        }
    }
}

impl std::iter::FusedIterator for PyramidTiles<'_> {}

/// Sort and de-duplicate materialize zooms, always including the root zoom
/// and dropping zooms past `max_zoom`.
pub fn normalize_materialize_zooms(root_zoom: u8, max_zoom: u8, zooms: &[u8]) -> Vec<u8> {
    let mut zooms: Vec<u8> = std::iter::once(root_zoom)
        .chain(zooms.iter().copied())
        .filter(|z| *z <= max_zoom)
        .collect();
    zooms.sort_unstable();
    zooms.dedup();
    zooms
}

/// Deepest zoom packaged in the archive rooted at zoom `z`.
///
/// One less than the next materialize zoom after `z`, or the job's
/// `max_zoom` when `z` is at or past the last one. `materialize_zooms` must
/// be sorted.
pub fn branch_max_zoom(materialize_zooms: &[u8], z: u8, max_zoom: u8) -> u8 {
    let idx = materialize_zooms.partition_point(|m| *m <= z);
    match materialize_zooms.get(idx) {
        Some(next) => next - 1,
        None => max_zoom,
    }
}

/// Everything needed to cut a job into independently packaged archives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializationPlan {
    pub root: Tile,
    pub max_zoom: u8,
    pub metatile: u32,
    /// Sorted, always contains `root.z`
    pub materialize_zooms: Vec<u8>,
}

impl MaterializationPlan {
    pub fn new(root: Tile, max_zoom: u8, metatile: u32, materialize_zooms: &[u8]) -> Result<Self> {
        if !root.is_valid() {
            return Err(Error::InvalidTile {
                z: root.z,
                x: root.x,
                y: root.y,
            });
        }
        if !metatile.is_power_of_two() {
            return Err(Error::InvalidMetatile(metatile));
        }
        let max_zoom = max_zoom.clamp(root.z, MAX_ZOOM);
        Ok(Self {
            root,
            max_zoom,
            metatile,
            materialize_zooms: normalize_materialize_zooms(root.z, max_zoom, materialize_zooms),
        })
    }

    fn planner(&self) -> Result<PyramidPlanner> {
        Ok(PyramidPlanner::new(self.root, self.max_zoom, self.metatile)?
            .with_materialize_zooms(self.materialize_zooms.clone()))
    }

    /// Roots of every archive in the job, in traversal order.
    pub fn subpyramid_roots(&self) -> Result<Vec<Tile>> {
        Ok(self.planner()?.subpyramid_roots().collect())
    }

    pub fn branch_max_zoom(&self, branch_root: &Tile) -> u8 {
        branch_max_zoom(&self.materialize_zooms, branch_root.z, self.max_zoom)
    }

    /// Planner for every tile packaged in the archive rooted at `branch_root`.
    pub fn branch(&self, branch_root: Tile) -> Result<PyramidPlanner> {
        PyramidPlanner::new(branch_root, self.branch_max_zoom(&branch_root), self.metatile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(z: u8, x: u32, y: u32) -> Tile {
        Tile::new(z, x, y).unwrap()
    }

    #[test]
    fn test_single_level_yields_root() {
        let root = tile(3, 2, 5);
        let planner = PyramidPlanner::new(root, 3, 1)
            .unwrap()
            .with_materialize_zooms(vec![3]);
        assert_eq!(planner.tiles().collect::<Vec<_>>(), vec![root]);
    }

    #[test]
    fn test_one_extra_level_yields_root_and_children() {
        let root = tile(3, 2, 5);
        let planner = PyramidPlanner::new(root, 4, 1).unwrap();
        let tiles: Vec<_> = planner.tiles().collect();
        assert_eq!(tiles.len(), 5);
        assert_eq!(tiles[0], root);
        assert_eq!(&tiles[1..], &root.children()[..]);
    }

    #[test]
    fn test_materialize_filter_skips_levels() {
        let root = tile(0, 0, 0);
        let planner = PyramidPlanner::new(root, 3, 1)
            .unwrap()
            .with_materialize_zooms(vec![0, 2]);
        let zooms: Vec<_> = planner.tiles().map(|t| t.z).collect();
        assert_eq!(zooms.len(), 1 + 16);
        assert!(zooms.iter().all(|z| *z == 0 || *z == 2));
    }

    #[test]
    fn test_root_block_bounds_cover_metatile() {
        let single = PyramidPlanner::new(tile(2, 0, 0), 2, 1).unwrap();
        assert_eq!(single.root_block_bounds(), tile(2, 0, 0).bounds());

        // 2x2 block at zoom 2 spans the north-west quadrant of the world
        let block = PyramidPlanner::new(tile(2, 0, 0), 2, 2).unwrap();
        let b = block.root_block_bounds();
        let quadrant = tile(1, 0, 0).bounds();
        for i in 0..4 {
            assert!((b[i] - quadrant[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn test_metatile_roots_are_aligned() {
        let planner = PyramidPlanner::new(tile(2, 0, 0), 4, 4).unwrap();
        let roots: Vec<_> = planner.subpyramid_roots().collect();
        assert!(!roots.is_empty());
        assert!(roots.iter().all(|t| t.x % 4 == 0 && t.y % 4 == 0));
        // 1 at z2, 4 at z3, 16 at z4
        assert_eq!(roots.len(), 1 + 4 + 16);
    }

    #[test]
    fn test_metatile_one_returns_every_tile() {
        let planner = PyramidPlanner::new(tile(1, 1, 0), 3, 1).unwrap();
        let all: Vec<_> = planner.tiles().collect();
        let roots: Vec<_> = planner.subpyramid_roots().collect();
        assert_eq!(all, roots);
        assert_eq!(all.len(), 1 + 4 + 16);
    }

    #[test]
    fn test_metatile_clamped_to_root_zoom() {
        let planner = PyramidPlanner::new(tile(2, 0, 0), 2, 8).unwrap();
        assert_eq!(planner.effective_metatile(), 4);
        assert_eq!(planner.tiles().count(), 16);

        let world = PyramidPlanner::new(tile(0, 0, 0), 0, 4).unwrap();
        assert_eq!(world.effective_metatile(), 1);
        assert_eq!(world.root_block(), vec![tile(0, 0, 0)]);
    }

    #[test]
    fn test_root_block_order_and_edges() {
        let planner = PyramidPlanner::new(tile(2, 0, 0), 2, 2).unwrap();
        assert_eq!(
            planner.root_block(),
            vec![tile(2, 0, 0), tile(2, 0, 1), tile(2, 1, 0), tile(2, 1, 1)]
        );

        // Block anchored at the grid edge loses the off-grid tiles
        let edge = PyramidPlanner::new(tile(2, 3, 3), 2, 2).unwrap();
        assert_eq!(edge.root_block(), vec![tile(2, 3, 3)]);
    }

    #[test]
    fn test_invalid_metatile() {
        assert!(matches!(
            PyramidPlanner::new(tile(0, 0, 0), 1, 3),
            Err(Error::InvalidMetatile(3))
        ));
        assert!(PyramidPlanner::new(tile(0, 0, 0), 1, 0).is_err());
    }

    #[test]
    fn test_branch_max_zoom() {
        let zooms = [0, 4, 8];
        assert_eq!(branch_max_zoom(&zooms, 0, 12), 3);
        assert_eq!(branch_max_zoom(&zooms, 4, 12), 7);
        assert_eq!(branch_max_zoom(&zooms, 5, 12), 7);
        assert_eq!(branch_max_zoom(&zooms, 8, 12), 12);
    }

    #[test]
    fn test_normalize_materialize_zooms() {
        assert_eq!(normalize_materialize_zooms(2, 10, &[8, 4, 4, 12]), vec![2, 4, 8]);
        assert_eq!(normalize_materialize_zooms(0, 5, &[]), vec![0]);
    }

    #[test]
    fn test_plan_branches() {
        let plan = MaterializationPlan::new(tile(0, 0, 0), 5, 1, &[3]).unwrap();
        assert_eq!(plan.materialize_zooms, vec![0, 3]);

        let roots = plan.subpyramid_roots().unwrap();
        assert_eq!(roots.len(), 1 + 64);
        assert_eq!(roots[0], tile(0, 0, 0));

        // World branch covers zooms 0..=2
        let world = plan.branch(roots[0]).unwrap();
        assert_eq!(world.tiles().count(), 1 + 4 + 16);

        // Each zoom-3 branch covers zooms 3..=5
        let deep = plan.branch(roots[1]).unwrap();
        assert_eq!(deep.tiles().count(), 1 + 4 + 16);
        assert_eq!(plan.branch_max_zoom(&roots[1]), 5);
    }

    #[test]
    fn test_plan_rejects_invalid_root() {
        let bad = Tile { z: 1, x: 2, y: 0 };
        assert!(matches!(
            MaterializationPlan::new(bad, 3, 1, &[]),
            Err(Error::InvalidTile { .. })
        ));
    }
}
