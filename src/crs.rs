//! Coordinate Reference System utilities.
//!
//! ## CRS used in this crate:
//!
//! - **WGS84 (EPSG:4326)**: Geographic coordinates (lon, lat in degrees).
//!   Used for: source footprints, R-tree spatial index, geometry algebra,
//!   archive metadata bounds.
//!
//! - **Web Mercator (EPSG:3857)**: Projected coordinates (x, y in meters).
//!   Used for: tile query regions and per-tile resolution. Transforms
//!   between these two use closed-form math.
//!
//! - **Any other EPSG code** (e.g. EPSG:32610 UTM 10N): query regions given
//!   by callers. Transformed through PROJ.
//!
//! ## Coordinate order convention:
//!
//! - Bounds arrays: `[min_x, min_y, max_x, max_y]` = `[west, south, east, north]`
//! - For WGS84: `[min_lon, min_lat, max_lon, max_lat]`

/// Common CRS codes used throughout the crate.
pub mod codes {
    /// WGS84 geographic coordinate system (lon/lat in degrees).
    pub const WGS84: &str = "EPSG:4326";

    /// Spherical Web Mercator (x/y in meters).
    pub const WEB_MERCATOR: &str = "EPSG:3857";
}

use crate::error::Error;
use crate::tile::{EARTH_RADIUS, HALF_EXTENT};
use geo::{MultiPolygon, Polygon, Rect};
use proj::Proj;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Bounds in a specific CRS: [min_x, min_y, max_x, max_y]
pub type Bounds = [f64; 4];

/// A coordinate reference system identified by EPSG code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Crs {
    Wgs84,
    WebMercator,
    Epsg(u32),
}

impl Crs {
    /// Parse a CRS identifier such as `EPSG:4326` or `epsg:32610`.
    pub fn parse(code: &str) -> Result<Self, Error> {
        let upper = code.trim().to_ascii_uppercase();
        match upper.as_str() {
            "EPSG:4326" | "WGS84" | "CRS:84" => Ok(Crs::Wgs84),
            "EPSG:3857" | "EPSG:900913" | "EPSG:3785" => Ok(Crs::WebMercator),
            other => other
                .strip_prefix("EPSG:")
                .and_then(|n| n.parse().ok())
                .map(Crs::Epsg)
                .ok_or_else(|| Error::UnsupportedCrs(code.to_string())),
        }
    }

    /// Authority code understood by PROJ.
    pub fn code(&self) -> String {
        match self {
            Crs::Wgs84 => codes::WGS84.to_string(),
            Crs::WebMercator => codes::WEB_MERCATOR.to_string(),
            Crs::Epsg(n) => format!("EPSG:{}", n),
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

/// Cache of PROJ transformations keyed by (source, target) code.
///
/// `Proj` handles are not `Sync`, so each thread keeps its own cache.
#[derive(Default)]
struct ProjCache {
    cache: RefCell<HashMap<(String, String), Rc<Proj>>>,
}

impl ProjCache {
    fn get(&self, from: Crs, to: Crs) -> Result<Rc<Proj>, Error> {
        let key = (from.code(), to.code());
        if let Some(proj) = self.cache.borrow().get(&key) {
            return Ok(Rc::clone(proj));
        }

        let proj = Proj::new_known_crs(&key.0, &key.1, None).map_err(|e| {
            Error::UnsupportedCrs(format!("no transformation from {} to {}: {}", from, to, e))
        })?;
        let proj = Rc::new(proj);
        self.cache.borrow_mut().insert(key, Rc::clone(&proj));
        Ok(proj)
    }
}

thread_local! {
    static PROJ_CACHE: ProjCache = ProjCache::default();
}

/// Project a lon/lat pair to Web Mercator meters.
///
/// Latitudes at the poles project to infinite `y`.
pub fn lonlat_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
    let x = lon.to_radians() * EARTH_RADIUS;
    let y = (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln() * EARTH_RADIUS;
    (x, y)
}

/// Unproject Web Mercator meters to a lon/lat pair.
pub fn mercator_to_lonlat(x: f64, y: f64) -> (f64, f64) {
    let lon = x / HALF_EXTENT * 180.0;
    let lat = (y / EARTH_RADIUS).sinh().atan().to_degrees();
    (lon, lat)
}

/// Closed-form transform, when one exists for the pair.
fn closed_form(from: Crs, to: Crs) -> Option<fn(f64, f64) -> (f64, f64)> {
    match (from, to) {
        (Crs::Wgs84, Crs::WebMercator) => Some(lonlat_to_mercator),
        (Crs::WebMercator, Crs::Wgs84) => Some(mercator_to_lonlat),
        _ => None,
    }
}

/// Transform a single point between CRS.
pub fn transform_point(x: f64, y: f64, from: Crs, to: Crs) -> Result<(f64, f64), Error> {
    if from == to {
        return Ok((x, y));
    }
    if let Some(transform) = closed_form(from, to) {
        return Ok(transform(x, y));
    }

    PROJ_CACHE.with(|cache| {
        let proj = cache.get(from, to)?;
        proj.convert((x, y)).map_err(|e| Error::Reprojection {
            from: from.code(),
            to: to.code(),
            reason: format!("point ({}, {}): {}", x, y, e),
        })
    })
}

/// Transform bounds between CRS.
///
/// Transforms all 4 corners and returns the bounding box of the result.
/// Non-finite results are kept as-is; see [`clamp_to_world`].
pub fn transform_bounds(bounds: &Bounds, from: Crs, to: Crs) -> Result<Bounds, Error> {
    if from == to {
        return Ok(*bounds);
    }

    let corners = [
        (bounds[0], bounds[1]), // SW
        (bounds[2], bounds[1]), // SE
        (bounds[2], bounds[3]), // NE
        (bounds[0], bounds[3]), // NW
    ];

    let mut min_x = f64::MAX;
    let mut min_y = f64::MAX;
    let mut max_x = f64::MIN;
    let mut max_y = f64::MIN;

    for (x, y) in corners {
        let (tx, ty) = transform_point(x, y, from, to)?;
        min_x = min_x.min(tx);
        min_y = min_y.min(ty);
        max_x = max_x.max(tx);
        max_y = max_y.max(ty);
    }

    Ok([min_x, min_y, max_x, max_y])
}

/// Substitute world extremes for any non-finite WGS84 bound.
pub fn clamp_to_world(bounds: Bounds) -> Bounds {
    let pick = |v: f64, fallback: f64| if v.is_finite() { v } else { fallback };
    [
        pick(bounds[0], -180.0),
        pick(bounds[1], -90.0),
        pick(bounds[2], 180.0),
        pick(bounds[3], 90.0),
    ]
}

/// Smallest bounds containing both inputs.
pub fn union_bounds(a: &Bounds, b: &Bounds) -> Bounds {
    [a[0].min(b[0]), a[1].min(b[1]), a[2].max(b[2]), a[3].max(b[3])]
}

/// Bounds as a single-polygon geometry.
pub fn bounds_to_geometry(bounds: &Bounds) -> MultiPolygon<f64> {
    let rect = Rect::new((bounds[0], bounds[1]), (bounds[2], bounds[3]));
    MultiPolygon::new(vec![Polygon::from(rect)])
}
