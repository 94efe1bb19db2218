//! Source footprint records and the GeoJSON catalog document they load from.

use crate::crs::Bounds;
use crate::error::Error;
use crate::tile::MAX_ZOOM;
use crate::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use geo::{BoundingRect, CoordsIter, LineString, MultiPolygon, Polygon};
use rstar::{RTreeObject, AABB};
use serde::Deserialize;
use serde_json::Value;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Priority assumed for sources that do not carry one.
pub const DEFAULT_PRIORITY: f64 = 0.5;

/// A registered data source and its coverage footprint.
///
/// Immutable once loaded; indexes hand out `Arc<Source>` clones.
#[derive(Debug, Clone)]
pub struct Source {
    /// Human-readable dataset name
    pub name: String,

    /// Location of the raster; also the source's identity
    pub url: String,

    /// Ground sample distance in meters
    pub resolution: f64,

    /// First zoom level the source is valid for
    pub min_zoom: u8,

    /// Last zoom level the source is valid for
    pub max_zoom: u8,

    /// Ranking weight, see [`Source::priority`]
    pub priority: Option<f64>,

    /// Opaque band description, passed through to the renderer
    pub band_info: Value,

    /// Opaque rendering recipes, passed through to the renderer
    pub recipes: Value,

    /// Opaque metadata, passed through to the renderer
    pub meta: Value,

    /// Acquisition date, if known
    pub acquired_at: Option<NaiveDate>,

    /// Footprint in WGS84
    pub geom: MultiPolygon<f64>,

    /// Optional polygon restricting usable pixels
    pub mask: Option<MultiPolygon<f64>>,
}

impl Source {
    /// Create a source with default ranking fields and empty pass-through blobs.
    pub fn new(url: impl Into<String>, resolution: f64, geom: MultiPolygon<f64>) -> Self {
        let url = url.into();
        Self {
            name: url.clone(),
            url,
            resolution,
            min_zoom: 0,
            max_zoom: MAX_ZOOM,
            priority: None,
            band_info: empty_object(),
            recipes: empty_object(),
            meta: empty_object(),
            acquired_at: None,
            geom,
            mask: None,
        }
    }

    /// Effective priority ([`DEFAULT_PRIORITY`] when unset).
    pub fn priority(&self) -> f64 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }

    /// Whether `[min_zoom, max_zoom]` overlaps the given zoom range.
    pub fn covers_zooms(&self, zooms: &RangeInclusive<u8>) -> bool {
        self.min_zoom <= *zooms.end() && self.max_zoom >= *zooms.start()
    }

    /// WGS84 bounding box of the footprint.
    pub fn bounds(&self) -> Option<Bounds> {
        self.geom
            .bounding_rect()
            .map(|r| [r.min().x, r.min().y, r.max().x, r.max().y])
    }

    /// Check that the footprint is usable for geometry algebra.
    pub fn validate(&self) -> Result<()> {
        validate_geometry(&self.url, &self.geom)?;
        if let Some(mask) = &self.mask {
            validate_geometry(&self.url, mask)?;
        }
        Ok(())
    }
}

fn validate_geometry(source_id: &str, geom: &MultiPolygon<f64>) -> Result<()> {
    let malformed = |reason: &str| Error::MalformedGeometry {
        source_id: source_id.to_string(),
        reason: reason.to_string(),
    };

    if geom.0.is_empty() {
        return Err(malformed("empty geometry"));
    }
    if geom.0.iter().any(|p| p.exterior().0.len() < 4) {
        return Err(malformed("polygon ring has fewer than 4 positions"));
    }
    if geom.coords_iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return Err(malformed("non-finite coordinate"));
    }
    Ok(())
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// R-tree entry wrapping a shared source with its precomputed envelope.
#[derive(Debug, Clone)]
pub(crate) struct IndexedSource {
    pub(crate) source: Arc<Source>,
    envelope: AABB<[f64; 2]>,
}

impl IndexedSource {
    /// Returns None for sources without a bounding box.
    pub(crate) fn new(source: Arc<Source>) -> Option<Self> {
        let b = source.bounds()?;
        Some(Self {
            source,
            envelope: AABB::from_corners([b[0], b[1]], [b[2], b[3]]),
        })
    }
}

impl RTreeObject for IndexedSource {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

// ============================================================================
// GeoJSON catalog documents
// ============================================================================

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Option<Value>,
    properties: FootprintProperties,
}

#[derive(Debug, Deserialize)]
struct FootprintProperties {
    url: String,
    #[serde(default)]
    name: Option<String>,
    resolution: f64,
    #[serde(default)]
    min_zoom: Option<u8>,
    #[serde(default)]
    max_zoom: Option<u8>,
    #[serde(default)]
    priority: Option<f64>,
    #[serde(default = "empty_object")]
    band_info: Value,
    #[serde(default = "empty_object")]
    recipes: Value,
    #[serde(default = "empty_object")]
    meta: Value,
    #[serde(default)]
    acquired_at: Option<String>,
    #[serde(default)]
    mask: Option<Value>,
}

/// Parse a GeoJSON FeatureCollection of footprints.
///
/// A document that is not a FeatureCollection fails with
/// [`Error::CatalogUnavailable`]. Individual features that cannot be used
/// are skipped with a warning.
pub fn parse_catalog(bytes: &[u8]) -> Result<Vec<Source>> {
    let collection: FeatureCollection = serde_json::from_slice(bytes)
        .map_err(|e| Error::CatalogUnavailable(format!("invalid catalog document: {}", e)))?;

    let total = collection.features.len();
    let sources: Vec<Source> = collection
        .features
        .into_iter()
        .enumerate()
        .filter_map(|(i, value)| match source_from_feature(value) {
            Ok(source) => Some(source),
            Err(e) => {
                tracing::warn!("Skipping catalog feature {}: {}", i, e);
                None
            }
        })
        .collect();

    tracing::info!("Parsed {} of {} catalog features", sources.len(), total);
    Ok(sources)
}

fn source_from_feature(value: Value) -> Result<Source> {
    let feature: Feature = serde_json::from_value(value)?;
    let props = feature.properties;

    let geom = feature
        .geometry
        .as_ref()
        .ok_or_else(|| "missing geometry".to_string())
        .and_then(geometry_from_geojson)
        .map_err(|reason| Error::MalformedGeometry {
            source_id: props.url.clone(),
            reason,
        })?;

    let mask = match props.mask.as_ref().filter(|m| !m.is_null()) {
        Some(m) => Some(geometry_from_geojson(m).map_err(|reason| Error::MalformedGeometry {
            source_id: props.url.clone(),
            reason: format!("mask: {}", reason),
        })?),
        None => None,
    };

    let acquired_at = props.acquired_at.as_deref().and_then(|raw| {
        let parsed = parse_date(raw);
        if parsed.is_none() {
            tracing::warn!("Ignoring unparseable acquired_at {:?} for {}", raw, props.url);
        }
        parsed
    });

    let source = Source {
        name: props.name.unwrap_or_else(|| props.url.clone()),
        url: props.url,
        resolution: props.resolution,
        min_zoom: props.min_zoom.unwrap_or(0),
        max_zoom: props.max_zoom.unwrap_or(MAX_ZOOM),
        priority: props.priority,
        band_info: props.band_info,
        recipes: props.recipes,
        meta: props.meta,
        acquired_at,
        geom,
        mask,
    };
    source.validate()?;
    Ok(source)
}

/// Parse an ISO date or datetime into a calendar date.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
                .ok()
                .map(|dt| dt.date())
        })
}

/// Convert a GeoJSON Polygon or MultiPolygon into a MultiPolygon.
pub fn geometry_from_geojson(value: &Value) -> std::result::Result<MultiPolygon<f64>, String> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or("geometry has no type")?;
    let coordinates = value.get("coordinates").ok_or("geometry has no coordinates")?;

    match kind {
        "Polygon" => {
            let rings: Vec<Vec<Vec<f64>>> =
                serde_json::from_value(coordinates.clone()).map_err(|e| e.to_string())?;
            Ok(MultiPolygon::new(vec![polygon_from_rings(rings)?]))
        }
        "MultiPolygon" => {
            let polygons: Vec<Vec<Vec<Vec<f64>>>> =
                serde_json::from_value(coordinates.clone()).map_err(|e| e.to_string())?;
            let polygons = polygons
                .into_iter()
                .map(polygon_from_rings)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(MultiPolygon::new(polygons))
        }
        other => Err(format!("unsupported geometry type {}", other)),
    }
}

fn polygon_from_rings(rings: Vec<Vec<Vec<f64>>>) -> std::result::Result<Polygon<f64>, String> {
    let mut rings = rings.into_iter().map(|ring| {
        ring.into_iter()
            .map(|pos| match pos.as_slice() {
                [x, y, ..] => Ok((*x, *y)),
                _ => Err("position has fewer than 2 values".to_string()),
            })
            .collect::<std::result::Result<Vec<(f64, f64)>, _>>()
            .map(LineString::from)
    });

    let exterior = rings.next().ok_or("polygon has no rings")??;
    let interiors = rings.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

/// Serialize a geometry as a GeoJSON MultiPolygon value.
pub fn geometry_to_geojson(geom: &MultiPolygon<f64>) -> Value {
    let ring = |ls: &LineString<f64>| -> Vec<[f64; 2]> { ls.0.iter().map(|c| [c.x, c.y]).collect() };
    let coordinates: Vec<Vec<Vec<[f64; 2]>>> = geom
        .0
        .iter()
        .map(|p| {
            std::iter::once(ring(p.exterior()))
                .chain(p.interiors().iter().map(&ring))
                .collect()
        })
        .collect();

    serde_json::json!({
        "type": "MultiPolygon",
        "coordinates": coordinates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::bounds_to_geometry;

    const CATALOG: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "geometry": {"type": "Polygon", "coordinates": [[[0,0],[10,0],[10,10],[0,10],[0,0]]]},
                "properties": {
                    "url": "s3://lc/nlcd.tif", "name": "NLCD", "resolution": 30.0,
                    "min_zoom": 4, "max_zoom": 13, "priority": 0.8,
                    "acquired_at": "2016-01-01", "meta": {"year": 2016}
                }
            },
            {
                "type": "Feature",
                "geometry": {"type": "MultiPolygon", "coordinates": [[[[-5,-5,0],[5,-5,0],[5,5,0],[-5,5,0],[-5,-5,0]]]]},
                "properties": {"url": "s3://lc/modis.tif", "resolution": 500.0, "acquired_at": "2012-06-30T12:00:00Z"}
            },
            {
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [1, 2]},
                "properties": {"url": "s3://lc/point.tif", "resolution": 1.0}
            },
            {
                "type": "Feature",
                "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[0,0]]]},
                "properties": {"url": "s3://lc/sliver.tif", "resolution": 1.0}
            },
            {
                "type": "Feature",
                "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]},
                "properties": {"name": "no url"}
            }
        ]
    }"#;

    #[test]
    fn test_parse_catalog_skips_unusable_features() {
        let sources = parse_catalog(CATALOG.as_bytes()).unwrap();
        let urls: Vec<_> = sources.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(urls, vec!["s3://lc/nlcd.tif", "s3://lc/modis.tif"]);

        let nlcd = &sources[0];
        assert_eq!(nlcd.name, "NLCD");
        assert_eq!((nlcd.min_zoom, nlcd.max_zoom), (4, 13));
        assert_eq!(nlcd.priority(), 0.8);
        assert_eq!(nlcd.acquired_at, NaiveDate::from_ymd_opt(2016, 1, 1));
        assert_eq!(nlcd.meta["year"], 2016);
        assert_eq!(nlcd.bounds(), Some([0.0, 0.0, 10.0, 10.0]));

        let modis = &sources[1];
        assert_eq!(modis.name, modis.url);
        assert_eq!(modis.priority(), DEFAULT_PRIORITY);
        assert_eq!((modis.min_zoom, modis.max_zoom), (0, MAX_ZOOM));
        assert_eq!(modis.acquired_at, NaiveDate::from_ymd_opt(2012, 6, 30));
        assert!(modis.recipes.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_parse_catalog_rejects_non_collection() {
        let err = parse_catalog(b"[1, 2, 3]").unwrap_err();
        assert!(matches!(err, Error::CatalogUnavailable(_)));
    }

    #[test]
    fn test_validate_non_finite() {
        let mut source = Source::new("bad", 10.0, bounds_to_geometry(&[0.0, 0.0, 1.0, 1.0]));
        assert!(source.validate().is_ok());

        source.geom = bounds_to_geometry(&[0.0, 0.0, f64::NAN, 1.0]);
        assert!(matches!(
            source.validate(),
            Err(Error::MalformedGeometry { .. })
        ));

        source.geom = MultiPolygon::new(vec![]);
        assert!(source.validate().is_err());
    }

    #[test]
    fn test_covers_zooms() {
        let mut source = Source::new("s", 10.0, bounds_to_geometry(&[0.0, 0.0, 1.0, 1.0]));
        source.min_zoom = 5;
        source.max_zoom = 9;
        assert!(source.covers_zooms(&(7..=7)));
        assert!(source.covers_zooms(&(0..=5)));
        assert!(source.covers_zooms(&(9..=12)));
        assert!(!source.covers_zooms(&(10..=12)));
        assert!(!source.covers_zooms(&(4..=4)));
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2019, 3, 4);
        assert_eq!(parse_date("2019-03-04"), expected);
        assert_eq!(parse_date("2019-03-04T10:11:12Z"), expected);
        assert_eq!(parse_date("2019-03-04T10:11:12"), expected);
        assert_eq!(parse_date("2019-03-04 10:11:12.5"), expected);
        assert_eq!(parse_date("March 4th"), None);
    }

    #[test]
    fn test_geometry_geojson_round_trip() {
        let geom = bounds_to_geometry(&[1.0, 2.0, 3.0, 4.0]);
        let value = geometry_to_geojson(&geom);
        assert_eq!(value["type"], "MultiPolygon");
        assert_eq!(geometry_from_geojson(&value).unwrap(), geom);
    }
}
