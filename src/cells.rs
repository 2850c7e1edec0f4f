//! # Cell Index
//!
//! Quantizes coordinates onto the H3 hexagonal grid and back.
//!
//! Two points inside the same cell footprint map to the same [`CellId`];
//! that quantization is the whole point of the territory game. Decoding a
//! cell's boundary and re-indexing its centroid returns the same id.
//!
//! The resolution must be the one the backend aggregates leaderboards at
//! (see [`TerritoryConfig::hex_resolution`](crate::TerritoryConfig)).

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use geo::{Centroid, Coord, LineString, Polygon};
use h3o::{CellIndex, LatLng, Resolution};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::geo_utils::haversine_distance;
use crate::{Bounds, GpsPoint, Result, TerritoryError};

// ============================================================================
// CellId
// ============================================================================

/// Identifier of one H3 cell.
///
/// Displays and serializes as the canonical lowercase hex string
/// (`"891f1d48177ffff"`). Deserializes from that string, a decimal string,
/// or a JSON integer, since the backend uses both encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(CellIndex);

impl CellId {
    /// Parse a hex (or decimal) cell id string.
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if let Ok(index) = CellIndex::from_str(trimmed) {
            return Ok(Self(index));
        }
        // Backend int64 ids sometimes arrive stringified
        match trimmed.parse::<u64>() {
            Ok(raw) => Self::from_u64(raw).map_err(|e| match e {
                TerritoryError::InvalidCellId { reason, .. } => TerritoryError::InvalidCellId {
                    value: value.to_string(),
                    reason,
                },
                other => other,
            }),
            Err(_) => Err(TerritoryError::InvalidCellId {
                value: value.to_string(),
                reason: "not a hex or decimal H3 index".to_string(),
            }),
        }
    }

    pub fn from_u64(raw: u64) -> Result<Self> {
        CellIndex::try_from(raw)
            .map(Self)
            .map_err(|e| TerritoryError::InvalidCellId {
                value: raw.to_string(),
                reason: e.to_string(),
            })
    }

    /// The backend stores cells as signed 64-bit integers.
    pub fn from_i64(raw: i64) -> Result<Self> {
        if raw < 0 {
            return Err(TerritoryError::InvalidCellId {
                value: raw.to_string(),
                reason: "negative H3 index".to_string(),
            });
        }
        Self::from_u64(raw as u64)
    }

    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    /// Signed form used by the activity ingestion endpoint.
    ///
    /// Valid H3 indexes keep the high bit clear, so the cast is lossless.
    pub fn as_i64(self) -> i64 {
        self.as_u64() as i64
    }

    pub fn index(self) -> CellIndex {
        self.0
    }

    pub fn resolution(self) -> u8 {
        u8::from(self.0.resolution())
    }

    /// Center of the cell.
    pub fn center(self) -> GpsPoint {
        let ll = LatLng::from(self.0);
        GpsPoint::new(ll.lat(), ll.lng())
    }

    /// Boundary polygon of the cell, counter-clockwise.
    pub fn boundary(self) -> CellBoundary {
        let vertices = self
            .0
            .boundary()
            .iter()
            .map(|ll| GpsPoint::new(ll.lat(), ll.lng()))
            .collect();
        CellBoundary {
            cell_id: self,
            vertices,
        }
    }

    /// Largest center-to-vertex distance in meters.
    pub fn circumradius_m(self) -> f64 {
        let center = self.center();
        self.boundary()
            .vertices
            .iter()
            .map(|v| haversine_distance(&center, v))
            .fold(0.0, f64::max)
    }
}

impl From<CellIndex> for CellId {
    fn from(index: CellIndex) -> Self {
        Self(index)
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CellId {
    type Err = TerritoryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for CellId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CellId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(CellIdVisitor)
    }
}

struct CellIdVisitor;

impl<'de> Visitor<'de> for CellIdVisitor {
    type Value = CellId;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an H3 cell index as hex string or integer")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<CellId, E> {
        CellId::parse(v).map_err(E::custom)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<CellId, E> {
        CellId::from_u64(v).map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<CellId, E> {
        CellId::from_i64(v).map_err(E::custom)
    }
}

// ============================================================================
// CellBoundary
// ============================================================================

/// Polygon outline of one cell.
///
/// Usually 6 vertices; cells next to icosahedron edges can carry more,
/// pentagons have 5.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellBoundary {
    pub cell_id: CellId,
    /// Vertices in counter-clockwise order, not closed
    pub vertices: Vec<GpsPoint>,
}

impl CellBoundary {
    /// Polygon in (lng, lat) planar coordinates.
    ///
    /// Longitudes are unwrapped around the first vertex so cells crossing
    /// the antimeridian stay contiguous; they may exceed ±180.
    pub fn to_polygon(&self) -> Polygon<f64> {
        let reference = self.vertices.first().map(|v| v.longitude).unwrap_or(0.0);
        let coords: Vec<Coord<f64>> = self
            .vertices
            .iter()
            .map(|v| Coord {
                x: unwrap_longitude(v.longitude, reference),
                y: v.latitude,
            })
            .collect();
        Polygon::new(LineString::from(coords), vec![])
    }

    /// Area-weighted centroid.
    pub fn centroid(&self) -> GpsPoint {
        centroid_of(self)
    }

    /// Axis-aligned envelope (unwrapped longitudes, see [`Self::to_polygon`]).
    pub fn envelope(&self) -> Bounds {
        let reference = self.vertices.first().map(|v| v.longitude).unwrap_or(0.0);
        let unwrapped: Vec<GpsPoint> = self
            .vertices
            .iter()
            .map(|v| GpsPoint::new(v.latitude, unwrap_longitude(v.longitude, reference)))
            .collect();
        Bounds::from_points(&unwrapped).unwrap_or(Bounds {
            min_lat: 0.0,
            max_lat: 0.0,
            min_lng: 0.0,
            max_lng: 0.0,
        })
    }

    /// Flat [lat, lng, lat, lng, ...] buffer for map rendering.
    pub fn to_flat(&self) -> Vec<f64> {
        self.vertices
            .iter()
            .flat_map(|v| [v.latitude, v.longitude])
            .collect()
    }
}

fn unwrap_longitude(lng: f64, reference: f64) -> f64 {
    let delta = lng - reference;
    if delta > 180.0 {
        lng - 360.0
    } else if delta < -180.0 {
        lng + 360.0
    } else {
        lng
    }
}

fn normalize_longitude(lng: f64) -> f64 {
    if lng > 180.0 {
        lng - 360.0
    } else if lng < -180.0 {
        lng + 360.0
    } else {
        lng
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Largest radius accepted by [`neighbors_within_radius`].
///
/// The grid disk grows with the square of the radius; 50 km is already
/// ~80k cells at resolution 9.
pub const MAX_NEIGHBOR_RADIUS_M: f64 = 50_000.0;

/// Cell containing `point` at `resolution`.
///
/// Fails with `InvalidCoordinate` for out-of-range or non-finite input.
///
/// ```rust
/// use stridewars_core::{cells, GpsPoint};
/// use h3o::Resolution;
///
/// let a = cells::index_of(GpsPoint::new(52.2297, 21.0122), Resolution::Nine).unwrap();
/// let b = cells::index_of(GpsPoint::new(52.2297, 21.0122), Resolution::Nine).unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.resolution(), 9);
/// ```
pub fn index_of(point: GpsPoint, resolution: Resolution) -> Result<CellId> {
    let point = point.validated()?;
    let ll = LatLng::new(point.latitude, point.longitude).map_err(|_| {
        TerritoryError::InvalidCoordinate {
            latitude: point.latitude,
            longitude: point.longitude,
        }
    })?;
    Ok(CellId(ll.to_cell(resolution)))
}

/// Boundary of a cell given its textual id.
///
/// Fails with `InvalidCellId` for anything that is not a valid H3 index.
pub fn boundary_of(cell_id: &str) -> Result<CellBoundary> {
    Ok(CellId::parse(cell_id)?.boundary())
}

/// Area-weighted centroid of a boundary polygon.
///
/// Falls back to the vertex mean for degenerate (zero-area) input.
pub fn centroid_of(boundary: &CellBoundary) -> GpsPoint {
    let polygon = boundary.to_polygon();
    match polygon.centroid() {
        Some(c) => GpsPoint::new(c.y(), normalize_longitude(c.x())),
        None => boundary.cell_id.center(),
    }
}

/// All cells whose footprint may intersect the disk of `radius_m` around `center`.
///
/// Grid-distance expansion followed by a conservative distance filter: a
/// cell is kept when its center lies within `radius_m` plus its own
/// circumradius. Over-inclusion at the rim is expected; no intersecting
/// cell is ever left out.
///
/// Fails with `InvalidRadius` for a negative, non-finite, or larger than
/// [`MAX_NEIGHBOR_RADIUS_M`] radius.
pub fn neighbors_within_radius(
    center: GpsPoint,
    radius_m: f64,
    resolution: Resolution,
) -> Result<HashSet<CellId>> {
    if !(0.0..=MAX_NEIGHBOR_RADIUS_M).contains(&radius_m) {
        return Err(TerritoryError::InvalidRadius { radius_m });
    }
    let origin = index_of(center, resolution)?;

    // Local cell geometry drives the ring count, not the global average
    let origin_boundary = origin.boundary();
    let circumradius = origin.circumradius_m();
    let min_edge = origin_boundary
        .vertices
        .iter()
        .zip(origin_boundary.vertices.iter().cycle().skip(1))
        .map(|(a, b)| haversine_distance(a, b))
        .fold(f64::MAX, f64::min)
        .min(resolution.edge_length_m());

    // Grid disk k covers every center within 1.5 * k * edge of the origin
    // center; the sample itself may sit a circumradius away from it.
    let reach = radius_m + 2.0 * circumradius;
    let k = (reach / (1.5 * min_edge)).ceil() as u32 + 1;

    let disk: Vec<CellIndex> = origin.index().grid_disk(k);
    let cells = disk
        .into_iter()
        .map(CellId)
        .filter(|cell| {
            let d = haversine_distance(&center, &cell.center());
            d <= radius_m + cell.circumradius_m()
        })
        .collect();

    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::offset_point;

    const RES: Resolution = Resolution::Nine;

    fn sample_points() -> Vec<GpsPoint> {
        vec![
            GpsPoint::new(52.2297, 21.0122),  // Warsaw
            GpsPoint::new(50.0647, 19.9450),  // Krakow
            GpsPoint::new(-33.8688, 151.2093), // Sydney
            GpsPoint::new(40.7128, -74.0060), // New York
            GpsPoint::new(0.0, 0.0),
            GpsPoint::new(0.3, 179.9995),     // antimeridian
            GpsPoint::new(-0.3, -179.9995),
            GpsPoint::new(64.1466, -21.9426), // Reykjavik
            GpsPoint::new(-54.8019, -68.3030), // Ushuaia
        ]
    }

    #[test]
    fn test_index_is_deterministic() {
        for p in sample_points() {
            let a = index_of(p, RES).unwrap();
            let b = index_of(p, RES).unwrap();
            assert_eq!(a, b);
            assert_eq!(a.resolution(), 9);
        }
    }

    #[test]
    fn test_round_trip_through_centroid() {
        for p in sample_points() {
            let cell = index_of(p, RES).unwrap();
            let centroid = centroid_of(&cell.boundary());
            assert_eq!(index_of(centroid, RES).unwrap(), cell, "point {:?}", p);
            assert_eq!(index_of(cell.center(), RES).unwrap(), cell);
        }
    }

    #[test]
    fn test_nearby_points_share_cell() {
        let cell = index_of(GpsPoint::new(52.2297, 21.0122), RES).unwrap();
        let center = cell.center();
        let nudged = offset_point(&center, 5.0, 5.0);
        assert_eq!(index_of(nudged, RES).unwrap(), cell);
    }

    #[test]
    fn test_invalid_coordinates() {
        for p in [
            GpsPoint::new(90.1, 0.0),
            GpsPoint::new(-91.0, 0.0),
            GpsPoint::new(0.0, 180.5),
            GpsPoint::new(f64::NAN, 0.0),
            GpsPoint::new(0.0, f64::INFINITY),
        ] {
            assert!(matches!(
                index_of(p, RES),
                Err(TerritoryError::InvalidCoordinate { .. })
            ));
        }
    }

    #[test]
    fn test_boundary_has_hexagon_shape() {
        let cell = index_of(GpsPoint::new(52.2297, 21.0122), RES).unwrap();
        let boundary = boundary_of(&cell.to_string()).unwrap();
        assert_eq!(boundary.cell_id, cell);
        assert!((5..=10).contains(&boundary.vertices.len()));
        // Every vertex lies roughly one edge length from the center
        let center = cell.center();
        for v in &boundary.vertices {
            let d = haversine_distance(&center, v);
            assert!(d > 100.0 && d < 300.0, "vertex at {} m", d);
        }
    }

    #[test]
    fn test_boundary_of_malformed_id() {
        for bad in ["", "hello", "ffffffffffffffff", "0"] {
            assert!(
                matches!(boundary_of(bad), Err(TerritoryError::InvalidCellId { .. })),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_parse_accepts_hex_and_decimal() {
        let cell = index_of(GpsPoint::new(50.0647, 19.9450), RES).unwrap();
        assert_eq!(CellId::parse(&cell.to_string()).unwrap(), cell);
        assert_eq!(CellId::parse(&cell.as_u64().to_string()).unwrap(), cell);
        assert_eq!(CellId::from_i64(cell.as_i64()).unwrap(), cell);
        assert!(CellId::from_i64(-1).is_err());
    }

    #[test]
    fn test_serde_string_and_integer() {
        let cell = index_of(GpsPoint::new(50.0647, 19.9450), RES).unwrap();
        let json = serde_json::to_string(&cell).unwrap();
        assert_eq!(json, format!("\"{}\"", cell));

        let from_str: CellId = serde_json::from_str(&json).unwrap();
        let from_int: CellId = serde_json::from_str(&cell.as_u64().to_string()).unwrap();
        assert_eq!(from_str, cell);
        assert_eq!(from_int, cell);

        assert!(serde_json::from_str::<CellId>("\"nope\"").is_err());
    }

    #[test]
    fn test_antimeridian_polygon_is_contiguous() {
        let cell = index_of(GpsPoint::new(0.3, 179.9995), RES).unwrap();
        let envelope = cell.boundary().envelope();
        // Unwrapped envelope is cell sized, not globe sized
        assert!(envelope.max_lng - envelope.min_lng < 0.1);
    }

    #[test]
    fn test_neighbors_zero_radius_contains_origin() {
        let p = GpsPoint::new(52.2297, 21.0122);
        let origin = index_of(p, RES).unwrap();
        let cells = neighbors_within_radius(p, 0.0, RES).unwrap();
        assert!(cells.contains(&origin));
    }

    #[test]
    fn test_neighbors_cover_the_disk() {
        let center = GpsPoint::new(52.2297, 21.0122);
        let radius = 600.0;
        let cells = neighbors_within_radius(center, radius, RES).unwrap();

        // Sample the disk densely; every sampled point's cell must be included
        for ring in 0..=12 {
            let r = radius * ring as f64 / 12.0;
            for step in 0..36 {
                let angle = (step as f64 * 10.0).to_radians();
                let p = offset_point(&center, r * angle.cos(), r * angle.sin());
                let cell = index_of(p, RES).unwrap();
                assert!(cells.contains(&cell), "missing cell at r={} angle={}", r, step);
            }
        }

        // ...without running away: a 600 m disk needs a few dozen res-9 cells
        assert!(cells.len() < 120, "got {} cells", cells.len());
    }

    #[test]
    fn test_neighbors_rejects_bad_radius() {
        let p = GpsPoint::new(52.2297, 21.0122);
        assert!(matches!(
            neighbors_within_radius(p, -1.0, RES),
            Err(TerritoryError::InvalidRadius { .. })
        ));
        assert!(neighbors_within_radius(p, f64::NAN, RES).is_err());
        assert!(matches!(
            neighbors_within_radius(p, MAX_NEIGHBOR_RADIUS_M + 1.0, RES),
            Err(TerritoryError::InvalidRadius { .. })
        ));
        assert!(matches!(
            neighbors_within_radius(p, 5_000_000.0, RES),
            Err(TerritoryError::InvalidRadius { .. })
        ));
        assert!(neighbors_within_radius(GpsPoint::new(100.0, 0.0), 10.0, RES).is_err());
    }
}
