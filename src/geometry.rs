//! Geographic primitives shared by the query components.
//!
//! All coordinates are SRID 4326 degrees in longitude/latitude order. The
//! planar projection used for grid snapping is spherical Web Mercator
//! (EPSG:3857), whose origin at (0, 0) gives every run the same lattice.

use geo::{BoundingRect, Centroid, Closest, ClosestPoint, Contains, Intersects};
use geo_types::{Coord, Geometry, LineString, MultiPolygon, Point, Polygon, Rect};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::{AppError, AppResult};

pub const SRID: i32 = 4326;
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

const MERCATOR_RADIUS: f64 = 6_378_137.0;
const MERCATOR_MAX_LAT: f64 = 85.051_128_78;
const BOX_MARGIN: f64 = 1.0 + 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

impl GeoPoint {
    pub fn new(lon: f64, lat: f64) -> AppResult<Self> {
        if !lon.is_finite() || !lat.is_finite() {
            return Err(AppError::invalid("coordinates must be finite numbers"));
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(AppError::invalid(format!("latitude {lat} out of range")));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(AppError::invalid(format!("longitude {lon} out of range")));
        }
        Ok(Self { lon, lat })
    }

    pub fn to_point(self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }

    pub fn from_point(point: Point<f64>) -> Self {
        Self {
            lon: point.x(),
            lat: point.y(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> AppResult<Self> {
        let lower = GeoPoint::new(min_lon, min_lat)?;
        let upper = GeoPoint::new(max_lon, max_lat)?;
        if lower.lon > upper.lon || lower.lat > upper.lat {
            return Err(AppError::invalid(
                "bounding box minimum must not exceed maximum",
            ));
        }
        Ok(Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        })
    }

    /// Parses `minLon,minLat,maxLon,maxLat`.
    pub fn parse(value: &str) -> AppResult<Self> {
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| AppError::invalid(format!("malformed bounding box: {value}")))?;
        match parts.as_slice() {
            [min_lon, min_lat, max_lon, max_lat] => {
                Self::new(*min_lon, *min_lat, *max_lon, *max_lat)
            }
            _ => Err(AppError::invalid(format!(
                "bounding box needs four numbers, got {}",
                parts.len()
            ))),
        }
    }

    /// Conservative box covering every point within `radius_meters` of `center`.
    pub fn around(center: GeoPoint, radius_meters: f64) -> Self {
        let angular = radius_meters.max(0.0) / EARTH_RADIUS_METERS;
        let lat_delta = angular.to_degrees() * BOX_MARGIN;
        let ratio = angular.sin() / center.lat.to_radians().cos();
        let reaches_pole = !ratio.is_finite() || ratio >= 1.0;
        let lon_delta = if angular >= std::f64::consts::FRAC_PI_2 || reaches_pole {
            360.0
        } else {
            ratio.asin().to_degrees() * BOX_MARGIN
        };
        let min_lat = center.lat - lat_delta;
        let max_lat = center.lat + lat_delta;
        let min_lon = center.lon - lon_delta;
        let max_lon = center.lon + lon_delta;
        // Circles reaching a pole or the antimeridian span every longitude.
        let wraps = min_lat <= -90.0 || max_lat >= 90.0 || min_lon < -180.0 || max_lon > 180.0;
        Self {
            min_lon: if wraps { -180.0 } else { min_lon },
            min_lat: min_lat.max(-90.0),
            max_lon: if wraps { 180.0 } else { max_lon },
            max_lat: max_lat.min(90.0),
        }
    }

    pub fn of_geometry(geometry: &Geometry<f64>) -> Option<Self> {
        geometry.bounding_rect().map(|rect| Self {
            min_lon: rect.min().x,
            min_lat: rect.min().y,
            max_lon: rect.max().x,
            max_lat: rect.max().y,
        })
    }

    pub fn to_rect(self) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.min_lon,
                y: self.min_lat,
            },
            Coord {
                x: self.max_lon,
                y: self.max_lat,
            },
        )
    }

    pub fn contains(&self, point: GeoPoint) -> bool {
        point.lon >= self.min_lon
            && point.lon <= self.max_lon
            && point.lat >= self.min_lat
            && point.lat <= self.max_lat
    }

    pub fn intersects_geometry(&self, geometry: &Geometry<f64>) -> bool {
        self.to_rect().intersects(geometry)
    }
}

pub fn haversine_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lon = (b.lon - a.lon).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_METERS * c
}

/// Great-circle distance from `point` to the nearest part of `geometry`.
///
/// Zero when a polygon contains the point. For polygon edges the closest
/// point is located in degree space and then measured on the sphere.
pub fn distance_to_geometry(point: GeoPoint, geometry: &Geometry<f64>) -> f64 {
    if let Geometry::Point(target) = geometry {
        return haversine_meters(point, GeoPoint::from_point(*target));
    }
    let origin = point.to_point();
    if geometry.contains(&origin) {
        return 0.0;
    }
    match geometry.closest_point(&origin) {
        Closest::Intersection(_) => 0.0,
        Closest::SinglePoint(nearest) => haversine_meters(point, GeoPoint::from_point(nearest)),
        Closest::Indeterminate => representative_point(geometry)
            .map(|rep| haversine_meters(point, rep))
            .unwrap_or(f64::INFINITY),
    }
}

/// The point itself for point geometries, otherwise the centroid.
pub fn representative_point(geometry: &Geometry<f64>) -> Option<GeoPoint> {
    match geometry {
        Geometry::Point(point) => Some(GeoPoint::from_point(*point)),
        other => other.centroid().map(GeoPoint::from_point),
    }
}

pub fn to_web_mercator(point: GeoPoint) -> (f64, f64) {
    let lat = point.lat.clamp(-MERCATOR_MAX_LAT, MERCATOR_MAX_LAT);
    let x = MERCATOR_RADIUS * point.lon.to_radians();
    let y = MERCATOR_RADIUS * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
    (x, y)
}

pub fn from_web_mercator(x: f64, y: f64) -> GeoPoint {
    let lon = (x / MERCATOR_RADIUS).to_degrees();
    let lat = (2.0 * (y / MERCATOR_RADIUS).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
    GeoPoint { lon, lat }
}

pub fn validate_geometry(geometry: &Geometry<f64>) -> AppResult<()> {
    let Some(bounds) = BoundingBox::of_geometry(geometry) else {
        return Err(AppError::invalid("geometry has no coordinates"));
    };
    GeoPoint::new(bounds.min_lon, bounds.min_lat)?;
    GeoPoint::new(bounds.max_lon, bounds.max_lat)?;
    Ok(())
}

/// Parses a GeoJSON geometry object (`Point`, `Polygon` or `MultiPolygon`).
pub fn parse_geojson_geometry(value: &Value) -> AppResult<Geometry<f64>> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::invalid("geometry is missing a type"))?;
    let coordinates = value
        .get("coordinates")
        .ok_or_else(|| AppError::invalid("geometry is missing coordinates"))?;

    let geometry = match kind {
        "Point" => Geometry::Point(Point::from(parse_position(coordinates)?)),
        "Polygon" => Geometry::Polygon(parse_polygon(coordinates)?),
        "MultiPolygon" => {
            let polygons = as_array(coordinates, "multipolygon")?
                .iter()
                .map(parse_polygon)
                .collect::<AppResult<Vec<_>>>()?;
            Geometry::MultiPolygon(MultiPolygon::new(polygons))
        }
        other => {
            return Err(AppError::invalid(format!(
                "unsupported geometry type {other}"
            )))
        }
    };
    validate_geometry(&geometry)?;
    Ok(geometry)
}

pub fn geometry_to_geojson(geometry: &Geometry<f64>) -> Value {
    match geometry {
        Geometry::Point(point) => json!({
            "type": "Point",
            "coordinates": [point.x(), point.y()],
        }),
        Geometry::Polygon(polygon) => json!({
            "type": "Polygon",
            "coordinates": polygon_rings(polygon),
        }),
        Geometry::MultiPolygon(multi) => json!({
            "type": "MultiPolygon",
            "coordinates": multi.iter().map(polygon_rings).collect::<Vec<_>>(),
        }),
        Geometry::Rect(rect) => geometry_to_geojson(&Geometry::Polygon(rect.to_polygon())),
        _ => Value::Null,
    }
}

fn polygon_rings(polygon: &Polygon<f64>) -> Vec<Vec<[f64; 2]>> {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .map(|ring| ring.coords().map(|c| [c.x, c.y]).collect())
        .collect()
}

fn parse_position(value: &Value) -> AppResult<Coord<f64>> {
    let parts = as_array(value, "position")?;
    match parts.as_slice() {
        [x, y, ..] => {
            let x = x
                .as_f64()
                .ok_or_else(|| AppError::invalid("longitude must be a number"))?;
            let y = y
                .as_f64()
                .ok_or_else(|| AppError::invalid("latitude must be a number"))?;
            let point = GeoPoint::new(x, y)?;
            Ok(Coord {
                x: point.lon,
                y: point.lat,
            })
        }
        _ => Err(AppError::invalid("position needs longitude and latitude")),
    }
}

fn parse_polygon(value: &Value) -> AppResult<Polygon<f64>> {
    let mut rings = as_array(value, "polygon")?
        .iter()
        .map(parse_ring)
        .collect::<AppResult<Vec<_>>>()?
        .into_iter();
    let exterior = rings
        .next()
        .ok_or_else(|| AppError::invalid("polygon needs an exterior ring"))?;
    Ok(Polygon::new(exterior, rings.collect()))
}

fn parse_ring(value: &Value) -> AppResult<LineString<f64>> {
    let coords = as_array(value, "ring")?
        .iter()
        .map(parse_position)
        .collect::<AppResult<Vec<_>>>()?;
    if coords.len() < 4 {
        return Err(AppError::invalid("polygon ring needs at least four positions"));
    }
    Ok(LineString::new(coords))
}

fn as_array<'a>(value: &'a Value, what: &str) -> AppResult<&'a Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| AppError::invalid(format!("{what} must be an array")))
}
