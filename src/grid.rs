//! Density aggregation over a square grid in Web Mercator meters.

use std::collections::BTreeMap;

use geo_types::{Coord, Geometry, LineString, Polygon};
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::geometry::{from_web_mercator, geometry_to_geojson, to_web_mercator, GeoPoint};
use crate::model::{Feature, FeatureId};

pub const MAX_CELLS: usize = 1000;

/// Lattice index of a cell; the cell is centred on `(column, row) * size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CellKey {
    pub column: i64,
    pub row: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridCell {
    pub key: CellKey,
    pub count: usize,
    pub footprint: Polygon<f64>,
}

impl GridCell {
    pub fn to_feature(&self, cell_size_meters: f64) -> Feature {
        Feature::new(
            FeatureId::Key(format!("{}:{}", self.key.column, self.key.row)),
            serde_json::Map::new(),
            geometry_to_geojson(&Geometry::Polygon(self.footprint.clone())),
        )
        .with_property("count", self.count)
        .with_property("cell_size_m", cell_size_meters)
        .with_property("column", self.key.column)
        .with_property("row", self.key.row)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GridAggregator {
    cell_size: f64,
}

impl GridAggregator {
    pub fn new(cell_size_meters: f64) -> AppResult<Self> {
        if !cell_size_meters.is_finite() || cell_size_meters <= 0.0 {
            return Err(AppError::invalid("grid size must be a positive number of meters"));
        }
        Ok(Self {
            cell_size: cell_size_meters,
        })
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Snaps a point to the nearest lattice node on both axes.
    pub fn key_for(&self, point: GeoPoint) -> CellKey {
        let (x, y) = to_web_mercator(point);
        CellKey {
            column: (x / self.cell_size).round() as i64,
            row: (y / self.cell_size).round() as i64,
        }
    }

    /// Square of side `cell_size` around the lattice node, in degrees.
    pub fn footprint(&self, key: CellKey) -> Polygon<f64> {
        let half = self.cell_size / 2.0;
        let cx = key.column as f64 * self.cell_size;
        let cy = key.row as f64 * self.cell_size;
        let corners = [
            (cx - half, cy - half),
            (cx + half, cy - half),
            (cx + half, cy + half),
            (cx - half, cy + half),
            (cx - half, cy - half),
        ];
        let ring: Vec<Coord<f64>> = corners
            .iter()
            .map(|(x, y)| {
                let point = from_web_mercator(*x, *y);
                Coord {
                    x: point.lon,
                    y: point.lat,
                }
            })
            .collect();
        Polygon::new(LineString::new(ring), Vec::new())
    }

    /// Counts points per cell, densest first, capped at [`MAX_CELLS`].
    pub fn aggregate<I>(&self, points: I) -> Vec<GridCell>
    where
        I: IntoIterator<Item = GeoPoint>,
    {
        let mut counts: BTreeMap<CellKey, usize> = BTreeMap::new();
        for point in points {
            *counts.entry(self.key_for(point)).or_default() += 1;
        }
        let total_cells = counts.len();

        let mut ordered: Vec<(CellKey, usize)> = counts.into_iter().collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ordered.truncate(MAX_CELLS);

        debug!(
            cell_size = self.cell_size,
            total_cells,
            returned = ordered.len(),
            "aggregated grid density"
        );
        ordered
            .into_iter()
            .map(|(key, count)| GridCell {
                key,
                count,
                footprint: self.footprint(key),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use geo::Contains;
    use geo_types::Point;

    use super::*;

    fn point(lon: f64, lat: f64) -> GeoPoint {
        GeoPoint::new(lon, lat).unwrap()
    }

    #[test]
    fn empty_input_gives_no_cells() {
        let grid = GridAggregator::new(1_000.0).unwrap();
        assert!(grid.aggregate(Vec::new()).is_empty());
    }

    #[test]
    fn rejects_non_positive_size() {
        assert!(GridAggregator::new(0.0).is_err());
        assert!(GridAggregator::new(-5.0).is_err());
        assert!(GridAggregator::new(f64::NAN).is_err());
    }

    #[test]
    fn groups_nearby_points_and_orders_by_count() {
        let grid = GridAggregator::new(10_000.0).unwrap();
        let cells = grid.aggregate(vec![
            point(36.8000, -1.3000),
            point(36.8001, -1.3001),
            point(36.8002, -1.2999),
            point(38.0, 0.5),
        ]);
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].count, 3);
        assert_eq!(cells[1].count, 1);
    }

    #[test]
    fn cells_are_deterministic_across_runs() {
        let grid = GridAggregator::new(500.0).unwrap();
        let input = vec![point(36.81, -1.28), point(36.95, -1.10), point(36.81, -1.28)];
        assert_eq!(grid.aggregate(input.clone()), grid.aggregate(input));
    }

    #[test]
    fn footprint_contains_its_members() {
        let grid = GridAggregator::new(2_000.0).unwrap();
        let member = point(36.817223, -1.286389);
        let cells = grid.aggregate(vec![member]);
        assert!(cells[0]
            .footprint
            .contains(&Point::new(member.lon, member.lat)));
    }

    #[test]
    fn caps_number_of_cells() {
        let grid = GridAggregator::new(1.0).unwrap();
        let points = (0..1_200).map(|i| point(i as f64 * 0.001, 0.0));
        let cells = grid.aggregate(points);
        assert_eq!(cells.len(), MAX_CELLS);
        assert!(cells.windows(2).all(|w| w[0].key < w[1].key));
    }
}
