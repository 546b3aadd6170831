//! Storage collaborator interface and the SQLite reference adapter.
//!
//! SQL narrows every spatial query with the bounding-box columns; the exact
//! predicates (intersection, great-circle distance) run in Rust on the rows
//! that survive.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use geo::Intersects;
use geo_types::Geometry;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::geometry::{
    distance_to_geometry, geometry_to_geojson, parse_geojson_geometry, BoundingBox, GeoPoint, SRID,
};
use crate::model::{resolve_display_name, NewSite, SiteRecord};
use crate::ranking::TextCandidate;
use crate::similarity::{contains_ci, similarity_opt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// An existing record already sits within the dedupe radius.
    Duplicate(i64),
}

impl InsertOutcome {
    pub fn id(&self) -> i64 {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, InsertOutcome::Duplicate(_))
    }
}

/// Record paired with its great-circle distance in meters.
pub type Ranged = (SiteRecord, f64);

pub trait SiteStore: Send + Sync {
    fn get(&self, id: i64) -> AppResult<Option<SiteRecord>>;

    fn insert(&self, site: &NewSite) -> AppResult<i64>;

    /// `k` records nearest to `point`, ascending distance.
    fn nearest(&self, point: GeoPoint, k: usize) -> AppResult<Vec<Ranged>>;

    fn within_bbox(&self, bbox: BoundingBox) -> AppResult<Vec<SiteRecord>>;

    /// Records at most `radius_meters` away, nearest first, capped at `limit`.
    fn within_radius(&self, point: GeoPoint, radius_meters: f64, limit: usize)
        -> AppResult<Vec<Ranged>>;

    fn intersecting(&self, geometry: &Geometry<f64>) -> AppResult<Vec<SiteRecord>>;

    /// Records whose explicit or property name contains `term`, with the
    /// trigram similarity of each name source.
    fn text_candidates(&self, term: &str) -> AppResult<Vec<TextCandidate>>;

    fn representative_points(&self, bbox: Option<BoundingBox>) -> AppResult<Vec<GeoPoint>>;

    fn count(&self) -> AppResult<usize>;

    /// Inserts `site` unless a record lies within `radius_meters` of its
    /// representative point. Implementations able to do so should make the
    /// check and the insert atomic.
    fn insert_deduplicated(&self, site: &NewSite, radius_meters: f64) -> AppResult<InsertOutcome> {
        let point = site
            .representative_point()
            .ok_or_else(|| AppError::invalid("geometry has no representative point"))?;
        if let Some((existing, _)) = self.within_radius(point, radius_meters, 1)?.into_iter().next()
        {
            return Ok(InsertOutcome::Duplicate(existing.id));
        }
        self.insert(site).map(InsertOutcome::Inserted)
    }
}

const SITE_COLUMNS: &str = "id, name, properties, geometry";
const INITIAL_SEARCH_RADIUS_METERS: f64 = 1_000.0;
const HALF_EARTH_CIRCUMFERENCE_METERS: f64 = 20_037_508.0;

struct RawSite {
    id: i64,
    name: Option<String>,
    properties: String,
    geometry: String,
}

impl RawSite {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            properties: row.get(2)?,
            geometry: row.get(3)?,
        })
    }

    fn decode(self) -> AppResult<SiteRecord> {
        let properties = decode_properties(&self.properties)?;
        let geometry_json: Value = serde_json::from_str(&self.geometry)?;
        let geometry = parse_geojson_geometry(&geometry_json)
            .map_err(|err| AppError::Storage(format!("site {} has bad geometry: {err}", self.id)))?;
        Ok(SiteRecord {
            id: self.id,
            name: self.name,
            properties,
            geometry,
        })
    }
}

fn decode_properties(raw: &str) -> AppResult<Map<String, Value>> {
    match serde_json::from_str(raw)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(AppError::Storage("site properties are not an object".into())),
    }
}

#[derive(Clone)]
pub struct SqliteSiteStore {
    db: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteSiteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let connection = Connection::open_with_flags(path, flags)?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        run_migrations(&connection)?;
        info!(target: "site_store", path = %path.display(), "site store opened");
        Ok(Self {
            db: Arc::new(Mutex::new(connection)),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn in_memory() -> AppResult<Self> {
        let connection = Connection::open_in_memory()?;
        run_migrations(&connection)?;
        Ok(Self {
            db: Arc::new(Mutex::new(connection)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn query_sites<P: rusqlite::Params>(
        conn: &Connection,
        filter: &str,
        params: P,
    ) -> AppResult<Vec<SiteRecord>> {
        let sql = format!("SELECT {SITE_COLUMNS} FROM sites {filter}");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, RawSite::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawSite::decode).collect()
    }

    fn sites_touching(conn: &Connection, bbox: BoundingBox) -> AppResult<Vec<SiteRecord>> {
        Self::query_sites(
            conn,
            "WHERE max_lon >= ?1 AND min_lon <= ?3 AND max_lat >= ?2 AND min_lat <= ?4
             ORDER BY id ASC",
            params![bbox.min_lon, bbox.min_lat, bbox.max_lon, bbox.max_lat],
        )
    }

    fn ranged_within(
        conn: &Connection,
        point: GeoPoint,
        radius_meters: f64,
    ) -> AppResult<Vec<Ranged>> {
        let candidates = Self::sites_touching(conn, BoundingBox::around(point, radius_meters))?;
        let mut ranged: Vec<Ranged> = candidates
            .into_iter()
            .map(|record| {
                let distance = distance_to_geometry(point, &record.geometry);
                (record, distance)
            })
            .filter(|(_, distance)| *distance <= radius_meters)
            .collect();
        sort_by_distance(&mut ranged);
        Ok(ranged)
    }
}

fn sort_by_distance(ranged: &mut [Ranged]) {
    ranged.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.id.cmp(&b.0.id))
    });
}

fn insert_site(tx: &Transaction<'_>, site: &NewSite) -> AppResult<i64> {
    let bounds = BoundingBox::of_geometry(&site.geometry)
        .ok_or_else(|| AppError::invalid("geometry has no coordinates"))?;
    let centroid = site
        .representative_point()
        .ok_or_else(|| AppError::invalid("geometry has no representative point"))?;
    let properties = serde_json::to_string(&site.properties)?;
    let geometry = serde_json::to_string(&geometry_to_geojson(&site.geometry))?;
    tx.execute(
        "INSERT INTO sites (
            name, properties, geometry, srid,
            centroid_lon, centroid_lat,
            min_lon, min_lat, max_lon, max_lat,
            created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            site.name,
            properties,
            geometry,
            SRID,
            centroid.lon,
            centroid.lat,
            bounds.min_lon,
            bounds.min_lat,
            bounds.max_lon,
            bounds.max_lat,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

impl SiteStore for SqliteSiteStore {
    fn get(&self, id: i64) -> AppResult<Option<SiteRecord>> {
        let conn = self.db.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {SITE_COLUMNS} FROM sites WHERE id = ?1"),
                [id],
                RawSite::from_row,
            )
            .optional()?;
        raw.map(RawSite::decode).transpose()
    }

    fn insert(&self, site: &NewSite) -> AppResult<i64> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let id = insert_site(&tx, site)?;
        tx.commit()?;
        debug!(target: "site_store", id, "site inserted");
        Ok(id)
    }

    fn insert_deduplicated(&self, site: &NewSite, radius_meters: f64) -> AppResult<InsertOutcome> {
        let point = site
            .representative_point()
            .ok_or_else(|| AppError::invalid("geometry has no representative point"))?;
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        if let Some((existing, distance)) = Self::ranged_within(&tx, point, radius_meters)?
            .into_iter()
            .next()
        {
            debug!(
                target: "site_store",
                existing = existing.id,
                distance,
                "duplicate site within dedupe radius"
            );
            return Ok(InsertOutcome::Duplicate(existing.id));
        }
        let id = insert_site(&tx, site)?;
        tx.commit()?;
        debug!(target: "site_store", id, "site inserted");
        Ok(InsertOutcome::Inserted(id))
    }

    fn nearest(&self, point: GeoPoint, k: usize) -> AppResult<Vec<Ranged>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let conn = self.db.lock();
        // Widen the search circle until it holds k records or the whole globe.
        let mut radius = INITIAL_SEARCH_RADIUS_METERS;
        loop {
            let mut ranged = Self::ranged_within(&conn, point, radius)?;
            if ranged.len() >= k || radius >= HALF_EARTH_CIRCUMFERENCE_METERS {
                ranged.truncate(k);
                return Ok(ranged);
            }
            radius = (radius * 8.0).min(HALF_EARTH_CIRCUMFERENCE_METERS);
        }
    }

    fn within_bbox(&self, bbox: BoundingBox) -> AppResult<Vec<SiteRecord>> {
        let conn = self.db.lock();
        let records = Self::sites_touching(&conn, bbox)?;
        Ok(records
            .into_iter()
            .filter(|record| bbox.intersects_geometry(&record.geometry))
            .collect())
    }

    fn within_radius(
        &self,
        point: GeoPoint,
        radius_meters: f64,
        limit: usize,
    ) -> AppResult<Vec<Ranged>> {
        let conn = self.db.lock();
        let mut ranged = Self::ranged_within(&conn, point, radius_meters)?;
        ranged.truncate(limit);
        Ok(ranged)
    }

    fn intersecting(&self, geometry: &Geometry<f64>) -> AppResult<Vec<SiteRecord>> {
        let Some(bounds) = BoundingBox::of_geometry(geometry) else {
            return Ok(Vec::new());
        };
        let conn = self.db.lock();
        let records = Self::sites_touching(&conn, bounds)?;
        Ok(records
            .into_iter()
            .filter(|record| geometry.intersects(&record.geometry))
            .collect())
    }

    fn text_candidates(&self, term: &str) -> AppResult<Vec<TextCandidate>> {
        let term = term.trim();
        if term.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!("SELECT {SITE_COLUMNS} FROM sites ORDER BY id ASC"))?;
        let mut rows = stmt.query([])?;
        let mut candidates = Vec::new();
        while let Some(row) = rows.next()? {
            let raw = RawSite::from_row(row)?;
            // Decode geometry only for rows whose names match.
            let properties = decode_properties(&raw.properties)?;
            let property_name = resolve_display_name(None, &properties);
            let matches_name = raw.name.as_deref().is_some_and(|n| contains_ci(n, term));
            let matches_property = property_name.is_some_and(|n| contains_ci(n, term));
            if !matches_name && !matches_property {
                continue;
            }
            let name_similarity = similarity_opt(term, raw.name.as_deref());
            let property_similarity = similarity_opt(term, property_name);
            candidates.push(TextCandidate {
                record: raw.decode()?,
                name_similarity,
                property_similarity,
            });
        }
        debug!(target: "site_store", term, candidates = candidates.len(), "text prefilter");
        Ok(candidates)
    }

    fn representative_points(&self, bbox: Option<BoundingBox>) -> AppResult<Vec<GeoPoint>> {
        let conn = self.db.lock();
        let map_point = |row: &rusqlite::Row<'_>| -> rusqlite::Result<GeoPoint> {
            Ok(GeoPoint {
                lon: row.get(0)?,
                lat: row.get(1)?,
            })
        };
        let points = match bbox {
            Some(bbox) => {
                let mut stmt = conn.prepare(
                    "SELECT centroid_lon, centroid_lat FROM sites
                     WHERE centroid_lon BETWEEN ?1 AND ?3 AND centroid_lat BETWEEN ?2 AND ?4
                     ORDER BY id ASC",
                )?;
                let rows = stmt.query_map(
                    params![bbox.min_lon, bbox.min_lat, bbox.max_lon, bbox.max_lat],
                    map_point,
                )?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT centroid_lon, centroid_lat FROM sites ORDER BY id ASC")?;
                let rows = stmt.query_map([], map_point)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(points)
    }

    fn count(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sites", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sites (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT,
            properties TEXT NOT NULL DEFAULT '{}',
            geometry TEXT NOT NULL,
            srid INTEGER NOT NULL DEFAULT 4326 CHECK (srid = 4326),
            centroid_lon REAL NOT NULL,
            centroid_lat REAL NOT NULL,
            min_lon REAL NOT NULL,
            min_lat REAL NOT NULL,
            max_lon REAL NOT NULL,
            max_lat REAL NOT NULL,
            created_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_sites_bounds ON sites(min_lon, max_lon, min_lat, max_lat);
        CREATE INDEX IF NOT EXISTS idx_sites_centroid ON sites(centroid_lon, centroid_lat);
        CREATE INDEX IF NOT EXISTS idx_sites_name ON sites(name COLLATE NOCASE);
        "#,
    )?;
    Ok(())
}
