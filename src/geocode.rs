//! External geocoder fallback with a durable on-disk cache.
//!
//! The cache maps a normalised query to the raw result list returned by the
//! geocoder. It is never evicted, so the file grows with every distinct
//! query that reaches the network.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use geo_types::{Geometry, Point};
use parking_lot::Mutex;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geometry::{geometry_to_geojson, parse_geojson_geometry, GeoPoint};
use crate::model::{Feature, FeatureId, Provenance};

const MAX_RESULTS: u8 = 10;

pub type GeocodeEntries = BTreeMap<String, Vec<Value>>;

/// Lowercased, trimmed, with internal whitespace collapsed to single spaces.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct GeocodeCache {
    path: PathBuf,
    entries: Mutex<GeocodeEntries>,
}

impl GeocodeCache {
    /// Opens the cache file, starting empty when it is missing or unreadable.
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match read_entries(&path) {
            Ok(entries) => entries,
            Err(AppError::Io(err)) if err.kind() == io::ErrorKind::NotFound => GeocodeEntries::new(),
            Err(AppError::Json(err)) => {
                warn!(
                    target: "geocode_cache",
                    path = %path.display(),
                    error = %err,
                    "geocode cache file is corrupt; starting empty"
                );
                GeocodeEntries::new()
            }
            Err(err) => return Err(err),
        };
        debug!(
            target: "geocode_cache",
            path = %path.display(),
            entries = entries.len(),
            "geocode cache loaded"
        );
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, normalized: &str) -> Option<Vec<Value>> {
        self.entries.lock().get(normalized).cloned()
    }

    /// Records `results` and rewrites the whole file before releasing the lock.
    pub fn store(&self, normalized: &str, results: Vec<Value>) -> AppResult<()> {
        let mut entries = self.entries.lock();
        entries.insert(normalized.to_string(), results);
        write_entries(&self.path, &entries)
    }

    pub fn snapshot(&self) -> GeocodeEntries {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn read_entries(path: &Path) -> AppResult<GeocodeEntries> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn write_entries(path: &Path, entries: &GeocodeEntries) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let encoded = serde_json::to_vec(entries)?;
    let tmp_path = temp_path(path);
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "geocode-cache".into());
    path.with_file_name(format!("{name}.tmp"))
}

#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    /// Raw result objects for `query`, in provider order.
    async fn search(&self, query: &str) -> AppResult<Vec<Value>>;
}

/// Nominatim-compatible search endpoint.
pub struct HttpGeocoder {
    http: Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpGeocoder {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<SecretString>,
        user_agent: &str,
        timeout: Duration,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        Self::new(
            config.geocoder_endpoint.clone(),
            config.geocoder_api_key.clone(),
            &config.geocoder_user_agent,
            config.geocoder_timeout(),
        )
    }
}

#[async_trait]
impl GeocodeProvider for HttpGeocoder {
    async fn search(&self, query: &str) -> AppResult<Vec<Value>> {
        let limit = MAX_RESULTS.to_string();
        let mut params = vec![
            ("q", query),
            ("format", "json"),
            ("polygon_geojson", "1"),
            ("limit", limit.as_str()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("key", key.expose_secret()));
        }

        let response = self
            .http
            .get(&self.endpoint)
            .query(&params)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        match body {
            Value::Array(items) => Ok(items),
            _ => Err(AppError::ExternalService(
                "geocoder response is not a list".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodedCandidate {
    pub display_name: Option<String>,
    pub geometry: Geometry<f64>,
    pub raw: Map<String, Value>,
}

impl GeocodedCandidate {
    /// Uses the `geojson` outline when it parses, else the `lat`/`lon` pair.
    pub fn from_raw(raw: &Value) -> Option<Self> {
        let object = raw.as_object()?;
        let geometry = object
            .get("geojson")
            .and_then(|g| parse_geojson_geometry(g).ok())
            .or_else(|| point_from_fields(object))?;
        Some(Self {
            display_name: object
                .get("display_name")
                .and_then(Value::as_str)
                .map(str::to_string),
            geometry,
            raw: object.clone(),
        })
    }

    pub fn to_feature(&self, index: usize) -> Feature {
        let id = self
            .raw
            .get("place_id")
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| index.to_string());
        let mut properties = self.raw.clone();
        properties.remove("geojson");
        let mut feature = Feature::new(
            FeatureId::Key(format!("external:{id}")),
            properties,
            geometry_to_geojson(&self.geometry),
        )
        .with_property("provenance", Provenance::External.as_str());
        if let Some(name) = &self.display_name {
            feature = feature.with_property("name", name.clone());
        }
        feature
    }
}

fn point_from_fields(object: &Map<String, Value>) -> Option<Geometry<f64>> {
    let lat = coordinate(object.get("lat")?)?;
    let lon = coordinate(object.get("lon")?)?;
    let point = GeoPoint::new(lon, lat).ok()?;
    Some(Geometry::Point(Point::new(point.lon, point.lat)))
}

fn coordinate(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub struct GeocodeFallback {
    cache: GeocodeCache,
    provider: Arc<dyn GeocodeProvider>,
}

impl GeocodeFallback {
    pub fn new(cache: GeocodeCache, provider: Arc<dyn GeocodeProvider>) -> Self {
        Self { cache, provider }
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let cache = GeocodeCache::open(&config.geocode_cache_path)?;
        let provider = HttpGeocoder::from_config(config)?;
        Ok(Self::new(cache, Arc::new(provider)))
    }

    pub fn cache(&self) -> &GeocodeCache {
        &self.cache
    }

    /// Geocodes `query`, serving from the disk cache when possible.
    ///
    /// Provider and parse failures yield an empty list; they are logged, not
    /// returned, and nothing is cached for the failed query.
    pub async fn lookup(&self, query: &str) -> Vec<GeocodedCandidate> {
        let normalized = normalize_query(query);
        if normalized.is_empty() {
            return Vec::new();
        }

        let raw = match self.cache.get(&normalized) {
            Some(hit) => {
                debug!(target: "geocode_cache", query = %normalized, "geocode cache hit");
                hit
            }
            None => match self.provider.search(query.trim()).await {
                Ok(results) => {
                    info!(
                        target: "geocode_cache",
                        query = %normalized,
                        results = results.len(),
                        "geocoder returned results"
                    );
                    if let Err(err) = self.cache.store(&normalized, results.clone()) {
                        warn!(
                            target: "geocode_cache",
                            error = %err,
                            "failed to persist geocode cache"
                        );
                    }
                    results
                }
                Err(err) => {
                    warn!(
                        target: "geocode_cache",
                        query = %normalized,
                        error = %err,
                        "geocoder lookup failed; returning no results"
                    );
                    return Vec::new();
                }
            },
        };

        raw.iter().filter_map(GeocodedCandidate::from_raw).collect()
    }
}
