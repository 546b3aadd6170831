use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_GEOCODER_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_GEOCODER_USER_AGENT: &str = "site-locator/0.1.0";
const DEFAULT_GEOCODER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RESULT_CACHE_TTL_SECS: u64 = 30;
const DEFAULT_STORAGE_TIMEOUT_MS: u64 = 5_000;

pub const DEFAULT_DEDUPE_RADIUS_METERS: f64 = 50.0;
pub const DEFAULT_CLUSTER_ITERATIONS: usize = 10;
pub const DEFAULT_MIN_SCORE: f64 = 0.03;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub geocoder_endpoint: String,
    pub geocoder_api_key: Option<SecretString>,
    pub geocoder_user_agent: String,
    pub geocoder_timeout_secs: u64,
    pub geocode_cache_path: PathBuf,
    pub result_cache_ttl_secs: u64,
    pub dedupe_radius_meters: f64,
    pub cluster_iterations: usize,
    pub cluster_tolerance: Option<f64>,
    pub ranking: RankingDefaults,
    pub storage_timeout_ms: u64,
}

/// Weighting knobs for hybrid text + distance ranking.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct RankingDefaults {
    pub similarity_weight: f64,
    pub distance_weight: f64,
    pub distance_scale_meters: f64,
    pub min_score: f64,
    pub limit: usize,
}

impl Default for RankingDefaults {
    fn default() -> Self {
        Self {
            similarity_weight: 0.7,
            distance_weight: 0.3,
            distance_scale_meters: 5_000.0,
            min_score: DEFAULT_MIN_SCORE,
            limit: 20,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_path: String,
    pub geocoder_endpoint: String,
    pub geocoder_timeout_secs: u64,
    pub geocode_cache_path: String,
    pub result_cache_ttl_secs: u64,
    pub dedupe_radius_meters: f64,
    pub cluster_iterations: usize,
    pub cluster_tolerance: Option<f64>,
    pub ranking: RankingDefaults,
    pub storage_timeout_ms: u64,
    pub has_geocoder_api_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = RankingDefaults::default();
        Self {
            database_path: env::var("SITE_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sites.db")),
            geocoder_endpoint: env::var("GEOCODER_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_GEOCODER_ENDPOINT.to_string()),
            geocoder_api_key: env::var("GEOCODER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            geocoder_user_agent: env::var("GEOCODER_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_GEOCODER_USER_AGENT.to_string()),
            geocoder_timeout_secs: parse_u64("GEOCODER_TIMEOUT_SECS", DEFAULT_GEOCODER_TIMEOUT_SECS)
                .max(1),
            geocode_cache_path: env::var("GEOCODE_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("geocode_cache.json")),
            result_cache_ttl_secs: parse_u64("RESULT_CACHE_TTL_SECS", DEFAULT_RESULT_CACHE_TTL_SECS),
            dedupe_radius_meters: parse_f64("DEDUPE_RADIUS_METERS", DEFAULT_DEDUPE_RADIUS_METERS)
                .max(0.0),
            cluster_iterations: parse_usize("CLUSTER_ITERATIONS", DEFAULT_CLUSTER_ITERATIONS),
            cluster_tolerance: parse_optional_f64("CLUSTER_TOLERANCE"),
            ranking: RankingDefaults {
                similarity_weight: parse_f64("RANK_SIMILARITY_WEIGHT", defaults.similarity_weight),
                distance_weight: parse_f64("RANK_DISTANCE_WEIGHT", defaults.distance_weight),
                distance_scale_meters: parse_f64(
                    "RANK_DISTANCE_SCALE_METERS",
                    defaults.distance_scale_meters,
                ),
                min_score: parse_f64("RANK_MIN_SCORE", defaults.min_score),
                limit: parse_usize("RANK_DEFAULT_LIMIT", defaults.limit).max(1),
            },
            storage_timeout_ms: parse_u64("STORAGE_TIMEOUT_MS", DEFAULT_STORAGE_TIMEOUT_MS).max(1),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_path: self.database_path.to_string_lossy().to_string(),
            geocoder_endpoint: self.geocoder_endpoint.clone(),
            geocoder_timeout_secs: self.geocoder_timeout_secs,
            geocode_cache_path: self.geocode_cache_path.to_string_lossy().to_string(),
            result_cache_ttl_secs: self.result_cache_ttl_secs,
            dedupe_radius_meters: self.dedupe_radius_meters,
            cluster_iterations: self.cluster_iterations,
            cluster_tolerance: self.cluster_tolerance,
            ranking: self.ranking,
            storage_timeout_ms: self.storage_timeout_ms,
            has_geocoder_api_key: self.geocoder_api_key.is_some(),
        }
    }

    pub fn result_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.result_cache_ttl_secs)
    }

    pub fn geocoder_timeout(&self) -> Duration {
        Duration::from_secs(self.geocoder_timeout_secs)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("sites.db"),
            geocoder_endpoint: DEFAULT_GEOCODER_ENDPOINT.to_string(),
            geocoder_api_key: None,
            geocoder_user_agent: DEFAULT_GEOCODER_USER_AGENT.to_string(),
            geocoder_timeout_secs: DEFAULT_GEOCODER_TIMEOUT_SECS,
            geocode_cache_path: PathBuf::from("geocode_cache.json"),
            result_cache_ttl_secs: DEFAULT_RESULT_CACHE_TTL_SECS,
            dedupe_radius_meters: DEFAULT_DEDUPE_RADIUS_METERS,
            cluster_iterations: DEFAULT_CLUSTER_ITERATIONS,
            cluster_tolerance: None,
            ranking: RankingDefaults::default(),
            storage_timeout_ms: DEFAULT_STORAGE_TIMEOUT_MS,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    parse_optional_f64(key).unwrap_or(default)
}

fn parse_optional_f64(key: &str) -> Option<f64> {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}
