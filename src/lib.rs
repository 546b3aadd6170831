pub mod cache;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod facade;
pub mod geocode;
pub mod geometry;
pub mod grid;
pub mod model;
pub mod ranking;
pub mod similarity;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::cache::{CacheKey, ResultCache};
pub use crate::cluster::{ClusterCentroid, ClusterEngine, ClusterOptions};
pub use crate::config::{AppConfig, PublicAppConfig};
pub use crate::errors::{AppError, AppResult, ErrorKind, ErrorPayload};
pub use crate::facade::{FacadeSettings, SearchRequest, SpatialQueryFacade};
pub use crate::geocode::{GeocodeCache, GeocodeFallback, GeocodeProvider, HttpGeocoder};
pub use crate::geometry::{BoundingBox, GeoPoint};
pub use crate::grid::{GridAggregator, GridCell};
pub use crate::model::{Feature, FeatureCollection, FeatureId, NewSite, Provenance, SiteRecord};
pub use crate::ranking::{RankedSearch, RankingParams, ScoredCandidate};
pub use crate::store::{InsertOutcome, SiteStore, SqliteSiteStore};

/// Fully wired query service: SQLite store, result cache, geocoder fallback.
pub struct SiteLocator {
    config: AppConfig,
    store: SqliteSiteStore,
    facade: SpatialQueryFacade,
}

#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub database_path: String,
    pub site_count: usize,
    pub result_cache_entries: usize,
    pub geocode_cache_path: Option<String>,
    pub geocode_cache_entries: usize,
    pub config: PublicAppConfig,
}

impl SiteLocator {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        init_tracing();
        let store = SqliteSiteStore::open(&config.database_path)?;
        let geocoder = GeocodeFallback::from_config(&config)?;
        let options = ClusterOptions::new(config.cluster_iterations, config.cluster_tolerance)?;
        let facade = SpatialQueryFacade::new(
            Arc::new(store.clone()),
            Arc::new(ResultCache::new()),
            FacadeSettings::from_config(&config),
        )
        .with_geocoder(geocoder)
        .with_cluster_engine(ClusterEngine::new(options));

        info!(
            database = %config.database_path.display(),
            geocode_cache = %config.geocode_cache_path.display(),
            "site locator initialized"
        );
        Ok(Self {
            config,
            store,
            facade,
        })
    }

    pub fn from_env() -> AppResult<Self> {
        Self::initialize(AppConfig::from_env())
    }

    pub fn facade(&self) -> &SpatialQueryFacade {
        &self.facade
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn database_path(&self) -> PathBuf {
        self.store
            .path()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.database_path.clone())
    }

    pub async fn health(&self) -> AppResult<ServiceHealth> {
        let geocode_cache = self.facade.geocoder().map(GeocodeFallback::cache);
        Ok(ServiceHealth {
            database_path: self.database_path().to_string_lossy().to_string(),
            site_count: self.facade.site_count().await?,
            result_cache_entries: self.facade.cache().len(),
            geocode_cache_path: geocode_cache
                .map(|cache| cache.path().to_string_lossy().to_string()),
            geocode_cache_entries: geocode_cache.map(GeocodeCache::len).unwrap_or(0),
            config: self.config.public_profile(),
        })
    }
}

/// Installs the global fmt subscriber once; later calls are no-ops.
pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,site_locator=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
