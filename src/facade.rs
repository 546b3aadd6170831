//! Request validation, orchestration and response shaping over a [`SiteStore`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::task;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, ResultCache};
use crate::cluster::{ClusterEngine, ClusterOptions};
use crate::config::{AppConfig, RankingDefaults, DEFAULT_DEDUPE_RADIUS_METERS};
use crate::errors::{AppError, AppResult};
use crate::geocode::GeocodeFallback;
use crate::geometry::{parse_geojson_geometry, BoundingBox, GeoPoint};
use crate::grid::GridAggregator;
use crate::model::{Feature, FeatureCollection, NewSite};
use crate::ranking::{RankedSearch, RankingParams};
use crate::store::{InsertOutcome, Ranged, SiteStore};

#[derive(Debug, Clone, Copy)]
pub struct FacadeSettings {
    pub cache_ttl: Duration,
    pub storage_timeout: Duration,
    pub dedupe_radius_meters: f64,
    pub ranking: RankingDefaults,
}

impl FacadeSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            cache_ttl: config.result_cache_ttl(),
            storage_timeout: config.storage_timeout(),
            dedupe_radius_meters: config.dedupe_radius_meters,
            ranking: config.ranking,
        }
    }
}

impl Default for FacadeSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            storage_timeout: Duration::from_secs(5),
            dedupe_radius_meters: DEFAULT_DEDUPE_RADIUS_METERS,
            ranking: RankingDefaults::default(),
        }
    }
}

/// Parameters for [`SpatialQueryFacade::search`]. Unset fields fall back to
/// the configured ranking defaults.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchRequest {
    pub term: String,
    pub reference: Option<GeoPoint>,
    pub limit: Option<usize>,
    pub min_score: Option<f64>,
    pub allow_external: bool,
}

impl SearchRequest {
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            ..Self::default()
        }
    }

    pub fn near(mut self, reference: GeoPoint) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn min_score(mut self, min_score: f64) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub fn allow_external(mut self, allow: bool) -> Self {
        self.allow_external = allow;
        self
    }

    fn params(&self, defaults: RankingDefaults) -> RankingParams {
        let mut params = RankingParams::from(defaults);
        if let Some(limit) = self.limit {
            params.limit = limit;
        }
        if let Some(min_score) = self.min_score {
            params.min_score = min_score;
        }
        params
    }
}

pub struct SpatialQueryFacade {
    store: Arc<dyn SiteStore>,
    cache: Arc<ResultCache<FeatureCollection>>,
    ranking: RankedSearch,
    clusters: ClusterEngine,
    geocoder: Option<GeocodeFallback>,
    settings: FacadeSettings,
}

impl SpatialQueryFacade {
    pub fn new(
        store: Arc<dyn SiteStore>,
        cache: Arc<ResultCache<FeatureCollection>>,
        settings: FacadeSettings,
    ) -> Self {
        Self {
            store,
            cache,
            ranking: RankedSearch::new(),
            clusters: ClusterEngine::new(ClusterOptions::default()),
            geocoder: None,
            settings,
        }
    }

    pub fn with_geocoder(mut self, geocoder: GeocodeFallback) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn with_cluster_engine(mut self, engine: ClusterEngine) -> Self {
        self.clusters = engine;
        self
    }

    pub fn settings(&self) -> FacadeSettings {
        self.settings
    }

    pub fn cache(&self) -> &ResultCache<FeatureCollection> {
        &self.cache
    }

    pub fn geocoder(&self) -> Option<&GeocodeFallback> {
        self.geocoder.as_ref()
    }

    pub fn invalidate_cache(&self) {
        self.cache.clear();
        debug!(target: "spatial_facade", "result cache cleared");
    }

    /// Runs a blocking store call off the async workers, bounded by the
    /// configured storage timeout.
    async fn run_store<T, F>(&self, operation: &'static str, call: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SiteStore) -> AppResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let handle = task::spawn_blocking(move || call(store.as_ref()));
        match timeout(self.settings.storage_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(AppError::Storage(format!(
                "{operation} did not complete: {join_err}"
            ))),
            Err(_) => Err(self.timed_out(operation)),
        }
    }

    fn timed_out(&self, operation: &'static str) -> AppError {
        warn!(
            target: "spatial_facade",
            operation,
            timeout_ms = self.settings.storage_timeout.as_millis() as u64,
            "storage call timed out"
        );
        AppError::Timeout(format!(
            "{operation} exceeded {}ms",
            self.settings.storage_timeout.as_millis()
        ))
    }

    pub async fn site(&self, id: i64) -> AppResult<Feature> {
        self.run_store("site", move |store| store.get(id))
            .await?
            .map(|record| record.to_feature())
            .ok_or_else(|| AppError::NotFound(format!("site {id}")))
    }

    pub async fn site_count(&self) -> AppResult<usize> {
        self.run_store("count", |store| store.count()).await
    }

    pub async fn nearest(&self, point: GeoPoint, k: usize) -> AppResult<FeatureCollection> {
        if k == 0 {
            return Err(AppError::invalid("k must be at least 1"));
        }
        let point = checked_point(point)?;
        let ranged = self
            .run_store("nearest", move |store| store.nearest(point, k))
            .await?;
        Ok(ranged_collection(ranged))
    }

    pub async fn within_bbox(&self, bbox: BoundingBox) -> AppResult<FeatureCollection> {
        let bbox = checked_bbox(bbox)?;
        let records = self
            .run_store("within_bbox", move |store| store.within_bbox(bbox))
            .await?;
        Ok(records.iter().map(|record| record.to_feature()).collect())
    }

    pub async fn within_radius(
        &self,
        point: GeoPoint,
        radius_meters: f64,
        limit: usize,
    ) -> AppResult<FeatureCollection> {
        let point = checked_point(point)?;
        validate_radius(radius_meters)?;
        if limit == 0 {
            return Err(AppError::invalid("limit must be at least 1"));
        }
        let ranged = self
            .run_store("within_radius", move |store| {
                store.within_radius(point, radius_meters, limit)
            })
            .await?;
        Ok(ranged_collection(ranged))
    }

    /// Records intersecting a GeoJSON point, polygon or multipolygon.
    pub async fn intersecting(&self, geometry: &Value) -> AppResult<FeatureCollection> {
        let geometry = parse_geojson_geometry(geometry)?;
        let records = self
            .run_store("intersecting", move |store| store.intersecting(&geometry))
            .await?;
        Ok(records.iter().map(|record| record.to_feature()).collect())
    }

    /// Inserts `site` unless one already lies within the dedupe radius
    /// (configured default when `radius_meters` is `None`).
    pub async fn insert_deduplicated(
        &self,
        site: NewSite,
        radius_meters: Option<f64>,
    ) -> AppResult<InsertOutcome> {
        let radius = radius_meters.unwrap_or(self.settings.dedupe_radius_meters);
        validate_radius(radius)?;
        if site.representative_point().is_none() {
            return Err(AppError::invalid("geometry has no representative point"));
        }
        let store = Arc::clone(&self.store);
        let mut handle = task::spawn_blocking(move || store.insert_deduplicated(&site, radius));
        let waited = timeout(self.settings.storage_timeout, &mut handle).await;
        let outcome = match waited {
            Ok(joined) => joined
                .map_err(|err| AppError::Storage(format!("insert did not complete: {err}")))??,
            Err(_) => {
                // The blocking insert keeps running and may still commit.
                self.invalidate_cache();
                let cache = Arc::clone(&self.cache);
                tokio::spawn(async move {
                    if let Ok(Ok(InsertOutcome::Inserted(id))) = handle.await {
                        warn!(
                            target: "spatial_facade",
                            id,
                            "late insert committed; clearing result cache"
                        );
                        cache.clear();
                    }
                });
                return Err(self.timed_out("insert"));
            }
        };
        match outcome {
            InsertOutcome::Inserted(id) => {
                info!(target: "spatial_facade", id, "site inserted");
                self.invalidate_cache();
            }
            InsertOutcome::Duplicate(id) => {
                info!(target: "spatial_facade", existing = id, radius, "duplicate site skipped");
            }
        }
        Ok(outcome)
    }

    /// Ranked local search, falling back to the external geocoder when
    /// nothing matches locally and the request opts in.
    pub async fn search(&self, request: SearchRequest) -> AppResult<FeatureCollection> {
        let params = request.params(self.settings.ranking);
        params.validate()?;
        let reference = request.reference.map(checked_point).transpose()?;
        let term = request.term.trim().to_string();
        if term.is_empty() {
            return Ok(FeatureCollection::empty());
        }

        let key = CacheKey::new("search")
            .arg("term", &term)
            .arg("reference", &reference)
            .arg("params", &params)
            .arg("allow_external", &request.allow_external)
            .finish();
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let lookup = term.clone();
        let candidates = self
            .run_store("text_candidates", move |store| store.text_candidates(&lookup))
            .await?;
        let ranked = self.ranking.rank(&term, reference, &params, candidates)?;
        let local_only = !ranked.is_empty() || !request.allow_external;
        let (collection, cacheable): (FeatureCollection, bool) = if local_only {
            (ranked.iter().map(|c| c.to_feature()).collect(), true)
        } else {
            // An empty fallback may be a provider outage; retry it next time.
            let external = self.external_search(&term, params.limit).await;
            let cacheable = !external.is_empty();
            (external, cacheable)
        };
        if cacheable {
            self.cache.insert(key, collection.clone(), self.settings.cache_ttl);
        }
        Ok(collection)
    }

    async fn external_search(&self, term: &str, limit: usize) -> FeatureCollection {
        let Some(geocoder) = &self.geocoder else {
            debug!(target: "spatial_facade", "no geocoder configured for fallback");
            return FeatureCollection::empty();
        };
        geocoder
            .lookup(term)
            .await
            .iter()
            .take(limit)
            .enumerate()
            .map(|(index, candidate)| candidate.to_feature(index))
            .collect()
    }

    /// Point density per grid cell, densest first.
    pub async fn grid(
        &self,
        cell_size_meters: f64,
        bbox: Option<BoundingBox>,
    ) -> AppResult<FeatureCollection> {
        let aggregator = GridAggregator::new(cell_size_meters)?;
        let bbox = bbox.map(checked_bbox).transpose()?;
        let key = CacheKey::new("grid")
            .arg("cell_size", &cell_size_meters)
            .arg("bbox", &bbox)
            .finish();
        self.cache
            .get_or_compute_async(&key, self.settings.cache_ttl, || async move {
                let points = self
                    .run_store("grid", move |store| store.representative_points(bbox))
                    .await?;
                Ok(aggregator
                    .aggregate(points)
                    .iter()
                    .map(|cell| cell.to_feature(aggregator.cell_size()))
                    .collect())
            })
            .await
    }

    pub async fn clusters(
        &self,
        k: usize,
        bbox: Option<BoundingBox>,
    ) -> AppResult<FeatureCollection> {
        if k == 0 {
            return Err(AppError::invalid("cluster count must be at least 1"));
        }
        let bbox = bbox.map(checked_bbox).transpose()?;
        let key = CacheKey::new("clusters")
            .arg("k", &k)
            .arg("bbox", &bbox)
            .finish();
        self.cache
            .get_or_compute_async(&key, self.settings.cache_ttl, || async move {
                let points = self
                    .run_store("clusters", move |store| store.representative_points(bbox))
                    .await?;
                let centroids = self.clusters.cluster(k, &points)?;
                Ok(centroids
                    .iter()
                    .enumerate()
                    .map(|(index, centroid)| centroid.to_feature(index))
                    .collect())
            })
            .await
    }
}

fn validate_radius(radius_meters: f64) -> AppResult<()> {
    if !radius_meters.is_finite() || radius_meters < 0.0 {
        return Err(AppError::invalid("radius must be a non-negative number of meters"));
    }
    Ok(())
}

/// Re-checks a point whose public fields may have bypassed [`GeoPoint::new`].
fn checked_point(point: GeoPoint) -> AppResult<GeoPoint> {
    GeoPoint::new(point.lon, point.lat)
}

fn checked_bbox(bbox: BoundingBox) -> AppResult<BoundingBox> {
    BoundingBox::new(bbox.min_lon, bbox.min_lat, bbox.max_lon, bbox.max_lat)
}

fn ranged_collection(ranged: Vec<Ranged>) -> FeatureCollection {
    ranged
        .into_iter()
        .map(|(record, distance)| record.to_feature().with_property("distance_m", distance))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use geo_types::{Geometry, Point};
    use rand::{rngs::StdRng, SeedableRng};
    use serde_json::{json, Map};
    use tempfile::tempdir;

    use super::*;
    use crate::geocode::{GeocodeCache, GeocodeProvider};
    use crate::model::{FeatureId, SiteRecord};
    use crate::ranking::TextCandidate;
    use crate::store::SqliteSiteStore;

    /// Store whose inserts stall before committing.
    struct SlowInsertStore {
        inner: SqliteSiteStore,
        delay: Duration,
    }

    impl SiteStore for SlowInsertStore {
        fn get(&self, id: i64) -> AppResult<Option<SiteRecord>> {
            self.inner.get(id)
        }

        fn insert(&self, site: &NewSite) -> AppResult<i64> {
            std::thread::sleep(self.delay);
            self.inner.insert(site)
        }

        fn nearest(&self, point: GeoPoint, k: usize) -> AppResult<Vec<Ranged>> {
            self.inner.nearest(point, k)
        }

        fn within_bbox(&self, bbox: BoundingBox) -> AppResult<Vec<SiteRecord>> {
            self.inner.within_bbox(bbox)
        }

        fn within_radius(
            &self,
            point: GeoPoint,
            radius_meters: f64,
            limit: usize,
        ) -> AppResult<Vec<Ranged>> {
            self.inner.within_radius(point, radius_meters, limit)
        }

        fn intersecting(&self, geometry: &Geometry<f64>) -> AppResult<Vec<SiteRecord>> {
            self.inner.intersecting(geometry)
        }

        fn text_candidates(&self, term: &str) -> AppResult<Vec<TextCandidate>> {
            self.inner.text_candidates(term)
        }

        fn representative_points(&self, bbox: Option<BoundingBox>) -> AppResult<Vec<GeoPoint>> {
            self.inner.representative_points(bbox)
        }

        fn count(&self) -> AppResult<usize> {
            self.inner.count()
        }
    }

    /// Fails its first lookup, then answers with a single point.
    struct FlakyGeocoder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GeocodeProvider for FlakyGeocoder {
        async fn search(&self, _query: &str) -> AppResult<Vec<Value>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(AppError::ExternalService("geocoder unavailable".into()));
            }
            Ok(vec![json!({
                "place_id": 7,
                "display_name": "Karura Forest, Nairobi",
                "lat": "-1.2400",
                "lon": "36.8300"
            })])
        }
    }

    fn facade() -> SpatialQueryFacade {
        let store = Arc::new(SqliteSiteStore::in_memory().unwrap());
        SpatialQueryFacade::new(store, Arc::new(ResultCache::new()), FacadeSettings::default())
            .with_cluster_engine(ClusterEngine::with_rng(
                ClusterOptions::default(),
                StdRng::seed_from_u64(3),
            ))
    }

    fn site(name: &str, lon: f64, lat: f64) -> NewSite {
        NewSite::new(
            Some(name.to_string()),
            Map::new(),
            Geometry::Point(Point::new(lon, lat)),
        )
        .unwrap()
    }

    fn at(lon: f64, lat: f64) -> GeoPoint {
        GeoPoint::new(lon, lat).unwrap()
    }

    fn distances(collection: &FeatureCollection) -> Vec<f64> {
        collection
            .features
            .iter()
            .map(|f| f.properties["distance_m"].as_f64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn second_insert_ten_meters_away_is_a_duplicate() {
        let facade = facade();
        let first = facade
            .insert_deduplicated(site("Clinic", 36.8, -1.3), Some(50.0))
            .await
            .unwrap();
        let second = facade
            .insert_deduplicated(site("Clinic annex", 36.8, -1.29991), Some(50.0))
            .await
            .unwrap();
        assert_eq!(second, InsertOutcome::Duplicate(first.id()));
        assert_eq!(facade.site_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn nearest_and_radius_are_sorted_by_distance() {
        let facade = facade();
        for (name, lon) in [("c", 0.03), ("a", 0.01), ("b", 0.02)] {
            facade
                .insert_deduplicated(site(name, lon, 0.0), None)
                .await
                .unwrap();
        }

        let nearest = facade.nearest(at(0.0, 0.0), 2).await.unwrap();
        assert_eq!(nearest.len(), 2);
        let d = distances(&nearest);
        assert!(d[0] <= d[1]);

        let radius = facade.within_radius(at(0.0, 0.0), 2_500.0, 10).await.unwrap();
        assert_eq!(radius.len(), 2);
        assert!(distances(&radius).iter().all(|d| *d <= 2_500.0));
    }

    #[tokio::test]
    async fn invalid_parameters_fail_before_storage() {
        let facade = facade();
        assert!(facade.nearest(at(0.0, 0.0), 0).await.is_err());
        assert!(facade.within_radius(at(0.0, 0.0), -1.0, 5).await.is_err());
        assert!(facade.grid(0.0, None).await.is_err());
        assert!(facade.clusters(0, None).await.is_err());
        let err = facade
            .intersecting(&json!({"type": "Point", "coordinates": [500.0, 0.0]}))
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        assert!(facade
            .insert_deduplicated(site("x", 1.0, 1.0), Some(f64::NAN))
            .await
            .is_err());
        assert_eq!(facade.site_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_site_is_not_found() {
        let facade = facade();
        let err = facade.site(42).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let id = facade
            .insert_deduplicated(site("Depot", 1.0, 1.0), None)
            .await
            .unwrap()
            .id();
        let feature = facade.site(id).await.unwrap();
        assert_eq!(feature.id, FeatureId::Site(id));
        assert_eq!(feature.properties["name"], "Depot");
    }

    #[tokio::test]
    async fn empty_store_gives_empty_grid_and_clusters() {
        let facade = facade();
        assert!(facade.grid(1_000.0, None).await.unwrap().is_empty());
        assert!(facade.clusters(3, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insert_invalidates_cached_results() {
        let facade = facade();
        facade
            .insert_deduplicated(site("a", 36.80, -1.30), None)
            .await
            .unwrap();
        let before = facade.grid(10_000.0, None).await.unwrap();
        assert_eq!(before.len(), 1);
        assert!(!facade.cache().is_empty());

        facade
            .insert_deduplicated(site("b", 39.6, -4.0), None)
            .await
            .unwrap();
        assert!(facade.cache().is_empty());
        let after = facade.grid(10_000.0, None).await.unwrap();
        assert_eq!(after.len(), 2);
    }

    #[tokio::test]
    async fn search_ranks_local_matches_and_skips_fallback_without_opt_in() {
        let facade = facade();
        facade
            .insert_deduplicated(site("St. Marys Academy", 36.80, -1.30), None)
            .await
            .unwrap();
        facade
            .insert_deduplicated(site("St. Mary Mission Hospital", 36.90, -1.20), None)
            .await
            .unwrap();

        let found = facade
            .search(SearchRequest::new("St. Mary").near(at(36.80, -1.30)))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found.features[0].properties["name"], "St. Marys Academy");
        assert_eq!(found.features[0].properties["provenance"], "local");
        assert!(found.features[0].properties.contains_key("distance_m"));

        let none = facade
            .search(SearchRequest::new("Kenyatta").allow_external(true))
            .await
            .unwrap();
        assert!(none.is_empty());
        assert!(facade.search(SearchRequest::new("   ")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bbox_and_clusters_cover_inserted_sites() {
        let facade = facade();
        for (name, lon, lat) in [("a", 36.80, -1.30), ("b", 36.81, -1.31), ("c", 39.6, -4.0)] {
            facade
                .insert_deduplicated(site(name, lon, lat), None)
                .await
                .unwrap();
        }
        let bbox = BoundingBox::new(36.0, -2.0, 37.0, -1.0).unwrap();
        assert_eq!(facade.within_bbox(bbox).await.unwrap().len(), 2);

        let clusters = facade.clusters(2, None).await.unwrap();
        let total: u64 = clusters
            .features
            .iter()
            .map(|f| f.properties["count"].as_u64().unwrap())
            .sum();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn malformed_points_and_boxes_are_rejected() {
        let facade = facade();
        facade
            .insert_deduplicated(site("Depot", 1.0, 1.0), None)
            .await
            .unwrap();

        let nan = GeoPoint {
            lon: f64::NAN,
            lat: 0.0,
        };
        let far = GeoPoint {
            lon: 500.0,
            lat: 0.0,
        };
        let inverted = BoundingBox {
            min_lon: 10.0,
            min_lat: 10.0,
            max_lon: -10.0,
            max_lat: -10.0,
        };

        for err in [
            facade.nearest(nan, 1).await.unwrap_err(),
            facade.nearest(far, 1).await.unwrap_err(),
            facade.within_radius(nan, 1_000.0, 5).await.unwrap_err(),
            facade.within_radius(far, 1_000.0, 5).await.unwrap_err(),
            facade.within_bbox(inverted).await.unwrap_err(),
            facade.grid(1_000.0, Some(inverted)).await.unwrap_err(),
            facade.clusters(2, Some(inverted)).await.unwrap_err(),
            facade
                .search(SearchRequest::new("Depot").near(far))
                .await
                .unwrap_err(),
        ] {
            assert!(matches!(err, AppError::InvalidParameter(_)), "{err:?}");
        }
        assert!(facade.cache().is_empty());
    }

    #[tokio::test]
    async fn timed_out_insert_still_invalidates_results_once_it_lands() {
        let store = SlowInsertStore {
            inner: SqliteSiteStore::in_memory().unwrap(),
            delay: Duration::from_millis(200),
        };
        let settings = FacadeSettings {
            storage_timeout: Duration::from_millis(50),
            ..FacadeSettings::default()
        };
        let facade =
            SpatialQueryFacade::new(Arc::new(store), Arc::new(ResultCache::new()), settings);

        assert!(facade.grid(10_000.0, None).await.unwrap().is_empty());
        let err = facade
            .insert_deduplicated(site("Late", 36.8, -1.3), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
        // Read before the insert commits; this caches an empty grid again.
        assert!(facade.grid(10_000.0, None).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(facade.site_count().await.unwrap(), 1);
        assert_eq!(facade.grid(10_000.0, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_external_fallback_is_not_cached() {
        let dir = tempdir().unwrap();
        let geocoder = GeocodeFallback::new(
            GeocodeCache::open(dir.path().join("geocode.json")).unwrap(),
            Arc::new(FlakyGeocoder {
                calls: AtomicUsize::new(0),
            }),
        );
        let facade = facade().with_geocoder(geocoder);
        let request = SearchRequest::new("Karura Forest").allow_external(true);

        assert!(facade.search(request.clone()).await.unwrap().is_empty());
        assert!(facade.cache().is_empty());

        let recovered = facade.search(request).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered.features[0].properties["provenance"], "external");
        assert_eq!(facade.cache().len(), 1);
    }
}
