use std::sync::Arc;
use std::time::Duration;

use geo_types::{Geometry, Point};
use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use serde_json::{json, Map};
use tempfile::tempdir;

use site_locator::{
    FacadeSettings, FeatureId, GeocodeCache, GeocodeFallback, HttpGeocoder, NewSite, ResultCache,
    SearchRequest, SpatialQueryFacade, SqliteSiteStore,
};

fn facade_with_geocoder(server: &Server, cache_path: &std::path::Path) -> SpatialQueryFacade {
    let provider = HttpGeocoder::new(
        server.url("/search").to_string(),
        None,
        "site-locator-tests",
        Duration::from_secs(5),
    )
    .expect("http geocoder");
    let geocoder = GeocodeFallback::new(
        GeocodeCache::open(cache_path).expect("geocode cache"),
        Arc::new(provider),
    );
    let store = SqliteSiteStore::in_memory().expect("store");
    SpatialQueryFacade::new(
        Arc::new(store),
        Arc::new(ResultCache::new()),
        FacadeSettings::default(),
    )
    .with_geocoder(geocoder)
}

#[tokio::test]
async fn falls_back_to_geocoder_and_persists_results() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/search"),
            request::query(url_decoded(contains(("q", "Uhuru Park")))),
            request::query(url_decoded(contains(("format", "json")))),
        ))
        .times(1)
        .respond_with(json_encoded(json!([
            {
                "place_id": 4321,
                "display_name": "Uhuru Park, Nairobi, Kenya",
                "lat": "-1.2900",
                "lon": "36.8170",
                "geojson": {
                    "type": "Polygon",
                    "coordinates": [[[36.81, -1.30], [36.83, -1.30], [36.83, -1.28], [36.81, -1.28], [36.81, -1.30]]]
                }
            },
            { "place_id": 99, "display_name": "Missing coordinates" }
        ]))),
    );

    let dir = tempdir().unwrap();
    let cache_path = dir.path().join("geocode.json");
    let facade = facade_with_geocoder(&server, &cache_path);

    let local_only = facade
        .search(SearchRequest::new("Uhuru Park"))
        .await
        .expect("local search");
    assert!(local_only.is_empty());

    let external = facade
        .search(SearchRequest::new("Uhuru Park").allow_external(true))
        .await
        .expect("fallback search");
    assert_eq!(external.len(), 1);
    let feature = &external.features[0];
    assert_eq!(feature.id, FeatureId::Key("external:4321".into()));
    assert_eq!(feature.properties["provenance"], "external");
    assert_eq!(feature.properties["display_name"], "Uhuru Park, Nairobi, Kenya");
    assert_eq!(feature.geometry["type"], "Polygon");

    // Served from the disk cache; the server expects exactly one request.
    facade.invalidate_cache();
    let again = facade
        .search(SearchRequest::new("  uhuru   park ").allow_external(true))
        .await
        .expect("cached fallback");
    assert_eq!(again, external);

    let reloaded = GeocodeCache::open(&cache_path).expect("reload cache");
    assert_eq!(reloaded.get("uhuru park").map(|r| r.len()), Some(2));
}

#[tokio::test]
async fn local_results_skip_the_geocoder() {
    let server = Server::run();
    let dir = tempdir().unwrap();
    let facade = facade_with_geocoder(&server, &dir.path().join("geocode.json"));

    let site = NewSite::new(
        Some("Uhuru Park Gate".into()),
        Map::new(),
        Geometry::Point(Point::new(36.817, -1.29)),
    )
    .unwrap();
    facade.insert_deduplicated(site, None).await.unwrap();

    let found = facade
        .search(SearchRequest::new("Uhuru Park").allow_external(true))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found.features[0].properties["provenance"], "local");
    assert!(facade.geocoder().unwrap().cache().is_empty());
}

#[tokio::test]
async fn geocoder_failure_degrades_to_empty() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::path("/search"))
            .times(1)
            .respond_with(status_code(503)),
    );

    let dir = tempdir().unwrap();
    let cache_path = dir.path().join("geocode.json");
    let facade = facade_with_geocoder(&server, &cache_path);

    let result = facade
        .search(SearchRequest::new("Atlantis").allow_external(true))
        .await
        .expect("degraded search still succeeds");
    assert!(result.is_empty());
    assert!(facade.geocoder().unwrap().cache().is_empty());
    assert!(!cache_path.exists());
}
