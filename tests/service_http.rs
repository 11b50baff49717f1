use std::sync::Arc;

use airguard::{
    feature_names_fingerprint, pm25_to_aqi, refresh_service_snapshot, service_router,
    ArtifactBundle, DashboardResponse, Ensemble, HistoricalPoint, HistoryPaths, HistoryStore,
    HourlyAqi, LatestPredictionResponse, LogisticModel, RawTable, SharedSnapshot,
    StandardScaler, StatusResponse, UpdaterConfig, ARTIFACT_VERSION, HISTORICAL_ROWS,
};
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::de::DeserializeOwned;
use tower::util::ServiceExt;

const SEEDED_HOURS: i64 = 30;
const LATEST_PM25: f64 = 160.0;

fn hour(h: i64) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 11, 4)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        + Duration::hours(h)
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn seed_tables() -> (RawTable, RawTable) {
    let air_quality = RawTable::from_rows(
        strings(&["timestamp", "value"]),
        (0..SEEDED_HOURS)
            .map(|h| {
                let pm25 = if h == SEEDED_HOURS - 1 { LATEST_PM25 } else { 60.0 };
                vec![
                    hour(h).format("%Y-%m-%d %H:%M:%S").to_string(),
                    pm25.to_string(),
                ]
            })
            .collect(),
    );
    let weather = RawTable::from_rows(
        strings(&[
            "datetime",
            "temp",
            "precip",
            "visibility",
            "humidity",
            "windspeed",
            "icon",
        ]),
        (0..SEEDED_HOURS)
            .map(|h| {
                vec![
                    hour(h).format("%Y-%m-%dT%H:%M:%S").to_string(),
                    (12 + h % 6).to_string(),
                    "0".to_string(),
                    "4.5".to_string(),
                    "71".to_string(),
                    "3.2".to_string(),
                    "haze".to_string(),
                ]
            })
            .collect(),
    );
    (air_quality, weather)
}

// One-feature bundle: probability rises with current PM2.5.
fn pm25_bundle() -> ArtifactBundle {
    let feature_names = vec!["pm25".to_string()];
    ArtifactBundle {
        version: ARTIFACT_VERSION,
        fingerprint: feature_names_fingerprint(ARTIFACT_VERSION, &feature_names),
        feature_names,
        scaler: StandardScaler {
            mean: vec![0.0],
            scale: vec![1.0],
        },
        ensemble: Ensemble {
            members: vec![LogisticModel {
                name: "pm25-only".to_string(),
                weights: vec![0.05],
                bias: -5.0,
            }],
        },
        threshold: 0.25,
    }
}

fn refreshed_app() -> (Router, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = HistoryStore::new(HistoryPaths::in_dir(dir.path()), UpdaterConfig::default());
    let (air_quality, weather) = seed_tables();
    store.seed(&air_quality, &weather).expect("seed succeeds");

    let bundle = Arc::new(pm25_bundle());
    let shared = SharedSnapshot::new();
    refresh_service_snapshot(&store, None, &bundle, &shared).expect("snapshot published");

    (service_router(Arc::new(shared), bundle), dir)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn get_json<T: DeserializeOwned>(app: Router, uri: &str) -> T {
    let (status, body) = get(app, uri).await;
    assert_eq!(status, StatusCode::OK, "{uri}");
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn routes_report_unavailable_before_first_refresh() {
    let app = service_router(Arc::new(SharedSnapshot::new()), Arc::new(pm25_bundle()));

    for uri in [
        "/api/v1/predict/latest",
        "/api/dashboard",
        "/api/historical",
        "/api/aqi-distribution",
    ] {
        let (status, body) = get(app.clone(), uri).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{uri}");
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(body["detail"].is_string());
    }

    let status: StatusResponse = get_json(app, "/").await;
    assert!(!status.ready);
    assert!(status.last_refresh.is_none());
    assert_eq!(status.model_features, 1);
}

#[tokio::test]
async fn latest_prediction_reflects_the_newest_hour() {
    let (app, _dir) = refreshed_app();

    let latest: LatestPredictionResponse = get_json(app.clone(), "/api/v1/predict/latest").await;
    assert_eq!(latest.timestamp, "2024-11-05 05:00:00");
    assert_eq!(latest.pm25_current, LATEST_PM25);
    assert_eq!(latest.aqi_current, pm25_to_aqi(LATEST_PM25));
    // sigmoid(0.05 * 160 - 5)
    assert!((latest.hazard_probability - 0.9526).abs() < 1e-9);
    assert!(latest.is_hazardous_upcoming);

    let status: StatusResponse = get_json(app, "/").await;
    assert!(status.ready);
    assert!(status.last_refresh.is_some());
}

#[tokio::test]
async fn dashboard_carries_weather_context_and_advice() {
    let (app, _dir) = refreshed_app();

    let dashboard: DashboardResponse = get_json(app, "/api/dashboard").await;
    assert_eq!(dashboard.aqi, pm25_to_aqi(LATEST_PM25));
    assert!((dashboard.pm10 - LATEST_PM25 * 1.2).abs() < 1e-9);
    assert_eq!(dashboard.humidity, 71.0);
    assert_eq!(dashboard.visibility, 4.5);
    assert_eq!(dashboard.hazard_level, "High");
    assert!(!dashboard.health_recommendations.is_empty());
}

#[tokio::test]
async fn historical_and_distribution_cover_the_merged_history() {
    let (app, _dir) = refreshed_app();

    let historical: Vec<HistoricalPoint> = get_json(app.clone(), "/api/historical").await;
    assert_eq!(historical.len(), HISTORICAL_ROWS);
    assert_eq!(historical.last().unwrap().pm25, LATEST_PM25);
    assert_eq!(historical[0].windspeed, 3.2);
    let wall_clock = Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}$").unwrap();
    assert!(historical
        .iter()
        .all(|point| wall_clock.is_match(&point.timestamp)));

    let distribution: Vec<HourlyAqi> = get_json(app, "/api/aqi-distribution").await;
    assert_eq!(distribution.len(), 24);
    assert_eq!(distribution[0].hour, "00:00");
    assert_eq!(distribution[23].hour, "23:00");
    assert_eq!(distribution[0].aqi, pm25_to_aqi(60.0));
}
