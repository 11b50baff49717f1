//! HTTP read surface over the latest refreshed prediction snapshot.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::air_quality::PM25_COLUMN;
use crate::aqi::{health_advice, health_recommendations, pm25_to_aqi, AqiCategory};
use crate::fetch::FeedSource;
use crate::frame::Frame;
use crate::model::{ArtifactBundle, ModelError, Prediction};
use crate::timestamp::format_timestamp;
use crate::updater::{HistoryStore, RefreshOutcome};

pub const SERVICE_NAME: &str = "Kathmandu Air Guard";
pub const HISTORICAL_ROWS: usize = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestPredictionResponse {
    pub timestamp: String,
    pub pm25_current: f64,
    pub aqi_current: u32,
    pub hazard_probability: f64,
    pub is_hazardous_upcoming: bool,
    pub health_advice: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardResponse {
    pub aqi: u32,
    pub pm25: f64,
    pub pm10: f64,
    pub humidity: f64,
    pub visibility: f64,
    pub timestamp: String,
    pub hazard_level: String,
    pub health_recommendations: Vec<String>,
    pub last_updated: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPoint {
    pub timestamp: String,
    pub pm25: f64,
    pub temp: f64,
    pub humidity: f64,
    pub windspeed: f64,
    pub aqi: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyAqi {
    pub hour: String,
    pub aqi: u32,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub message: String,
    pub ready: bool,
    pub last_refresh: Option<String>,
    pub model_fingerprint: String,
    pub model_features: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSnapshot {
    pub refreshed_at: DateTime<Utc>,
    pub prediction: Prediction,
    pub latest: LatestPredictionResponse,
    pub dashboard: DashboardResponse,
    pub historical: Vec<HistoricalPoint>,
    pub distribution: Vec<HourlyAqi>,
}

pub trait PredictionSource: Send + Sync + 'static {
    fn snapshot(&self) -> Option<Arc<ServiceSnapshot>>;
}

#[derive(Clone, Default)]
pub struct SharedSnapshot {
    inner: Arc<RwLock<Option<Arc<ServiceSnapshot>>>>,
}

impl SharedSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, snapshot: Arc<ServiceSnapshot>) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(snapshot);
    }
}

impl PredictionSource for SharedSnapshot {
    fn snapshot(&self) -> Option<Arc<ServiceSnapshot>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub fn build_snapshot(
    bundle: &ArtifactBundle,
    outcome: &RefreshOutcome,
    refreshed_at: DateTime<Utc>,
) -> Result<ServiceSnapshot, ModelError> {
    let prediction = bundle.predict(&outcome.latest)?;
    let latest_merged = outcome.merged.last_row();
    let merged_value = |name: &str| {
        latest_merged
            .as_ref()
            .and_then(|row| row.numeric.get(name).copied())
    };

    let pm25 = outcome
        .latest
        .numeric
        .get(PM25_COLUMN)
        .copied()
        .unwrap_or_default();
    let aqi = pm25_to_aqi(pm25);
    let timestamp = format_timestamp(outcome.latest.timestamp);

    let latest = LatestPredictionResponse {
        timestamp: timestamp.clone(),
        pm25_current: pm25,
        aqi_current: aqi,
        hazard_probability: round4(prediction.probability),
        is_hazardous_upcoming: prediction.is_hazardous,
        health_advice: health_advice(prediction.is_hazardous).to_string(),
    };

    let dashboard = DashboardResponse {
        aqi,
        pm25,
        pm10: merged_value("pm10").unwrap_or(pm25 * 1.2),
        humidity: merged_value("humidity").unwrap_or_default(),
        visibility: merged_value("visibility").unwrap_or_default(),
        timestamp,
        hazard_level: if prediction.is_hazardous { "High" } else { "Low" }.to_string(),
        health_recommendations: health_recommendations(prediction.is_hazardous, aqi),
        last_updated: refreshed_at.to_rfc3339(),
    };

    Ok(ServiceSnapshot {
        refreshed_at,
        prediction,
        latest,
        dashboard,
        historical: historical_points(&outcome.merged, HISTORICAL_ROWS),
        distribution: aqi_distribution(&outcome.merged),
    })
}

pub fn historical_points(merged: &Frame, limit: usize) -> Vec<HistoricalPoint> {
    let value = |name: &str, row: usize| {
        merged
            .numeric(name)
            .and_then(|values| values[row])
            .unwrap_or_default()
    };

    (merged.len().saturating_sub(limit)..merged.len())
        .map(|row| {
            let pm25 = value(PM25_COLUMN, row);
            HistoricalPoint {
                timestamp: format_timestamp(merged.timestamps()[row]),
                pm25,
                temp: value("temp", row),
                humidity: value("humidity", row),
                windspeed: value("windspeed", row),
                aqi: pm25_to_aqi(pm25),
            }
        })
        .collect()
}

pub fn aqi_distribution(merged: &Frame) -> Vec<HourlyAqi> {
    let Some(pm25) = merged.numeric(PM25_COLUMN) else {
        return Vec::new();
    };

    let mut by_hour: BTreeMap<u32, (u64, usize)> = BTreeMap::new();
    for (ts, value) in merged.timestamps().iter().zip(pm25) {
        if let Some(value) = value {
            let entry = by_hour.entry(ts.hour()).or_default();
            entry.0 += u64::from(pm25_to_aqi(*value));
            entry.1 += 1;
        }
    }

    by_hour
        .into_iter()
        .map(|(hour, (sum, count))| {
            let mean = (sum as f64 / count as f64) as u32;
            HourlyAqi {
                hour: format!("{hour:02}:00"),
                aqi: mean,
                category: AqiCategory::from_aqi(mean).label().to_string(),
            }
        })
        .collect()
}

pub fn refresh_service_snapshot(
    store: &HistoryStore,
    feed: Option<&dyn FeedSource>,
    bundle: &ArtifactBundle,
    shared: &SharedSnapshot,
) -> Option<Arc<ServiceSnapshot>> {
    let outcome = match feed {
        Some(feed) => store.refresh_from_feed(feed),
        None => store.rebuild(),
    };
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(
                component = "service",
                event = "refresh.skipped",
                from_feed = feed.is_some(),
                error = %err
            );
            return None;
        }
    };

    match build_snapshot(bundle, &outcome, Utc::now()) {
        Ok(snapshot) => {
            info!(
                component = "service",
                event = "refresh.published",
                timestamp = %snapshot.latest.timestamp,
                aqi = snapshot.latest.aqi_current,
                hazard_probability = snapshot.latest.hazard_probability,
                is_hazardous = snapshot.latest.is_hazardous_upcoming
            );
            let snapshot = Arc::new(snapshot);
            shared.replace(Arc::clone(&snapshot));
            Some(snapshot)
        }
        Err(err) => {
            warn!(
                component = "service",
                event = "refresh.predict_failed",
                error = %err
            );
            None
        }
    }
}

pub fn service_router(source: Arc<dyn PredictionSource>, bundle: Arc<ArtifactBundle>) -> Router {
    Router::new()
        .route("/", get(get_status))
        .route("/api/v1/predict/latest", get(get_latest_prediction))
        .route("/api/dashboard", get(get_dashboard))
        .route("/api/historical", get(get_historical))
        .route("/api/aqi-distribution", get(get_aqi_distribution))
        .with_state(ServiceAppState { source, bundle })
}

#[derive(Clone)]
struct ServiceAppState {
    source: Arc<dyn PredictionSource>,
    bundle: Arc<ArtifactBundle>,
}

#[derive(Serialize)]
struct ErrorBody {
    detail: &'static str,
}

fn not_ready(route: &'static str) -> Response {
    info!(component = "service", event = "http.not_ready", route);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorBody {
            detail: "no refreshed prediction available yet",
        }),
    )
        .into_response()
}

async fn get_status(State(state): State<ServiceAppState>) -> impl IntoResponse {
    let snapshot = state.source.snapshot();
    Json(StatusResponse {
        message: format!("{SERVICE_NAME} API is online"),
        ready: snapshot.is_some(),
        last_refresh: snapshot.map(|s| s.refreshed_at.to_rfc3339()),
        model_fingerprint: state.bundle.fingerprint.clone(),
        model_features: state.bundle.feature_names.len(),
    })
}

async fn get_latest_prediction(State(state): State<ServiceAppState>) -> Response {
    match state.source.snapshot() {
        Some(snapshot) => {
            info!(component = "service", event = "http.predict.latest");
            Json(snapshot.latest.clone()).into_response()
        }
        None => not_ready("/api/v1/predict/latest"),
    }
}

async fn get_dashboard(State(state): State<ServiceAppState>) -> Response {
    match state.source.snapshot() {
        Some(snapshot) => Json(snapshot.dashboard.clone()).into_response(),
        None => not_ready("/api/dashboard"),
    }
}

async fn get_historical(State(state): State<ServiceAppState>) -> Response {
    match state.source.snapshot() {
        Some(snapshot) => Json(snapshot.historical.clone()).into_response(),
        None => not_ready("/api/historical"),
    }
}

async fn get_aqi_distribution(State(state): State<ServiceAppState>) -> Response {
    match state.source.snapshot() {
        Some(snapshot) => Json(snapshot.distribution.clone()).into_response(),
        None => not_ready("/api/aqi-distribution"),
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
