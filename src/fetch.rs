//! Upstream feed clients: OpenAQ v3 for PM2.5 and the Visual Crossing
//! timeline CSV for weather. Both return raw tables for the history files.

use std::io::Cursor;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::FeedCredentials;
use crate::frame::TIMESTAMP_COLUMN;
use crate::table::RawTable;

pub const AQ_VALUE_COLUMN: &str = "value";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to build HTTP client: {0}")]
    HttpClientBuild(String),
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("request to {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("missing credential {name}")]
    MissingCredential { name: &'static str },
    #[error("sensor {sensor_id} not present in location response")]
    SensorNotFound { sensor_id: u64 },
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    pub openaq_base_url: String,
    pub visual_crossing_base_url: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub page_limit: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            openaq_base_url: "https://api.openaq.org/v3".to_string(),
            visual_crossing_base_url:
                "https://weather.visualcrossing.com/VisualCrossingWebServices/rest/services/timeline"
                    .to_string(),
            timeout_ms: 15_000,
            max_retries: 3,
            retry_backoff_ms: 500,
            page_limit: 100,
        }
    }
}

pub trait FeedSource: Send + Sync {
    fn latest_air_quality(&self) -> Result<RawTable, FetchError>;
    fn latest_weather(&self) -> Result<RawTable, FetchError>;
    fn recent_air_quality(&self, hours: u32) -> Result<RawTable, FetchError>;
    fn recent_weather(&self) -> Result<RawTable, FetchError>;
}

pub trait HttpGetter: Send + Sync {
    fn get_bytes(&self, url: &Url, headers: &[(&'static str, String)]) -> Result<Vec<u8>, FetchError>;
}

pub struct ReqwestGetter {
    client: reqwest::blocking::Client,
}

impl ReqwestGetter {
    pub fn new(timeout_ms: u64) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| FetchError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpGetter for ReqwestGetter {
    fn get_bytes(&self, url: &Url, headers: &[(&'static str, String)]) -> Result<Vec<u8>, FetchError> {
        let display = redacted(url);
        let mut request = self.client.get(url.clone());
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        let response = request.send().map_err(|err| FetchError::Transport {
            url: display.clone(),
            message: err.without_url().to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: display,
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| FetchError::Transport {
                url: display,
                message: err.without_url().to_string(),
            })
    }
}

pub struct HttpFeedSource<G: HttpGetter = ReqwestGetter> {
    getter: G,
    credentials: FeedCredentials,
    cfg: FetchConfig,
}

impl HttpFeedSource<ReqwestGetter> {
    pub fn new(credentials: FeedCredentials, cfg: FetchConfig) -> Result<Self, FetchError> {
        let getter = ReqwestGetter::new(cfg.timeout_ms)?;
        Ok(Self::with_getter(getter, credentials, cfg))
    }
}

impl<G: HttpGetter> HttpFeedSource<G> {
    pub fn with_getter(getter: G, credentials: FeedCredentials, cfg: FetchConfig) -> Self {
        Self {
            getter,
            credentials,
            cfg,
        }
    }

    fn openaq_headers(&self) -> Result<Vec<(&'static str, String)>, FetchError> {
        let key = self
            .credentials
            .openaq_api_key
            .clone()
            .ok_or(FetchError::MissingCredential {
                name: "OPENAQ_API_KEY",
            })?;
        Ok(vec![
            ("accept", "application/json".to_string()),
            ("X-API-Key", key),
        ])
    }

    fn get_with_retry(&self, url: &Url, headers: &[(&'static str, String)]) -> Result<Vec<u8>, FetchError> {
        retry(&self.cfg, || self.getter.get_bytes(url, headers))
    }

    fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &Url,
        headers: &[(&'static str, String)],
    ) -> Result<T, FetchError> {
        let bytes = self.get_with_retry(url, headers)?;
        serde_json::from_slice(&bytes).map_err(|err| FetchError::Decode {
            url: redacted(url),
            message: err.to_string(),
        })
    }

    fn visual_crossing(&self, segments: &[&str], include: &str) -> Result<RawTable, FetchError> {
        let key = self
            .credentials
            .visual_crossing_api_key
            .as_deref()
            .ok_or(FetchError::MissingCredential { name: "VC_API_KEY" })?;

        let mut url = parse_url(&self.cfg.visual_crossing_base_url)?;
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidUrl(self.cfg.visual_crossing_base_url.clone()))?
            .push(&self.credentials.weather_location)
            .extend(segments);
        url.query_pairs_mut()
            .append_pair("unitGroup", "metric")
            .append_pair("include", include)
            .append_pair("contentType", "csv")
            .append_pair("key", key);

        let bytes = self.get_with_retry(&url, &[])?;
        RawTable::from_reader(Cursor::new(bytes)).map_err(|err| FetchError::Decode {
            url: redacted(&url),
            message: err.to_string(),
        })
    }
}

impl<G: HttpGetter> FeedSource for HttpFeedSource<G> {
    fn latest_air_quality(&self) -> Result<RawTable, FetchError> {
        let headers = self.openaq_headers()?;
        let mut url = parse_url(&self.cfg.openaq_base_url)?;
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidUrl(self.cfg.openaq_base_url.clone()))?
            .push("locations")
            .push(&self.credentials.openaq_location_id.to_string())
            .push("sensors");

        let body: OpenAqResponse<OpenAqSensor> = self.get_json(&url, &headers)?;
        let sensor_id = self.credentials.openaq_sensor_id;
        let latest = body
            .results
            .into_iter()
            .find(|sensor| sensor.id == sensor_id)
            .and_then(|sensor| sensor.latest)
            .ok_or(FetchError::SensorNotFound { sensor_id })?;

        info!(
            component = "fetch",
            event = "fetch.air_quality.latest",
            sensor_id,
            timestamp = %latest.datetime.local,
            value = latest.value
        );
        Ok(aq_table(vec![(latest.datetime.local, latest.value)]))
    }

    fn latest_weather(&self) -> Result<RawTable, FetchError> {
        let table = self.visual_crossing(&[], "current")?;
        info!(
            component = "fetch",
            event = "fetch.weather.latest",
            rows = table.len()
        );
        Ok(table)
    }

    fn recent_air_quality(&self, hours: u32) -> Result<RawTable, FetchError> {
        let headers = self.openaq_headers()?;
        let to = Utc::now();
        let from = to - chrono::Duration::hours(i64::from(hours));
        let mut samples = Vec::new();
        let mut page: u32 = 1;

        loop {
            let url = self.hourly_measurements_url(from, to, page)?;
            let body: OpenAqResponse<OpenAqMeasurement> = self.get_json(&url, &headers)?;
            if body.results.is_empty() {
                break;
            }
            let fetched = body.results.len();
            samples.extend(
                body.results
                    .into_iter()
                    .map(|m| (m.period.datetime_from.local, m.value)),
            );
            debug!(
                component = "fetch",
                event = "fetch.air_quality.page",
                page,
                fetched
            );

            let found = body.meta.and_then(|meta| meta.found_count());
            let seen = u64::from(page) * u64::from(self.cfg.page_limit);
            match found {
                Some(found) if seen >= found => break,
                _ if fetched < self.cfg.page_limit as usize => break,
                _ => page += 1,
            }
        }

        info!(
            component = "fetch",
            event = "fetch.air_quality.recent",
            hours,
            rows = samples.len()
        );
        Ok(aq_table(samples))
    }

    fn recent_weather(&self) -> Result<RawTable, FetchError> {
        let table = self.visual_crossing(&["last2days"], "hours")?;
        info!(
            component = "fetch",
            event = "fetch.weather.recent",
            rows = table.len()
        );
        Ok(table)
    }
}

impl<G: HttpGetter> HttpFeedSource<G> {
    fn hourly_measurements_url(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        page: u32,
    ) -> Result<Url, FetchError> {
        let mut url = parse_url(&self.cfg.openaq_base_url)?;
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidUrl(self.cfg.openaq_base_url.clone()))?
            .push("sensors")
            .push(&self.credentials.openaq_sensor_id.to_string())
            .push("measurements")
            .push("hourly");
        url.query_pairs_mut()
            .append_pair("datetime_from", &from.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .append_pair("datetime_to", &to.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .append_pair("limit", &self.cfg.page_limit.to_string())
            .append_pair("page", &page.to_string());
        Ok(url)
    }
}

pub fn retry<T>(cfg: &FetchConfig, mut f: impl FnMut() -> Result<T, FetchError>) -> Result<T, FetchError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() || attempt >= cfg.max_retries => return Err(err),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let sleep_ms = cfg.retry_backoff_ms.saturating_mul(1u64 << shift);
                warn!(
                    component = "fetch",
                    event = "fetch.retry",
                    attempt,
                    sleep_ms,
                    error = %err
                );
                std::thread::sleep(Duration::from_millis(sleep_ms));
            }
        }
    }
}

fn aq_table(samples: Vec<(String, f64)>) -> RawTable {
    RawTable::from_rows(
        vec![TIMESTAMP_COLUMN.to_string(), AQ_VALUE_COLUMN.to_string()],
        samples
            .into_iter()
            .map(|(ts, value)| vec![ts, format!("{value}")])
            .collect(),
    )
}

fn parse_url(raw: &str) -> Result<Url, FetchError> {
    Url::parse(raw).map_err(|err| FetchError::InvalidUrl(format!("{raw}: {err}")))
}

fn redacted(url: &Url) -> String {
    let mut clean = url.clone();
    clean.set_query(None);
    clean.to_string()
}

#[derive(Debug, Deserialize)]
struct OpenAqResponse<T> {
    #[serde(default)]
    meta: Option<OpenAqMeta>,
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct OpenAqMeta {
    #[serde(default)]
    found: Option<serde_json::Value>,
}

impl OpenAqMeta {
    fn found_count(&self) -> Option<u64> {
        match self.found.as_ref()? {
            serde_json::Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAqSensor {
    id: u64,
    #[serde(default)]
    latest: Option<OpenAqLatest>,
}

#[derive(Debug, Deserialize)]
struct OpenAqLatest {
    datetime: OpenAqDateTime,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct OpenAqDateTime {
    local: String,
}

#[derive(Debug, Deserialize)]
struct OpenAqMeasurement {
    value: f64,
    period: OpenAqPeriod,
}

#[derive(Debug, Deserialize)]
struct OpenAqPeriod {
    #[serde(rename = "datetimeFrom")]
    datetime_from: OpenAqDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockGetter {
        responses: Vec<(String, Vec<u8>)>,
        requests: Mutex<Vec<String>>,
    }

    impl MockGetter {
        fn with(mut self, url_fragment: &str, body: &str) -> Self {
            self.responses
                .push((url_fragment.to_string(), body.as_bytes().to_vec()));
            self
        }
    }

    impl HttpGetter for MockGetter {
        fn get_bytes(&self, url: &Url, _headers: &[(&'static str, String)]) -> Result<Vec<u8>, FetchError> {
            let url = url.to_string();
            self.requests
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(url.clone());
            self.responses
                .iter()
                .find(|(fragment, _)| url.contains(fragment.as_str()))
                .map(|(_, body)| body.clone())
                .ok_or(FetchError::HttpStatus { url, status: 404 })
        }
    }

    fn creds() -> FeedCredentials {
        FeedCredentials {
            openaq_api_key: Some("aq-key".to_string()),
            visual_crossing_api_key: Some("vc-key".to_string()),
            ..FeedCredentials::default()
        }
    }

    fn fast_cfg() -> FetchConfig {
        FetchConfig {
            openaq_base_url: "http://openaq.test/v3".to_string(),
            visual_crossing_base_url: "http://vc.test/timeline".to_string(),
            retry_backoff_ms: 0,
            page_limit: 2,
            ..FetchConfig::default()
        }
    }

    #[test]
    fn latest_air_quality_picks_configured_sensor() {
        let body = r#"{"results":[
            {"id":1,"latest":{"datetime":{"local":"2024-01-01T00:00:00+05:45"},"value":1.0}},
            {"id":7710,"latest":{"datetime":{"local":"2024-01-01T09:00:00+05:45"},"value":88.5}}
        ]}"#;
        let getter = MockGetter::default().with("/locations/3459/sensors", body);
        let source = HttpFeedSource::with_getter(getter, creds(), fast_cfg());

        let table = source.latest_air_quality().unwrap();
        assert_eq!(table.headers(), &["timestamp", "value"]);
        assert_eq!(table.rows()[0], vec!["2024-01-01T09:00:00+05:45", "88.5"]);
    }

    #[test]
    fn absent_sensor_is_reported() {
        let getter = MockGetter::default().with("/sensors", r#"{"results":[{"id":1}]}"#);
        let source = HttpFeedSource::with_getter(getter, creds(), fast_cfg());
        assert!(matches!(
            source.latest_air_quality(),
            Err(FetchError::SensorNotFound { sensor_id: 7710 })
        ));
    }

    #[test]
    fn missing_key_fails_before_any_request() {
        let source = HttpFeedSource::with_getter(
            MockGetter::default(),
            FeedCredentials::default(),
            fast_cfg(),
        );
        assert!(matches!(
            source.latest_weather(),
            Err(FetchError::MissingCredential { name: "VC_API_KEY" })
        ));
        assert!(source.getter.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn recent_air_quality_follows_pages_until_found_is_reached() {
        let page1 = r#"{"meta":{"found":3},"results":[
            {"value":10,"period":{"datetimeFrom":{"local":"2024-01-01T00:00:00+05:45"}}},
            {"value":11,"period":{"datetimeFrom":{"local":"2024-01-01T01:00:00+05:45"}}}
        ]}"#;
        let page2 = r#"{"meta":{"found":3},"results":[
            {"value":12,"period":{"datetimeFrom":{"local":"2024-01-01T02:00:00+05:45"}}}
        ]}"#;
        let getter = MockGetter::default()
            .with("page=1", page1)
            .with("page=2", page2);
        let source = HttpFeedSource::with_getter(getter, creds(), fast_cfg());

        let table = source.recent_air_quality(48).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.cell(2, 1), "12");
        let requests = source.getter.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].contains("/sensors/7710/measurements/hourly"));
    }

    #[test]
    fn weather_csv_is_parsed_from_timeline_endpoint() {
        let csv = "name,datetime,temp,visibility\nKathmandu,2024-01-01T09:00:00,12.5,4.1\n";
        let getter = MockGetter::default().with("/timeline/Kathmandu/last2days", csv);
        let source = HttpFeedSource::with_getter(getter, creds(), fast_cfg());

        let table = source.recent_weather().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.column_index("temp"), Some(2));
        let requests = source.getter.requests.lock().unwrap();
        assert!(requests[0].contains("include=hours"));
    }

    #[test]
    fn retry_recovers_from_transient_errors_only() {
        let calls = AtomicU32::new(0);
        let cfg = fast_cfg();
        let value = retry(&cfg, || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(FetchError::HttpStatus {
                    url: "u".to_string(),
                    status: 503,
                })
            } else {
                Ok(7)
            }
        })
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let err = retry(&cfg, || -> Result<(), FetchError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::HttpStatus {
                url: "u".to_string(),
                status: 401,
            })
        })
        .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 401, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
