//! Pipeline, service and feed-credential configuration loaded from the
//! environment on top of fixed defaults.

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;

use crate::air_quality::AirQualityCleanerConfig;
use crate::features::FeatureConfig;
use crate::model::{LogisticParams, TrainingConfig};
use crate::series::WindowMode;
use crate::weather::WeatherCleanerConfig;

pub const ARTIFACT_FILE_NAME: &str = "airguard_bundle.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("unknown timezone {0:?}")]
    InvalidTimezone(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub aq_input_dir: PathBuf,
    pub weather_input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub aq_raw_path: PathBuf,
    pub weather_raw_path: PathBuf,
    pub cleaned_path: PathBuf,
    pub ml_ready_path: PathBuf,
    pub model_dir: PathBuf,
    pub aq_sort_column: String,
    pub aq_local_time_column: String,
    pub weather_datetime_column: String,
    pub outlier_threshold: f64,
    pub rolling_window: usize,
    pub hazard_threshold: f64,
    pub prediction_window: usize,
    pub test_fraction: f64,
    pub probability_threshold: f64,
    pub timezone: Tz,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::rooted_at(Path::new(""))
    }
}

impl PipelineConfig {
    pub fn rooted_at(root: &Path) -> Self {
        let output_dir = root.join("outputs");
        Self {
            aq_input_dir: root.join("aqData"),
            weather_input_dir: root.join("weatherData"),
            aq_raw_path: output_dir.join("aq_data_full.csv"),
            weather_raw_path: output_dir.join("weather_data_full.csv"),
            cleaned_path: output_dir.join("df_final.csv"),
            ml_ready_path: output_dir.join("kathmandu_aq_ml_ready.csv"),
            output_dir,
            model_dir: root.join("models"),
            aq_sort_column: "datetimeUtc".to_string(),
            aq_local_time_column: "datetimeLocal".to_string(),
            weather_datetime_column: "datetime".to_string(),
            outlier_threshold: 400.0,
            rolling_window: 7,
            hazard_threshold: 150.0,
            prediction_window: 24,
            test_fraction: 0.2,
            probability_threshold: 0.25,
            timezone: chrono_tz::Asia::Kathmandu,
        }
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.model_dir.join(ARTIFACT_FILE_NAME)
    }

    pub fn schema_path(&self) -> PathBuf {
        self.ml_ready_path.with_extension("schema.json")
    }

    pub fn air_quality_cleaner(&self) -> AirQualityCleanerConfig {
        AirQualityCleanerConfig {
            timestamp_column: self.aq_local_time_column.clone(),
            ceiling: self.outlier_threshold,
            rolling_window: self.rolling_window,
            window_mode: WindowMode::Centered,
            timezone: self.timezone,
            ..AirQualityCleanerConfig::default()
        }
    }

    pub fn weather_cleaner(&self) -> WeatherCleanerConfig {
        WeatherCleanerConfig {
            datetime_column: self.weather_datetime_column.clone(),
            timezone: self.timezone,
            ..WeatherCleanerConfig::default()
        }
    }

    pub fn features(&self) -> FeatureConfig {
        FeatureConfig {
            hazard_threshold: self.hazard_threshold,
            prediction_window: self.prediction_window,
            ..FeatureConfig::default()
        }
    }

    pub fn training(&self) -> TrainingConfig {
        TrainingConfig {
            test_fraction: self.test_fraction,
            threshold: self.probability_threshold,
            params: LogisticParams::default(),
        }
    }
}

pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    let mut config = match non_empty_var("AIRGUARD_DATA_ROOT") {
        Some(root) => PipelineConfig::rooted_at(Path::new(&root)),
        None => PipelineConfig::default(),
    };

    if let Some(dir) = non_empty_var("AIRGUARD_AQ_INPUT_DIR") {
        config.aq_input_dir = PathBuf::from(dir);
    }
    if let Some(dir) = non_empty_var("AIRGUARD_WEATHER_INPUT_DIR") {
        config.weather_input_dir = PathBuf::from(dir);
    }
    if let Some(dir) = non_empty_var("AIRGUARD_MODEL_DIR") {
        config.model_dir = PathBuf::from(dir);
    }
    if let Some(raw) = non_empty_var("AIRGUARD_TIMEZONE") {
        config.timezone = raw
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidTimezone(raw.clone()))?;
    }

    Ok(config)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub history_dir: PathBuf,
    pub artifact_path: PathBuf,
    pub refresh_interval: Duration,
    pub alert_aqi_threshold: u32,
    pub alert_min_interval: Duration,
    pub alert_webhook_url: Option<String>,
    pub alert_recipient: Option<String>,
    pub timezone: Tz,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            history_dir: PathBuf::from("history"),
            artifact_path: Path::new("models").join(ARTIFACT_FILE_NAME),
            refresh_interval: Duration::from_secs(3_600),
            alert_aqi_threshold: 120,
            alert_min_interval: Duration::from_secs(3 * 3_600),
            alert_webhook_url: None,
            alert_recipient: None,
            timezone: chrono_tz::Asia::Kathmandu,
        }
    }
}

pub fn service_config_from_env() -> Result<ServiceConfig, ConfigError> {
    let mut config = ServiceConfig::default();

    if let Some(raw) = non_empty_var("AIRGUARD_BIND_ADDR") {
        config.bind_addr = raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: "AIRGUARD_BIND_ADDR",
            value: raw.clone(),
        })?;
    }
    if let Some(dir) = non_empty_var("AIRGUARD_HISTORY_DIR") {
        config.history_dir = PathBuf::from(dir);
    }
    if let Some(path) = non_empty_var("AIRGUARD_ARTIFACT_PATH") {
        config.artifact_path = PathBuf::from(path);
    }
    if let Some(secs) = parse_u64_var("AIRGUARD_REFRESH_INTERVAL_SECS")? {
        config.refresh_interval = Duration::from_secs(secs.max(1));
    }
    if let Some(aqi) = parse_u64_var("AIRGUARD_ALERT_AQI_THRESHOLD")? {
        config.alert_aqi_threshold = u32::try_from(aqi).map_err(|_| ConfigError::InvalidValue {
            key: "AIRGUARD_ALERT_AQI_THRESHOLD",
            value: aqi.to_string(),
        })?;
    }
    if let Some(secs) = parse_u64_var("AIRGUARD_ALERT_INTERVAL_SECS")? {
        config.alert_min_interval = Duration::from_secs(secs);
    }
    config.alert_webhook_url = non_empty_var("AIRGUARD_ALERT_WEBHOOK_URL");
    config.alert_recipient = non_empty_var("AIRGUARD_ALERT_RECIPIENT");
    if let Some(raw) = non_empty_var("AIRGUARD_TIMEZONE") {
        config.timezone = raw
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidTimezone(raw.clone()))?;
    }

    Ok(config)
}

#[derive(Clone, PartialEq, Eq)]
pub struct FeedCredentials {
    pub openaq_api_key: Option<String>,
    pub openaq_location_id: u64,
    pub openaq_sensor_id: u64,
    pub visual_crossing_api_key: Option<String>,
    pub weather_location: String,
}

impl Default for FeedCredentials {
    fn default() -> Self {
        Self {
            openaq_api_key: None,
            openaq_location_id: 3459,
            openaq_sensor_id: 7710,
            visual_crossing_api_key: None,
            weather_location: "Kathmandu".to_string(),
        }
    }
}

impl fmt::Debug for FeedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedCredentials")
            .field("openaq_api_key", &self.openaq_api_key.as_ref().map(|_| "<redacted>"))
            .field("openaq_location_id", &self.openaq_location_id)
            .field("openaq_sensor_id", &self.openaq_sensor_id)
            .field(
                "visual_crossing_api_key",
                &self.visual_crossing_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("weather_location", &self.weather_location)
            .finish()
    }
}

pub fn feed_credentials_from_env() -> Result<FeedCredentials, ConfigError> {
    let mut creds = FeedCredentials {
        openaq_api_key: non_empty_var("OPENAQ_API_KEY"),
        visual_crossing_api_key: non_empty_var("VC_API_KEY"),
        ..FeedCredentials::default()
    };

    if let Some(id) = parse_u64_var("AIRGUARD_OPENAQ_LOCATION_ID")? {
        creds.openaq_location_id = id;
    }
    if let Some(id) = parse_u64_var("AIRGUARD_OPENAQ_SENSOR_ID")? {
        creds.openaq_sensor_id = id;
    }
    if let Some(location) = non_empty_var("AIRGUARD_WEATHER_LOCATION") {
        creds.weather_location = location;
    }

    Ok(creds)
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_u64_var(key: &'static str) -> Result<Option<u64>, ConfigError> {
    match non_empty_var(key) {
        Some(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(None),
    }
}
