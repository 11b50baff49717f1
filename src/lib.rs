//! Airguard core crate.
//!
//! PM2.5 hazard forecasting for Kathmandu:
//! - raw fragment merge, per-feed cleaning and the cross-feed join
//! - feature engineering with a versioned schema contract
//! - logistic ensemble training and the persisted artifact bundle
//! - incremental history updates, alerting and the HTTP read surface

mod air_quality;
mod alert;
mod aqi;
mod config;
mod error;
mod features;
mod fetch;
mod frame;
mod merge;
mod model;
mod observability;
mod pipeline;
mod raw_merge;
mod series;
mod service;
mod table;
mod timestamp;
mod updater;
mod weather;

pub use air_quality::{
    clean_air_quality, AirQualityCleanReport, AirQualityCleanerConfig, CleanedAirQuality,
    HourlyPm25, PM25_COLUMN,
};
pub use alert::{
    AlertDecision, AlertError, AlertMessage, AlertNotifier, AlertPolicy, AlertSink, AlertState,
    LogAlertSink, WebhookAlertSink,
};
pub use aqi::{
    health_advice, health_recommendations, pm25_to_aqi, AqiCategory, HAZARD_ADVICE, SAFE_ADVICE,
    SEVERE_AQI,
};
pub use config::{
    feed_credentials_from_env, pipeline_config_from_env, service_config_from_env, ConfigError,
    FeedCredentials, PipelineConfig, ServiceConfig, ARTIFACT_FILE_NAME,
};
pub use error::PipelineError;
pub use features::{
    assert_schema_compatible, build_inference_frame, build_training_table, cyclical_encoding,
    day_name, is_brick_kiln_active, is_rush_hour, is_weekend, FeatureColumn, FeatureConfig,
    FeatureDType, FeatureEngineer, FeatureReport, FeatureSchema, FeatureTable, Season,
    FEATURE_SCHEMA_VERSION, HAZARD_NOW_COLUMN, PROVIDER_SUMMARY_COLUMN, REQUIRED_COLUMNS,
    SCRATCH_COLUMNS, TARGET_COLUMN, WEATHER_SUMMARY_COLUMN,
};
pub use fetch::{
    retry, FeedSource, FetchConfig, FetchError, HttpFeedSource, HttpGetter, ReqwestGetter,
    AQ_VALUE_COLUMN,
};
pub use frame::{format_number, Column, ColumnData, Frame, FrameRow, MissingStat, TIMESTAMP_COLUMN};
pub use merge::inner_join;
pub use model::{
    align_feature_row, build_design_matrix, feature_names_fingerprint, train_artifact_bundle,
    ArtifactBundle, ClassWeight, DesignMatrix, Ensemble, EvaluationMetrics, LogisticModel,
    LogisticParams, ModelError, Prediction, StandardScaler, TrainingConfig, TrainingReport,
    ARTIFACT_VERSION, DEFAULT_PROBABILITY_THRESHOLD,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_missing_stats, log_stage_finish,
    log_stage_start, logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    run_all, run_build_stage, run_clean_stage, run_preprocess_stage, run_stage, run_train_stage,
    BuildSummary, PipelineSummary, Stage, StageError,
};
pub use raw_merge::{list_fragments, merge_raw_fragments, read_fragment, RawMergeReport, RawMergeResult};
pub use series::{
    backward_fill, diff, fill_boundaries, forward_fill, forward_max, interpolate_linear,
    rolling_mean, rolling_median, shift, WindowMode,
};
pub use service::{
    aqi_distribution, build_snapshot, historical_points, refresh_service_snapshot, service_router,
    DashboardResponse, HistoricalPoint, HourlyAqi, LatestPredictionResponse, PredictionSource,
    ServiceSnapshot, SharedSnapshot, StatusResponse, HISTORICAL_ROWS, SERVICE_NAME,
};
pub use table::{write_atomic, RawTable};
pub use timestamp::{floor_to_hour, format_timestamp, parse_timestamp, TIMESTAMP_FORMAT};
pub use updater::{
    rebuild_from_histories, HistoryPaths, HistoryStore, RefreshOutcome, UpdateError,
    UpdaterConfig, AQ_HISTORY_FILE, MERGED_HISTORY_FILE, WEATHER_HISTORY_FILE,
};
pub use weather::{
    clean_weather, CleanedWeather, WeatherCleanReport, WeatherCleanerConfig,
    DROPPED_WEATHER_COLUMNS, NO_PRECIP_CATEGORY, PRECIP_TYPE_COLUMN, VISIBILITY_COLUMN,
};
