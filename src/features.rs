//! Feature engineering over the merged hourly table.
//!
//! Four ordered phases: temporal, lag, target, finalize. Lag and rolling
//! features only look backwards. The target is the one column that looks
//! forward, and rows without a full lookback or horizon are removed.

use std::f64::consts::PI;

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::air_quality::PM25_COLUMN;
use crate::error::PipelineError;
use crate::frame::{Column, ColumnData, Frame};
use crate::series::{diff, forward_max, rolling_mean, shift};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const TARGET_COLUMN: &str = "target_next_24h";
pub const HAZARD_NOW_COLUMN: &str = "is_hazardous_now";
pub const WEATHER_SUMMARY_COLUMN: &str = "weather_summary";
pub const PROVIDER_SUMMARY_COLUMN: &str = "icon";

pub const REQUIRED_COLUMNS: [&str; 4] = [PM25_COLUMN, "temp", "precip", "visibility"];
pub const SCRATCH_COLUMNS: [&str; 3] = ["temp_change_bin", "year_month", "day_name"];

const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Season {
    Winter,
    PreMonsoon,
    Monsoon,
    PostMonsoon,
}

impl Season {
    pub fn from_month(month: u32) -> Self {
        match month {
            12 | 1 | 2 => Self::Winter,
            3..=5 => Self::PreMonsoon,
            6..=9 => Self::Monsoon,
            _ => Self::PostMonsoon,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Winter => "Winter",
            Self::PreMonsoon => "Pre-Monsoon",
            Self::Monsoon => "Monsoon",
            Self::PostMonsoon => "Post-Monsoon",
        }
    }
}

pub fn is_brick_kiln_active(month: u32) -> bool {
    (1..=5).contains(&month)
}

pub fn is_rush_hour(hour: u32) -> bool {
    (8..=11).contains(&hour) || (16..=20).contains(&hour)
}

pub fn is_weekend(day_of_week: u32) -> bool {
    matches!(day_of_week, 5 | 6)
}

pub fn day_name(day_of_week: u32) -> &'static str {
    DAY_NAMES[(day_of_week % 7) as usize]
}

pub fn cyclical_encoding(value: f64, period: f64) -> (f64, f64) {
    let angle = 2.0 * PI * value / period;
    (angle.sin(), angle.cos())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    Numeric,
    Categorical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn from_frame(frame: &Frame, version: u32) -> Self {
        let columns: Vec<FeatureColumn> = frame
            .columns()
            .iter()
            .map(|column| FeatureColumn {
                name: column.name.clone(),
                dtype: match column.data {
                    ColumnData::Numeric(_) => FeatureDType::Numeric,
                    ColumnData::Text(_) => FeatureDType::Categorical,
                },
            })
            .collect();

        let mut hasher = Sha256::new();
        hasher.update(format!("version:{version};columns:"));
        for column in &columns {
            hasher.update(column.name.as_bytes());
            hasher.update(match column.dtype {
                FeatureDType::Numeric => ":num;",
                FeatureDType::Categorical => ":cat;",
            });
        }

        Self {
            version,
            fingerprint: hex::encode(hasher.finalize()),
            columns,
        }
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), PipelineError> {
    if expected_version != actual.version {
        return Err(PipelineError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(PipelineError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub hazard_threshold: f64,
    pub prediction_window: usize,
    pub lookback_hours: usize,
    pub schema_version: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            hazard_threshold: 150.0,
            prediction_window: 24,
            lookback_hours: 24,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureReport {
    pub input_rows: usize,
    pub output_rows: usize,
    pub dropped_rows: usize,
    pub positive_labels: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub frame: Frame,
    pub schema: FeatureSchema,
    pub report: FeatureReport,
}

#[derive(Debug, Clone)]
pub struct FeatureEngineer {
    frame: Frame,
    cfg: FeatureConfig,
}

impl FeatureEngineer {
    pub fn new(frame: Frame, cfg: FeatureConfig) -> Self {
        Self { frame, cfg }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn add_temporal_features(mut self) -> Self {
        let timestamps: Vec<NaiveDateTime> = self.frame.timestamps().to_vec();
        let hours: Vec<u32> = timestamps.iter().map(|ts| ts.hour()).collect();
        let months: Vec<u32> = timestamps.iter().map(|ts| ts.month()).collect();
        let days: Vec<u32> = timestamps
            .iter()
            .map(|ts| ts.weekday().num_days_from_monday())
            .collect();

        let numeric = |values: &[u32], f: &dyn Fn(u32) -> f64| -> Vec<Option<f64>> {
            values.iter().map(|v| Some(f(*v))).collect()
        };
        let flag = |on: bool| if on { 1.0 } else { 0.0 };

        let frame = &mut self.frame;
        frame.set_column(Column::numeric("hour", numeric(&hours, &|h| h as f64)));
        frame.set_column(Column::numeric("month", numeric(&months, &|m| m as f64)));
        frame.set_column(Column::numeric("day_of_week", numeric(&days, &|d| d as f64)));
        frame.set_column(Column::text(
            "season",
            months
                .iter()
                .map(|m| Some(Season::from_month(*m).as_str().to_string()))
                .collect(),
        ));
        frame.set_column(Column::numeric(
            "brick_kiln_active",
            numeric(&months, &|m| flag(is_brick_kiln_active(m))),
        ));
        frame.set_column(Column::numeric(
            "month_sin",
            numeric(&months, &|m| cyclical_encoding(m as f64, 12.0).0),
        ));
        frame.set_column(Column::numeric(
            "month_cos",
            numeric(&months, &|m| cyclical_encoding(m as f64, 12.0).1),
        ));
        frame.set_column(Column::numeric(
            "hour_sin",
            numeric(&hours, &|h| cyclical_encoding(h as f64, 24.0).0),
        ));
        frame.set_column(Column::numeric(
            "hour_cos",
            numeric(&hours, &|h| cyclical_encoding(h as f64, 24.0).1),
        ));
        frame.set_column(Column::numeric(
            "is_rush_hour",
            numeric(&hours, &|h| flag(is_rush_hour(h))),
        ));
        frame.set_column(Column::numeric(
            "is_weekend",
            numeric(&days, &|d| flag(is_weekend(d))),
        ));
        frame.set_column(Column::text(
            "day_name",
            days.iter().map(|d| Some(day_name(*d).to_string())).collect(),
        ));

        self
    }

    pub fn add_lag_features(mut self) -> Result<Self, PipelineError> {
        let pm25 = self.frame.require_numeric(PM25_COLUMN, "lag features")?.to_vec();
        let precip = self.frame.require_numeric("precip", "lag features")?.to_vec();
        let visibility = self.frame.require_numeric("visibility", "lag features")?.to_vec();
        let temp = self.frame.require_numeric("temp", "lag features")?.to_vec();

        let frame = &mut self.frame;
        frame.set_column(Column::numeric("pm25_lag_1h", shift(&pm25, 1)));
        frame.set_column(Column::numeric("pm25_lag_2h", shift(&pm25, 2)));
        frame.set_column(Column::numeric("pm25_rolling_6h", rolling_mean(&pm25, 6)));
        frame.set_column(Column::numeric("pm25_rolling_24h", rolling_mean(&pm25, 24)));
        frame.set_column(Column::numeric("precip_lag_3h", shift(&precip, 3)));
        frame.set_column(Column::numeric("visibility_lag_3h", shift(&visibility, 3)));
        frame.set_column(Column::numeric("temp_diff_6h", diff(&temp, 6)));

        Ok(self)
    }

    pub fn add_targets(mut self) -> Result<Self, PipelineError> {
        let threshold = self.cfg.hazard_threshold;
        let hazardous: Vec<Option<f64>> = self
            .frame
            .require_numeric(PM25_COLUMN, "targets")?
            .iter()
            .map(|value| value.map(|v| if v >= threshold { 1.0 } else { 0.0 }))
            .collect();
        let target = forward_max(&hazardous, self.cfg.prediction_window);

        self.frame.set_column(Column::numeric(HAZARD_NOW_COLUMN, hazardous));
        self.frame.set_column(Column::numeric(TARGET_COLUMN, target));
        Ok(self)
    }

    pub fn finalize(self) -> FeatureTable {
        let FeatureEngineer { frame, cfg } = self;
        let input_rows = frame.len();
        let mut frame = tidy_columns(frame);

        let keep: Vec<usize> = (cfg.lookback_hours..frame.len())
            .filter(|row| !frame.row_has_missing(*row))
            .collect();
        frame = frame.select_rows(&keep);

        let positive_labels = frame
            .numeric(TARGET_COLUMN)
            .map(|values| values.iter().filter(|v| **v == Some(1.0)).count())
            .unwrap_or(0);
        let report = FeatureReport {
            input_rows,
            output_rows: frame.len(),
            dropped_rows: input_rows - frame.len(),
            positive_labels,
        };

        info!(
            component = "features",
            event = "features.finalize",
            input_rows = report.input_rows,
            output_rows = report.output_rows,
            dropped_rows = report.dropped_rows,
            positive_labels = report.positive_labels
        );

        let schema = FeatureSchema::from_frame(&frame, cfg.schema_version);
        FeatureTable {
            frame,
            schema,
            report,
        }
    }

    pub fn prepare_for_inference(self) -> Frame {
        tidy_columns(self.frame)
    }
}

fn tidy_columns(mut frame: Frame) -> Frame {
    frame.rename_column(PROVIDER_SUMMARY_COLUMN, WEATHER_SUMMARY_COLUMN);
    frame.drop_columns(&SCRATCH_COLUMNS);
    frame
}

fn check_required_columns(frame: &Frame) -> Result<(), PipelineError> {
    for column in REQUIRED_COLUMNS {
        frame.require_numeric(column, "feature engineering")?;
    }
    Ok(())
}

pub fn build_training_table(merged: &Frame, cfg: &FeatureConfig) -> Result<FeatureTable, PipelineError> {
    check_required_columns(merged)?;
    info!(
        component = "features",
        event = "features.build.start",
        rows = merged.len(),
        prediction_window = cfg.prediction_window,
        hazard_threshold = cfg.hazard_threshold
    );

    let table = FeatureEngineer::new(merged.clone(), cfg.clone())
        .add_temporal_features()
        .add_lag_features()?
        .add_targets()?
        .finalize();

    info!(
        component = "features",
        event = "features.schema.built",
        version = table.schema.version,
        column_count = table.schema.columns.len(),
        fingerprint = %table.schema.fingerprint
    );
    Ok(table)
}

pub fn build_inference_frame(merged: &Frame, cfg: &FeatureConfig) -> Result<Frame, PipelineError> {
    check_required_columns(merged)?;
    Ok(FeatureEngineer::new(merged.clone(), cfg.clone())
        .add_temporal_features()
        .add_lag_features()?
        .prepare_for_inference())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn season_mapping_covers_every_month() {
        let expected = [
            "Winter",
            "Winter",
            "Pre-Monsoon",
            "Pre-Monsoon",
            "Pre-Monsoon",
            "Monsoon",
            "Monsoon",
            "Monsoon",
            "Monsoon",
            "Post-Monsoon",
            "Post-Monsoon",
            "Winter",
        ];
        for (idx, name) in expected.iter().enumerate() {
            assert_eq!(Season::from_month(idx as u32 + 1).as_str(), *name, "month {}", idx + 1);
        }
    }

    #[test]
    fn cyclical_hour_encoding_wraps_continuously() {
        let (sin0, cos0) = cyclical_encoding(0.0, 24.0);
        let (sin24, cos24) = cyclical_encoding(24.0, 24.0);
        assert!((sin0 - sin24).abs() < 1e-12);
        assert!((cos0 - cos24).abs() < 1e-12);

        let (sin23, cos23) = cyclical_encoding(23.0, 24.0);
        let (sin1, _) = cyclical_encoding(1.0, 24.0);
        assert!((sin23 + sin1).abs() < 1e-12);
        assert!(cos23 > 0.96);
    }

    #[test]
    fn calendar_flags() {
        assert!(is_brick_kiln_active(1));
        assert!(is_brick_kiln_active(5));
        assert!(!is_brick_kiln_active(6));
        assert!(!is_brick_kiln_active(12));

        assert!(is_rush_hour(8));
        assert!(is_rush_hour(11));
        assert!(!is_rush_hour(12));
        assert!(is_rush_hour(20));
        assert!(!is_rush_hour(21));

        assert!(!is_weekend(4));
        assert!(is_weekend(5));
        assert!(is_weekend(6));
        assert!(!is_weekend(0));
        assert_eq!(day_name(5), "Sat");
        assert_eq!(day_name(6), "Sun");
    }

    #[test]
    fn schema_fingerprint_tracks_column_order_and_type() {
        let ts = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let mut a = Frame::new(vec![ts]);
        a.set_column(Column::numeric("x", vec![Some(1.0)]));
        a.set_column(Column::numeric("y", vec![Some(1.0)]));
        let mut b = Frame::new(vec![ts]);
        b.set_column(Column::numeric("y", vec![Some(1.0)]));
        b.set_column(Column::numeric("x", vec![Some(1.0)]));

        let schema_a = FeatureSchema::from_frame(&a, FEATURE_SCHEMA_VERSION);
        let schema_b = FeatureSchema::from_frame(&b, FEATURE_SCHEMA_VERSION);
        assert_ne!(schema_a.fingerprint, schema_b.fingerprint);
        assert_eq!(schema_a, FeatureSchema::from_frame(&a, FEATURE_SCHEMA_VERSION));

        assert!(assert_schema_compatible(FEATURE_SCHEMA_VERSION, &schema_a.fingerprint, &schema_a).is_ok());
        assert!(matches!(
            assert_schema_compatible(FEATURE_SCHEMA_VERSION, &schema_a.fingerprint, &schema_b),
            Err(PipelineError::SchemaFingerprintMismatch { .. })
        ));
        assert!(matches!(
            assert_schema_compatible(2, &schema_a.fingerprint, &schema_a),
            Err(PipelineError::SchemaVersionMismatch { .. })
        ));
    }
}
