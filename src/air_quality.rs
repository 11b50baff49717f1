//! Air-quality cleaner: sentinel removal, gap filling, outlier replacement,
//! ceiling clip and hourly aggregation of PM2.5 samples.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PipelineError;
use crate::frame::{Column, Frame, TIMESTAMP_COLUMN};
use crate::series::{fill_boundaries, interpolate_linear, rolling_median, WindowMode};
use crate::table::RawTable;
use crate::timestamp::{floor_to_hour, parse_timestamp};

pub const PM25_COLUMN: &str = "pm25";

#[derive(Debug, Clone, PartialEq)]
pub struct AirQualityCleanerConfig {
    pub value_column: String,
    pub timestamp_column: String,
    pub sentinel: f64,
    pub ceiling: f64,
    pub outlier_factor: f64,
    pub rolling_window: usize,
    pub window_mode: WindowMode,
    pub timezone: Tz,
}

impl Default for AirQualityCleanerConfig {
    fn default() -> Self {
        Self {
            value_column: "value".to_string(),
            timestamp_column: "datetimeLocal".to_string(),
            sentinel: -999.0,
            ceiling: 400.0,
            outlier_factor: 5.0,
            rolling_window: 7,
            window_mode: WindowMode::Centered,
            timezone: chrono_tz::Asia::Kathmandu,
        }
    }
}

impl AirQualityCleanerConfig {
    pub fn online() -> Self {
        Self {
            timestamp_column: TIMESTAMP_COLUMN.to_string(),
            window_mode: WindowMode::Trailing,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HourlyPm25 {
    pub timestamp: NaiveDateTime,
    pub pm25: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AirQualityCleanReport {
    pub input_rows: usize,
    pub sentinel_values: usize,
    pub filled_values: usize,
    pub outliers_replaced: usize,
    pub clipped_values: usize,
    pub null_timestamps: usize,
    pub output_rows: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanedAirQuality {
    pub rows: Vec<HourlyPm25>,
    pub report: AirQualityCleanReport,
}

impl CleanedAirQuality {
    pub fn to_frame(&self) -> Frame {
        let mut frame = Frame::new(self.rows.iter().map(|row| row.timestamp).collect());
        frame.set_column(Column::numeric(
            PM25_COLUMN,
            self.rows.iter().map(|row| Some(row.pm25)).collect(),
        ));
        frame
    }
}

pub fn clean_air_quality(
    raw: &RawTable,
    cfg: &AirQualityCleanerConfig,
) -> Result<CleanedAirQuality, PipelineError> {
    let value_idx = raw
        .column_index(&cfg.value_column)
        .ok_or_else(|| PipelineError::missing_column(cfg.value_column.clone(), "air-quality clean"))?;
    let ts_idx = raw
        .column_index(&cfg.timestamp_column)
        .ok_or_else(|| {
            PipelineError::missing_column(cfg.timestamp_column.clone(), "air-quality clean")
        })?;

    let mut report = AirQualityCleanReport {
        input_rows: raw.len(),
        ..AirQualityCleanReport::default()
    };

    // Stable chronological order so interpolation and the median window run
    // over neighbouring hours; unparseable timestamps sort last.
    let timestamps: Vec<Option<NaiveDateTime>> = raw
        .column_cells(ts_idx)
        .map(|cell| parse_timestamp(cell, cfg.timezone))
        .collect();
    let mut order: Vec<usize> = (0..raw.len()).collect();
    order.sort_by_key(|idx| (timestamps[*idx].is_none(), timestamps[*idx]));

    let mut values: Vec<Option<f64>> = order
        .iter()
        .map(|idx| raw.cell(*idx, value_idx).trim().parse::<f64>().ok())
        .map(|value| value.filter(|v| v.is_finite()))
        .collect();

    for value in values.iter_mut() {
        if *value == Some(cfg.sentinel) {
            *value = None;
            report.sentinel_values += 1;
        }
    }

    if values.iter().all(Option::is_none) {
        return Err(PipelineError::NoValidObservations { feed: "air_quality" });
    }

    let missing_before = values.iter().filter(|v| v.is_none()).count();
    let values = fill_boundaries(&interpolate_linear(&values));
    report.filled_values = missing_before;

    let medians = rolling_median(&values, cfg.rolling_window, cfg.window_mode);
    let mut cleaned = Vec::with_capacity(values.len());
    for (value, median) in values.into_iter().zip(medians) {
        let mut value = value.unwrap_or_default();
        if let Some(median) = median {
            if value > cfg.ceiling && value > median * cfg.outlier_factor {
                value = median;
                report.outliers_replaced += 1;
            }
        }
        if value > cfg.ceiling {
            value = cfg.ceiling;
            report.clipped_values += 1;
        }
        cleaned.push(value);
    }

    let mut hourly: BTreeMap<NaiveDateTime, (f64, usize)> = BTreeMap::new();
    for (pos, raw_idx) in order.iter().enumerate() {
        let Some(ts) = timestamps[*raw_idx] else {
            report.null_timestamps += 1;
            continue;
        };
        let slot = hourly.entry(floor_to_hour(ts)).or_insert((0.0, 0));
        slot.0 += cleaned[pos];
        slot.1 += 1;
    }

    let rows: Vec<HourlyPm25> = hourly
        .into_iter()
        .map(|(timestamp, (sum, count))| HourlyPm25 {
            timestamp,
            pm25: sum / count as f64,
        })
        .collect();

    if rows.is_empty() {
        return Err(PipelineError::NoValidObservations { feed: "air_quality" });
    }
    report.output_rows = rows.len();

    info!(
        component = "aq_clean",
        event = "aq_clean.finish",
        input_rows = report.input_rows,
        output_rows = report.output_rows,
        sentinel_values = report.sentinel_values,
        filled_values = report.filled_values,
        outliers_replaced = report.outliers_replaced,
        clipped_values = report.clipped_values,
        null_timestamps = report.null_timestamps,
        window_mode = ?cfg.window_mode
    );

    Ok(CleanedAirQuality { rows, report })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(rows: &[(&str, &str)]) -> RawTable {
        RawTable::from_rows(
            vec!["datetimeLocal".to_string(), "value".to_string()],
            rows.iter()
                .map(|(ts, v)| vec![ts.to_string(), v.to_string()])
                .collect(),
        )
    }

    #[test]
    fn sentinel_is_interpolated_and_never_emitted() {
        let table = raw(&[
            ("2024-01-01T00:00:00+05:45", "10"),
            ("2024-01-01T01:00:00+05:45", "-999"),
            ("2024-01-01T02:00:00+05:45", "30"),
        ]);

        let cleaned = clean_air_quality(&table, &AirQualityCleanerConfig::default()).unwrap();

        let values: Vec<f64> = cleaned.rows.iter().map(|r| r.pm25).collect();
        assert_eq!(values, vec![10.0, 20.0, 30.0]);
        assert_eq!(cleaned.report.sentinel_values, 1);
    }

    #[test]
    fn outlier_above_ceiling_is_replaced_by_local_median() {
        let mut rows: Vec<(String, String)> = (0..7)
            .map(|h| (format!("2024-01-01 {h:02}:00:00"), "50".to_string()))
            .collect();
        rows[3].1 = "900".to_string();
        let table = RawTable::from_rows(
            vec!["datetimeLocal".to_string(), "value".to_string()],
            rows.into_iter().map(|(a, b)| vec![a, b]).collect(),
        );

        let cleaned = clean_air_quality(&table, &AirQualityCleanerConfig::default()).unwrap();
        assert_eq!(cleaned.rows[3].pm25, 50.0);
        assert_eq!(cleaned.report.outliers_replaced, 1);
    }

    #[test]
    fn values_above_ceiling_without_outlier_ratio_are_clipped() {
        let table = raw(&[
            ("2024-01-01 00:00:00", "420"),
            ("2024-01-01 01:00:00", "450"),
            ("2024-01-01 02:00:00", "430"),
        ]);

        let cleaned = clean_air_quality(&table, &AirQualityCleanerConfig::default()).unwrap();
        assert!(cleaned.rows.iter().all(|r| r.pm25 == 400.0));
        assert_eq!(cleaned.report.clipped_values, 3);
    }

    #[test]
    fn duplicate_hour_samples_are_averaged() {
        let table = raw(&[
            ("2024-01-01 00:10:00", "10"),
            ("2024-01-01 00:50:00", "20"),
            ("2024-01-01 01:00:00", "40"),
        ]);

        let cleaned = clean_air_quality(&table, &AirQualityCleanerConfig::default()).unwrap();
        assert_eq!(cleaned.rows.len(), 2);
        assert_eq!(cleaned.rows[0].pm25, 15.0);
        assert_eq!(cleaned.rows[1].pm25, 40.0);
    }

    #[test]
    fn all_sentinel_feed_has_no_valid_observations() {
        let table = raw(&[("2024-01-01 00:00:00", "-999"), ("2024-01-01 01:00:00", "")]);
        let err = clean_air_quality(&table, &AirQualityCleanerConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::NoValidObservations { .. }));
    }

    #[test]
    fn missing_value_column_is_reported() {
        let table = RawTable::from_rows(vec!["datetimeLocal".to_string()], vec![]);
        let err = clean_air_quality(&table, &AirQualityCleanerConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::MissingColumn { .. }));
    }
}
