//! Weather cleaner: hourly alignment, first-wins deduplication, categorical
//! fills and gap closing for the provider's timeline export.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PipelineError;
use crate::frame::{is_missing_cell, Column, ColumnData, Frame, TIMESTAMP_COLUMN};
use crate::series::{backward_fill, fill_boundaries, forward_fill, interpolate_linear};
use crate::table::RawTable;
use crate::timestamp::{floor_to_hour, parse_timestamp};

pub const PRECIP_TYPE_COLUMN: &str = "preciptype";
pub const VISIBILITY_COLUMN: &str = "visibility";
pub const NO_PRECIP_CATEGORY: &str = "none";

pub const DROPPED_WEATHER_COLUMNS: [&str; 5] =
    ["stations", "name", "snow", "snowdepth", "severerisk"];

#[derive(Debug, Clone, PartialEq)]
pub struct WeatherCleanerConfig {
    pub datetime_column: String,
    pub drop_columns: Vec<String>,
    pub timezone: Tz,
}

impl Default for WeatherCleanerConfig {
    fn default() -> Self {
        Self {
            datetime_column: "datetime".to_string(),
            drop_columns: DROPPED_WEATHER_COLUMNS.iter().map(|c| c.to_string()).collect(),
            timezone: chrono_tz::Asia::Kathmandu,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeatherCleanReport {
    pub input_rows: usize,
    pub null_timestamps: usize,
    pub duplicate_rows: usize,
    pub dropped_columns: Vec<String>,
    pub output_rows: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanedWeather {
    pub frame: Frame,
    pub report: WeatherCleanReport,
}

pub fn clean_weather(raw: &RawTable, cfg: &WeatherCleanerConfig) -> Result<CleanedWeather, PipelineError> {
    // Histories written by this crate already carry the canonical name.
    let ts_idx = raw
        .column_index(&cfg.datetime_column)
        .or_else(|| raw.column_index(TIMESTAMP_COLUMN))
        .ok_or_else(|| PipelineError::missing_column(cfg.datetime_column.clone(), "weather clean"))?;

    let mut report = WeatherCleanReport {
        input_rows: raw.len(),
        ..WeatherCleanReport::default()
    };

    let mut hours: BTreeMap<NaiveDateTime, Vec<usize>> = BTreeMap::new();
    for (row, cell) in raw.column_cells(ts_idx).enumerate() {
        match parse_timestamp(cell, cfg.timezone) {
            Some(ts) => hours.entry(floor_to_hour(ts)).or_default().push(row),
            None => report.null_timestamps += 1,
        }
    }
    report.duplicate_rows = hours.values().map(|rows| rows.len() - 1).sum();

    let mut frame = Frame::new(hours.keys().copied().collect());
    for (col_idx, header) in raw.headers().iter().enumerate() {
        if col_idx == ts_idx || header == TIMESTAMP_COLUMN {
            continue;
        }
        if cfg.drop_columns.iter().any(|drop| drop == header) {
            report.dropped_columns.push(header.clone());
            continue;
        }
        let cells = hours.values().map(|rows| {
            rows.iter()
                .map(|row| raw.cell(*row, col_idx))
                .find(|cell| !is_missing_cell(cell))
                .unwrap_or("")
        });
        frame.set_column(Column {
            name: header.clone(),
            data: ColumnData::infer(cells),
        });
    }

    if let Some(column) = frame.column_mut(PRECIP_TYPE_COLUMN) {
        let values = std::mem::replace(&mut column.data, ColumnData::Text(Vec::new())).into_text();
        column.data = ColumnData::Text(
            values
                .into_iter()
                .map(|value| value.or_else(|| Some(NO_PRECIP_CATEGORY.to_string())))
                .collect(),
        );
    }

    if frame.has_column(VISIBILITY_COLUMN) {
        let visibility = frame.require_numeric(VISIBILITY_COLUMN, "weather clean")?;
        let filled = fill_boundaries(&interpolate_linear(visibility));
        frame.set_column(Column::numeric(VISIBILITY_COLUMN, filled));
    }

    let names: Vec<String> = frame.column_names().into_iter().map(str::to_string).collect();
    for name in names {
        if let Some(column) = frame.column_mut(&name) {
            column.data = match &column.data {
                ColumnData::Numeric(values) => ColumnData::Numeric(backward_fill(&forward_fill(values))),
                ColumnData::Text(values) => ColumnData::Text(backward_fill(&forward_fill(values))),
            };
        }
    }

    report.output_rows = frame.len();
    info!(
        component = "weather_clean",
        event = "weather_clean.finish",
        input_rows = report.input_rows,
        output_rows = report.output_rows,
        duplicate_rows = report.duplicate_rows,
        null_timestamps = report.null_timestamps,
        dropped_columns = ?report.dropped_columns
    );

    Ok(CleanedWeather { frame, report })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(headers: &[&str], rows: &[&[&str]]) -> RawTable {
        RawTable::from_rows(
            headers.iter().map(|h| h.to_string()).collect(),
            rows.iter()
                .map(|row| row.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    #[test]
    fn nan_cells_are_gaps_not_text() {
        let raw = table(
            &["datetime", "visibility", "windgust"],
            &[
                &["2024-01-01T00:00:00", "4", "5"],
                &["2024-01-01T00:20:00", "9", "8"],
                &["2024-01-01T01:00:00", "NaN", "nan"],
                &["2024-01-01T01:30:00", "N/A", "NULL"],
                &["2024-01-01T02:00:00", "6", "7"],
            ],
        );

        let cleaned = clean_weather(&raw, &WeatherCleanerConfig::default()).unwrap();

        assert_eq!(
            cleaned.frame.numeric(VISIBILITY_COLUMN),
            Some(&[Some(4.0), Some(5.0), Some(6.0)][..])
        );
        assert_eq!(
            cleaned.frame.numeric("windgust"),
            Some(&[Some(5.0), Some(5.0), Some(7.0)][..])
        );
        assert!(cleaned.frame.text("windgust").is_none());
    }

    #[test]
    fn marker_does_not_shadow_a_later_reading_in_the_hour() {
        let raw = table(
            &["datetime", "temp"],
            &[
                &["2024-01-01T00:00:00", "nan"],
                &["2024-01-01T00:40:00", "11"],
            ],
        );

        let cleaned = clean_weather(&raw, &WeatherCleanerConfig::default()).unwrap();
        assert_eq!(cleaned.frame.numeric("temp"), Some(&[Some(11.0)][..]));
    }

    #[test]
    fn duplicate_hours_keep_first_and_timestamp_is_renamed() {
        let raw = table(
            &["datetime", "temp", "name"],
            &[
                &["2024-01-01T00:00:00", "10", "Kathmandu"],
                &["2024-01-01T00:30:00", "99", "Kathmandu"],
                &["2024-01-01T01:00:00", "12", "Kathmandu"],
            ],
        );

        let cleaned = clean_weather(&raw, &WeatherCleanerConfig::default()).unwrap();

        assert_eq!(cleaned.frame.len(), 2);
        assert_eq!(cleaned.frame.numeric("temp"), Some(&[Some(10.0), Some(12.0)][..]));
        assert!(!cleaned.frame.has_column("name"));
        assert!(!cleaned.frame.has_column("datetime"));
        assert_eq!(cleaned.report.duplicate_rows, 1);
        assert_eq!(cleaned.report.dropped_columns, vec!["name".to_string()]);
    }

    #[test]
    fn precip_type_gaps_become_none_category() {
        let raw = table(
            &["datetime", "preciptype"],
            &[
                &["2024-01-01 00:00:00", ""],
                &["2024-01-01 01:00:00", "rain"],
                &["2024-01-01 02:00:00", ""],
            ],
        );

        let cleaned = clean_weather(&raw, &WeatherCleanerConfig::default()).unwrap();
        let values = cleaned.frame.text(PRECIP_TYPE_COLUMN).unwrap();
        assert_eq!(
            values,
            &[Some("none".to_string()), Some("rain".to_string()), Some("none".to_string())]
        );
    }

    #[test]
    fn all_empty_precip_type_still_becomes_text() {
        let raw = table(
            &["datetime", "preciptype"],
            &[&["2024-01-01 00:00:00", ""], &["2024-01-01 01:00:00", ""]],
        );

        let cleaned = clean_weather(&raw, &WeatherCleanerConfig::default()).unwrap();
        assert_eq!(cleaned.frame.categories(PRECIP_TYPE_COLUMN).len(), 1);
    }

    #[test]
    fn visibility_is_interpolated_and_others_forward_filled() {
        let raw = table(
            &["datetime", "visibility", "humidity"],
            &[
                &["2024-01-01 00:00:00", "", "80"],
                &["2024-01-01 01:00:00", "2", ""],
                &["2024-01-01 02:00:00", "", "70"],
                &["2024-01-01 03:00:00", "4", ""],
            ],
        );

        let cleaned = clean_weather(&raw, &WeatherCleanerConfig::default()).unwrap();
        assert_eq!(
            cleaned.frame.numeric(VISIBILITY_COLUMN),
            Some(&[Some(2.0), Some(2.0), Some(3.0), Some(4.0)][..])
        );
        assert_eq!(
            cleaned.frame.numeric("humidity"),
            Some(&[Some(80.0), Some(80.0), Some(70.0), Some(70.0)][..])
        );
        assert_eq!(cleaned.frame.null_count(), 0);
    }

    #[test]
    fn non_numeric_visibility_is_rejected() {
        let raw = table(&["datetime", "visibility"], &[&["2024-01-01 00:00:00", "clear"]]);
        let err = clean_weather(&raw, &WeatherCleanerConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidColumnType { .. }));
    }

    #[test]
    fn missing_datetime_column_is_reported() {
        let raw = table(&["temp"], &[&["1"]]);
        let err = clean_weather(&raw, &WeatherCleanerConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::MissingColumn { .. }));
    }
}
