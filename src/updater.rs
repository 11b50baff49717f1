//! Incremental updater: appends freshly fetched observations to the running
//! per-feed histories and rebuilds the inference features from the full
//! history on every refresh.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::NaiveDateTime;
use chrono_tz::Tz;
use thiserror::Error;
use tracing::{info, warn};

use crate::air_quality::{clean_air_quality, AirQualityCleanerConfig};
use crate::error::PipelineError;
use crate::features::{build_inference_frame, FeatureConfig};
use crate::fetch::{FeedSource, FetchError};
use crate::frame::{Frame, FrameRow, TIMESTAMP_COLUMN};
use crate::merge::inner_join;
use crate::table::RawTable;
use crate::timestamp::parse_timestamp;
use crate::weather::{clean_weather, WeatherCleanerConfig};

pub const AQ_HISTORY_FILE: &str = "aq_last_48.csv";
pub const WEATHER_HISTORY_FILE: &str = "weather_last_48.csv";
pub const MERGED_HISTORY_FILE: &str = "current_history.csv";

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("history file {} is absent", path.display())]
    HistoryMissing { path: PathBuf },
    #[error("no new observations to append")]
    NoNewRows,
    #[error("merged history has {rows} rows, at least {required} needed")]
    InsufficientHistory { rows: usize, required: usize },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPaths {
    pub air_quality: PathBuf,
    pub weather: PathBuf,
    pub merged: PathBuf,
}

impl HistoryPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            air_quality: dir.join(AQ_HISTORY_FILE),
            weather: dir.join(WEATHER_HISTORY_FILE),
            merged: dir.join(MERGED_HISTORY_FILE),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdaterConfig {
    pub air_quality: AirQualityCleanerConfig,
    pub weather: WeatherCleanerConfig,
    pub features: FeatureConfig,
    pub max_history_rows: usize,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            air_quality: AirQualityCleanerConfig::online(),
            weather: WeatherCleanerConfig::default(),
            features: FeatureConfig::default(),
            max_history_rows: 24 * 30,
        }
    }
}

impl UpdaterConfig {
    pub fn with_timezone(timezone: Tz) -> Self {
        let mut cfg = Self::default();
        cfg.air_quality.timezone = timezone;
        cfg.weather.timezone = timezone;
        cfg
    }

    pub fn required_rows(&self) -> usize {
        self.features.lookback_hours + 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    pub merged: Frame,
    pub features: Frame,
    pub latest: FrameRow,
    pub appended_air_quality: usize,
    pub appended_weather: usize,
}

#[derive(Debug)]
pub struct HistoryStore {
    paths: HistoryPaths,
    cfg: UpdaterConfig,
    lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(paths: HistoryPaths, cfg: UpdaterConfig) -> Self {
        Self {
            paths,
            cfg,
            lock: Mutex::new(()),
        }
    }

    pub fn paths(&self) -> &HistoryPaths {
        &self.paths
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.cfg
    }

    pub fn seed(&self, air_quality: &RawTable, weather: &RawTable) -> Result<RefreshOutcome, UpdateError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        air_quality.write_csv_atomic(&self.paths.air_quality)?;
        weather.write_csv_atomic(&self.paths.weather)?;
        info!(
            component = "updater",
            event = "updater.seed",
            aq_rows = air_quality.len(),
            weather_rows = weather.len()
        );
        self.rebuild_locked(air_quality, weather, air_quality.len(), weather.len())
    }

    pub fn rebuild(&self) -> Result<RefreshOutcome, UpdateError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (air_quality, weather) = self.read_histories()?;
        self.rebuild_locked(&air_quality, &weather, 0, 0)
    }

    pub fn append_and_refresh(
        &self,
        new_air_quality: &RawTable,
        new_weather: &RawTable,
    ) -> Result<RefreshOutcome, UpdateError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut air_quality, mut weather) = self.read_histories()?;

        let aq_ts = [self.cfg.air_quality.timestamp_column.as_str(), TIMESTAMP_COLUMN];
        let weather_ts = [self.cfg.weather.datetime_column.as_str(), TIMESTAMP_COLUMN];
        let tz = self.cfg.air_quality.timezone;
        let appended_air_quality = append_new_rows(&mut air_quality, new_air_quality, &aq_ts, tz);
        let appended_weather = append_new_rows(&mut weather, new_weather, &weather_ts, tz);

        if appended_air_quality == 0 && appended_weather == 0 {
            warn!(
                component = "updater",
                event = "updater.no_new_rows",
                aq_candidates = new_air_quality.len(),
                weather_candidates = new_weather.len()
            );
            return Err(UpdateError::NoNewRows);
        }

        truncate_front(&mut air_quality, self.cfg.max_history_rows);
        truncate_front(&mut weather, self.cfg.max_history_rows);
        air_quality.write_csv_atomic(&self.paths.air_quality)?;
        weather.write_csv_atomic(&self.paths.weather)?;

        self.rebuild_locked(&air_quality, &weather, appended_air_quality, appended_weather)
    }

    pub fn refresh_from_feed(&self, source: &dyn FeedSource) -> Result<RefreshOutcome, UpdateError> {
        let air_quality = source.latest_air_quality()?;
        let weather = source.latest_weather()?;
        self.append_and_refresh(&air_quality, &weather)
    }

    fn read_histories(&self) -> Result<(RawTable, RawTable), UpdateError> {
        Ok((
            read_history(&self.paths.air_quality)?,
            read_history(&self.paths.weather)?,
        ))
    }

    fn rebuild_locked(
        &self,
        air_quality: &RawTable,
        weather: &RawTable,
        appended_air_quality: usize,
        appended_weather: usize,
    ) -> Result<RefreshOutcome, UpdateError> {
        let merged = rebuild_from_histories(air_quality, weather, &self.cfg)?;
        merged.to_table().write_csv_atomic(&self.paths.merged)?;

        let required = self.cfg.required_rows();
        if merged.len() < required {
            return Err(UpdateError::InsufficientHistory {
                rows: merged.len(),
                required,
            });
        }

        let features = build_inference_frame(&merged, &self.cfg.features)?;
        let latest = features.last_row().ok_or(UpdateError::InsufficientHistory {
            rows: 0,
            required,
        })?;

        info!(
            component = "updater",
            event = "updater.refresh",
            merged_rows = merged.len(),
            appended_air_quality,
            appended_weather,
            latest = %latest.timestamp
        );

        Ok(RefreshOutcome {
            merged,
            features,
            latest,
            appended_air_quality,
            appended_weather,
        })
    }
}

pub fn rebuild_from_histories(
    air_quality: &RawTable,
    weather: &RawTable,
    cfg: &UpdaterConfig,
) -> Result<Frame, PipelineError> {
    let cleaned_aq = clean_air_quality(air_quality, &cfg.air_quality)?;
    let cleaned_weather = clean_weather(weather, &cfg.weather)?;
    inner_join(&cleaned_aq.to_frame(), &cleaned_weather.frame)
}

fn read_history(path: &Path) -> Result<RawTable, UpdateError> {
    match RawTable::read_csv(path) {
        Ok(table) => Ok(table),
        Err(PipelineError::MissingData { path }) => Err(UpdateError::HistoryMissing { path }),
        Err(err) => Err(err.into()),
    }
}

fn append_new_rows(history: &mut RawTable, incoming: &RawTable, candidates: &[&str], tz: Tz) -> usize {
    let Some(incoming_idx) = timestamp_index(incoming, candidates) else {
        warn!(
            component = "updater",
            event = "updater.incoming_without_timestamp",
            columns = ?incoming.headers()
        );
        return 0;
    };

    let mut seen: HashSet<NaiveDateTime> = timestamp_index(history, candidates)
        .map(|idx| {
            history
                .column_cells(idx)
                .filter_map(|cell| parse_timestamp(cell, tz))
                .collect()
        })
        .unwrap_or_default();

    let mut fresh = RawTable::new(incoming.headers().to_vec());
    for (row, cell) in incoming.column_cells(incoming_idx).enumerate() {
        match parse_timestamp(cell, tz) {
            Some(ts) if seen.insert(ts) => fresh.push_row(incoming.rows()[row].clone()),
            _ => {}
        }
    }

    // Keep the history's own timestamp header so rows line up after the append.
    if let Some(history_idx) = timestamp_index(history, candidates) {
        let history_name = history.headers()[history_idx].clone();
        let incoming_name = incoming.headers()[incoming_idx].clone();
        if history_name != incoming_name {
            fresh.rename_column(&incoming_name, &history_name);
        }
    }

    let appended = fresh.len();
    history.append(&fresh);
    appended
}

fn timestamp_index(table: &RawTable, candidates: &[&str]) -> Option<usize> {
    candidates.iter().find_map(|name| table.column_index(name))
}

fn truncate_front(table: &mut RawTable, max_rows: usize) {
    if max_rows == 0 || table.len() <= max_rows {
        return;
    }
    let order: Vec<usize> = (table.len() - max_rows..table.len()).collect();
    table.reorder(&order);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn aq_rows(hours: usize) -> RawTable {
        RawTable::from_rows(
            strings(&["timestamp", "value"]),
            (0..hours)
                .map(|h| strings(&[&format!("2024-01-0{} {:02}:00:00", 1 + h / 24, h % 24), "40"]))
                .collect(),
        )
    }

    fn weather_rows(hours: usize) -> RawTable {
        RawTable::from_rows(
            strings(&["datetime", "temp", "precip", "visibility", "icon"]),
            (0..hours)
                .map(|h| {
                    strings(&[
                        &format!("2024-01-0{}T{:02}:00:00", 1 + h / 24, h % 24),
                        "12.5",
                        "0",
                        "4.0",
                        "fog",
                    ])
                })
                .collect(),
        )
    }

    #[test]
    fn duplicate_hour_does_not_create_second_row() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(HistoryPaths::in_dir(dir.path()), UpdaterConfig::default());
        store.seed(&aq_rows(30), &weather_rows(30)).unwrap();

        let new_aq = RawTable::from_rows(
            strings(&["timestamp", "value"]),
            vec![
                strings(&["2024-01-02 05:00:00", "55"]),
                strings(&["2024-01-02 05:30:00", "65"]),
            ],
        );
        let new_weather = RawTable::from_rows(
            strings(&["datetime", "temp", "precip", "visibility", "icon"]),
            vec![strings(&["2024-01-02T05:00:00", "11", "0", "3.5", "fog"])],
        );

        let outcome = store.append_and_refresh(&new_aq, &new_weather).unwrap();

        assert_eq!(outcome.appended_air_quality, 1);
        assert_eq!(outcome.appended_weather, 0);
        assert_eq!(outcome.merged.len(), 30);
        let mut unique = outcome.merged.timestamps().to_vec();
        unique.dedup();
        assert_eq!(unique.len(), outcome.merged.len());
        // 05:00 keeps 40 and averages with the 05:30 sample.
        let pm25 = outcome.merged.numeric("pm25").unwrap();
        assert_eq!(pm25[29], Some(52.5));
    }

    #[test]
    fn new_hour_extends_history_and_latest_row() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(HistoryPaths::in_dir(dir.path()), UpdaterConfig::default());
        store.seed(&aq_rows(30), &weather_rows(30)).unwrap();

        let new_aq = RawTable::from_rows(
            strings(&["timestamp", "value"]),
            vec![strings(&["2024-01-02T06:00:00+05:45", "70"])],
        );
        let new_weather = RawTable::from_rows(
            strings(&["datetime", "temp", "precip", "visibility", "icon"]),
            vec![strings(&["2024-01-02T06:00:00", "10", "0.2", "2.0", "rain"])],
        );

        let outcome = store.append_and_refresh(&new_aq, &new_weather).unwrap();

        assert_eq!(outcome.merged.len(), 31);
        assert_eq!(outcome.latest.numeric["pm25"], 70.0);
        assert_eq!(outcome.latest.numeric["pm25_lag_1h"], 40.0);
        assert!(outcome.latest.numeric.contains_key("pm25_rolling_24h"));
        assert!(!outcome.latest.numeric.contains_key("target_next_24h"));

        let persisted = RawTable::read_csv(&store.paths().merged).unwrap();
        assert_eq!(persisted.len(), 31);
    }

    #[test]
    fn replaying_known_rows_is_no_new_rows() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(HistoryPaths::in_dir(dir.path()), UpdaterConfig::default());
        store.seed(&aq_rows(30), &weather_rows(30)).unwrap();

        let err = store
            .append_and_refresh(&aq_rows(2), &weather_rows(2))
            .unwrap_err();
        assert!(matches!(err, UpdateError::NoNewRows));
    }

    #[test]
    fn absent_history_is_reported_not_created() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(HistoryPaths::in_dir(dir.path()), UpdaterConfig::default());

        let err = store.append_and_refresh(&aq_rows(1), &weather_rows(1)).unwrap_err();
        assert!(matches!(err, UpdateError::HistoryMissing { .. }));
        assert!(!store.paths().air_quality.exists());
    }

    #[test]
    fn short_history_is_insufficient() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(HistoryPaths::in_dir(dir.path()), UpdaterConfig::default());
        let err = store.seed(&aq_rows(10), &weather_rows(10)).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::InsufficientHistory { rows: 10, required: 25 }
        ));
    }

    #[test]
    fn retention_drops_oldest_rows() {
        let dir = tempdir().unwrap();
        let cfg = UpdaterConfig {
            max_history_rows: 30,
            ..UpdaterConfig::default()
        };
        let store = HistoryStore::new(HistoryPaths::in_dir(dir.path()), cfg);
        store.seed(&aq_rows(30), &weather_rows(30)).unwrap();

        let outcome = store.append_and_refresh(&aq_rows(31), &weather_rows(31)).unwrap();
        assert_eq!(outcome.merged.len(), 30);
        let aq = RawTable::read_csv(&store.paths().air_quality).unwrap();
        assert_eq!(aq.cell(0, 0), "2024-01-01 01:00:00");
    }
}
