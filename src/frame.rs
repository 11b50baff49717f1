//! Typed hourly frame: one row per timestamp, named numeric or text columns.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PipelineError;
use crate::table::RawTable;
use crate::timestamp::{format_timestamp, parse_timestamp};

pub const TIMESTAMP_COLUMN: &str = "timestamp";

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Numeric(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
}

impl ColumnData {
    /// Infers a column type from raw cells. A column is numeric when every
    /// non-empty cell is a number or a missing-value marker, and at least one
    /// cell parses as a float. Markers and non-finite values become missing.
    pub fn infer<'a>(cells: impl IntoIterator<Item = &'a str>) -> Self {
        let cells: Vec<&str> = cells.into_iter().map(str::trim).collect();
        let mut parsed_any = false;
        let numeric: Option<Vec<Option<f64>>> = cells
            .iter()
            .map(|cell| {
                if cell.is_empty() {
                    return Some(None);
                }
                match cell.parse::<f64>() {
                    Ok(value) => {
                        parsed_any = true;
                        Some(value.is_finite().then_some(value))
                    }
                    Err(_) if is_missing_marker(cell) => Some(None),
                    Err(_) => None,
                }
            })
            .collect();

        match numeric {
            Some(values) if parsed_any || cells.iter().all(|cell| cell.is_empty()) => {
                Self::Numeric(values)
            }
            _ => Self::Text(
                cells
                    .into_iter()
                    .map(|cell| (!cell.is_empty()).then(|| cell.to_string()))
                    .collect(),
            ),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(values) => values.len(),
            Self::Text(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_missing(&self, row: usize) -> bool {
        match self {
            Self::Numeric(values) => values.get(row).map_or(true, Option::is_none),
            Self::Text(values) => values.get(row).map_or(true, Option::is_none),
        }
    }

    pub fn missing_count(&self) -> usize {
        match self {
            Self::Numeric(values) => values.iter().filter(|v| v.is_none()).count(),
            Self::Text(values) => values.iter().filter(|v| v.is_none()).count(),
        }
    }

    pub fn select(&self, rows: &[usize]) -> Self {
        match self {
            Self::Numeric(values) => {
                Self::Numeric(rows.iter().map(|idx| values.get(*idx).copied().flatten()).collect())
            }
            Self::Text(values) => Self::Text(
                rows.iter()
                    .map(|idx| values.get(*idx).cloned().flatten())
                    .collect(),
            ),
        }
    }

    pub fn into_text(self) -> Vec<Option<String>> {
        match self {
            Self::Numeric(values) => values
                .into_iter()
                .map(|value| value.map(format_number))
                .collect(),
            Self::Text(values) => values,
        }
    }

    fn cell_text(&self, row: usize) -> String {
        match self {
            Self::Numeric(values) => values
                .get(row)
                .copied()
                .flatten()
                .map(format_number)
                .unwrap_or_default(),
            Self::Text(values) => values.get(row).cloned().flatten().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn numeric(name: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Numeric(values),
        }
    }

    pub fn text(name: impl Into<String>, values: Vec<Option<String>>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Text(values),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingStat {
    pub column: String,
    pub missing: usize,
    pub percent_missing: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    timestamps: Vec<NaiveDateTime>,
    columns: Vec<Column>,
}

impl Frame {
    pub fn new(timestamps: Vec<NaiveDateTime>) -> Self {
        Self {
            timestamps,
            columns: Vec::new(),
        }
    }

    pub fn from_table(table: &RawTable, timestamp_column: &str, tz: Tz) -> Result<Self, PipelineError> {
        let ts_idx = table
            .column_index(timestamp_column)
            .ok_or_else(|| PipelineError::missing_column(timestamp_column, "frame load"))?;

        let mut keep = Vec::with_capacity(table.len());
        let mut timestamps = Vec::with_capacity(table.len());
        for (row, cell) in table.column_cells(ts_idx).enumerate() {
            if let Some(ts) = parse_timestamp(cell, tz) {
                keep.push(row);
                timestamps.push(ts);
            }
        }
        if keep.len() < table.len() {
            warn!(
                component = "frame",
                event = "frame.load.invalid_timestamps",
                dropped_rows = table.len() - keep.len()
            );
        }

        let mut frame = Self::new(timestamps);
        for (col_idx, header) in table.headers().iter().enumerate() {
            if col_idx == ts_idx {
                continue;
            }
            let cells = keep.iter().map(|row| table.cell(*row, col_idx));
            frame.set_column(Column {
                name: header.clone(),
                data: ColumnData::infer(cells),
            });
        }
        Ok(frame)
    }

    pub fn to_table(&self) -> RawTable {
        let mut headers = vec![TIMESTAMP_COLUMN.to_string()];
        headers.extend(self.columns.iter().map(|column| column.name.clone()));

        let rows = (0..self.len())
            .map(|row| {
                let mut cells = Vec::with_capacity(headers.len());
                cells.push(format_timestamp(self.timestamps[row]));
                cells.extend(self.columns.iter().map(|column| column.data.cell_text(row)));
                cells
            })
            .collect();

        RawTable::from_rows(headers, rows)
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> &[NaiveDateTime] {
        &self.timestamps
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn numeric(&self, name: &str) -> Option<&[Option<f64>]> {
        match self.column(name).map(|column| &column.data) {
            Some(ColumnData::Numeric(values)) => Some(values),
            _ => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<&[Option<String>]> {
        match self.column(name).map(|column| &column.data) {
            Some(ColumnData::Text(values)) => Some(values),
            _ => None,
        }
    }

    pub fn require_numeric(&self, name: &str, context: &'static str) -> Result<&[Option<f64>], PipelineError> {
        match self.column(name).map(|column| &column.data) {
            Some(ColumnData::Numeric(values)) => Ok(values),
            Some(ColumnData::Text(_)) => Err(PipelineError::InvalidColumnType {
                column: name.to_string(),
                context,
            }),
            None => Err(PipelineError::missing_column(name, context)),
        }
    }

    pub fn set_column(&mut self, column: Column) {
        debug_assert_eq!(column.data.len(), self.len());
        match self.columns.iter_mut().find(|existing| existing.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|column| column.name == name)
    }

    pub fn drop_columns(&mut self, names: &[&str]) -> Vec<String> {
        let mut dropped = Vec::new();
        self.columns.retain(|column| {
            let remove = names.contains(&column.name.as_str());
            if remove {
                dropped.push(column.name.clone());
            }
            !remove
        });
        dropped
    }

    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        if self.has_column(to) {
            return false;
        }
        match self.column_mut(from) {
            Some(column) => {
                column.name = to.to_string();
                true
            }
            None => false,
        }
    }

    pub fn select_rows(&self, rows: &[usize]) -> Frame {
        Frame {
            timestamps: rows.iter().map(|idx| self.timestamps[*idx]).collect(),
            columns: self
                .columns
                .iter()
                .map(|column| Column {
                    name: column.name.clone(),
                    data: column.data.select(rows),
                })
                .collect(),
        }
    }

    pub fn row_has_missing(&self, row: usize) -> bool {
        self.columns.iter().any(|column| column.data.is_missing(row))
    }

    pub fn null_count(&self) -> usize {
        self.columns.iter().map(|column| column.data.missing_count()).sum()
    }

    pub fn missing_stats(&self) -> Vec<MissingStat> {
        let total = self.len().max(1) as f64;
        let mut stats: Vec<MissingStat> = self
            .columns
            .iter()
            .map(|column| {
                let missing = column.data.missing_count();
                MissingStat {
                    column: column.name.clone(),
                    missing,
                    percent_missing: ((missing as f64 / total) * 10_000.0).round() / 100.0,
                }
            })
            .collect();
        stats.sort_by(|a, b| b.missing.cmp(&a.missing).then_with(|| a.column.cmp(&b.column)));
        stats
    }

    pub fn categories(&self, name: &str) -> BTreeSet<String> {
        self.text(name)
            .map(|values| values.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, row: usize) -> Option<FrameRow> {
        let timestamp = *self.timestamps.get(row)?;
        let mut numeric = BTreeMap::new();
        let mut categorical = BTreeMap::new();
        let mut missing = Vec::new();

        for column in &self.columns {
            match &column.data {
                ColumnData::Numeric(values) => match values[row] {
                    Some(value) => {
                        numeric.insert(column.name.clone(), value);
                    }
                    None => missing.push(column.name.clone()),
                },
                ColumnData::Text(values) => match &values[row] {
                    Some(value) => {
                        categorical.insert(column.name.clone(), value.clone());
                    }
                    None => missing.push(column.name.clone()),
                },
            }
        }

        Some(FrameRow {
            timestamp,
            numeric,
            categorical,
            missing,
        })
    }

    pub fn last_row(&self) -> Option<FrameRow> {
        self.len().checked_sub(1).and_then(|row| self.row(row))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRow {
    pub timestamp: NaiveDateTime,
    pub numeric: BTreeMap<String, f64>,
    pub categorical: BTreeMap<String, String>,
    pub missing: Vec<String>,
}

const MISSING_MARKERS: [&str; 4] = ["na", "n/a", "null", "none"];

fn is_missing_marker(cell: &str) -> bool {
    MISSING_MARKERS
        .iter()
        .any(|marker| cell.eq_ignore_ascii_case(marker))
}

pub(crate) fn is_missing_cell(cell: &str) -> bool {
    let cell = cell.trim();
    cell.is_empty()
        || is_missing_marker(cell)
        || cell.parse::<f64>().is_ok_and(|value| !value.is_finite())
}

pub fn format_number(value: f64) -> String {
    format!("{value}")
}
