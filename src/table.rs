//! String-level CSV tables used for raw feeds and persisted histories.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use csv::StringRecord;

use crate::error::PipelineError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let mut table = Self::new(headers);
        for row in rows {
            table.push_row(row);
        }
        table
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }

    pub fn cell(&self, row: usize, column: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|cells| cells.get(column))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn column_cells(&self, column: usize) -> impl Iterator<Item = &str> + '_ {
        (0..self.rows.len()).map(move |row| self.cell(row, column))
    }

    pub fn push_row(&mut self, mut row: Vec<String>) {
        row.resize(self.headers.len(), String::new());
        self.rows.push(row);
    }

    pub fn set_cell(&mut self, row: usize, column: usize, value: String) {
        if let Some(cell) = self.rows.get_mut(row).and_then(|cells| cells.get_mut(column)) {
            *cell = value;
        }
    }

    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        match self.column_index(from) {
            Some(idx) => {
                self.headers[idx] = to.to_string();
                true
            }
            None => false,
        }
    }

    pub fn append(&mut self, other: &RawTable) {
        for header in &other.headers {
            if self.column_index(header).is_none() {
                self.headers.push(header.clone());
                for row in &mut self.rows {
                    row.push(String::new());
                }
            }
        }

        let mapping: Vec<usize> = other
            .headers
            .iter()
            .filter_map(|header| self.column_index(header))
            .collect();

        for other_row in &other.rows {
            let mut row = vec![String::new(); self.headers.len()];
            for (src, dst) in mapping.iter().enumerate() {
                if let Some(value) = other_row.get(src) {
                    row[*dst] = value.clone();
                }
            }
            self.rows.push(row);
        }
    }

    pub fn reorder(&mut self, order: &[usize]) {
        let mut taken: Vec<Option<Vec<String>>> = self.rows.drain(..).map(Some).collect();
        self.rows = order
            .iter()
            .filter_map(|idx| taken.get_mut(*idx).and_then(Option::take))
            .collect();
    }

    pub fn read_csv(path: &Path) -> Result<Self, PipelineError> {
        if !path.exists() {
            return Err(PipelineError::MissingData {
                path: path.to_path_buf(),
            });
        }
        let file = fs::File::open(path)?;
        Ok(Self::from_reader(file)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(reader);
        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|header| header.trim().to_string())
            .collect();

        let mut table = Self::new(headers);
        for record in reader.records() {
            let record: StringRecord = record?;
            table.push_row(record.iter().map(str::to_string).collect());
        }
        Ok(table)
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer
            .into_inner()
            .map_err(|err| PipelineError::Io(err.into_error()))
    }

    pub fn write_csv_atomic(&self, path: &Path) -> Result<(), PipelineError> {
        let bytes = self.to_csv_bytes()?;
        write_atomic(path, &bytes)
    }
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| PipelineError::MissingData {
            path: path.to_path_buf(),
        })?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}
