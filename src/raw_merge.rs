//! Raw Merger: concatenates per-source CSV fragments of one feed into a single
//! table sorted by its timestamp column.

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zip::ZipArchive;

use crate::error::PipelineError;
use crate::table::RawTable;
use crate::timestamp::parse_timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMergeReport {
    pub fragments: usize,
    pub rows: usize,
    pub columns: usize,
    pub null_timestamps: usize,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RawMergeResult {
    pub table: RawTable,
    pub report: RawMergeReport,
}

pub fn list_fragments(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    if !dir.is_dir() {
        return Err(PipelineError::MissingData {
            path: dir.to_path_buf(),
        });
    }

    let mut fragments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let is_fragment = path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_ascii_lowercase();
                ext == "csv" || ext == "zip"
            })
            .unwrap_or(false);
        if is_fragment {
            fragments.push(path);
        }
    }
    fragments.sort();

    if fragments.is_empty() {
        return Err(PipelineError::MissingData {
            path: dir.to_path_buf(),
        });
    }
    Ok(fragments)
}

pub fn read_fragment(path: &Path) -> Result<RawTable, PipelineError> {
    let is_zip = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false);
    if !is_zip {
        return RawTable::read_csv(path);
    }

    let file = fs::File::open(path)?;
    let mut zip = ZipArchive::new(file)?;
    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx)?;
        if entry.is_dir() || !entry.name().to_ascii_lowercase().ends_with(".csv") {
            continue;
        }
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        return Ok(RawTable::from_reader(Cursor::new(buf))?);
    }

    Err(PipelineError::MissingCsvEntry {
        path: path.to_path_buf(),
    })
}

pub fn merge_raw_fragments(
    input_dir: &Path,
    timestamp_column: &str,
    output_path: &Path,
    tz: Tz,
) -> Result<RawMergeResult, PipelineError> {
    let fragments = list_fragments(input_dir)?;
    info!(
        component = "raw_merge",
        event = "raw_merge.start",
        input_dir = %input_dir.display(),
        fragments = fragments.len()
    );

    let mut merged = RawTable::default();
    for path in &fragments {
        let fragment = read_fragment(path)?;
        if fragment.column_index(timestamp_column).is_none() {
            warn!(
                component = "raw_merge",
                event = "raw_merge.fragment.missing_timestamp_column",
                path = %path.display(),
                timestamp_column
            );
        }
        merged.append(&fragment);
    }

    let ts_idx = merged
        .column_index(timestamp_column)
        .ok_or_else(|| PipelineError::missing_column(timestamp_column, "raw merge"))?;

    let parsed: Vec<_> = merged
        .column_cells(ts_idx)
        .map(|cell| parse_timestamp(cell, tz))
        .collect();
    let null_timestamps = parsed.iter().filter(|ts| ts.is_none()).count();

    let mut order: Vec<usize> = (0..merged.len()).collect();
    order.sort_by_key(|idx| (parsed[*idx].is_none(), parsed[*idx]));
    for (row, ts) in parsed.iter().enumerate() {
        if ts.is_none() {
            merged.set_cell(row, ts_idx, String::new());
        }
    }
    merged.reorder(&order);

    merged.write_csv_atomic(output_path)?;

    let report = RawMergeReport {
        fragments: fragments.len(),
        rows: merged.len(),
        columns: merged.headers().len(),
        null_timestamps,
        output_path: output_path.to_path_buf(),
    };

    if null_timestamps > 0 {
        warn!(
            component = "raw_merge",
            event = "raw_merge.null_timestamps",
            count = null_timestamps
        );
    }
    info!(
        component = "raw_merge",
        event = "raw_merge.finish",
        rows = report.rows,
        columns = report.columns,
        output_path = %output_path.display()
    );

    Ok(RawMergeResult {
        table: merged,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Asia::Kathmandu;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entry: &str, body: &str) {
        let file = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file(entry, SimpleFileOptions::default()).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn empty_directory_is_missing_data() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();

        let err = list_fragments(dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::MissingData { .. }));
    }

    #[test]
    fn zip_fragment_without_csv_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.zip");
        write_zip(&path, "readme.txt", "nothing");

        let err = read_fragment(&path).unwrap_err();
        assert!(matches!(err, PipelineError::MissingCsvEntry { .. }));
    }

    #[test]
    fn merges_csv_and_zip_fragments_sorted_with_nulls_last() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("aq");
        fs::create_dir_all(&input).unwrap();
        fs::write(
            input.join("b.csv"),
            "datetimeUtc,value\n2024-01-01T03:00:00Z,30\nbroken,99\n",
        )
        .unwrap();
        write_zip(
            &input.join("a.zip"),
            "a.csv",
            "datetimeUtc,value,unit\n2024-01-01T01:00:00Z,10,ugm3\n",
        );

        let output = dir.path().join("out").join("aq_full.csv");
        let result = merge_raw_fragments(&input, "datetimeUtc", &output, Kathmandu).unwrap();

        assert_eq!(result.report.fragments, 2);
        assert_eq!(result.report.null_timestamps, 1);
        assert_eq!(result.table.headers(), &["datetimeUtc", "value", "unit"]);
        let values: Vec<&str> = result.table.column_cells(1).collect();
        assert_eq!(values, vec!["10", "30", "99"]);
        assert_eq!(result.table.cell(2, 0), "");
        assert!(output.exists());
    }
}
