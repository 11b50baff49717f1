//! Cross-feed merger: exact-timestamp inner join of two cleaned feeds.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::frame::Frame;

/// A `right` column whose name already exists on the left is skipped.
pub fn inner_join(left: &Frame, right: &Frame) -> Result<Frame, PipelineError> {
    let left_rows = sorted_unique_rows(left);
    let right_index: HashMap<NaiveDateTime, usize> = sorted_unique_rows(right)
        .into_iter()
        .map(|row| (right.timestamps()[row], row))
        .collect();

    let mut left_keep = Vec::new();
    let mut right_keep = Vec::new();
    for row in left_rows {
        if let Some(right_row) = right_index.get(&left.timestamps()[row]) {
            left_keep.push(row);
            right_keep.push(*right_row);
        }
    }

    if left_keep.is_empty() {
        warn!(
            component = "merge",
            event = "merge.empty_join",
            left_rows = left.len(),
            right_rows = right.len()
        );
        return Err(PipelineError::EmptyJoin {
            left_rows: left.len(),
            right_rows: right.len(),
        });
    }

    let mut merged = left.select_rows(&left_keep);
    let right_selected = right.select_rows(&right_keep);
    for column in right_selected.columns() {
        if merged.has_column(&column.name) {
            warn!(
                component = "merge",
                event = "merge.column_collision",
                column = %column.name
            );
            continue;
        }
        merged.set_column(column.clone());
    }

    info!(
        component = "merge",
        event = "merge.finish",
        left_rows = left.len(),
        right_rows = right.len(),
        merged_rows = merged.len(),
        columns = merged.columns().len()
    );

    Ok(merged)
}

fn sorted_unique_rows(frame: &Frame) -> Vec<usize> {
    let timestamps = frame.timestamps();
    let mut order: Vec<usize> = (0..frame.len()).collect();
    order.sort_by_key(|row| timestamps[*row]);
    order.dedup_by_key(|row| timestamps[*row]);
    order
}
