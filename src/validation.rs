//! Schema, target and timestamp-grid checks run before anything is encoded.

use tracing::info;

use crate::error::{ClientError, Result};
use crate::frame::{group_indptr, Column, Table};
use crate::freq::{self, Freq, TimeValue};

const GRID_MISMATCH: &str = "Series contain missing or duplicate timestamps, or the timestamps \
do not match the provided frequency.\nPlease make sure that all series have a single observation \
from the first to the last timestamp and that the provided frequency matches the timestamps'.";

/// Names of the identifier, time and target columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelColumns {
    pub id_col: String,
    pub time_col: String,
    pub target_col: String,
}

impl Default for PanelColumns {
    fn default() -> Self {
        Self {
            id_col: "unique_id".to_string(),
            time_col: "ds".to_string(),
            target_col: "y".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidatedPanel<T> {
    pub df: T,
    pub futr_df: Option<T>,
    pub freq: Freq,
    /// The id column was synthesised and must be dropped from outputs.
    pub drop_id: bool,
}

pub fn validate_panel<T: Table>(
    mut df: T,
    mut futr_df: Option<T>,
    freq: Option<Freq>,
    cols: &PanelColumns,
) -> Result<ValidatedPanel<T>> {
    let drop_id = !df.has_column(&cols.id_col);
    if drop_id {
        let rows = df.num_rows();
        df.assign(&cols.id_col, Column::filled_int(0, rows))?;
        if let Some(futr) = futr_df.as_mut() {
            let rows = futr.num_rows();
            futr.assign(&cols.id_col, Column::filled_int(0, rows))?;
        }
    }
    if df.num_rows() == 0 {
        return Err(ClientError::validation("df must contain at least one row"));
    }

    let times = df.require_column(&cols.time_col)?;
    if !matches!(times.as_ref(), Column::Int(_) | Column::Datetime(_)) {
        return Err(ClientError::validation(format!(
            "The time column ('{}') should be either timestamps or integers, got '{}'.",
            cols.time_col,
            times.dtype()
        )));
    }
    let target = df.require_column(&cols.target_col)?;
    if !target.is_numeric() {
        return Err(ClientError::validation(format!(
            "The target column ('{}') should have a numeric data type, got '{}'.",
            cols.target_col,
            target.dtype()
        )));
    }
    if target.has_missing() {
        return Err(ClientError::validation(format!(
            "Target column ({}) cannot contain missing values.",
            cols.target_col
        )));
    }

    let ids = df.require_column(&cols.id_col)?;
    let order = df
        .sort_indices(&cols.id_col, &cols.time_col)?
        .unwrap_or_else(|| (0..df.num_rows()).collect());
    let indptr = group_indptr(&ids, &order);
    let series_times = |i: usize| -> Result<Vec<TimeValue>> {
        order[indptr[i]..indptr[i + 1]]
            .iter()
            .map(|&row| TimeValue::from_column(&times, row))
            .collect()
    };

    let freq = match freq {
        Some(freq) => freq,
        None => {
            let longest = (0..indptr.len() - 1)
                .max_by(|&a, &b| {
                    let len = |i: usize| indptr[i + 1] - indptr[i];
                    len(a).cmp(&len(b)).then(b.cmp(&a))
                })
                .unwrap_or(0);
            let inferred = freq::infer(&series_times(longest)?)?;
            info!(freq = %inferred, "Inferred freq");
            inferred
        }
    };

    for i in 0..indptr.len() - 1 {
        let stamps = series_times(i)?;
        if stamps.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ClientError::validation(GRID_MISMATCH));
        }
        let (Some(first), Some(last)) = (stamps.first(), stamps.last()) else {
            continue;
        };
        let ok = match &freq {
            Freq::Offset(_) => freq.shift(first, stamps.len() as i64 - 1)? == *last,
            Freq::Step(_) | Freq::Alias { .. } => freq.grid_len(first, last)? == stamps.len(),
        };
        if !ok {
            return Err(ClientError::validation(GRID_MISMATCH));
        }
    }
    drop((ids, times, target));

    Ok(ValidatedPanel {
        df,
        futr_df,
        freq,
        drop_id,
    })
}
