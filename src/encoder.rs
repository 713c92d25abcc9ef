//! Ragged-array encoding of multi-series panels.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::error::{ClientError, Result};
use crate::frame::{group_indptr, Column, Table};
use crate::validation::PanelColumns;

/// Flat per-series buffers plus offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct RaggedArray {
    /// Series identifiers in encoded order.
    pub uids: Column,
    /// Column-major values. Column 0 is the target when the array was built
    /// with one; the rest are features in table order.
    pub data: Vec<Vec<f64>>,
    pub indptr: Vec<usize>,
    pub last_times: Column,
    /// Permutation from caller row order to encoded order; `None` if the
    /// input was already sorted by (id, time).
    pub sort_idxs: Option<Vec<usize>>,
}

impl RaggedArray {
    /// Encodes `df`, placing `target_col` first when given and every other
    /// non id/time column after it.
    pub fn from_table<T: Table>(
        df: &T,
        id_col: &str,
        time_col: &str,
        target_col: Option<&str>,
    ) -> Result<Self> {
        let ids = df.require_column(id_col)?;
        let times = df.require_column(time_col)?;
        let sort_idxs = df.sort_indices(id_col, time_col)?;
        let order: Vec<usize> = match &sort_idxs {
            Some(idxs) => idxs.clone(),
            None => (0..df.num_rows()).collect(),
        };
        let indptr = group_indptr(&ids, &order);

        let mut value_cols: Vec<String> = Vec::new();
        if let Some(target) = target_col {
            value_cols.push(target.to_string());
        }
        value_cols.extend(
            df.column_names()
                .into_iter()
                .filter(|c| c != id_col && c != time_col && Some(c.as_str()) != target_col),
        );

        let mut data = Vec::with_capacity(value_cols.len());
        for name in &value_cols {
            let column = df.require_column(name)?;
            let values = column.to_f64().ok_or_else(|| {
                ClientError::validation(format!(
                    "column {name} must be numeric, got {}",
                    column.dtype()
                ))
            })?;
            data.push(order.iter().map(|&row| values[row]).collect());
        }

        let firsts: Vec<usize> = indptr[..indptr.len() - 1].iter().map(|&p| order[p]).collect();
        let lasts: Vec<usize> = indptr[1..].iter().map(|&p| order[p - 1]).collect();
        Ok(Self {
            uids: ids.take(&firsts),
            data,
            last_times: times.take(&lasts),
            indptr,
            sort_idxs,
        })
    }

    pub fn n_series(&self) -> usize {
        self.indptr.len() - 1
    }

    pub fn n_rows(&self) -> usize {
        self.indptr.last().copied().unwrap_or(0)
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.indptr.windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn target(&self) -> &[f64] {
        self.data.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Feature columns after the target.
    pub fn features(&self) -> &[Vec<f64>] {
        self.data.get(1..).unwrap_or(&[])
    }

    pub fn series(&self, i: usize) -> &[f64] {
        &self.target()[self.indptr[i]..self.indptr[i + 1]]
    }

    /// Keeps at most the last `n` rows of every series.
    pub fn tail(&self, n: usize) -> Result<Self> {
        let new_sizes: Vec<usize> = self.sizes().into_iter().map(|s| s.min(n)).collect();
        let idxs = tail_indices(&self.indptr, &new_sizes)?;
        let data = self
            .data
            .iter()
            .map(|col| idxs.iter().map(|&i| col[i]).collect())
            .collect();
        Ok(Self {
            uids: self.uids.clone(),
            data,
            indptr: indptr_from_sizes(&new_sizes),
            last_times: self.last_times.clone(),
            sort_idxs: None,
        })
    }
}

pub fn indptr_from_sizes(sizes: &[usize]) -> Vec<usize> {
    let mut indptr = Vec::with_capacity(sizes.len() + 1);
    indptr.push(0);
    let mut total = 0;
    for size in sizes {
        total += size;
        indptr.push(total);
    }
    indptr
}

/// Positions of the last `out_sizes[i]` rows of every series.
pub fn tail_indices(indptr: &[usize], out_sizes: &[usize]) -> Result<Vec<usize>> {
    if out_sizes.len() + 1 != indptr.len() {
        return Err(ClientError::validation(format!(
            "expected {} series sizes, got {}",
            indptr.len().saturating_sub(1),
            out_sizes.len()
        )));
    }
    let mut idxs = Vec::with_capacity(out_sizes.iter().sum());
    for (bounds, &size) in indptr.windows(2).zip(out_sizes) {
        if size > bounds[1] - bounds[0] {
            return Err(ClientError::validation(
                "out_sizes must be at most the original sizes.",
            ));
        }
        idxs.extend(bounds[1] - size..bounds[1]);
    }
    Ok(idxs)
}

pub fn array_tails<T: Clone>(x: &[T], indptr: &[usize], out_sizes: &[usize]) -> Result<Vec<T>> {
    Ok(tail_indices(indptr, out_sizes)?
        .into_iter()
        .map(|i| x[i].clone())
        .collect())
}

/// Splits the non id/time/target columns into historical and future
/// covariates and returns both tables restricted to the declared features,
/// ordered `[id, time, target, future..., historical...]`.
pub fn select_exogenous<T: Table>(
    df: &T,
    futr_df: Option<&T>,
    cols: &PanelColumns,
    hist_exog: &[String],
) -> Result<(T, Option<T>)> {
    let base: HashSet<&str> = [
        cols.id_col.as_str(),
        cols.time_col.as_str(),
        cols.target_col.as_str(),
    ]
    .into_iter()
    .collect();
    let exogs: Vec<String> = df
        .column_names()
        .into_iter()
        .filter(|c| !base.contains(c.as_str()))
        .collect();

    let Some(futr_df) = futr_df else {
        let ignored: Vec<&String> = exogs.iter().filter(|c| !hist_exog.contains(c)).collect();
        if !ignored.is_empty() {
            warn!(
                features = ?ignored,
                "df contains exogenous features that were not provided in X_df nor declared \
                 in hist_exog_list, they will be ignored"
            );
        }
        let mut keep = vec![
            cols.id_col.as_str(),
            cols.time_col.as_str(),
            cols.target_col.as_str(),
        ];
        keep.extend(exogs.iter().filter(|c| hist_exog.contains(c)).map(String::as_str));
        return Ok((df.select(&keep)?, None));
    };

    let mut futr_exog: Vec<String> = futr_df
        .column_names()
        .into_iter()
        .filter(|c| !base.contains(c.as_str()))
        .collect();
    let ignored: Vec<&String> = exogs
        .iter()
        .filter(|c| !hist_exog.contains(c) && !futr_exog.contains(c))
        .collect();
    if !ignored.is_empty() {
        warn!(
            features = ?ignored,
            "df contains exogenous features that were not found in X_df nor declared in \
             hist_exog_list, they will be ignored"
        );
    }

    let missing_futr: Vec<&String> = futr_exog.iter().filter(|c| !exogs.contains(c)).collect();
    if !missing_futr.is_empty() {
        return Err(ClientError::validation(format!(
            "The following exogenous features are present in X_df but not in df: {missing_futr:?}."
        )));
    }

    let futr_and_hist: Vec<&String> = futr_exog.iter().filter(|c| hist_exog.contains(c)).collect();
    if !futr_and_hist.is_empty() {
        warn!(
            features = ?futr_and_hist,
            "features declared as historic were found in X_df, they will be considered as historic"
        );
        futr_exog.retain(|c| !hist_exog.contains(c));
    }

    let mut df_cols = vec![
        cols.id_col.as_str(),
        cols.time_col.as_str(),
        cols.target_col.as_str(),
    ];
    df_cols.extend(futr_exog.iter().map(String::as_str));
    df_cols.extend(hist_exog.iter().map(String::as_str));
    let mut futr_cols = vec![cols.id_col.as_str(), cols.time_col.as_str()];
    futr_cols.extend(futr_exog.iter().map(String::as_str));
    Ok((df.select(&df_cols)?, Some(futr_df.select(&futr_cols)?)))
}

/// Encoder output for one call.
#[derive(Debug, Clone)]
pub struct EncodedPanel {
    pub ragged: RaggedArray,
    /// `(n_future_features, n_series * h)`.
    pub x_future: Option<Vec<Vec<f64>>>,
    /// Feature names matching `ragged.features()`.
    pub x_cols: Vec<String>,
    pub futr_cols: Option<Vec<String>>,
}

pub fn encode<T: Table>(
    df: &T,
    futr_df: Option<&T>,
    h: usize,
    cols: &PanelColumns,
) -> Result<EncodedPanel> {
    let ragged = RaggedArray::from_table(df, &cols.id_col, &cols.time_col, Some(&cols.target_col))?;
    let x_cols: Vec<String> = df
        .column_names()
        .into_iter()
        .filter(|c| c != &cols.id_col && c != &cols.time_col && c != &cols.target_col)
        .collect();

    let (x_future, futr_cols) = match futr_df {
        Some(futr) if futr.column_names().len() > 2 => {
            let processed = RaggedArray::from_table(futr, &cols.id_col, &cols.time_col, None)?;
            if processed.uids != ragged.uids {
                return Err(ClientError::validation(
                    "X_df must contain the same series as df, in the same order",
                ));
            }
            if processed.sizes().iter().any(|&size| size != h) {
                return Err(ClientError::validation(format!(
                    "X_df must contain exactly h={h} rows for every series"
                )));
            }
            let names = futr
                .column_names()
                .into_iter()
                .filter(|c| c != &cols.id_col && c != &cols.time_col)
                .collect();
            (Some(processed.data), Some(names))
        }
        _ => (None, None),
    };

    Ok(EncodedPanel {
        ragged,
        x_future,
        x_cols,
        futr_cols,
    })
}

/// Feature matrix ordered `[future, historical]` plus the positions of the
/// historical rows, when `hist_exog_list` is given.
pub fn order_features(
    features: &[Vec<f64>],
    x_cols: &[String],
    hist_exog_list: Option<&[String]>,
) -> Result<(Option<Vec<Vec<f64>>>, Option<Vec<usize>>)> {
    if features.is_empty() {
        return Ok((None, None));
    }
    let Some(hist) = hist_exog_list else {
        info!(features = ?x_cols, "Using future exogenous features");
        return Ok((Some(features.to_vec()), None));
    };
    let missing: Vec<&String> = hist.iter().filter(|c| !x_cols.contains(c)).collect();
    if !missing.is_empty() {
        return Err(ClientError::validation(format!(
            "The following exogenous features were declared as historic but were not found in df: {missing:?}."
        )));
    }
    let futr: Vec<&String> = x_cols.iter().filter(|c| !hist.contains(c)).collect();
    let ordered: Vec<&String> = futr.iter().copied().chain(hist.iter()).collect();
    let mut x = Vec::with_capacity(ordered.len());
    for name in &ordered {
        let pos = x_cols.iter().position(|c| c == *name).unwrap_or_default();
        x.push(features[pos].clone());
    }
    let hist_idxs = hist
        .iter()
        .filter_map(|name| ordered.iter().position(|c| *c == name))
        .collect();
    if !futr.is_empty() {
        info!(features = ?futr, "Using future exogenous features");
    }
    if !hist.is_empty() {
        info!(features = ?hist, "Using historical exogenous features");
    }
    Ok((Some(x), Some(hist_idxs)))
}
