//! Maps flat response arrays back onto tables aligned to series and time.

use std::cmp::Ordering;

use crate::encoder::{tail_indices, RaggedArray};
use crate::error::{ClientError, Result};
use crate::frame::{Column, Table};
use crate::freq::{Freq, TimeValue};
use crate::response::{Contributions, Floats, Intervals, WeightsX};
use crate::validation::PanelColumns;

pub const MODEL_COL: &str = "TimeGPT";
pub const CUTOFF_COL: &str = "cutoff";

/// A forecast-style result and the artifacts returned alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastOutput<T> {
    pub forecast: T,
    /// `(features, weights)` tables, one per partition.
    pub weights_x: Option<Vec<T>>,
    /// `(id, time, TimeGPT, <features>..., base_value)`.
    pub feature_contributions: Option<T>,
}

/// `int(x)` without the float noise of `100 - 200 * q` style arithmetic.
fn snapped_trunc(x: f64) -> i64 {
    ((x * 1e6).round() / 1e6).trunc() as i64
}

/// Validates the level/quantile arguments and returns the levels to request.
pub fn prepare_level_and_quantiles(
    level: Option<Vec<f64>>,
    quantiles: Option<Vec<f64>>,
) -> Result<(Option<Vec<f64>>, Option<Vec<f64>>)> {
    match (level, quantiles) {
        (Some(_), Some(_)) => Err(ClientError::validation(
            "You should provide `level` or `quantiles`, but not both.",
        )),
        (level, None) => Ok((level, None)),
        (None, Some(quantiles)) => {
            if !quantiles.iter().all(|q| *q > 0.0 && *q < 1.0) {
                return Err(ClientError::validation(
                    "`quantiles` should be floats between 0 and 1.",
                ));
            }
            let levels = quantiles
                .iter()
                .map(|q| snapped_trunc(100.0 - 200.0 * q).abs() as f64)
                .collect();
            Ok((Some(levels), Some(quantiles)))
        }
    }
}

fn parse_interval_key(key: &str) -> Option<(bool, f64)> {
    let (side, level) = key.split_once('-')?;
    let level = level.parse::<f64>().ok()?;
    match side {
        "lo" => Some((true, level)),
        "hi" => Some((false, level)),
        _ => None,
    }
}

/// Interval columns ordered lower bounds by descending level, then upper
/// bounds by ascending level.
pub fn interval_columns(intervals: &Intervals) -> Vec<(String, Column)> {
    let mut keys: Vec<&String> = intervals.keys().collect();
    keys.sort_by(|a, b| match (parse_interval_key(a), parse_interval_key(b)) {
        (Some((true, la)), Some((true, lb))) => lb.total_cmp(&la),
        (Some((false, la)), Some((false, lb))) => la.total_cmp(&lb),
        (Some((true, _)), Some((false, _))) => Ordering::Less,
        (Some((false, _)), Some((true, _))) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    });
    keys.into_iter()
        .map(|key| {
            (
                format!("{MODEL_COL}-{key}"),
                Column::Float(intervals[key].0.clone()),
            )
        })
        .collect()
}

pub fn assign_intervals<T: Table>(out: &mut T, intervals: Option<&Intervals>) -> Result<()> {
    let Some(intervals) = intervals else {
        return Ok(());
    };
    for (name, column) in interval_columns(intervals) {
        out.assign(&name, column)?;
    }
    Ok(())
}

/// Replaces interval columns with quantile columns `TimeGPT-q-{percent}`.
pub fn levels_to_quantiles<T: Table>(df: T, quantiles: Option<&[f64]>) -> Result<T> {
    let Some(quantiles) = quantiles else {
        return Ok(df);
    };
    let mut out_cols: Vec<String> = df
        .column_names()
        .into_iter()
        .filter(|c| !c.contains("-lo-") && !c.contains("-hi-"))
        .collect();
    let mut sorted = quantiles.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mut quantile_cols = Vec::with_capacity(sorted.len());
    for q in sorted {
        let source = if q == 0.5 {
            MODEL_COL.to_string()
        } else {
            let lv = snapped_trunc(100.0 - 200.0 * q);
            let side = if lv > 0 { "lo" } else { "hi" };
            format!("{MODEL_COL}-{side}-{}", lv.abs())
        };
        let column = df.require_column(&source)?.into_owned();
        let name = format!("{MODEL_COL}-q-{}", snapped_trunc(q * 100.0));
        quantile_cols.push((name, column));
    }

    let mut df = df;
    for (name, column) in quantile_cols {
        df.assign(&name, column)?;
        if !out_cols.contains(&name) {
            out_cols.push(name);
        }
    }
    let refs: Vec<&str> = out_cols.iter().map(String::as_str).collect();
    df.select(&refs)
}

/// `h` future timestamps per series, in `uids` order.
pub fn future_frame<T: Table>(
    ragged: &RaggedArray,
    freq: &Freq,
    h: usize,
    cols: &PanelColumns,
) -> Result<T> {
    let n_series = ragged.n_series();
    let mut times = Vec::with_capacity(n_series * h);
    for i in 0..n_series {
        let last = TimeValue::from_column(&ragged.last_times, i)?;
        for k in 1..=h {
            times.push(freq.shift(&last, k as i64)?);
        }
    }
    let times = if times.is_empty() {
        ragged.last_times.slice(0, 0)
    } else {
        TimeValue::collect(times)?
    };
    T::from_columns(vec![
        (cols.id_col.clone(), ragged.uids.repeat(&vec![h; n_series])),
        (cols.time_col.clone(), times),
    ])
}

pub fn forecast_frame<T: Table>(
    ragged: &RaggedArray,
    freq: &Freq,
    h: usize,
    mean: &Floats,
    intervals: Option<&Intervals>,
    cols: &PanelColumns,
) -> Result<T> {
    let mut out: T = future_frame(ragged, freq, h, cols)?;
    if mean.len() != out.num_rows() {
        return Err(ClientError::UnexpectedResponse(format!(
            "expected {} forecasts, got {}",
            out.num_rows(),
            mean.len()
        )));
    }
    out.assign(MODEL_COL, Column::Float(mean.0.clone()))?;
    assign_intervals(&mut out, intervals)?;
    Ok(out)
}

/// Time and target columns in encoded row order.
pub fn encoded_times_and_targets<T: Table>(
    df: &T,
    ragged: &RaggedArray,
    cols: &PanelColumns,
) -> Result<(Column, Column)> {
    let times = df.require_column(&cols.time_col)?;
    let targets = df.require_column(&cols.target_col)?;
    Ok(match &ragged.sort_idxs {
        Some(idxs) => (times.take(idxs), targets.take(idxs)),
        None => (times.into_owned(), targets.into_owned()),
    })
}

/// Rows selected by trailing per-series `sizes`, as returned by historic
/// forecasts and anomaly detection.
pub fn in_sample_frame<T: Table>(
    df: &T,
    ragged: &RaggedArray,
    sizes: &[usize],
    mean: &Floats,
    intervals: Option<&Intervals>,
    cols: &PanelColumns,
) -> Result<T> {
    let (times, targets) = encoded_times_and_targets(df, ragged, cols)?;
    let idxs = tail_indices(&ragged.indptr, sizes)?;
    if mean.len() != idxs.len() {
        return Err(ClientError::UnexpectedResponse(format!(
            "expected {} fitted values, got {}",
            idxs.len(),
            mean.len()
        )));
    }
    let mut out = T::from_columns(vec![
        (cols.id_col.clone(), ragged.uids.repeat(sizes)),
        (cols.time_col.clone(), times.take(&idxs)),
        (cols.target_col.clone(), targets.take(&idxs)),
        (MODEL_COL.to_string(), Column::Float(mean.0.clone())),
    ])?;
    assign_intervals(&mut out, intervals)?;
    Ok(out)
}

/// Rows selected by absolute `idxs` into the encoded buffers, as returned by
/// online anomaly detection and cross-validation. With `cutoff_h` set, a
/// `cutoff` column holds the timestamp preceding each window of that size.
#[allow(clippy::too_many_arguments)]
pub fn indexed_frame<T: Table>(
    uids: &Column,
    times: &Column,
    targets: &Column,
    sizes: &[usize],
    idxs: &[usize],
    mean: &Floats,
    cutoff_h: Option<usize>,
    cols: &PanelColumns,
) -> Result<T> {
    if idxs.iter().any(|&i| i >= times.len()) || mean.len() != idxs.len() {
        return Err(ClientError::UnexpectedResponse(
            "response indices do not match the submitted series".to_string(),
        ));
    }
    let mut columns = vec![
        (cols.id_col.clone(), uids.repeat(sizes)),
        (cols.time_col.clone(), times.take(idxs)),
    ];
    if let Some(h) = cutoff_h {
        let h = h.max(1);
        let mut cutoff_idxs = Vec::with_capacity(idxs.len());
        for window_start in (0..idxs.len()).step_by(h) {
            let before = idxs[window_start].checked_sub(1).ok_or_else(|| {
                ClientError::UnexpectedResponse("cross-validation window starts at row 0".to_string())
            })?;
            let window = h.min(idxs.len() - window_start);
            cutoff_idxs.extend(std::iter::repeat(before).take(window));
        }
        columns.push((CUTOFF_COL.to_string(), times.take(&cutoff_idxs)));
    }
    columns.push((cols.target_col.clone(), targets.take(idxs)));
    columns.push((MODEL_COL.to_string(), Column::Float(mean.0.clone())));
    T::from_columns(columns)
}

pub fn weights_tables<T: Table>(weights: Option<&WeightsX>, x_cols: &[String]) -> Result<Option<Vec<T>>> {
    let Some(weights) = weights else {
        return Ok(None);
    };
    let build = |w: &Vec<f64>| -> Result<T> {
        let n = w.len().min(x_cols.len());
        T::from_columns(vec![
            ("features".to_string(), Column::Str(x_cols[..n].to_vec())),
            ("weights".to_string(), Column::Float(w[..n].to_vec())),
        ])
    };
    let tables = match weights {
        WeightsX::Single(w) => vec![build(w)?],
        WeightsX::PerPartition(ws) => ws.iter().map(build).collect::<Result<Vec<_>>>()?,
    };
    Ok(Some(tables))
}

/// Joins `(id, time, TimeGPT)` with per-feature contributions and the base
/// value; in-sample contributions, when given, precede the forecast ones.
pub fn contributions_table<T: Table>(
    base: T,
    x_cols: &[String],
    contributions: &Contributions,
    in_sample: Option<&Contributions>,
) -> Result<T> {
    let names: Vec<String> = x_cols
        .iter()
        .cloned()
        .chain(std::iter::once("base_value".to_string()))
        .collect();
    let mut shap = Vec::with_capacity(names.len());
    for (pos, (name, row)) in names.into_iter().zip(contributions.iter()).enumerate() {
        let values = match in_sample {
            Some(rows) => {
                let prefix = rows.get(pos).ok_or_else(|| {
                    ClientError::UnexpectedResponse(format!(
                        "in-sample feature contributions missing {name}"
                    ))
                })?;
                prefix.iter().chain(row.iter()).copied().collect()
            }
            None => row.0.clone(),
        };
        shap.push((name, Column::Float(values)));
    }
    base.horizontal_concat(T::from_columns(shap)?)
}

/// Re-sorts `out` (and a row-aligned companion) to (id, time) order.
pub fn restore_order<T: Table>(
    out: T,
    companion: Option<T>,
    cols: &PanelColumns,
) -> Result<(T, Option<T>)> {
    match out.sort_indices(&cols.id_col, &cols.time_col)? {
        None => Ok((out, companion)),
        Some(idxs) => {
            let companion = companion.map(|c| c.take_rows(&idxs));
            Ok((out.take_rows(&idxs), companion))
        }
    }
}

/// Stacks frames row-wise over the union of their columns. Columns missing
/// from a frame are filled with NaN; the order follows first appearance.
pub fn stack_filling_nan<T: Table>(frames: Vec<T>) -> Result<T> {
    let mut names: Vec<String> = Vec::new();
    for frame in &frames {
        for name in frame.column_names() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    let order: Vec<&str> = names.iter().map(String::as_str).collect();
    let mut aligned = Vec::with_capacity(frames.len());
    for mut frame in frames {
        let n = frame.num_rows();
        for name in &names {
            if !frame.has_column(name) {
                frame.assign(name, Column::Float(vec![f64::NAN; n]))?;
            }
        }
        aligned.push(frame.select(&order)?);
    }
    T::vertical_concat(aligned)
}

pub fn maybe_drop_id<T: Table>(mut df: T, id_col: &str, drop: bool) -> T {
    if drop {
        df.drop_column(id_col);
    }
    df
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn day(d: u32) -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn ragged() -> RaggedArray {
        RaggedArray {
            uids: Column::Str(vec!["A".into(), "B".into()]),
            data: vec![vec![1.0, 2.0, 3.0, 4.0, 5.0]],
            indptr: vec![0, 3, 5],
            last_times: Column::Datetime(vec![day(3), day(2)]),
            sort_idxs: None,
        }
    }

    fn intervals() -> Intervals {
        let mut map = BTreeMap::new();
        for (key, value) in [("lo-80", 1.0), ("lo-90", 0.5), ("hi-80", 3.0), ("hi-90", 3.5)] {
            map.insert(key.to_string(), Floats(vec![value; 4]));
        }
        map
    }

    #[test]
    fn quantiles_map_to_levels() {
        let (level, q) = prepare_level_and_quantiles(None, Some(vec![0.1, 0.5, 0.95])).unwrap();
        assert_eq!(level, Some(vec![80.0, 0.0, 90.0]));
        assert_eq!(q, Some(vec![0.1, 0.5, 0.95]));
        assert!(prepare_level_and_quantiles(Some(vec![80.0]), Some(vec![0.1])).is_err());
        assert!(prepare_level_and_quantiles(None, Some(vec![1.0])).is_err());
        assert_eq!(snapped_trunc(100.0 - 200.0 * 0.07), 86);
    }

    #[test]
    fn interval_columns_are_lo_descending_then_hi_ascending() {
        let names: Vec<String> = interval_columns(&intervals()).into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["TimeGPT-lo-90", "TimeGPT-lo-80", "TimeGPT-hi-80", "TimeGPT-hi-90"]
        );
    }

    #[test]
    fn forecast_frame_steps_each_series_from_its_last_time() {
        let mean = Floats(vec![10.0, 11.0, 20.0, 21.0]);
        let freq = Freq::parse("D").unwrap();
        let out: Frame =
            forecast_frame(&ragged(), &freq, 2, &mean, Some(&intervals()), &PanelColumns::default())
                .unwrap();
        assert_eq!(
            out.get("unique_id"),
            Some(&Column::Str(vec!["A".into(), "A".into(), "B".into(), "B".into()]))
        );
        assert_eq!(
            out.get("ds"),
            Some(&Column::Datetime(vec![day(4), day(5), day(3), day(4)]))
        );
        assert_eq!(out.column_names()[2], "TimeGPT");
        assert_eq!(out.column_names().len(), 7);
    }

    #[test]
    fn quantile_point_one_equals_level_eighty_lower_bound() {
        let mean = Floats(vec![2.0; 4]);
        let freq = Freq::parse("D").unwrap();
        let out: Frame =
            forecast_frame(&ragged(), &freq, 2, &mean, Some(&intervals()), &PanelColumns::default())
                .unwrap();
        let lo80 = out.get("TimeGPT-lo-80").cloned().unwrap();
        let hi90 = out.get("TimeGPT-hi-90").cloned().unwrap();
        let converted = levels_to_quantiles(out, Some(&[0.95, 0.1, 0.5])).unwrap();
        assert_eq!(
            converted.column_names(),
            vec!["unique_id", "ds", "TimeGPT", "TimeGPT-q-10", "TimeGPT-q-50", "TimeGPT-q-95"]
        );
        assert_eq!(converted.get("TimeGPT-q-10"), Some(&lo80));
        assert_eq!(converted.get("TimeGPT-q-95"), Some(&hi90));
        assert_eq!(converted.get("TimeGPT-q-50"), Some(&Column::Float(vec![2.0; 4])));
    }

    #[test]
    fn in_sample_frame_uses_trailing_rows() {
        let df = Frame::from_columns(vec![
            ("unique_id".into(), Column::Str(vec!["A".into(), "A".into(), "A".into(), "B".into(), "B".into()])),
            ("ds".into(), Column::Datetime(vec![day(1), day(2), day(3), day(1), day(2)])),
            ("y".into(), Column::Float(vec![1.0, 2.0, 3.0, 4.0, 5.0])),
        ])
        .unwrap();
        let out: Frame = in_sample_frame(
            &df,
            &ragged(),
            &[2, 1],
            &Floats(vec![0.2, 0.3, 0.5]),
            None,
            &PanelColumns::default(),
        )
        .unwrap();
        assert_eq!(out.get("y"), Some(&Column::Float(vec![2.0, 3.0, 5.0])));
        assert_eq!(out.get("ds"), Some(&Column::Datetime(vec![day(2), day(3), day(2)])));
    }

    #[test]
    fn indexed_frame_adds_cutoffs_before_each_window() {
        let times = Column::Int(vec![1, 2, 3, 4, 5, 1, 2, 3]);
        let targets = Column::Float(vec![0.0; 8]);
        let uids = Column::Str(vec!["A".into(), "B".into()]);
        let out: Frame = indexed_frame(
            &uids,
            &times,
            &targets,
            &[2, 2],
            &[3, 4, 6, 7],
            &Floats(vec![1.0; 4]),
            Some(2),
            &PanelColumns::default(),
        )
        .unwrap();
        assert_eq!(out.column_names(), vec!["unique_id", "ds", "cutoff", "y", "TimeGPT"]);
        assert_eq!(out.get("cutoff"), Some(&Column::Int(vec![3, 3, 1, 1])));
        assert_eq!(out.get("ds"), Some(&Column::Int(vec![4, 5, 2, 3])));
    }

    #[test]
    fn restore_order_sorts_companion_identically() {
        let out = Frame::from_columns(vec![
            ("unique_id".into(), Column::Str(vec!["A".into(), "B".into(), "A".into()])),
            ("ds".into(), Column::Int(vec![5, 1, 1])),
        ])
        .unwrap();
        let companion = Frame::from_columns(vec![("v".into(), Column::Int(vec![0, 1, 2]))]).unwrap();
        let (out, companion) = restore_order(out, Some(companion), &PanelColumns::default()).unwrap();
        assert_eq!(out.get("ds"), Some(&Column::Int(vec![1, 5, 1])));
        assert_eq!(companion.unwrap().get("v"), Some(&Column::Int(vec![2, 0, 1])));
    }

    #[test]
    fn contributions_prepend_in_sample_rows() {
        let base = Frame::from_columns(vec![("TimeGPT".into(), Column::Float(vec![1.0, 2.0, 3.0]))]).unwrap();
        let x_cols = vec!["x1".to_string()];
        let fcst = vec![Floats(vec![0.3]), Floats(vec![2.7])];
        let insample = vec![Floats(vec![0.1, 0.2]), Floats(vec![0.9, 1.8])];
        let out = contributions_table(base, &x_cols, &fcst, Some(&insample)).unwrap();
        assert_eq!(out.get("x1"), Some(&Column::Float(vec![0.1, 0.2, 0.3])));
        assert_eq!(out.get("base_value"), Some(&Column::Float(vec![0.9, 1.8, 2.7])));
    }

    #[test]
    fn stacking_fills_interval_columns_one_side_lacks() {
        let fitted = Frame::from_columns(vec![
            ("ds".into(), Column::Datetime(vec![day(1), day(2)])),
            (MODEL_COL.into(), Column::Float(vec![1.0, 2.0])),
            ("TimeGPT-lo-80".into(), Column::Float(vec![0.5, 1.5])),
        ])
        .unwrap();
        let fcst = Frame::from_columns(vec![
            ("ds".into(), Column::Datetime(vec![day(3)])),
            (MODEL_COL.into(), Column::Float(vec![3.0])),
            ("TimeGPT-hi-80".into(), Column::Float(vec![3.5])),
        ])
        .unwrap();
        let out = stack_filling_nan(vec![fitted, fcst]).unwrap();
        assert_eq!(out.column_names(), vec!["ds", MODEL_COL, "TimeGPT-lo-80", "TimeGPT-hi-80"]);
        assert_eq!(out.get(MODEL_COL), Some(&Column::Float(vec![1.0, 2.0, 3.0])));
        let Some(Column::Float(lo)) = out.get("TimeGPT-lo-80") else {
            panic!("expected float lower bound");
        };
        assert_eq!(&lo[..2], &[0.5, 1.5]);
        assert!(lo[2].is_nan());
        let Some(Column::Float(hi)) = out.get("TimeGPT-hi-80") else {
            panic!("expected float upper bound");
        };
        assert!(hi[0].is_nan() && hi[1].is_nan());
        assert_eq!(hi[2], 3.5);
    }
}
