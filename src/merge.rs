//! Recombines per-partition responses into one logical response.

use crate::error::{ClientError, Result};
use crate::response::{
    AnomalyResponse, Contributions, CrossValidationResponse, Floats, ForecastResponse,
    HistoricResponse, Intervals, OnlineAnomalyResponse, WeightsX,
};

/// Responses that can be stitched back together in partition order.
pub trait MergeParts: Sized {
    /// `part_rows[i]` is the number of input rows sent in partition `i`.
    fn merge_parts(parts: Vec<Self>, part_rows: &[usize]) -> Result<Self>;
}

fn concat_floats<'a>(parts: impl Iterator<Item = &'a Floats>) -> Floats {
    Floats(parts.flat_map(|p| p.iter().copied()).collect())
}

fn concat_vecs<'a, T: Clone + 'a>(parts: impl Iterator<Item = &'a Vec<T>>) -> Vec<T> {
    parts.flat_map(|p| p.iter().cloned()).collect()
}

fn merge_optional_floats<'a>(
    mut parts: impl Iterator<Item = &'a Option<Floats>>,
    field: &str,
) -> Result<Option<Floats>> {
    let Some(Some(first)) = parts.next() else {
        return Ok(None);
    };
    let mut out = first.0.clone();
    for part in parts {
        let values = part
            .as_ref()
            .ok_or_else(|| ClientError::UnexpectedResponse(format!("{field} missing in partition")))?;
        out.extend_from_slice(values);
    }
    Ok(Some(Floats(out)))
}

fn merge_intervals<'a>(
    mut parts: impl Iterator<Item = &'a Option<Intervals>>,
) -> Result<Option<Intervals>> {
    let Some(Some(first)) = parts.next() else {
        return Ok(None);
    };
    let mut merged = first.clone();
    for part in parts {
        let part = part.as_ref().ok_or_else(|| {
            ClientError::UnexpectedResponse("intervals missing in partition".to_string())
        })?;
        for (key, values) in merged.iter_mut() {
            let more = part.get(key).ok_or_else(|| {
                ClientError::UnexpectedResponse(format!("interval {key} missing in partition"))
            })?;
            values.0.extend_from_slice(more);
        }
    }
    Ok(Some(merged))
}

fn offset_idxs<'a>(parts: impl Iterator<Item = &'a Vec<usize>>, part_rows: &[usize]) -> Vec<usize> {
    let mut offset = 0;
    let mut out = Vec::new();
    for (idxs, rows) in parts.zip(part_rows) {
        out.extend(idxs.iter().map(|i| i + offset));
        offset += rows;
    }
    out
}

fn merge_weights<'a>(mut parts: impl Iterator<Item = &'a Option<WeightsX>>) -> Option<WeightsX> {
    let first = parts.next()?.as_ref()?;
    let mut out = Vec::new();
    for weights in std::iter::once(Some(first)).chain(parts.map(Option::as_ref)).flatten() {
        match weights {
            WeightsX::Single(w) => out.push(w.clone()),
            WeightsX::PerPartition(ws) => out.extend(ws.iter().cloned()),
        }
    }
    Some(WeightsX::PerPartition(out))
}

/// Each feature row is concatenated along the observation axis.
fn merge_contributions<'a>(
    mut parts: impl Iterator<Item = &'a Option<Option<Contributions>>>,
) -> Result<Option<Option<Contributions>>> {
    let first = match parts.next() {
        None | Some(None) => return Ok(None),
        Some(Some(None)) => return Ok(Some(None)),
        Some(Some(Some(first))) => first,
    };
    let mut merged = first.clone();
    for part in parts {
        let Some(Some(rows)) = part else {
            return Err(ClientError::UnexpectedResponse(
                "feature_contributions missing in partition".to_string(),
            ));
        };
        if rows.len() != merged.len() {
            return Err(ClientError::UnexpectedResponse(format!(
                "expected {} feature contribution rows, got {}",
                merged.len(),
                rows.len()
            )));
        }
        for (acc, row) in merged.iter_mut().zip(rows) {
            acc.0.extend_from_slice(row);
        }
    }
    Ok(Some(Some(merged)))
}

impl MergeParts for ForecastResponse {
    fn merge_parts(parts: Vec<Self>, _part_rows: &[usize]) -> Result<Self> {
        Ok(Self {
            mean: concat_floats(parts.iter().map(|p| &p.mean)),
            intervals: merge_intervals(parts.iter().map(|p| &p.intervals))?,
            weights_x: merge_weights(parts.iter().map(|p| &p.weights_x)),
            feature_contributions: merge_contributions(
                parts.iter().map(|p| &p.feature_contributions),
            )?,
        })
    }
}

impl MergeParts for HistoricResponse {
    fn merge_parts(parts: Vec<Self>, _part_rows: &[usize]) -> Result<Self> {
        Ok(Self {
            mean: concat_floats(parts.iter().map(|p| &p.mean)),
            sizes: concat_vecs(parts.iter().map(|p| &p.sizes)),
            intervals: merge_intervals(parts.iter().map(|p| &p.intervals))?,
            weights_x: merge_weights(parts.iter().map(|p| &p.weights_x)),
            feature_contributions: merge_contributions(
                parts.iter().map(|p| &p.feature_contributions),
            )?,
        })
    }
}

impl MergeParts for AnomalyResponse {
    fn merge_parts(parts: Vec<Self>, _part_rows: &[usize]) -> Result<Self> {
        Ok(Self {
            mean: concat_floats(parts.iter().map(|p| &p.mean)),
            sizes: concat_vecs(parts.iter().map(|p| &p.sizes)),
            anomaly: concat_vecs(parts.iter().map(|p| &p.anomaly)),
            anomaly_score: merge_optional_floats(
                parts.iter().map(|p| &p.anomaly_score),
                "anomaly_score",
            )?,
            intervals: merge_intervals(parts.iter().map(|p| &p.intervals))?,
            weights_x: merge_weights(parts.iter().map(|p| &p.weights_x)),
        })
    }
}

impl MergeParts for OnlineAnomalyResponse {
    fn merge_parts(parts: Vec<Self>, part_rows: &[usize]) -> Result<Self> {
        Ok(Self {
            mean: concat_floats(parts.iter().map(|p| &p.mean)),
            sizes: concat_vecs(parts.iter().map(|p| &p.sizes)),
            idxs: offset_idxs(parts.iter().map(|p| &p.idxs), part_rows),
            anomaly: concat_vecs(parts.iter().map(|p| &p.anomaly)),
            anomaly_score: concat_floats(parts.iter().map(|p| &p.anomaly_score)),
            accumulated_anomaly_score: merge_optional_floats(
                parts.iter().map(|p| &p.accumulated_anomaly_score),
                "accumulated_anomaly_score",
            )?,
            intervals: merge_intervals(parts.iter().map(|p| &p.intervals))?,
        })
    }
}

impl MergeParts for CrossValidationResponse {
    fn merge_parts(parts: Vec<Self>, part_rows: &[usize]) -> Result<Self> {
        Ok(Self {
            mean: concat_floats(parts.iter().map(|p| &p.mean)),
            sizes: concat_vecs(parts.iter().map(|p| &p.sizes)),
            idxs: offset_idxs(parts.iter().map(|p| &p.idxs), part_rows),
            intervals: merge_intervals(parts.iter().map(|p| &p.intervals))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn intervals(lo: Vec<f64>, hi: Vec<f64>) -> Option<Intervals> {
        let mut map = BTreeMap::new();
        map.insert("lo-80".to_string(), Floats(lo));
        map.insert("hi-80".to_string(), Floats(hi));
        Some(map)
    }

    #[test]
    fn idxs_are_offset_by_preceding_rows() {
        let parts = vec![
            CrossValidationResponse {
                mean: Floats(vec![1.0, 2.0]),
                sizes: vec![2],
                idxs: vec![3, 4],
                intervals: None,
            },
            CrossValidationResponse {
                mean: Floats(vec![3.0]),
                sizes: vec![1],
                idxs: vec![1],
                intervals: None,
            },
        ];
        let merged = CrossValidationResponse::merge_parts(parts, &[5, 2]).unwrap();
        assert_eq!(merged.idxs, vec![3, 4, 6]);
        assert_eq!(merged.mean, Floats(vec![1.0, 2.0, 3.0]));
        assert_eq!(merged.sizes, vec![2, 1]);
        assert_eq!(merged.intervals, None);
    }

    #[test]
    fn intervals_concatenate_per_key() {
        let parts = vec![
            ForecastResponse {
                mean: Floats(vec![1.0]),
                intervals: intervals(vec![0.0], vec![2.0]),
                ..Default::default()
            },
            ForecastResponse {
                mean: Floats(vec![5.0]),
                intervals: intervals(vec![4.0], vec![6.0]),
                ..Default::default()
            },
        ];
        let merged = ForecastResponse::merge_parts(parts, &[3, 3]).unwrap();
        let merged_intervals = merged.intervals.unwrap();
        assert_eq!(merged_intervals["lo-80"], Floats(vec![0.0, 4.0]));
        assert_eq!(merged_intervals["hi-80"], Floats(vec![2.0, 6.0]));
    }

    #[test]
    fn weights_and_contributions_follow_the_first_part() {
        let parts = vec![
            ForecastResponse {
                mean: Floats(vec![1.0]),
                weights_x: Some(WeightsX::Single(vec![0.5])),
                feature_contributions: Some(Some(vec![Floats(vec![0.1]), Floats(vec![1.0])])),
                ..Default::default()
            },
            ForecastResponse {
                mean: Floats(vec![2.0, 3.0]),
                weights_x: Some(WeightsX::Single(vec![0.25])),
                feature_contributions: Some(Some(vec![
                    Floats(vec![0.2, 0.3]),
                    Floats(vec![2.0, 3.0]),
                ])),
                ..Default::default()
            },
        ];
        let merged = ForecastResponse::merge_parts(parts, &[1, 2]).unwrap();
        assert_eq!(
            merged.weights_x,
            Some(WeightsX::PerPartition(vec![vec![0.5], vec![0.25]]))
        );
        assert_eq!(
            merged.feature_contributions,
            Some(Some(vec![
                Floats(vec![0.1, 0.2, 0.3]),
                Floats(vec![1.0, 2.0, 3.0])
            ]))
        );

        let absent = vec![ForecastResponse::default(), ForecastResponse::default()];
        let merged = ForecastResponse::merge_parts(absent, &[1, 1]).unwrap();
        assert_eq!(merged.weights_x, None);
        assert_eq!(merged.feature_contributions, None);
    }

    #[test]
    fn anomaly_flags_and_scores_concatenate() {
        let part = |flag: bool, score: f64| AnomalyResponse {
            mean: Floats(vec![0.0]),
            sizes: vec![1],
            anomaly: vec![flag],
            anomaly_score: Some(Floats(vec![score])),
            intervals: None,
            weights_x: None,
        };
        let merged =
            AnomalyResponse::merge_parts(vec![part(true, 0.9), part(false, 0.1)], &[4, 4]).unwrap();
        assert_eq!(merged.anomaly, vec![true, false]);
        assert_eq!(merged.anomaly_score, Some(Floats(vec![0.9, 0.1])));
    }
}
