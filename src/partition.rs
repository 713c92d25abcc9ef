//! Splits a request into series-aligned partitions for concurrent dispatch.

use crate::payload::{Matrix, Request, SeriesPayload};

/// Splits `request` into at most `n_partitions` requests of consecutive whole
/// series. Future covariates are laid out in blocks of `h` rows per series.
pub fn partition_series<P: Clone>(
    request: &Request<P>,
    n_partitions: usize,
    h: usize,
) -> Vec<Request<P>> {
    let series = &request.series;
    let n_series = series.n_series();
    if n_series == 0 {
        return vec![request.clone()];
    }
    let n_partitions = n_partitions.clamp(1, n_series);
    let series_per_part = n_series.div_ceil(n_partitions);

    let mut parts = Vec::with_capacity(n_partitions);
    let mut row_start = 0;
    for first in (0..n_series).step_by(series_per_part) {
        let last = (first + series_per_part).min(n_series);
        let sizes = series.sizes[first..last].to_vec();
        let row_end = row_start + sizes.iter().sum::<usize>();
        let slice_rows = |m: &Matrix, start: usize, end: usize| -> Matrix {
            m.iter().map(|row| row[start..end].to_vec()).collect()
        };
        let x_future = if h > 0 {
            series
                .x_future
                .as_ref()
                .map(|inner| inner.as_ref().map(|m| slice_rows(m, first * h, last * h)))
        } else {
            None
        };
        parts.push(Request {
            series: SeriesPayload {
                y: series.y[row_start..row_end].to_vec(),
                sizes,
                x: series.x.as_ref().map(|m| slice_rows(m, row_start, row_end)),
                x_future,
            },
            params: request.params.clone(),
        });
        row_start = row_end;
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(sizes: Vec<usize>, h: usize) -> Request<&'static str> {
        let rows: usize = sizes.iter().sum();
        let n_series = sizes.len();
        Request {
            series: SeriesPayload {
                y: (0..rows).map(|v| v as f64).collect(),
                sizes,
                x: Some(vec![(0..rows).map(|v| -(v as f64)).collect()]),
                x_future: Some(Some(vec![(0..n_series * h).map(|v| v as f64).collect()])),
            },
            params: "params",
        }
    }

    #[test]
    fn parts_concatenate_back_to_the_original() {
        let original = request(vec![3, 1, 2, 4, 2], 2);
        for n in 1..=5 {
            let parts = partition_series(&original, n, 2);
            let y: Vec<f64> = parts.iter().flat_map(|p| p.series.y.clone()).collect();
            let sizes: Vec<usize> = parts.iter().flat_map(|p| p.series.sizes.clone()).collect();
            let x: Vec<f64> = parts
                .iter()
                .flat_map(|p| p.series.x.as_ref().unwrap()[0].clone())
                .collect();
            let futr: Vec<f64> = parts
                .iter()
                .flat_map(|p| p.series.x_future.clone().unwrap().unwrap()[0].clone())
                .collect();
            assert_eq!(y, original.series.y);
            assert_eq!(sizes, original.series.sizes);
            assert_eq!(x, original.series.x.as_ref().unwrap()[0]);
            assert_eq!(futr, original.series.x_future.clone().unwrap().unwrap()[0]);
            assert!(parts.iter().all(|p| p.params == "params"));
        }
    }

    #[test]
    fn chunks_use_ceiling_division_and_clamp() {
        let original = request(vec![1; 5], 1);
        let counts: Vec<usize> = partition_series(&original, 2, 1)
            .iter()
            .map(|p| p.series.n_series())
            .collect();
        assert_eq!(counts, vec![3, 2]);
        assert_eq!(partition_series(&original, 50, 1).len(), 5);
        assert_eq!(partition_series(&original, 0, 1).len(), 1);
    }

    #[test]
    fn zero_horizon_omits_future_covariates() {
        let mut original = request(vec![2, 2], 0);
        original.series.x_future = None;
        for part in partition_series(&original, 2, 0) {
            assert!(part.series.x_future.is_none());
        }
    }
}
