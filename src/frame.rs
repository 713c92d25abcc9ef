//! Minimal columnar table used by the request/response pipeline.
//!
//! The pipeline only talks to tables through the [`Table`] trait so other
//! tabular backends can be plugged in by implementing it; [`Frame`] is the
//! in-crate backend.

use chrono::NaiveDateTime;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::path::Path;

use crate::error::{ClientError, Result};

const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Bool(Vec<bool>),
    Str(Vec<String>),
    Datetime(Vec<NaiveDateTime>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Int(v) => v.len(),
            Column::Float(v) => v.len(),
            Column::Bool(v) => v.len(),
            Column::Str(v) => v.len(),
            Column::Datetime(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> &'static str {
        match self {
            Column::Int(_) => "int",
            Column::Float(_) => "float",
            Column::Bool(_) => "bool",
            Column::Str(_) => "str",
            Column::Datetime(_) => "datetime",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Column::Int(_) | Column::Float(_) | Column::Bool(_))
    }

    /// Numeric view of the column; `None` for strings and timestamps.
    pub fn to_f64(&self) -> Option<Vec<f64>> {
        match self {
            Column::Int(v) => Some(v.iter().map(|x| *x as f64).collect()),
            Column::Float(v) => Some(v.clone()),
            Column::Bool(v) => Some(v.iter().map(|x| if *x { 1.0 } else { 0.0 }).collect()),
            Column::Str(_) | Column::Datetime(_) => None,
        }
    }

    pub fn has_missing(&self) -> bool {
        match self {
            Column::Float(v) => v.iter().any(|x| x.is_nan()),
            _ => false,
        }
    }

    pub fn take(&self, idxs: &[usize]) -> Column {
        fn pick<T: Clone>(values: &[T], idxs: &[usize]) -> Vec<T> {
            idxs.iter().map(|&i| values[i].clone()).collect()
        }
        match self {
            Column::Int(v) => Column::Int(pick(v, idxs)),
            Column::Float(v) => Column::Float(pick(v, idxs)),
            Column::Bool(v) => Column::Bool(pick(v, idxs)),
            Column::Str(v) => Column::Str(pick(v, idxs)),
            Column::Datetime(v) => Column::Datetime(pick(v, idxs)),
        }
    }

    pub fn slice(&self, start: usize, end: usize) -> Column {
        match self {
            Column::Int(v) => Column::Int(v[start..end].to_vec()),
            Column::Float(v) => Column::Float(v[start..end].to_vec()),
            Column::Bool(v) => Column::Bool(v[start..end].to_vec()),
            Column::Str(v) => Column::Str(v[start..end].to_vec()),
            Column::Datetime(v) => Column::Datetime(v[start..end].to_vec()),
        }
    }

    /// Repeats element `i` `counts[i]` times.
    pub fn repeat(&self, counts: &[usize]) -> Column {
        let idxs: Vec<usize> = counts
            .iter()
            .enumerate()
            .flat_map(|(i, &n)| std::iter::repeat(i).take(n))
            .collect();
        self.take(&idxs)
    }

    /// Constant integer column, used for synthetic series ids.
    pub fn filled_int(value: i64, len: usize) -> Column {
        Column::Int(vec![value; len])
    }

    pub fn concat(parts: &[&Column]) -> Result<Column> {
        let Some(first) = parts.first() else {
            return Err(ClientError::validation("cannot concatenate zero columns"));
        };
        macro_rules! gather {
            ($variant:ident) => {{
                let mut out = Vec::new();
                for part in parts {
                    match part {
                        Column::$variant(v) => out.extend_from_slice(v),
                        other => {
                            return Err(ClientError::validation(format!(
                                "cannot concatenate {} column with {} column",
                                first.dtype(),
                                other.dtype()
                            )))
                        }
                    }
                }
                Column::$variant(out)
            }};
        }
        Ok(match first {
            Column::Int(_) => gather!(Int),
            Column::Float(_) => gather!(Float),
            Column::Bool(_) => gather!(Bool),
            Column::Str(_) => gather!(Str),
            Column::Datetime(_) => gather!(Datetime),
        })
    }

    /// Total order between two rows of the same column. Floats order NaN last.
    pub fn cmp_rows(&self, a: usize, b: usize) -> Ordering {
        match self {
            Column::Int(v) => v[a].cmp(&v[b]),
            Column::Float(v) => v[a].total_cmp(&v[b]),
            Column::Bool(v) => v[a].cmp(&v[b]),
            Column::Str(v) => v[a].cmp(&v[b]),
            Column::Datetime(v) => v[a].cmp(&v[b]),
        }
    }

    pub fn display_value(&self, row: usize) -> String {
        match self {
            Column::Int(v) => v[row].to_string(),
            Column::Float(v) if v[row].is_nan() => String::new(),
            Column::Float(v) => v[row].to_string(),
            Column::Bool(v) => v[row].to_string(),
            Column::Str(v) => v[row].clone(),
            Column::Datetime(v) => {
                let ts = v[row];
                if ts.time() == chrono::NaiveTime::MIN {
                    ts.format("%Y-%m-%d").to_string()
                } else {
                    ts.format("%Y-%m-%d %H:%M:%S").to_string()
                }
            }
        }
    }
}

/// Offsets of the runs of equal ids when rows are visited in `order`.
pub fn group_indptr(ids: &Column, order: &[usize]) -> Vec<usize> {
    let mut indptr = vec![0];
    for pos in 1..order.len() {
        if ids.cmp_rows(order[pos - 1], order[pos]) != Ordering::Equal {
            indptr.push(pos);
        }
    }
    if !order.is_empty() {
        indptr.push(order.len());
    }
    indptr
}

/// Capability interface the pipeline needs from a tabular backend.
pub trait Table: Sized {
    fn num_rows(&self) -> usize;

    fn column_names(&self) -> Vec<String>;

    fn column(&self, name: &str) -> Option<Cow<'_, Column>>;

    fn from_columns(columns: Vec<(String, Column)>) -> Result<Self>;

    /// Adds or replaces a column.
    fn assign(&mut self, name: &str, column: Column) -> Result<()>;

    fn drop_column(&mut self, name: &str);

    fn select(&self, names: &[&str]) -> Result<Self>;

    fn take_rows(&self, idxs: &[usize]) -> Self;

    fn vertical_concat(frames: Vec<Self>) -> Result<Self>;

    fn horizontal_concat(self, other: Self) -> Result<Self>;

    fn has_column(&self, name: &str) -> bool {
        self.column_names().iter().any(|c| c == name)
    }

    fn require_column(&self, name: &str) -> Result<Cow<'_, Column>> {
        self.column(name)
            .ok_or_else(|| ClientError::validation(format!("missing column: {name}")))
    }

    /// Stable permutation sorting rows by `(id, time)`, `None` if already sorted.
    fn sort_indices(&self, id_col: &str, time_col: &str) -> Result<Option<Vec<usize>>> {
        let ids = self.require_column(id_col)?;
        let times = self.require_column(time_col)?;
        let cmp = |a: usize, b: usize| {
            ids.cmp_rows(a, b)
                .then_with(|| times.cmp_rows(a, b))
        };
        let n = self.num_rows();
        if (1..n).all(|i| cmp(i - 1, i) != Ordering::Greater) {
            return Ok(None);
        }
        let mut idxs: Vec<usize> = (0..n).collect();
        idxs.sort_by(|&a, &b| cmp(a, b));
        Ok(Some(idxs))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    names: Vec<String>,
    columns: Vec<Column>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|pos| &self.columns[pos])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.names.iter().map(String::as_str).zip(self.columns.iter())
    }

    /// Reads a panel CSV: `id_col` stays textual, `time_col` is parsed as
    /// integers or timestamps and every other column as floats when it can be.
    pub fn read_csv(path: &Path, id_col: &str, time_col: &str) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .map_err(|err| ClientError::validation(format!("failed to open {}: {err}", path.display())))?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(|err| ClientError::validation(format!("invalid csv header: {err}")))?
            .iter()
            .map(str::to_string)
            .collect();
        let mut raw: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
        for record in reader.records() {
            let record =
                record.map_err(|err| ClientError::validation(format!("invalid csv row: {err}")))?;
            for (i, cell) in record.iter().enumerate().take(headers.len()) {
                raw[i].push(cell.trim().to_string());
            }
        }

        let mut columns = Vec::with_capacity(headers.len());
        for (name, cells) in headers.into_iter().zip(raw) {
            let column = if name == id_col {
                Column::Str(cells)
            } else if name == time_col {
                parse_time_cells(&name, &cells)?
            } else if let Some(values) = parse_float_cells(&cells) {
                values
            } else {
                Column::Str(cells)
            };
            columns.push((name, column));
        }
        Self::from_columns(columns)
    }

    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> Result<()> {
        let mut out = csv::Writer::from_writer(writer);
        let to_err = |err: csv::Error| ClientError::configuration(format!("failed to write csv: {err}"));
        out.write_record(&self.names).map_err(to_err)?;
        for row in 0..self.num_rows() {
            let record: Vec<String> = self.columns.iter().map(|c| c.display_value(row)).collect();
            out.write_record(&record).map_err(to_err)?;
        }
        out.flush()
            .map_err(|err| ClientError::configuration(format!("failed to write csv: {err}")))?;
        Ok(())
    }
}

fn parse_float_cells(cells: &[String]) -> Option<Column> {
    let mut values = Vec::with_capacity(cells.len());
    for cell in cells {
        if cell.is_empty() || cell.eq_ignore_ascii_case("nan") {
            values.push(f64::NAN);
        } else {
            values.push(cell.parse::<f64>().ok()?);
        }
    }
    Some(Column::Float(values))
}

fn parse_time_cells(name: &str, cells: &[String]) -> Result<Column> {
    if let Ok(ints) = cells.iter().map(|c| c.parse::<i64>()).collect::<std::result::Result<Vec<_>, _>>() {
        return Ok(Column::Int(ints));
    }
    let mut out = Vec::with_capacity(cells.len());
    for cell in cells {
        out.push(parse_datetime(cell).ok_or_else(|| {
            ClientError::validation(format!("column {name} has unparseable timestamp: {cell}"))
        })?);
    }
    Ok(Column::Datetime(out))
}

pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date.and_time(chrono::NaiveTime::MIN));
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

impl Table for Frame {
    fn num_rows(&self) -> usize {
        self.columns.first().map(Column::len).unwrap_or(0)
    }

    fn column_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn column(&self, name: &str) -> Option<Cow<'_, Column>> {
        self.get(name).map(Cow::Borrowed)
    }

    fn from_columns(columns: Vec<(String, Column)>) -> Result<Self> {
        let mut frame = Frame::new();
        for (name, column) in columns {
            frame.assign(&name, column)?;
        }
        Ok(frame)
    }

    fn assign(&mut self, name: &str, column: Column) -> Result<()> {
        if !self.columns.is_empty() && column.len() != self.num_rows() {
            return Err(ClientError::validation(format!(
                "column {name} has {} rows, expected {}",
                column.len(),
                self.num_rows()
            )));
        }
        match self.names.iter().position(|n| n == name) {
            Some(pos) => self.columns[pos] = column,
            None => {
                self.names.push(name.to_string());
                self.columns.push(column);
            }
        }
        Ok(())
    }

    fn drop_column(&mut self, name: &str) {
        if let Some(pos) = self.names.iter().position(|n| n == name) {
            self.names.remove(pos);
            self.columns.remove(pos);
        }
    }

    fn select(&self, names: &[&str]) -> Result<Self> {
        let mut out = Frame::new();
        for name in names {
            let column = self
                .get(name)
                .ok_or_else(|| ClientError::validation(format!("missing column: {name}")))?;
            out.assign(name, column.clone())?;
        }
        Ok(out)
    }

    fn take_rows(&self, idxs: &[usize]) -> Self {
        Frame {
            names: self.names.clone(),
            columns: self.columns.iter().map(|c| c.take(idxs)).collect(),
        }
    }

    fn vertical_concat(frames: Vec<Self>) -> Result<Self> {
        let Some(first) = frames.first() else {
            return Ok(Frame::new());
        };
        let names = first.names.clone();
        let mut columns = Vec::with_capacity(names.len());
        for name in &names {
            let parts = frames
                .iter()
                .map(|f| {
                    f.get(name).ok_or_else(|| {
                        ClientError::validation(format!("missing column in concat: {name}"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            columns.push(Column::concat(&parts)?);
        }
        Ok(Frame { names, columns })
    }

    fn horizontal_concat(mut self, other: Self) -> Result<Self> {
        for (name, column) in other.names.into_iter().zip(other.columns) {
            self.assign(&name, column)?;
        }
        Ok(self)
    }
}
