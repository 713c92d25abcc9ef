//! Timestamp frequencies: integer steps, calendar aliases and structured offsets.

use chrono::{Datelike, Duration as ChronoDuration, Months, NaiveDate, NaiveDateTime, Weekday};
use std::fmt;

use crate::error::{ClientError, Result};
use crate::frame::Column;

/// Frequency sent to the service when the time column holds integers.
const INTEGER_FREQ_ALIAS: &str = "MS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthAnchor {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarUnit {
    Microsecond,
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    BusinessDay,
    Week {
        anchor: Option<Weekday>,
    },
    /// Month-based offsets. `span` is 1 (months), 3 (quarters) or 12 (years);
    /// `phase` is a calendar month the anchor dates align with.
    Month {
        anchor: MonthAnchor,
        span: u32,
        phase: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarOffset {
    pub n: i64,
    pub unit: CalendarUnit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freq {
    /// Arithmetic step for integer time columns.
    Step(i64),
    /// Calendar alias as written by the caller (e.g. `"D"`, `"15min"`, `"MS"`).
    Alias { raw: String, offset: CalendarOffset },
    /// Structured calendar offset.
    Offset(CalendarOffset),
}

impl Freq {
    pub fn parse(raw: &str) -> Result<Self> {
        let offset = CalendarOffset::parse(raw)?;
        Ok(Freq::Alias {
            raw: raw.trim().to_string(),
            offset,
        })
    }

    pub fn calendar(&self) -> Option<&CalendarOffset> {
        match self {
            Freq::Step(_) => None,
            Freq::Alias { offset, .. } | Freq::Offset(offset) => Some(offset),
        }
    }

    /// Frequency string understood by the service.
    pub fn standardize(&self) -> String {
        match self {
            Freq::Alias { raw, .. } => raw.replace("mo", "MS"),
            Freq::Offset(offset) => offset.freqstr(),
            Freq::Step(_) => INTEGER_FREQ_ALIAS.to_string(),
        }
    }

    /// Timestamp `steps` periods after `time`.
    pub fn shift(&self, time: &TimeValue, steps: i64) -> Result<TimeValue> {
        match (self, time) {
            (Freq::Step(step), TimeValue::Int(t)) => step
                .checked_mul(steps)
                .and_then(|delta| t.checked_add(delta))
                .map(TimeValue::Int)
                .ok_or_else(out_of_range),
            (Freq::Alias { offset, .. } | Freq::Offset(offset), TimeValue::Datetime(t)) => {
                Ok(TimeValue::Datetime(offset.advance(*t, steps)?))
            }
            (Freq::Step(_), TimeValue::Datetime(_)) => Err(ClientError::validation(
                "integer frequencies require an integer time column",
            )),
            (_, TimeValue::Int(_)) => Err(ClientError::validation(
                "calendar frequencies require a datetime time column",
            )),
        }
    }

    /// Number of timestamps in the dense grid from `first` to `last` inclusive.
    pub fn grid_len(&self, first: &TimeValue, last: &TimeValue) -> Result<usize> {
        match (self, first, last) {
            (Freq::Step(step), TimeValue::Int(a), TimeValue::Int(b)) => {
                if *step <= 0 {
                    return Err(ClientError::configuration(format!(
                        "integer frequency must be positive, got {step}"
                    )));
                }
                if b < a {
                    return Ok(0);
                }
                Ok(((b - a).div_euclid(*step) + 1) as usize)
            }
            (
                Freq::Alias { offset, .. } | Freq::Offset(offset),
                TimeValue::Datetime(a),
                TimeValue::Datetime(b),
            ) => offset.grid_len(*a, *b),
            _ => Err(ClientError::validation(
                "the frequency type does not match the time column type",
            )),
        }
    }
}

impl fmt::Display for Freq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Freq::Step(step) => write!(f, "{step}"),
            Freq::Alias { raw, .. } => write!(f, "{raw}"),
            Freq::Offset(offset) => write!(f, "{}", offset.freqstr()),
        }
    }
}

/// A single timestamp from either kind of time column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimeValue {
    Int(i64),
    Datetime(NaiveDateTime),
}

impl TimeValue {
    pub fn from_column(column: &Column, row: usize) -> Result<Self> {
        match column {
            Column::Int(v) => Ok(TimeValue::Int(v[row])),
            Column::Datetime(v) => Ok(TimeValue::Datetime(v[row])),
            other => Err(ClientError::validation(format!(
                "time column must hold integers or timestamps, got {}",
                other.dtype()
            ))),
        }
    }

    pub fn collect(values: Vec<TimeValue>) -> Result<Column> {
        if values.iter().all(|v| matches!(v, TimeValue::Int(_))) {
            return Ok(Column::Int(
                values
                    .into_iter()
                    .filter_map(|v| match v {
                        TimeValue::Int(t) => Some(t),
                        TimeValue::Datetime(_) => None,
                    })
                    .collect(),
            ));
        }
        let mut out = Vec::with_capacity(values.len());
        for value in values {
            match value {
                TimeValue::Datetime(t) => out.push(t),
                TimeValue::Int(_) => {
                    return Err(ClientError::validation("mixed integer and datetime timestamps"))
                }
            }
        }
        Ok(Column::Datetime(out))
    }
}

impl CalendarOffset {
    pub fn new(n: i64, unit: CalendarUnit) -> Self {
        Self { n, unit }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let digits_end = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let n = if digits_end == 0 {
            1
        } else {
            trimmed[..digits_end]
                .parse::<i64>()
                .map_err(|_| unsupported_alias(raw))?
        };
        if n <= 0 {
            return Err(unsupported_alias(raw));
        }
        let code = &trimmed[digits_end..];
        let (base, suffix) = match code.split_once('-') {
            Some((base, suffix)) => (base, Some(suffix)),
            None => (code, None),
        };

        let month_unit = |anchor: MonthAnchor, span: u32, default_phase: u32| -> Result<CalendarUnit> {
            let phase = match suffix {
                Some(name) => month_from_abbrev(name).ok_or_else(|| unsupported_alias(raw))?,
                None => default_phase,
            };
            Ok(CalendarUnit::Month { anchor, span, phase })
        };

        let unit = match base {
            "us" | "U" => CalendarUnit::Microsecond,
            "ms" | "L" => CalendarUnit::Millisecond,
            "s" | "S" => CalendarUnit::Second,
            "min" | "T" | "m" => CalendarUnit::Minute,
            "h" | "H" => CalendarUnit::Hour,
            "D" | "d" => CalendarUnit::Day,
            "B" => CalendarUnit::BusinessDay,
            "W" => CalendarUnit::Week {
                anchor: Some(match suffix {
                    Some(day) => weekday_from_abbrev(day).ok_or_else(|| unsupported_alias(raw))?,
                    None => Weekday::Sun,
                }),
            },
            "w" => CalendarUnit::Week { anchor: None },
            "MS" | "mo" => month_unit(MonthAnchor::Start, 1, 1)?,
            "M" | "ME" => month_unit(MonthAnchor::End, 1, 12)?,
            "QS" | "q" => month_unit(MonthAnchor::Start, 3, 1)?,
            "Q" | "QE" => month_unit(MonthAnchor::End, 3, 12)?,
            "YS" | "AS" | "y" => month_unit(MonthAnchor::Start, 12, 1)?,
            "Y" | "A" | "YE" => month_unit(MonthAnchor::End, 12, 12)?,
            _ => return Err(unsupported_alias(raw)),
        };
        Ok(Self { n, unit })
    }

    pub fn freqstr(&self) -> String {
        let code = match self.unit {
            CalendarUnit::Microsecond => "us".to_string(),
            CalendarUnit::Millisecond => "ms".to_string(),
            CalendarUnit::Second => "s".to_string(),
            CalendarUnit::Minute => "min".to_string(),
            CalendarUnit::Hour => "h".to_string(),
            CalendarUnit::Day => "D".to_string(),
            CalendarUnit::BusinessDay => "B".to_string(),
            CalendarUnit::Week { anchor: Some(day) } => format!("W-{}", weekday_abbrev(day)),
            CalendarUnit::Week { anchor: None } => "W".to_string(),
            CalendarUnit::Month { anchor, span, phase } => {
                let base = match (anchor, span) {
                    (MonthAnchor::Start, 1) => return self.with_multiplier("MS"),
                    (MonthAnchor::End, 1) => return self.with_multiplier("ME"),
                    (MonthAnchor::Start, 3) => "QS",
                    (MonthAnchor::End, 3) => "QE",
                    (MonthAnchor::Start, _) => "YS",
                    (MonthAnchor::End, _) => "YE",
                };
                format!("{base}-{}", month_abbrev(phase))
            }
        };
        self.with_multiplier(&code)
    }

    fn with_multiplier(&self, code: &str) -> String {
        if self.n == 1 {
            code.to_string()
        } else {
            format!("{}{code}", self.n)
        }
    }

    fn fixed_step(&self) -> Result<Option<ChronoDuration>> {
        let n = self.n;
        let step = match self.unit {
            CalendarUnit::Microsecond => Some(ChronoDuration::microseconds(n)),
            CalendarUnit::Millisecond => ChronoDuration::try_milliseconds(n),
            CalendarUnit::Second => ChronoDuration::try_seconds(n),
            CalendarUnit::Minute => ChronoDuration::try_minutes(n),
            CalendarUnit::Hour => ChronoDuration::try_hours(n),
            CalendarUnit::Day => ChronoDuration::try_days(n),
            CalendarUnit::Week { anchor: None } => ChronoDuration::try_weeks(n),
            _ => return Ok(None),
        };
        step.map(Some).ok_or_else(out_of_range)
    }

    pub fn is_on_anchor(&self, t: NaiveDateTime) -> bool {
        match self.unit {
            CalendarUnit::BusinessDay => is_weekday(t.date()),
            CalendarUnit::Week { anchor: Some(day) } => t.weekday() == day,
            CalendarUnit::Month { anchor, span, phase } => {
                let date = t.date();
                let aligned = (date.month() as i64 - phase as i64).rem_euclid(span as i64) == 0;
                let on_day = match anchor {
                    MonthAnchor::Start => date.day() == 1,
                    MonthAnchor::End => date == month_end(date),
                };
                aligned && on_day
            }
            _ => true,
        }
    }

    /// First anchored timestamp at or after `t`.
    pub fn roll_forward(&self, t: NaiveDateTime) -> NaiveDateTime {
        let mut current = t;
        while !self.is_on_anchor(current) {
            current = match self.unit {
                CalendarUnit::Month { anchor, .. } => {
                    let date = current.date();
                    let next = match anchor {
                        MonthAnchor::Start => first_of_next_month(date),
                        MonthAnchor::End if date < month_end(date) => month_end(date),
                        MonthAnchor::End => month_end(first_of_next_month(date)),
                    };
                    next.and_time(current.time())
                }
                _ => current + ChronoDuration::days(1),
            };
        }
        current
    }

    /// Moves `t` forward by `steps` periods (non-negative). An unanchored
    /// start counts its roll to the next anchor as the first period.
    pub fn advance(&self, t: NaiveDateTime, steps: i64) -> Result<NaiveDateTime> {
        if steps < 0 {
            return Err(ClientError::configuration("cannot shift timestamps backwards"));
        }
        if steps == 0 {
            return Ok(t);
        }
        if let Some(step) = self.fixed_step()? {
            return i32::try_from(steps)
                .ok()
                .and_then(|steps| step.checked_mul(steps))
                .and_then(|delta| t.checked_add_signed(delta))
                .ok_or_else(out_of_range);
        }
        let mut periods = self.n.checked_mul(steps).ok_or_else(out_of_range)?;
        let mut current = t;
        if !self.is_on_anchor(current) {
            current = self.roll_forward(current);
            periods -= 1;
        }
        match self.unit {
            CalendarUnit::BusinessDay => {
                for _ in 0..periods {
                    current += ChronoDuration::days(1);
                    while !is_weekday(current.date()) {
                        current += ChronoDuration::days(1);
                    }
                }
                Ok(current)
            }
            CalendarUnit::Week { .. } => ChronoDuration::try_weeks(periods)
                .and_then(|delta| current.checked_add_signed(delta))
                .ok_or_else(out_of_range),
            CalendarUnit::Month { anchor, span, .. } => {
                let months = periods
                    .checked_mul(span as i64)
                    .and_then(|months| u32::try_from(months).ok())
                    .ok_or_else(out_of_range)?;
                let base = match anchor {
                    MonthAnchor::Start => current.date(),
                    MonthAnchor::End => current.date().with_day(1).unwrap_or(current.date()),
                };
                let shifted = base
                    .checked_add_months(Months::new(months))
                    .ok_or_else(out_of_range)?;
                let date = match anchor {
                    MonthAnchor::Start => shifted,
                    MonthAnchor::End => month_end(shifted),
                };
                Ok(date.and_time(current.time()))
            }
            _ => Ok(current),
        }
    }

    /// Size of `date_range(first, last)` for this offset.
    pub fn grid_len(&self, first: NaiveDateTime, last: NaiveDateTime) -> Result<usize> {
        if let Some(step) = self.fixed_step()? {
            if last < first {
                return Ok(0);
            }
            let span = (last - first).num_microseconds().ok_or_else(|| {
                ClientError::configuration("timestamp range too large for the frequency")
            })?;
            let step = step.num_microseconds().unwrap_or(i64::MAX).max(1);
            return Ok((span / step + 1) as usize);
        }
        let mut count = 0usize;
        let mut current = self.roll_forward(first);
        while current <= last {
            count += 1;
            current = self.advance(current, 1)?;
        }
        Ok(count)
    }
}

fn out_of_range() -> ClientError {
    ClientError::configuration("calendar shift out of range")
}

fn unsupported_alias(raw: &str) -> ClientError {
    ClientError::configuration(format!("unsupported frequency alias: {raw}"))
}

fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn first_of_next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
}

fn month_end(date: NaiveDate) -> NaiveDate {
    first_of_next_month(date).pred_opt().unwrap_or(date)
}

const WEEKDAYS: [(Weekday, &str); 7] = [
    (Weekday::Mon, "MON"),
    (Weekday::Tue, "TUE"),
    (Weekday::Wed, "WED"),
    (Weekday::Thu, "THU"),
    (Weekday::Fri, "FRI"),
    (Weekday::Sat, "SAT"),
    (Weekday::Sun, "SUN"),
];

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

fn weekday_from_abbrev(raw: &str) -> Option<Weekday> {
    WEEKDAYS
        .iter()
        .find(|(_, name)| name.eq_ignore_ascii_case(raw))
        .map(|(day, _)| *day)
}

fn weekday_abbrev(day: Weekday) -> &'static str {
    WEEKDAYS
        .iter()
        .find(|(d, _)| *d == day)
        .map(|(_, name)| *name)
        .unwrap_or("SUN")
}

fn month_from_abbrev(raw: &str) -> Option<u32> {
    MONTHS
        .iter()
        .position(|name| name.eq_ignore_ascii_case(raw))
        .map(|pos| pos as u32 + 1)
}

fn month_abbrev(month: u32) -> &'static str {
    MONTHS[((month.max(1) - 1) % 12) as usize]
}

/// Infers the frequency of a sorted run of timestamps.
pub fn infer(times: &[TimeValue]) -> Result<Freq> {
    let failure = || {
        ClientError::validation(
            "Could not infer the frequency of the time column. This could be due \
             to inconsistent intervals. Please check your data for missing, \
             duplicated or irregular timestamps",
        )
    };
    if times.len() < 3 {
        return Err(failure());
    }
    if let Some(ints) = times
        .iter()
        .map(|t| match t {
            TimeValue::Int(v) => Some(*v),
            TimeValue::Datetime(_) => None,
        })
        .collect::<Option<Vec<i64>>>()
    {
        let step = ints[1] - ints[0];
        if step > 0 && ints.windows(2).all(|w| w[1] - w[0] == step) {
            return Ok(Freq::Step(step));
        }
        return Err(failure());
    }
    let stamps = times
        .iter()
        .map(|t| match t {
            TimeValue::Datetime(v) => Some(*v),
            TimeValue::Int(_) => None,
        })
        .collect::<Option<Vec<NaiveDateTime>>>()
        .ok_or_else(failure)?;

    let offset = infer_fixed(&stamps)
        .or_else(|| infer_business_days(&stamps))
        .or_else(|| infer_month_based(&stamps))
        .ok_or_else(failure)?;
    Ok(Freq::Alias {
        raw: offset.freqstr(),
        offset,
    })
}

fn infer_fixed(stamps: &[NaiveDateTime]) -> Option<CalendarOffset> {
    let delta = stamps[1] - stamps[0];
    if delta <= ChronoDuration::zero() || !stamps.windows(2).all(|w| w[1] - w[0] == delta) {
        return None;
    }
    let micros = delta.num_microseconds()?;
    const DAY: i64 = 86_400_000_000;
    if micros % DAY == 0 {
        let days = micros / DAY;
        if days % 7 == 0 {
            return Some(CalendarOffset::new(
                days / 7,
                CalendarUnit::Week {
                    anchor: Some(stamps[0].weekday()),
                },
            ));
        }
        return Some(CalendarOffset::new(days, CalendarUnit::Day));
    }
    let units = [
        (3_600_000_000, CalendarUnit::Hour),
        (60_000_000, CalendarUnit::Minute),
        (1_000_000, CalendarUnit::Second),
        (1_000, CalendarUnit::Millisecond),
        (1, CalendarUnit::Microsecond),
    ];
    units
        .into_iter()
        .find(|(size, _)| micros % size == 0)
        .map(|(size, unit)| CalendarOffset::new(micros / size, unit))
}

fn infer_business_days(stamps: &[NaiveDateTime]) -> Option<CalendarOffset> {
    let offset = CalendarOffset::new(1, CalendarUnit::BusinessDay);
    if !stamps.iter().all(|t| offset.is_on_anchor(*t)) {
        return None;
    }
    let consistent = stamps
        .windows(2)
        .all(|w| offset.advance(w[0], 1).ok() == Some(w[1]));
    consistent.then_some(offset)
}

fn infer_month_based(stamps: &[NaiveDateTime]) -> Option<CalendarOffset> {
    let time_of_day = stamps[0].time();
    if stamps.iter().any(|t| t.time() != time_of_day) {
        return None;
    }
    let anchor = if stamps.iter().all(|t| t.day() == 1) {
        MonthAnchor::Start
    } else if stamps.iter().all(|t| t.date() == month_end(t.date())) {
        MonthAnchor::End
    } else {
        return None;
    };
    let month_index = |t: &NaiveDateTime| t.year() as i64 * 12 + t.month() as i64;
    let step = month_index(&stamps[1]) - month_index(&stamps[0]);
    if step <= 0
        || !stamps
            .windows(2)
            .all(|w| month_index(&w[1]) - month_index(&w[0]) == step)
    {
        return None;
    }
    let phase = stamps[0].month();
    let (n, span) = if step % 12 == 0 {
        (step / 12, 12)
    } else if step % 3 == 0 {
        (step / 3, 3)
    } else {
        (step, 1)
    };
    Some(CalendarOffset::new(
        n,
        CalendarUnit::Month {
            anchor,
            span,
            phase,
        },
    ))
}
