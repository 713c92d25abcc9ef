use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::client::{AnomalyOptions, CrossValidationOptions, ForecastOptions, DEFAULT_MODEL};
use crate::freq::Freq;
use crate::validation::PanelColumns;

#[derive(Parser, Debug, Clone)]
#[command(name = "timegpt", version, about = "Forecast panel CSVs with TimeGPT")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    Forecast(ForecastArgs),
    Anomalies(AnomaliesArgs),
    CrossValidation(CrossValidationArgs),
}

impl Command {
    pub fn common(&self) -> &CommonArgs {
        match self {
            Command::Forecast(args) => &args.common,
            Command::Anomalies(args) => &args.common,
            Command::CrossValidation(args) => &args.common,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Panel CSV with id, time and target columns.
    #[arg(long)]
    pub input: PathBuf,
    /// Result CSV; stdout when omitted.
    #[arg(long)]
    pub output: Option<PathBuf>,
    /// Pandas-style alias (`D`, `15min`, `MS`) or an integer step.
    #[arg(long)]
    pub freq: Option<String>,
    #[arg(long, default_value = "unique_id")]
    pub id_col: String,
    #[arg(long, default_value = "ds")]
    pub time_col: String,
    #[arg(long, default_value = "y")]
    pub target_col: String,
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,
    #[arg(long)]
    pub num_partitions: Option<usize>,
}

impl CommonArgs {
    pub fn columns(&self) -> PanelColumns {
        PanelColumns {
            id_col: self.id_col.clone(),
            time_col: self.time_col.clone(),
            target_col: self.target_col.clone(),
        }
    }

    pub fn freq(&self) -> Result<Option<Freq>> {
        let Some(raw) = self.freq.as_deref() else {
            return Ok(None);
        };
        if let Ok(step) = raw.trim().parse::<i64>() {
            return Ok(Some(Freq::Step(step)));
        }
        Freq::parse(raw)
            .map(Some)
            .with_context(|| format!("invalid --freq {raw}"))
    }
}

#[derive(Args, Debug, Clone)]
pub struct ForecastArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[arg(long)]
    pub h: usize,
    #[arg(long)]
    pub level: Vec<f64>,
    #[arg(long)]
    pub quantile: Vec<f64>,
    /// Future exogenous values, `h` rows per series.
    #[arg(long)]
    pub futr: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub add_history: bool,
}

impl ForecastArgs {
    pub fn options(&self) -> Result<ForecastOptions> {
        let mut options = ForecastOptions::new(self.h);
        options.freq = self.common.freq()?;
        options.columns = self.common.columns();
        options.model = self.common.model.clone();
        options.num_partitions = self.common.num_partitions;
        options.level = non_empty(&self.level);
        options.quantiles = non_empty(&self.quantile);
        options.add_history = self.add_history;
        Ok(options)
    }
}

#[derive(Args, Debug, Clone)]
pub struct AnomaliesArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[arg(long, default_value_t = 99.0)]
    pub level: f64,
}

impl AnomaliesArgs {
    pub fn options(&self) -> Result<AnomalyOptions> {
        Ok(AnomalyOptions {
            freq: self.common.freq()?,
            columns: self.common.columns(),
            level: self.level,
            model: self.common.model.clone(),
            num_partitions: self.common.num_partitions,
            ..AnomalyOptions::default()
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct CrossValidationArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[arg(long)]
    pub h: usize,
    #[arg(long, default_value_t = 1)]
    pub n_windows: usize,
    #[arg(long)]
    pub step_size: Option<usize>,
    #[arg(long)]
    pub level: Vec<f64>,
    #[arg(long)]
    pub quantile: Vec<f64>,
}

impl CrossValidationArgs {
    pub fn options(&self) -> Result<CrossValidationOptions> {
        let mut options = CrossValidationOptions::new(self.h);
        options.freq = self.common.freq()?;
        options.columns = self.common.columns();
        options.model = self.common.model.clone();
        options.num_partitions = self.common.num_partitions;
        options.n_windows = self.n_windows;
        options.step_size = self.step_size;
        options.level = non_empty(&self.level);
        options.quantiles = non_empty(&self.quantile);
        Ok(options)
    }
}

fn non_empty(values: &[f64]) -> Option<Vec<f64>> {
    (!values.is_empty()).then(|| values.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("timegpt").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn forecast_flags_map_onto_options() {
        let cli = parse(&[
            "forecast", "--input", "panel.csv", "--h", "12", "--level", "80", "--level", "95",
            "--freq", "MS", "--num-partitions", "2",
        ]);
        let Command::Forecast(args) = cli.command else {
            panic!("expected forecast");
        };
        let options = args.options().unwrap();
        assert_eq!(options.h, 12);
        assert_eq!(options.level, Some(vec![80.0, 95.0]));
        assert_eq!(options.quantiles, None);
        assert_eq!(options.num_partitions, Some(2));
        assert_eq!(options.freq.map(|f| f.standardize()), Some("MS".to_string()));
        assert_eq!(options.model, DEFAULT_MODEL);
        assert_eq!(args.common.output, None);
    }

    #[test]
    fn integer_freq_is_a_step() {
        let cli = parse(&["anomalies", "--input", "panel.csv", "--freq", "7", "--id-col", "series"]);
        let options = match &cli.command {
            Command::Anomalies(args) => args.options().unwrap(),
            other => panic!("unexpected command {other:?}"),
        };
        assert_eq!(options.freq, Some(Freq::Step(7)));
        assert_eq!(options.level, 99.0);
        assert_eq!(cli.command.common().columns().id_col, "series");
    }

    #[test]
    fn cross_validation_requires_a_horizon() {
        assert!(Cli::try_parse_from(["timegpt", "cross-validation", "--input", "p.csv"]).is_err());
        let cli = parse(&[
            "cross-validation", "--input", "p.csv", "--h", "3", "--n-windows", "4", "--quantile", "0.1",
        ]);
        let Command::CrossValidation(args) = cli.command else {
            panic!("expected cross-validation");
        };
        let options = args.options().unwrap();
        assert_eq!(options.n_windows, 4);
        assert_eq!(options.step_size, None);
        assert_eq!(options.quantiles, Some(vec![0.1]));
    }
}
