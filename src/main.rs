use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;
use timegpt_client::cli::{Cli, Command};
use timegpt_client::{Client, ClientConfig, Frame};

fn read_panel(path: &Path, id_col: &str, time_col: &str) -> Result<Frame> {
    Frame::read_csv(path, id_col, time_col)
        .with_context(|| format!("failed to read {}", path.display()))
}

fn write_output(frame: &Frame, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            frame.write_csv(BufWriter::new(file))?;
        }
        None => frame.write_csv(io::stdout().lock())?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ClientConfig::from_env().context("failed to load client configuration")?;
    let client = Client::new(config).context("failed to build http client")?;

    let common = cli.command.common();
    let columns = common.columns();
    let df = read_panel(&common.input, &columns.id_col, &columns.time_col)?;

    let result = match &cli.command {
        Command::Forecast(args) => {
            let futr = args
                .futr
                .as_deref()
                .map(|path| read_panel(path, &columns.id_col, &columns.time_col))
                .transpose()?;
            let output = client
                .forecast(df, futr, &args.options()?)
                .await
                .context("forecast failed")?;
            if let Some(weights) = &output.weights_x {
                tracing::info!(partitions = weights.len(), "exogenous weights returned");
            }
            output.forecast
        }
        Command::Anomalies(args) => {
            client
                .detect_anomalies(df, &args.options()?)
                .await
                .context("anomaly detection failed")?
                .anomalies
        }
        Command::CrossValidation(args) => client
            .cross_validation(df, &args.options()?)
            .await
            .context("cross-validation failed")?,
    };

    write_output(&result, common.output.as_deref())
}
