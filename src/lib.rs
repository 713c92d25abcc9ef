pub mod cli;
pub mod client;
pub mod config;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod freq;
pub mod merge;
pub mod partition;
pub mod payload;
pub mod reconstruct;
pub mod response;
pub mod retry;
pub mod transport;
pub mod validation;

#[cfg(test)]
pub mod test_support;

pub use client::{
    AnomalyOptions, AnomalyOutput, Client, CrossValidationOptions, FinetuneOptions,
    ForecastOptions, OnlineAnomalyOptions,
};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use frame::{Column, Frame, Table};
pub use freq::Freq;
pub use payload::{FinetuneDepth, FinetuneLoss, ThresholdMethod};
pub use reconstruct::ForecastOutput;
pub use validation::PanelColumns;
