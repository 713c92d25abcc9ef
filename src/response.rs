//! Typed response bodies, one per service operation.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::ops::Deref;

use crate::payload::{
    AnomalyParams, CrossValidationParams, FinetuneParams, ForecastParams, HistoricParams,
    OnlineAnomalyParams,
};

/// A POST operation: its path, request parameters and response body.
pub trait Endpoint {
    const PATH: &'static str;
    type Params: Serialize + Clone + Send + Sync + 'static;
    type Response: DeserializeOwned + Send + 'static;
}

pub struct Forecast;
pub struct HistoricForecast;
pub struct AnomalyDetection;
pub struct OnlineAnomalyDetection;
pub struct CrossValidation;
pub struct Finetune;

impl Endpoint for Forecast {
    const PATH: &'static str = "v2/forecast";
    type Params = ForecastParams;
    type Response = ForecastResponse;
}

impl Endpoint for HistoricForecast {
    const PATH: &'static str = "v2/historic_forecast";
    type Params = HistoricParams;
    type Response = HistoricResponse;
}

impl Endpoint for AnomalyDetection {
    const PATH: &'static str = "v2/anomaly_detection";
    type Params = AnomalyParams;
    type Response = AnomalyResponse;
}

impl Endpoint for OnlineAnomalyDetection {
    const PATH: &'static str = "v2/online_anomaly_detection";
    type Params = OnlineAnomalyParams;
    type Response = OnlineAnomalyResponse;
}

impl Endpoint for CrossValidation {
    const PATH: &'static str = "v2/cross_validation";
    type Params = CrossValidationParams;
    type Response = CrossValidationResponse;
}

impl Endpoint for Finetune {
    const PATH: &'static str = "v2/finetune";
    type Params = FinetuneParams;
    type Response = FinetuneResponse;
}

/// Float array where `null` entries decode as `NaN`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Floats(pub Vec<f64>);

impl<'de> Deserialize<'de> for Floats {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<Option<f64>>::deserialize(deserializer)?;
        Ok(Floats(raw.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect()))
    }
}

impl Deref for Floats {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.0
    }
}

impl From<Vec<f64>> for Floats {
    fn from(values: Vec<f64>) -> Self {
        Floats(values)
    }
}

/// Interval bounds keyed `lo-{level}` / `hi-{level}`.
pub type Intervals = BTreeMap<String, Floats>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WeightsX {
    Single(Vec<f64>),
    PerPartition(Vec<Vec<f64>>),
}

/// Deserializes a key that may be absent (`None`), `null` (`Some(None)`) or set.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Feature rows (`features..., base_value`) by observations.
pub type Contributions = Vec<Floats>;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ForecastResponse {
    pub mean: Floats,
    #[serde(default)]
    pub intervals: Option<Intervals>,
    #[serde(default)]
    pub weights_x: Option<WeightsX>,
    #[serde(default, deserialize_with = "present")]
    pub feature_contributions: Option<Option<Contributions>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HistoricResponse {
    pub mean: Floats,
    pub sizes: Vec<usize>,
    #[serde(default)]
    pub intervals: Option<Intervals>,
    #[serde(default)]
    pub weights_x: Option<WeightsX>,
    #[serde(default, deserialize_with = "present")]
    pub feature_contributions: Option<Option<Contributions>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AnomalyResponse {
    pub mean: Floats,
    pub sizes: Vec<usize>,
    pub anomaly: Vec<bool>,
    #[serde(default)]
    pub anomaly_score: Option<Floats>,
    #[serde(default)]
    pub intervals: Option<Intervals>,
    #[serde(default)]
    pub weights_x: Option<WeightsX>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OnlineAnomalyResponse {
    pub mean: Floats,
    pub sizes: Vec<usize>,
    pub idxs: Vec<usize>,
    pub anomaly: Vec<bool>,
    pub anomaly_score: Floats,
    #[serde(default)]
    pub accumulated_anomaly_score: Option<Floats>,
    #[serde(default)]
    pub intervals: Option<Intervals>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CrossValidationResponse {
    pub mean: Floats,
    pub sizes: Vec<usize>,
    pub idxs: Vec<usize>,
    #[serde(default)]
    pub intervals: Option<Intervals>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FinetuneResponse {
    pub finetuned_model_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ModelParams {
    pub input_size: usize,
    pub horizon: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ModelParamsResponse {
    pub detail: ModelParams,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FinetunedModel {
    pub id: String,
    pub created_at: String,
    pub created_by: String,
    pub base_model_id: String,
    pub steps: usize,
    pub depth: u8,
    pub loss: String,
    pub model: String,
    pub freq: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FinetunedModelsResponse {
    pub finetuned_models: Vec<FinetunedModel>,
}

/// Consumed requests and limits, keyed by period (`minute`, `month`).
pub type Usage = BTreeMap<String, BTreeMap<String, i64>>;
