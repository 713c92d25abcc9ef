//! Request bodies sent to the forecasting service.

use serde::{Serialize, Serializer};

use crate::error::{ClientError, Result};
use crate::transport::{serialize_f32_matrix, serialize_f32_values};

/// Matrix stored feature-major: `matrix[feature][row]`.
pub type Matrix = Vec<Vec<f64>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPayload {
    #[serde(serialize_with = "serialize_f32_values")]
    pub y: Vec<f64>,
    pub sizes: Vec<usize>,
    #[serde(rename = "X", serialize_with = "serialize_optional_matrix")]
    pub x: Option<Matrix>,
    /// Outer `None` omits the key; `Some(None)` sends `null`.
    #[serde(
        rename = "X_future",
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_future_matrix"
    )]
    pub x_future: Option<Option<Matrix>>,
}

impl SeriesPayload {
    pub fn n_series(&self) -> usize {
        self.sizes.len()
    }

    pub fn n_rows(&self) -> usize {
        self.sizes.iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request<P> {
    pub series: SeriesPayload,
    #[serde(flatten)]
    pub params: P,
}

fn serialize_optional_matrix<S: Serializer>(
    value: &Option<Matrix>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(matrix) => serialize_f32_matrix(matrix, serializer),
        None => serializer.serialize_none(),
    }
}

fn serialize_future_matrix<S: Serializer>(
    value: &Option<Option<Matrix>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(inner) => serialize_optional_matrix(inner, serializer),
        None => serializer.serialize_none(),
    }
}

/// Integral levels within the percentage range; anything else stays a float
/// instead of saturating in the cast.
fn integral_level(level: f64) -> Option<i64> {
    (level.fract() == 0.0 && (0.0..=100.0).contains(&level)).then(|| level as i64)
}

/// Interval levels, sent as integers when they have no fractional part.
fn serialize_levels<S: Serializer>(
    value: &Option<Vec<f64>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    use serde::ser::SerializeSeq;
    let Some(levels) = value else {
        return serializer.serialize_none();
    };
    let mut seq = serializer.serialize_seq(Some(levels.len()))?;
    for level in levels {
        match integral_level(*level) {
            Some(level) => seq.serialize_element(&level)?,
            None => seq.serialize_element(level)?,
        }
    }
    seq.end()
}

fn serialize_level<S: Serializer>(level: &f64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match integral_level(*level) {
        Some(level) => serializer.serialize_i64(level),
        None => serializer.serialize_f64(*level),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinetuneLoss {
    #[default]
    Default,
    Mae,
    Mse,
    Rmse,
    Mape,
    Smape,
}

impl FinetuneLoss {
    pub fn as_str(self) -> &'static str {
        match self {
            FinetuneLoss::Default => "default",
            FinetuneLoss::Mae => "mae",
            FinetuneLoss::Mse => "mse",
            FinetuneLoss::Rmse => "rmse",
            FinetuneLoss::Mape => "mape",
            FinetuneLoss::Smape => "smape",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "default" => Some(FinetuneLoss::Default),
            "mae" => Some(FinetuneLoss::Mae),
            "mse" => Some(FinetuneLoss::Mse),
            "rmse" => Some(FinetuneLoss::Rmse),
            "mape" => Some(FinetuneLoss::Mape),
            "smape" => Some(FinetuneLoss::Smape),
            _ => None,
        }
    }
}

/// Finetuning depth on the 1 (shallow) to 5 (whole model) scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FinetuneDepth(u8);

impl FinetuneDepth {
    pub fn new(depth: u8) -> Result<Self> {
        if (1..=5).contains(&depth) {
            Ok(Self(depth))
        } else {
            Err(ClientError::validation(format!(
                "finetune_depth must be between 1 and 5, got {depth}"
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for FinetuneDepth {
    fn default() -> Self {
        Self(1)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMethod {
    #[default]
    Univariate,
    Multivariate,
}

impl ThresholdMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ThresholdMethod::Univariate => "univariate",
            ThresholdMethod::Multivariate => "multivariate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastParams {
    pub model: String,
    pub h: usize,
    pub freq: String,
    pub clean_ex_first: bool,
    #[serde(serialize_with = "serialize_levels")]
    pub level: Option<Vec<f64>>,
    pub finetune_steps: usize,
    pub finetune_depth: FinetuneDepth,
    pub finetune_loss: FinetuneLoss,
    pub finetuned_model_id: Option<String>,
    pub feature_contributions: bool,
}

/// In-sample fitted values; the forecast body without horizon and
/// finetune step/loss settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoricParams {
    pub model: String,
    pub freq: String,
    pub clean_ex_first: bool,
    #[serde(serialize_with = "serialize_levels")]
    pub level: Option<Vec<f64>>,
    pub finetune_depth: FinetuneDepth,
    pub finetuned_model_id: Option<String>,
    pub feature_contributions: bool,
}

impl From<&ForecastParams> for HistoricParams {
    fn from(params: &ForecastParams) -> Self {
        Self {
            model: params.model.clone(),
            freq: params.freq.clone(),
            clean_ex_first: params.clean_ex_first,
            level: params.level.clone(),
            finetune_depth: params.finetune_depth,
            finetuned_model_id: params.finetuned_model_id.clone(),
            feature_contributions: params.feature_contributions,
        }
    }
}

impl Request<ForecastParams> {
    pub fn to_in_sample(&self) -> Request<HistoricParams> {
        Request {
            series: SeriesPayload {
                x_future: None,
                ..self.series.clone()
            },
            params: HistoricParams::from(&self.params),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyParams {
    pub model: String,
    pub freq: String,
    pub finetuned_model_id: Option<String>,
    pub clean_ex_first: bool,
    #[serde(serialize_with = "serialize_level")]
    pub level: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OnlineAnomalyParams {
    pub h: usize,
    pub detection_size: usize,
    pub threshold_method: ThresholdMethod,
    pub model: String,
    pub freq: String,
    pub clean_ex_first: bool,
    #[serde(serialize_with = "serialize_level")]
    pub level: f64,
    pub step_size: Option<usize>,
    pub finetune_steps: usize,
    pub finetune_loss: FinetuneLoss,
    pub finetune_depth: FinetuneDepth,
    pub refit: bool,
    pub hist_exog: Option<Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossValidationParams {
    pub model: String,
    pub h: usize,
    pub n_windows: usize,
    pub step_size: usize,
    pub freq: String,
    pub clean_ex_first: bool,
    pub hist_exog: Option<Vec<usize>>,
    #[serde(serialize_with = "serialize_levels")]
    pub level: Option<Vec<f64>>,
    pub finetune_steps: usize,
    pub finetune_depth: FinetuneDepth,
    pub finetune_loss: FinetuneLoss,
    pub finetuned_model_id: Option<String>,
    pub refit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinetuneParams {
    pub model: String,
    pub freq: String,
    pub finetune_steps: usize,
    pub finetune_depth: FinetuneDepth,
    pub finetune_loss: FinetuneLoss,
    pub output_model_id: Option<String>,
    pub finetuned_model_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelParamsQuery {
    pub model: String,
    pub freq: String,
}
