//! Service operations: validate, encode, dispatch, then rebuild tables.

use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::encoder::{encode, order_features, select_exogenous, tail_indices, RaggedArray};
use crate::error::{ClientError, Result};
use crate::frame::{Column, Table};
use crate::freq::Freq;
use crate::merge::MergeParts;
use crate::partition::partition_series;
use crate::payload::{
    AnomalyParams, CrossValidationParams, FinetuneDepth, FinetuneLoss, FinetuneParams,
    ForecastParams, Matrix, ModelParamsQuery, OnlineAnomalyParams, Request, SeriesPayload,
    ThresholdMethod,
};
use crate::reconstruct::{
    assign_intervals, contributions_table, encoded_times_and_targets, forecast_frame,
    in_sample_frame, indexed_frame, levels_to_quantiles, maybe_drop_id,
    prepare_level_and_quantiles, restore_order, stack_filling_nan, weights_tables,
    ForecastOutput, MODEL_COL,
};
use crate::response::{
    AnomalyDetection, CrossValidation, Endpoint, Finetune, FinetunedModel,
    FinetunedModelsResponse, Forecast, ForecastResponse, HistoricForecast, HistoricResponse,
    ModelParams, ModelParamsResponse, OnlineAnomalyDetection, Usage,
};
use crate::retry::RetryPolicy;
use crate::transport::{decode, encode_body, parse_response, HttpTransport, Transport};
use crate::validation::{validate_panel, PanelColumns};

pub const DEFAULT_MODEL: &str = "timegpt-1";
const AZURE_MODEL: &str = "azureai";
const DEFAULT_ANOMALY_LEVEL: f64 = 99.0;

fn is_supported_model(model: &str) -> bool {
    model == AZURE_MODEL
        || model
            .strip_prefix("timegpt-")
            .is_some_and(|rest| !rest.is_empty())
}

fn require_positive(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(ClientError::validation(format!("{name} must be a positive integer")));
    }
    Ok(())
}

fn ensure_min_size(ragged: &RaggedArray, params: ModelParams) -> Result<()> {
    let required = params.input_size + params.horizon;
    let shortest = ragged.sizes().into_iter().min().unwrap_or(0);
    if shortest < required {
        return Err(ClientError::validation(format!(
            "Some series are too short. Please make sure that each series contains at least \
             {required} observations."
        )));
    }
    Ok(())
}

fn feature_matrix(ragged: &RaggedArray) -> Option<Matrix> {
    let features = ragged.features();
    (!features.is_empty()).then(|| features.to_vec())
}

#[derive(Debug, Clone)]
pub struct ForecastOptions {
    pub h: usize,
    pub freq: Option<Freq>,
    pub columns: PanelColumns,
    pub level: Option<Vec<f64>>,
    pub quantiles: Option<Vec<f64>>,
    pub validate_api_key: bool,
    pub finetune_steps: usize,
    pub finetune_depth: FinetuneDepth,
    pub finetune_loss: FinetuneLoss,
    pub finetuned_model_id: Option<String>,
    pub clean_ex_first: bool,
    pub hist_exog_list: Option<Vec<String>>,
    /// Also return fitted values for the history.
    pub add_history: bool,
    pub model: String,
    pub num_partitions: Option<usize>,
    pub feature_contributions: bool,
}

impl ForecastOptions {
    pub fn new(h: usize) -> Self {
        Self {
            h,
            freq: None,
            columns: PanelColumns::default(),
            level: None,
            quantiles: None,
            validate_api_key: false,
            finetune_steps: 0,
            finetune_depth: FinetuneDepth::default(),
            finetune_loss: FinetuneLoss::default(),
            finetuned_model_id: None,
            clean_ex_first: true,
            hist_exog_list: None,
            add_history: false,
            model: DEFAULT_MODEL.to_string(),
            num_partitions: None,
            feature_contributions: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnomalyOptions {
    pub freq: Option<Freq>,
    pub columns: PanelColumns,
    pub level: f64,
    pub finetuned_model_id: Option<String>,
    pub clean_ex_first: bool,
    pub validate_api_key: bool,
    pub model: String,
    pub num_partitions: Option<usize>,
}

impl Default for AnomalyOptions {
    fn default() -> Self {
        Self {
            freq: None,
            columns: PanelColumns::default(),
            level: DEFAULT_ANOMALY_LEVEL,
            finetuned_model_id: None,
            clean_ex_first: true,
            validate_api_key: false,
            model: DEFAULT_MODEL.to_string(),
            num_partitions: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OnlineAnomalyOptions {
    pub h: usize,
    /// Trailing observations of every series that are scored.
    pub detection_size: usize,
    pub threshold_method: ThresholdMethod,
    pub freq: Option<Freq>,
    pub columns: PanelColumns,
    pub level: f64,
    pub clean_ex_first: bool,
    pub step_size: Option<usize>,
    pub finetune_steps: usize,
    pub finetune_depth: FinetuneDepth,
    pub finetune_loss: FinetuneLoss,
    pub hist_exog_list: Option<Vec<String>>,
    pub model: String,
    pub refit: bool,
    pub num_partitions: Option<usize>,
}

impl OnlineAnomalyOptions {
    pub fn new(h: usize, detection_size: usize) -> Self {
        Self {
            h,
            detection_size,
            threshold_method: ThresholdMethod::default(),
            freq: None,
            columns: PanelColumns::default(),
            level: DEFAULT_ANOMALY_LEVEL,
            clean_ex_first: true,
            step_size: None,
            finetune_steps: 0,
            finetune_depth: FinetuneDepth::default(),
            finetune_loss: FinetuneLoss::default(),
            hist_exog_list: None,
            model: DEFAULT_MODEL.to_string(),
            refit: false,
            num_partitions: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrossValidationOptions {
    pub h: usize,
    pub freq: Option<Freq>,
    pub columns: PanelColumns,
    pub level: Option<Vec<f64>>,
    pub quantiles: Option<Vec<f64>>,
    pub validate_api_key: bool,
    pub n_windows: usize,
    /// Defaults to `h`.
    pub step_size: Option<usize>,
    pub finetune_steps: usize,
    pub finetune_depth: FinetuneDepth,
    pub finetune_loss: FinetuneLoss,
    pub finetuned_model_id: Option<String>,
    pub refit: bool,
    pub clean_ex_first: bool,
    pub hist_exog_list: Option<Vec<String>>,
    pub model: String,
    pub num_partitions: Option<usize>,
}

impl CrossValidationOptions {
    pub fn new(h: usize) -> Self {
        Self {
            h,
            freq: None,
            columns: PanelColumns::default(),
            level: None,
            quantiles: None,
            validate_api_key: false,
            n_windows: 1,
            step_size: None,
            finetune_steps: 0,
            finetune_depth: FinetuneDepth::default(),
            finetune_loss: FinetuneLoss::default(),
            finetuned_model_id: None,
            refit: true,
            clean_ex_first: true,
            hist_exog_list: None,
            model: DEFAULT_MODEL.to_string(),
            num_partitions: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FinetuneOptions {
    pub freq: Option<Freq>,
    pub columns: PanelColumns,
    pub finetune_steps: usize,
    pub finetune_depth: FinetuneDepth,
    pub finetune_loss: FinetuneLoss,
    /// Id for the new model; the service generates one when unset.
    pub output_model_id: Option<String>,
    /// Previously finetuned model to start from.
    pub finetuned_model_id: Option<String>,
    pub model: String,
}

impl Default for FinetuneOptions {
    fn default() -> Self {
        Self {
            freq: None,
            columns: PanelColumns::default(),
            finetune_steps: 10,
            finetune_depth: FinetuneDepth::default(),
            finetune_loss: FinetuneLoss::default(),
            output_model_id: None,
            finetuned_model_id: None,
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

/// Flagged in-sample rows plus the exogenous weights, when features were sent.
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyOutput<T> {
    pub anomalies: T,
    pub weights_x: Option<Vec<T>>,
}

pub struct Client<T = HttpTransport> {
    config: ClientConfig,
    transport: T,
    /// `(model, freq) -> (input_size, horizon)`. Never invalidated; two
    /// concurrent first lookups may both query the service.
    model_params: Mutex<HashMap<(String, String), ModelParams>>,
}

impl Client<HttpTransport> {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config.base_url, &config.api_key, config.timeout)?;
        Ok(Self::with_transport(config, transport))
    }

    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }
}

impl<T: Transport> Client<T> {
    pub fn with_transport(config: ClientConfig, transport: T) -> Self {
        Self {
            config,
            transport,
            model_params: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.config.retry_policy()
    }

    fn resolve_model(&self, model: &str) -> String {
        if self.config.is_azure() && model != AZURE_MODEL {
            warn!("Azure endpoint detected, setting `model` to 'azureai'.");
            return AZURE_MODEL.to_string();
        }
        model.to_string()
    }

    async fn check_inputs(&self, model: &str, validate_api_key: bool) -> Result<()> {
        if validate_api_key && !self.check_api_key(false).await? {
            return Err(ClientError::configuration(
                "API Key not valid, please email support@nixtla.io",
            ));
        }
        if !is_supported_model(model) {
            return Err(ClientError::validation(format!("unsupported model: {model}.")));
        }
        Ok(())
    }

    async fn post<E: Endpoint>(
        &self,
        request: &Request<E::Params>,
        multithreaded_compress: bool,
    ) -> Result<E::Response> {
        let body = encode_body(request, multithreaded_compress)?;
        self.retry_policy()
            .run(move || {
                let body = body.clone();
                async move {
                    let raw = self.transport.post(E::PATH, body).await?;
                    decode(parse_response(&raw)?)
                }
            })
            .await
    }

    /// Sends `request` whole, or split into series-aligned partitions that
    /// are dispatched concurrently and merged back in order.
    async fn dispatch<E>(
        &self,
        request: &Request<E::Params>,
        num_partitions: Option<usize>,
        h: usize,
    ) -> Result<E::Response>
    where
        E: Endpoint,
        E::Response: MergeParts,
    {
        let Some(num_partitions) = num_partitions else {
            return self.post::<E>(request, true).await;
        };
        let parts = partition_series(request, num_partitions, h);
        if let [single] = parts.as_slice() {
            return self.post::<E>(single, true).await;
        }

        let part_rows: Vec<usize> = parts.iter().map(|p| p.series.n_rows()).collect();
        let workers = self.config.max_partition_workers.clamp(1, parts.len());
        let mut slots: Vec<Option<E::Response>> =
            std::iter::repeat_with(|| None).take(parts.len()).collect();
        let mut in_flight = stream::iter(parts.iter().enumerate())
            .map(move |(pos, part)| async move { (pos, self.post::<E>(part, false).await) })
            .buffer_unordered(workers);
        while let Some((pos, response)) = in_flight.next().await {
            slots[pos] = Some(response?);
        }
        let responses = slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| ClientError::UnexpectedResponse("partition response missing".to_string()))?;
        MergeParts::merge_parts(responses, &part_rows)
    }

    async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let raw = self.transport.get(path, &[]).await?;
        decode(parse_response(&raw)?)
    }

    fn cached_model_params(&self, key: &(String, String)) -> Option<ModelParams> {
        self.model_params
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    /// Input size and horizon of `model` at the standardized `freq`.
    pub async fn model_params(&self, model: &str, freq: &str) -> Result<ModelParams> {
        let key = (model.to_string(), freq.to_string());
        if let Some(params) = self.cached_model_params(&key) {
            return Ok(params);
        }
        info!("Querying model metadata...");
        let response: ModelParamsResponse = if self.config.is_azure() {
            let query = ModelParamsQuery {
                model: model.to_string(),
                freq: freq.to_string(),
            };
            let body = encode_body(&query, true)?;
            self.retry_policy()
                .run(move || {
                    let body = body.clone();
                    async move {
                        let raw = self.transport.post("model_params", body).await?;
                        decode(parse_response(&raw)?)
                    }
                })
                .await?
        } else {
            let query = [
                ("model".to_string(), model.to_string()),
                ("freq".to_string(), freq.to_string()),
            ];
            let query = &query;
            self.retry_policy()
                .run(move || async move {
                    let raw = self.transport.get("model_params", query).await?;
                    decode(parse_response(&raw)?)
                })
                .await?
        };
        self.model_params
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, response.detail);
        Ok(response.detail)
    }

    async fn check_api_key(&self, log: bool) -> Result<bool> {
        if self.config.is_azure() {
            return Err(ClientError::configuration(
                "validate_api_key is not implemented for Azure deployments, \
                 you can try using the forecasting methods directly.",
            ));
        }
        let raw = self.transport.get("validate_api_key", &[]).await?;
        if log {
            let detail = serde_json::from_slice::<JsonValue>(&raw.body)
                .ok()
                .and_then(|body| body.get("detail").cloned());
            if let Some(detail) = detail {
                info!("{detail}");
            }
        }
        Ok(raw.status == 200)
    }

    pub async fn validate_api_key(&self) -> Result<bool> {
        self.check_api_key(true).await
    }

    /// Consumed requests and limits by minute and month.
    pub async fn usage(&self) -> Result<Usage> {
        if self.config.is_azure() {
            return Err(ClientError::configuration(
                "usage is not implemented for Azure deployments",
            ));
        }
        self.get_json("usage").await
    }

    pub async fn finetuned_models(&self) -> Result<Vec<FinetunedModel>> {
        let response: FinetunedModelsResponse = self.get_json("v2/finetuned_models").await?;
        Ok(response.finetuned_models)
    }

    pub async fn finetuned_model(&self, finetuned_model_id: &str) -> Result<FinetunedModel> {
        self.get_json(&format!("v2/finetuned_models/{finetuned_model_id}"))
            .await
    }

    /// Returns whether the service confirmed the deletion.
    pub async fn delete_finetuned_model(&self, finetuned_model_id: &str) -> Result<bool> {
        let raw = self
            .transport
            .delete(&format!("v2/finetuned_models/{finetuned_model_id}"))
            .await?;
        Ok(raw.status == 204)
    }

    /// Forecasts `h` steps past the end of every series in `df`.
    ///
    /// `x_df` holds future values of the exogenous features, `h` rows per
    /// series. Columns of `df` that are neither in `x_df` nor listed in
    /// `hist_exog_list` are dropped with a warning.
    pub async fn forecast<D: Table>(
        &self,
        df: D,
        x_df: Option<D>,
        options: &ForecastOptions,
    ) -> Result<ForecastOutput<D>> {
        let cols = &options.columns;
        require_positive("h", options.h)?;
        let model = self.resolve_model(&options.model);
        info!("Validating inputs...");
        self.check_inputs(&model, options.validate_api_key).await?;
        let panel = validate_panel(df, x_df, options.freq.clone(), cols)?;
        let hist_exog = options.hist_exog_list.clone().unwrap_or_default();
        let (df, x_df) = select_exogenous(&panel.df, panel.futr_df.as_ref(), cols, &hist_exog)?;
        let (level, quantiles) =
            prepare_level_and_quantiles(options.level.clone(), options.quantiles.clone())?;

        info!("Preprocessing dataframes...");
        let encoded = encode(&df, x_df.as_ref(), options.h, cols)?;
        let freq = panel.freq.standardize();
        let params = self.model_params(&model, &freq).await?;
        if options.finetune_steps > 0 || options.add_history {
            ensure_min_size(&encoded.ragged, params)?;
        }
        if options.h > params.horizon {
            warn!(
                h = options.h,
                model_horizon = params.horizon,
                "The specified horizon \"h\" exceeds the model horizon, this may lead to less \
                 accurate forecasts. Please consider using a smaller horizon."
            );
        }
        let restrict_input =
            options.finetune_steps == 0 && encoded.x_cols.is_empty() && !options.add_history;
        let ragged = if restrict_input {
            info!("Restricting input...");
            let rows = self.config.input_restriction.rows(
                level.is_some(),
                params.input_size,
                params.horizon,
                options.h,
            );
            encoded.ragged.tail(rows)?
        } else {
            encoded.ragged
        };
        let x = feature_matrix(&ragged);
        if x.is_some() {
            if let Some(futr_cols) = &encoded.futr_cols {
                info!(features = ?futr_cols, "Using future exogenous features");
            }
            if !hist_exog.is_empty() {
                info!(features = ?hist_exog, "Using historical exogenous features");
            }
        }
        let contributions_requested = options.feature_contributions && x.is_some();

        let request = Request {
            series: SeriesPayload {
                y: ragged.target().to_vec(),
                sizes: ragged.sizes(),
                x,
                x_future: Some(encoded.x_future),
            },
            params: ForecastParams {
                model,
                h: options.h,
                freq,
                clean_ex_first: options.clean_ex_first,
                level,
                finetune_steps: options.finetune_steps,
                finetune_depth: options.finetune_depth,
                finetune_loss: options.finetune_loss,
                finetuned_model_id: options.finetuned_model_id.clone(),
                feature_contributions: contributions_requested,
            },
        };
        info!("Calling Forecast Endpoint...");
        let response = self
            .dispatch::<Forecast>(&request, options.num_partitions, options.h)
            .await?;
        let historic = if options.add_history {
            info!("Calling Historical Forecast Endpoint...");
            Some(
                self.dispatch::<HistoricForecast>(&request.to_in_sample(), options.num_partitions, 0)
                    .await?,
            )
        } else {
            None
        };

        let mut out: D = forecast_frame(
            &ragged,
            &panel.freq,
            options.h,
            &response.mean,
            response.intervals.as_ref(),
            cols,
        )?;
        if let Some(historic) = &historic {
            let mut fitted: D = in_sample_frame(
                &df,
                &ragged,
                &historic.sizes,
                &historic.mean,
                historic.intervals.as_ref(),
                cols,
            )?;
            fitted.drop_column(&cols.target_col);
            out = stack_filling_nan(vec![fitted, out])?;
        }
        let out = levels_to_quantiles(out, quantiles.as_deref())?;
        let contributions = if options.feature_contributions {
            self.contributions_frame(&out, &encoded.x_cols, &response, historic.as_ref(), cols)?
        } else {
            None
        };
        let (out, contributions) = if options.add_history {
            restore_order(out, contributions, cols)?
        } else {
            (out, contributions)
        };
        Ok(ForecastOutput {
            forecast: maybe_drop_id(out, &cols.id_col, panel.drop_id),
            weights_x: weights_tables(response.weights_x.as_ref(), &encoded.x_cols)?,
            feature_contributions: contributions,
        })
    }

    fn contributions_frame<D: Table>(
        &self,
        out: &D,
        x_cols: &[String],
        response: &ForecastResponse,
        historic: Option<&HistoricResponse>,
        cols: &PanelColumns,
    ) -> Result<Option<D>> {
        let contributions = match &response.feature_contributions {
            None if self.config.is_azure() => {
                warn!("feature_contributions aren't implemented in Azure yet.");
                return Ok(None);
            }
            None => {
                return Err(ClientError::UnexpectedResponse(
                    "feature_contributions expected in response but not found".to_string(),
                ))
            }
            Some(None) => return Ok(None),
            Some(Some(contributions)) => contributions,
        };
        let base = out.select(&[cols.id_col.as_str(), cols.time_col.as_str(), MODEL_COL])?;
        let in_sample = historic
            .and_then(|h| h.feature_contributions.as_ref())
            .and_then(Option::as_ref);
        contributions_table(base, x_cols, contributions, in_sample).map(Some)
    }

    /// Flags anomalous in-sample observations at the given confidence level.
    /// Every non id/time/target column is sent as an exogenous feature.
    pub async fn detect_anomalies<D: Table>(
        &self,
        df: D,
        options: &AnomalyOptions,
    ) -> Result<AnomalyOutput<D>> {
        let cols = &options.columns;
        let model = self.resolve_model(&options.model);
        info!("Validating inputs...");
        self.check_inputs(&model, options.validate_api_key).await?;
        let panel = validate_panel(df, None, options.freq.clone(), cols)?;

        info!("Preprocessing dataframes...");
        let encoded = encode(&panel.df, None, 0, cols)?;
        let freq = panel.freq.standardize();
        self.model_params(&model, &freq).await?;
        let ragged = &encoded.ragged;
        let x = feature_matrix(ragged);
        if x.is_some() {
            info!(features = ?encoded.x_cols, "Using the following exogenous features");
        }

        info!("Calling Anomaly Detector Endpoint...");
        let request = Request {
            series: SeriesPayload {
                y: ragged.target().to_vec(),
                sizes: ragged.sizes(),
                x,
                x_future: None,
            },
            params: AnomalyParams {
                model,
                freq,
                finetuned_model_id: options.finetuned_model_id.clone(),
                clean_ex_first: options.clean_ex_first,
                level: options.level,
            },
        };
        let response = self
            .dispatch::<AnomalyDetection>(&request, options.num_partitions, 0)
            .await?;

        let mut out: D = in_sample_frame(
            &panel.df,
            ragged,
            &response.sizes,
            &response.mean,
            response.intervals.as_ref(),
            cols,
        )?;
        out.assign("anomaly", Column::Bool(response.anomaly))?;
        Ok(AnomalyOutput {
            anomalies: maybe_drop_id(out, &cols.id_col, panel.drop_id),
            weights_x: weights_tables(response.weights_x.as_ref(), &encoded.x_cols)?,
        })
    }

    /// Scores the last `detection_size` observations of every series with
    /// rolling forecasts of `h` steps.
    pub async fn detect_anomalies_online<D: Table>(
        &self,
        df: D,
        options: &OnlineAnomalyOptions,
    ) -> Result<D> {
        let multivariate = options.threshold_method == ThresholdMethod::Multivariate;
        if multivariate && options.num_partitions.is_some_and(|n| n > 1) {
            return Err(ClientError::validation(
                "Cannot use more than 1 partition for multivariate anomaly detection. \
                 Either set threshold_method to univariate or set num_partitions to None.",
            ));
        }
        require_positive("h", options.h)?;
        require_positive("detection_size", options.detection_size)?;
        let cols = &options.columns;
        let model = self.resolve_model(&options.model);
        info!("Validating inputs...");
        self.check_inputs(&model, false).await?;
        let panel = validate_panel(df, None, options.freq.clone(), cols)?;

        info!("Preprocessing dataframes...");
        let encoded = encode(&panel.df, None, 0, cols)?;
        let freq = panel.freq.standardize();
        let ragged = &encoded.ragged;
        let (times, targets) = encoded_times_and_targets(&panel.df, ragged, cols)?;
        let (x, hist_exog) = order_features(
            ragged.features(),
            &encoded.x_cols,
            options.hist_exog_list.as_deref(),
        )?;
        let sizes = ragged.sizes();
        if sizes.iter().all(|&size| size <= 6 * options.detection_size) {
            warn!(
                "Detection size is large. Using the entire series to compute the anomaly \
                 threshold..."
            );
        }

        info!("Calling Online Anomaly Detector Endpoint...");
        let request = Request {
            series: SeriesPayload {
                y: ragged.target().to_vec(),
                sizes,
                x,
                x_future: None,
            },
            params: OnlineAnomalyParams {
                h: options.h,
                detection_size: options.detection_size,
                threshold_method: options.threshold_method,
                model,
                freq,
                clean_ex_first: options.clean_ex_first,
                level: options.level,
                step_size: options.step_size,
                finetune_steps: options.finetune_steps,
                finetune_loss: options.finetune_loss,
                finetune_depth: options.finetune_depth,
                refit: options.refit,
                hist_exog,
            },
        };
        let response = self
            .dispatch::<OnlineAnomalyDetection>(&request, options.num_partitions, 0)
            .await?;

        let mut out: D = indexed_frame(
            &ragged.uids,
            &times,
            &targets,
            &response.sizes,
            &response.idxs,
            &response.mean,
            None,
            cols,
        )?;
        out.assign("anomaly", Column::Bool(response.anomaly))?;
        out.assign("anomaly_score", Column::Float(response.anomaly_score.0))?;
        if multivariate {
            let accumulated = response.accumulated_anomaly_score.ok_or_else(|| {
                ClientError::UnexpectedResponse(
                    "accumulated_anomaly_score expected in response but not found".to_string(),
                )
            })?;
            out.assign("accumulated_anomaly_score", Column::Float(accumulated.0))?;
        }
        assign_intervals(&mut out, response.intervals.as_ref())?;
        Ok(maybe_drop_id(out, &cols.id_col, panel.drop_id))
    }

    /// Forecasts `n_windows` windows of `h` steps at the end of every series,
    /// each preceded by a `cutoff` timestamp.
    pub async fn cross_validation<D: Table>(
        &self,
        df: D,
        options: &CrossValidationOptions,
    ) -> Result<D> {
        require_positive("h", options.h)?;
        require_positive("n_windows", options.n_windows)?;
        let cols = &options.columns;
        let model = self.resolve_model(&options.model);
        info!("Validating inputs...");
        self.check_inputs(&model, options.validate_api_key).await?;
        let panel = validate_panel(df, None, options.freq.clone(), cols)?;
        let (level, quantiles) =
            prepare_level_and_quantiles(options.level.clone(), options.quantiles.clone())?;
        let step_size = options.step_size.unwrap_or(options.h);
        require_positive("step_size", step_size)?;

        info!("Preprocessing dataframes...");
        let encoded = encode(&panel.df, None, 0, cols)?;
        let freq = panel.freq.standardize();
        let params = self.model_params(&model, &freq).await?;
        let (mut times, mut targets) = encoded_times_and_targets(&panel.df, &encoded.ragged, cols)?;
        let mut ragged = encoded.ragged;
        if options.finetune_steps == 0 && encoded.x_cols.is_empty() {
            info!("Restricting input...");
            let rows = self.config.input_restriction.rows(
                level.is_some(),
                params.input_size,
                params.horizon,
                options.h,
            ) + options.h
                + step_size * (options.n_windows - 1);
            let tailed = ragged.tail(rows)?;
            let keep = tail_indices(&ragged.indptr, &tailed.sizes())?;
            times = times.take(&keep);
            targets = targets.take(&keep);
            ragged = tailed;
        }
        let (x, hist_exog) = order_features(
            ragged.features(),
            &encoded.x_cols,
            options.hist_exog_list.as_deref(),
        )?;

        info!("Calling Cross Validation Endpoint...");
        let request = Request {
            series: SeriesPayload {
                y: ragged.target().to_vec(),
                sizes: ragged.sizes(),
                x,
                x_future: None,
            },
            params: CrossValidationParams {
                model,
                h: options.h,
                n_windows: options.n_windows,
                step_size,
                freq,
                clean_ex_first: options.clean_ex_first,
                hist_exog,
                level,
                finetune_steps: options.finetune_steps,
                finetune_depth: options.finetune_depth,
                finetune_loss: options.finetune_loss,
                finetuned_model_id: options.finetuned_model_id.clone(),
                refit: options.refit,
            },
        };
        let response = self
            .dispatch::<CrossValidation>(&request, options.num_partitions, 0)
            .await?;

        let mut out: D = indexed_frame(
            &ragged.uids,
            &times,
            &targets,
            &response.sizes,
            &response.idxs,
            &response.mean,
            Some(options.h),
            cols,
        )?;
        assign_intervals(&mut out, response.intervals.as_ref())?;
        let out = maybe_drop_id(out, &cols.id_col, panel.drop_id);
        levels_to_quantiles(out, quantiles.as_deref())
    }

    /// Finetunes `model` on `df` and returns the id of the stored model.
    pub async fn finetune<D: Table>(&self, df: D, options: &FinetuneOptions) -> Result<String> {
        let cols = &options.columns;
        let model = self.resolve_model(&options.model);
        info!("Validating inputs...");
        self.check_inputs(&model, false).await?;
        let panel = validate_panel(df, None, options.freq.clone(), cols)?;

        info!("Preprocessing dataframes...");
        let encoded = encode(&panel.df, None, 0, cols)?;
        let freq = panel.freq.standardize();
        let params = self.model_params(&model, &freq).await?;
        ensure_min_size(&encoded.ragged, params)?;

        info!("Calling Fine-tune Endpoint...");
        let request = Request {
            series: SeriesPayload {
                y: encoded.ragged.target().to_vec(),
                sizes: encoded.ragged.sizes(),
                x: None,
                x_future: None,
            },
            params: FinetuneParams {
                model,
                freq,
                finetune_steps: options.finetune_steps,
                finetune_depth: options.finetune_depth,
                finetune_loss: options.finetune_loss,
                output_model_id: options.output_model_id.clone(),
                finetuned_model_id: options.finetuned_model_id.clone(),
            },
        };
        let response = self.post::<Finetune>(&request, true).await?;
        Ok(response.finetuned_model_id)
    }
}
