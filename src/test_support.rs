//! In-process engine standing in for the remote service in tests.
//!
//! Answers are deterministic functions of the submitted series so results can
//! be compared across partition counts.

use bytes::Bytes;
use serde_json::{json, Value as JsonValue};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::frame::{Column, Frame, Table};
use crate::transport::{OutgoingBody, RawResponse, Transport};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: &'static str,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<JsonValue>,
}

#[derive(Debug)]
pub struct StubTransport {
    pub input_size: usize,
    pub horizon: usize,
    pub api_key_valid: bool,
    calls: Mutex<Vec<RecordedCall>>,
    scripted: Mutex<VecDeque<RawResponse>>,
}

impl Default for StubTransport {
    fn default() -> Self {
        Self::new(4, 24)
    }
}

impl StubTransport {
    pub fn new(input_size: usize, horizon: usize) -> Self {
        Self {
            input_size,
            horizon,
            api_key_valid: true,
            calls: Mutex::new(Vec::new()),
            scripted: Mutex::new(VecDeque::new()),
        }
    }

    /// Queues a reply returned by the next POST instead of the engine's answer.
    pub fn push_reply(&self, status: u16, body: JsonValue) {
        self.scripted.lock().expect("scripted").push_back(RawResponse {
            status,
            body: Bytes::from(body.to_string()),
        });
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.path == path).collect()
    }

    fn record(&self, method: &'static str, path: &str, query: &[(String, String)], body: Option<JsonValue>) {
        self.calls.lock().expect("calls").push(RecordedCall {
            method,
            path: path.to_string(),
            query: query.to_vec(),
            body,
        });
    }

    fn model_params(&self) -> JsonValue {
        json!({"detail": {"input_size": self.input_size, "horizon": self.horizon}})
    }
}

fn reply(status: u16, body: JsonValue) -> RawResponse {
    RawResponse {
        status,
        body: Bytes::from(body.to_string()),
    }
}

fn decode_body(body: &OutgoingBody) -> JsonValue {
    let raw = if body.zstd {
        zstd::decode_all(&body.content[..]).expect("zstd body")
    } else {
        body.content.to_vec()
    };
    serde_json::from_slice(&raw).expect("json body")
}

fn floats(value: &JsonValue) -> Vec<f64> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|v| v.as_f64().unwrap_or(f64::NAN))
                .collect()
        })
        .unwrap_or_default()
}

fn usizes(value: &JsonValue) -> Vec<usize> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(|v| v.as_u64()).map(|v| v as usize).collect())
        .unwrap_or_default()
}

fn offsets(sizes: &[usize]) -> Vec<usize> {
    let mut out = vec![0];
    for size in sizes {
        out.push(out[out.len() - 1] + size);
    }
    out
}

/// Levels as sent on the wire, rendered the way interval keys are.
fn level_keys(level: &JsonValue) -> Vec<(String, f64)> {
    let values: Vec<&JsonValue> = match level {
        JsonValue::Array(items) => items.iter().collect(),
        JsonValue::Null => Vec::new(),
        other => vec![other],
    };
    values
        .into_iter()
        .filter_map(|v| v.as_f64().map(|f| (v.to_string(), f)))
        .collect()
}

fn intervals(mean: &[f64], level: &JsonValue) -> JsonValue {
    let keys = level_keys(level);
    if keys.is_empty() {
        return JsonValue::Null;
    }
    let mut map = serde_json::Map::new();
    for (key, value) in keys {
        let width = value / 100.0;
        map.insert(
            format!("lo-{key}"),
            json!(mean.iter().map(|m| m - width).collect::<Vec<_>>()),
        );
        map.insert(
            format!("hi-{key}"),
            json!(mean.iter().map(|m| m + width).collect::<Vec<_>>()),
        );
    }
    JsonValue::Object(map)
}

fn n_features(series: &JsonValue) -> usize {
    series["X"].as_array().map(Vec::len).unwrap_or(0)
}

fn weights(series: &JsonValue) -> JsonValue {
    match n_features(series) {
        0 => JsonValue::Null,
        n => json!(vec![1.0 / n as f64; n]),
    }
}

/// `last_y + k` for every step `k` of the horizon.
fn forecast(body: &JsonValue) -> JsonValue {
    let series = &body["series"];
    let y = floats(&series["y"]);
    let sizes = usizes(&series["sizes"]);
    let h = body["h"].as_u64().unwrap_or(0) as usize;
    let bounds = offsets(&sizes);
    let mut mean = Vec::with_capacity(sizes.len() * h);
    for i in 0..sizes.len() {
        let last = if bounds[i + 1] > bounds[i] { y[bounds[i + 1] - 1] } else { 0.0 };
        mean.extend((1..=h).map(|k| last + k as f64));
    }
    let contributions = if body["feature_contributions"].as_bool().unwrap_or(false) {
        let rows = n_features(series) + 1;
        json!(vec![vec![0.5; mean.len()]; rows])
    } else {
        JsonValue::Null
    };
    json!({
        "intervals": intervals(&mean, &body["level"]),
        "weights_x": weights(series),
        "feature_contributions": contributions,
        "mean": mean,
    })
}

/// Echoes every observation after the first one of each series.
fn in_sample(body: &JsonValue) -> (Vec<f64>, Vec<usize>) {
    let series = &body["series"];
    let y = floats(&series["y"]);
    let sizes = usizes(&series["sizes"]);
    let bounds = offsets(&sizes);
    let mut mean = Vec::new();
    let mut out_sizes = Vec::with_capacity(sizes.len());
    for i in 0..sizes.len() {
        let n = sizes[i].saturating_sub(1);
        mean.extend_from_slice(&y[bounds[i + 1] - n..bounds[i + 1]]);
        out_sizes.push(n);
    }
    (mean, out_sizes)
}

fn historic_forecast(body: &JsonValue) -> JsonValue {
    let (mean, sizes) = in_sample(body);
    let contributions = if body["feature_contributions"].as_bool().unwrap_or(false) {
        let rows = n_features(&body["series"]) + 1;
        json!(vec![vec![0.25; mean.len()]; rows])
    } else {
        JsonValue::Null
    };
    json!({
        "intervals": intervals(&mean, &body["level"]),
        "weights_x": weights(&body["series"]),
        "feature_contributions": contributions,
        "sizes": sizes,
        "mean": mean,
    })
}

/// Flags observations above 100.
fn anomaly_detection(body: &JsonValue) -> JsonValue {
    let (mean, sizes) = in_sample(body);
    let anomaly: Vec<bool> = mean.iter().map(|v| *v > 100.0).collect();
    json!({
        "intervals": intervals(&mean, &body["level"]),
        "weights_x": weights(&body["series"]),
        "anomaly_score": vec![0.0; mean.len()],
        "anomaly": anomaly,
        "sizes": sizes,
        "mean": mean,
    })
}

fn online_anomaly_detection(body: &JsonValue) -> JsonValue {
    let series = &body["series"];
    let y = floats(&series["y"]);
    let sizes = usizes(&series["sizes"]);
    let detection_size = body["detection_size"].as_u64().unwrap_or(1) as usize;
    let bounds = offsets(&sizes);
    let mut idxs = Vec::new();
    let mut out_sizes = Vec::with_capacity(sizes.len());
    for i in 0..sizes.len() {
        let n = detection_size.min(sizes[i]);
        idxs.extend(bounds[i + 1] - n..bounds[i + 1]);
        out_sizes.push(n);
    }
    let mean: Vec<f64> = idxs.iter().map(|&i| y[i]).collect();
    let mut out = json!({
        "intervals": intervals(&mean, &body["level"]),
        "anomaly": mean.iter().map(|v| *v > 100.0).collect::<Vec<_>>(),
        "anomaly_score": vec![0.1; mean.len()],
        "sizes": out_sizes,
        "idxs": idxs,
        "mean": mean,
    });
    if body["threshold_method"] == "multivariate" {
        out["accumulated_anomaly_score"] = json!(vec![0.2; idxs.len()]);
    }
    out
}

/// Windows of `h` rows ending `step_size * w` rows before each series end.
fn cross_validation(body: &JsonValue) -> JsonValue {
    let series = &body["series"];
    let y = floats(&series["y"]);
    let sizes = usizes(&series["sizes"]);
    let h = body["h"].as_u64().unwrap_or(1) as usize;
    let n_windows = body["n_windows"].as_u64().unwrap_or(1) as usize;
    let step_size = body["step_size"].as_u64().unwrap_or(h as u64) as usize;
    let bounds = offsets(&sizes);
    let mut idxs = Vec::new();
    let mut out_sizes = Vec::with_capacity(sizes.len());
    for i in 0..sizes.len() {
        for w in (0..n_windows).rev() {
            let end = bounds[i + 1] - step_size * w;
            idxs.extend(end - h..end);
        }
        out_sizes.push(h * n_windows);
    }
    let mean: Vec<f64> = idxs.iter().map(|&i| y[i] + 0.5).collect();
    json!({
        "intervals": intervals(&mean, &body["level"]),
        "sizes": out_sizes,
        "idxs": idxs,
        "mean": mean,
    })
}

fn finetuned_model(id: &str) -> JsonValue {
    json!({
        "id": id,
        "created_at": "2024-05-01T10:00:00Z",
        "created_by": "user",
        "base_model_id": "timegpt-1",
        "steps": 10,
        "depth": 1,
        "loss": "default",
        "model": "timegpt-1",
        "freq": "D",
    })
}

impl Transport for StubTransport {
    async fn post(&self, path: &str, body: OutgoingBody) -> Result<RawResponse> {
        let payload = decode_body(&body);
        self.record("POST", path, &[], Some(payload.clone()));
        if let Some(scripted) = self.scripted.lock().expect("scripted").pop_front() {
            return Ok(scripted);
        }
        let answer = match path {
            "model_params" => self.model_params(),
            "v2/forecast" => forecast(&payload),
            "v2/historic_forecast" => historic_forecast(&payload),
            "v2/anomaly_detection" => anomaly_detection(&payload),
            "v2/online_anomaly_detection" => online_anomaly_detection(&payload),
            "v2/cross_validation" => cross_validation(&payload),
            "v2/finetune" => {
                let id = payload["output_model_id"].as_str().unwrap_or("ft-generated");
                json!({"finetuned_model_id": id})
            }
            _ => return Ok(reply(404, json!({"detail": "Not Found"}))),
        };
        Ok(reply(200, answer))
    }

    async fn get(&self, path: &str, query: &[(String, String)]) -> Result<RawResponse> {
        self.record("GET", path, query, None);
        Ok(match path {
            "model_params" => reply(200, self.model_params()),
            "validate_api_key" if self.api_key_valid => reply(200, json!({"detail": "API key is valid"})),
            "validate_api_key" => reply(401, json!({"detail": "Invalid API key"})),
            "usage" => reply(
                200,
                json!({"minute": {"requests": 3, "limit": 100}, "month": {"requests": 40, "limit": 1000}}),
            ),
            "v2/finetuned_models" => reply(
                200,
                json!({"finetuned_models": [finetuned_model("ft-1"), finetuned_model("ft-2")]}),
            ),
            other => match other.strip_prefix("v2/finetuned_models/") {
                Some(id) => reply(200, finetuned_model(id)),
                None => reply(404, json!({"detail": "Not Found"})),
            },
        })
    }

    async fn delete(&self, path: &str) -> Result<RawResponse> {
        self.record("DELETE", path, &[], None);
        Ok(RawResponse {
            status: 204,
            body: Bytes::new(),
        })
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig::new("test-key")
        .with_base_url("http://stub.invalid")
        .with_max_retries(3)
}

pub fn day(d: u32) -> chrono::NaiveDateTime {
    chrono::NaiveDate::from_ymd_opt(2024, 1, d)
        .expect("date")
        .and_hms_opt(0, 0, 0)
        .expect("time")
}

/// Daily panel; each entry is `(id, first day, targets)`.
pub fn daily_panel(series: &[(&str, u32, &[f64])]) -> Frame {
    let mut ids = Vec::new();
    let mut times = Vec::new();
    let mut targets = Vec::new();
    for (id, start, values) in series {
        for (k, value) in values.iter().enumerate() {
            ids.push(id.to_string());
            times.push(day(start + k as u32));
            targets.push(*value);
        }
    }
    Frame::from_columns(vec![
        ("unique_id".to_string(), Column::Str(ids)),
        ("ds".to_string(), Column::Datetime(times)),
        ("y".to_string(), Column::Float(targets)),
    ])
    .expect("panel")
}
