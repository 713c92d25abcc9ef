//! Wire encoding, compression and the HTTP seam to the service.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::io::Write;
use std::time::Duration;

use crate::error::{ApiError, ClientError, Result};

const MAX_PAYLOAD_MB: f64 = 200.0;
const COMPRESSION_THRESHOLD_MB: f64 = 1.0;
const ZSTD_LEVEL: i32 = 1;
const BYTES_PER_MB: f64 = (1 << 20) as f64;

/// Status and raw body of a finished HTTP exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Serialized request body, possibly zstd-compressed.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingBody {
    pub content: Bytes,
    pub zstd: bool,
}

/// Seam between the client and the remote engine.
pub trait Transport: Send + Sync {
    fn post(&self, path: &str, body: OutgoingBody)
        -> impl Future<Output = Result<RawResponse>> + Send;

    fn get(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> impl Future<Output = Result<RawResponse>> + Send;

    fn delete(&self, path: &str) -> impl Future<Output = Result<RawResponse>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, api_key: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ClientError::configuration("api key contains invalid header characters"))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

impl Transport for HttpTransport {
    async fn post(&self, path: &str, body: OutgoingBody) -> Result<RawResponse> {
        let mut request = self.client.post(self.url(path)).body(body.content);
        if body.zstd {
            request = request.header("content-encoding", "zstd");
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        Ok(RawResponse {
            status,
            body: response.bytes().await?,
        })
    }

    async fn get(&self, path: &str, query: &[(String, String)]) -> Result<RawResponse> {
        let response = self.client.get(self.url(path)).query(query).send().await?;
        let status = response.status().as_u16();
        Ok(RawResponse {
            status,
            body: response.bytes().await?,
        })
    }

    async fn delete(&self, path: &str) -> Result<RawResponse> {
        let response = self
            .client
            .delete(self.url(path))
            .header("accept-encoding", "identity")
            .send()
            .await?;
        let status = response.status().as_u16();
        Ok(RawResponse {
            status,
            body: response.bytes().await?,
        })
    }
}

/// `f64` to wire `f32`: `NaN` stays `NaN`, out-of-range values clamp to the
/// finite `f32` bounds.
pub fn to_wire_f32(value: f64) -> f32 {
    value.clamp(f32::MIN as f64, f32::MAX as f64) as f32
}

pub fn serialize_f32_values<S: Serializer>(
    values: &[f64],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let mut seq = serializer.serialize_seq(Some(values.len()))?;
    for value in values {
        seq.serialize_element(&to_wire_f32(*value))?;
    }
    seq.end()
}

pub fn serialize_f32_matrix<S: Serializer>(
    matrix: &[Vec<f64>],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    struct Row<'a>(&'a [f64]);

    impl Serialize for Row<'_> {
        fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
            serialize_f32_values(self.0, serializer)
        }
    }

    let mut seq = serializer.serialize_seq(Some(matrix.len()))?;
    for row in matrix {
        seq.serialize_element(&Row(row))?;
    }
    seq.end()
}

/// Serializes `payload`, refusing bodies above 200 MiB and compressing
/// bodies above 1 MiB.
pub fn encode_body<P: Serialize>(payload: &P, multithreaded_compress: bool) -> Result<OutgoingBody> {
    let content = serde_json::to_vec(payload)?;
    if !needs_compression(content.len())? {
        return Ok(OutgoingBody {
            content: Bytes::from(content),
            zstd: false,
        });
    }
    let compressed = compress(&content, multithreaded_compress).map_err(ClientError::Compression)?;
    Ok(OutgoingBody {
        content: Bytes::from(compressed),
        zstd: true,
    })
}

/// Whether a body of `len` bytes is compressed; bodies over the size
/// ceiling are refused with the partition count that would fit.
fn needs_compression(len: usize) -> Result<bool> {
    let size_mb = len as f64 / BYTES_PER_MB;
    if size_mb > MAX_PAYLOAD_MB {
        return Err(ClientError::configuration(format!(
            "The payload is too large. Set num_partitions={}",
            (size_mb / MAX_PAYLOAD_MB).ceil() as usize
        )));
    }
    Ok(size_mb > COMPRESSION_THRESHOLD_MB)
}

fn compress(content: &[u8], multithreaded: bool) -> std::io::Result<Vec<u8>> {
    let mut encoder = zstd::Encoder::new(Vec::with_capacity(content.len() / 2), ZSTD_LEVEL)?;
    if multithreaded {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        encoder.multithread(workers)?;
    }
    encoder.write_all(content)?;
    encoder.finish()
}

/// Parses a service reply: non-JSON bodies and non-200 statuses become
/// [`ApiError`]s and a `{"data": ...}` envelope is unwrapped.
pub fn parse_response(raw: &RawResponse) -> Result<JsonValue> {
    let mut bytes = raw.body.to_vec();
    let body: JsonValue = match simd_json::serde::from_slice(&mut bytes) {
        Ok(body) => body,
        Err(_) => {
            return Err(ApiError::new(
                raw.status,
                JsonValue::String(format!(
                    "Could not parse JSON: {}",
                    String::from_utf8_lossy(&raw.body)
                )),
            )
            .into())
        }
    };
    if raw.status != 200 {
        return Err(ApiError::new(raw.status, body).into());
    }
    Ok(match body {
        JsonValue::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(JsonValue::Null)
        }
        other => other,
    })
}

pub fn decode<R: DeserializeOwned>(body: JsonValue) -> Result<R> {
    serde_json::from_value(body).map_err(|err| ClientError::UnexpectedResponse(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_floats_keep_nan_and_clamp_infinities() {
        assert!(to_wire_f32(f64::NAN).is_nan());
        assert_eq!(to_wire_f32(f64::INFINITY), f32::MAX);
        assert_eq!(to_wire_f32(f64::NEG_INFINITY), f32::MIN);
        assert_eq!(to_wire_f32(1e300), f32::MAX);
        assert_eq!(to_wire_f32(0.5), 0.5);
    }

    #[test]
    fn small_bodies_are_sent_plain() {
        let body = encode_body(&json!({"y": [1, 2, 3]}), true).unwrap();
        assert!(!body.zstd);
        assert_eq!(&body.content[..], br#"{"y":[1,2,3]}"#);
    }

    #[test]
    fn large_bodies_are_zstd_compressed() {
        let values = vec![1.25f64; 300_000];
        let body = encode_body(&json!({ "y": values }), false).unwrap();
        assert!(body.zstd);
        let decoded = zstd::decode_all(&body.content[..]).unwrap();
        let parsed: JsonValue = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(parsed["y"].as_array().unwrap().len(), 300_000);
    }

    #[test]
    fn compression_starts_just_above_one_mebibyte() {
        // `{"s":""}` wraps the string with 8 bytes.
        let at_limit = json!({ "s": "a".repeat((1 << 20) - 8) });
        let body = encode_body(&at_limit, false).unwrap();
        assert_eq!(body.content.len(), 1 << 20);
        assert!(!body.zstd);

        let over = json!({ "s": "a".repeat((1 << 20) - 7) });
        let body = encode_body(&over, false).unwrap();
        assert!(body.zstd);
        assert!(body.content.len() < 1 << 20);
    }

    #[test]
    fn oversized_payloads_name_the_partition_count() {
        let mib = 1usize << 20;
        assert!(!needs_compression(mib).unwrap());
        assert!(needs_compression(mib + 1).unwrap());
        assert!(needs_compression(200 * mib).unwrap());
        match needs_compression(450 * mib) {
            Err(ClientError::Configuration(message)) => {
                assert!(message.contains("num_partitions=3"), "{message}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            needs_compression(200 * mib + 1),
            Err(ClientError::Configuration(_))
        ));
    }

    #[test]
    fn non_json_bodies_become_api_errors() {
        let raw = RawResponse {
            status: 502,
            body: Bytes::from_static(b"<html>bad gateway</html>"),
        };
        match parse_response(&raw).unwrap_err() {
            ClientError::Api(err) => {
                assert_eq!(err.status_code, Some(502));
                assert!(err.body.as_str().unwrap().starts_with("Could not parse JSON"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn error_statuses_carry_the_parsed_body() {
        let raw = RawResponse {
            status: 422,
            body: Bytes::from_static(br#"{"detail":"bad freq"}"#),
        };
        match parse_response(&raw).unwrap_err() {
            ClientError::Api(err) => assert_eq!(err.body, json!({"detail": "bad freq"})),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn data_envelopes_are_unwrapped() {
        let raw = RawResponse {
            status: 200,
            body: Bytes::from_static(br#"{"data":{"mean":[1.0]},"message":"ok"}"#),
        };
        assert_eq!(parse_response(&raw).unwrap(), json!({"mean": [1.0]}));
    }
}
