//! Invocation boundary
//!
//! Turns the event shapes a function-style deployment receives into one
//! [`CutoutRequest`], and a pipeline result (or error) back into an HTTP-style
//! [`InvocationResponse`]. Accepted shapes:
//!
//! - a direct JSON payload (`{"image_url": ...}`)
//! - a proxy event whose `body` is a JSON string, base64 encoded when
//!   `isBase64Encoded` is set
//! - a proxy event with an `application/json` body carrying `imageBase64`
//!   (plus optional `s3Key` and `bucket`)
//! - a raw binary body with `x-s3-key` / `x-s3-bucket` headers
//! - `s3_url` or `bucket` + `key` object sources

use crate::config::TuningOverrides;
use crate::error::{CutoutError, Result};
use crate::input::ImageSource;
use crate::pipeline::{CutoutPipeline, CutoutRequest};
use crate::sink::{ObjectTarget, PNG_CONTENT_TYPE};
use crate::types::{CutoutOutcome, Reference};
use base64::{engine::general_purpose, Engine};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// HTTP-style response in the shape proxy integrations expect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub is_base64_encoded: bool,
}

impl InvocationResponse {
    fn json(status_code: u16, body: &Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), JSON_CONTENT_TYPE.to_string());
        Self {
            status_code,
            headers,
            body: body.to_string(),
            is_base64_encoded: false,
        }
    }

    /// `{ error, detail }` body for a failed invocation
    #[must_use]
    pub fn from_error(err: &CutoutError) -> Self {
        Self::json(
            err.status_code(),
            &json!({ "error": err.kind(), "detail": err.to_string() }),
        )
    }

    /// Response body parsed as JSON, `None` for binary responses
    #[must_use]
    pub fn json_body(&self) -> Option<Value> {
        if self.is_base64_encoded {
            return None;
        }
        serde_json::from_str(&self.body).ok()
    }
}

fn lowercase_headers(event: &Map<String, Value>) -> BTreeMap<String, String> {
    event
        .get("headers")
        .and_then(Value::as_object)
        .map(|headers| {
            headers
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.to_ascii_lowercase(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn decode_base64(field: &str, data: &str) -> Result<Vec<u8>> {
    // tolerate data URLs
    let data = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| CutoutError::input(format!("{field} is not valid base64: {e}")))
}

/// First non-null value among `names`
fn field<'a>(payload: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .find_map(|name| payload.get(*name).filter(|v| !v.is_null()))
}

fn string_field(payload: &Map<String, Value>, names: &[&str]) -> Result<Option<String>> {
    match field(payload, names) {
        None => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(other) => Err(CutoutError::input(format!(
            "{} must be a string, got {other}",
            names[0]
        ))),
    }
}

/// Numbers may arrive as JSON numbers or numeric strings
fn number_field<T: std::str::FromStr>(
    payload: &Map<String, Value>,
    names: &[&str],
) -> Result<Option<T>> {
    let Some(value) = field(payload, names) else {
        return Ok(None);
    };
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    text.parse().map(Some).map_err(|_| {
        CutoutError::input(format!("{} must be a number, got {value}", names[0]))
    })
}

fn bool_field(payload: &Map<String, Value>, names: &[&str]) -> Result<Option<bool>> {
    match field(payload, names) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::Number(n)) => Ok(Some(n.as_f64().unwrap_or(0.0) != 0.0)),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(CutoutError::input(format!(
                "{} must be a boolean, got '{s}'",
                names[0]
            ))),
        },
        Some(other) => Err(CutoutError::input(format!(
            "{} must be a boolean, got {other}",
            names[0]
        ))),
    }
}

fn parsed_field<T>(payload: &Map<String, Value>, names: &[&str]) -> Result<Option<T>>
where
    T: std::str::FromStr<Err = CutoutError>,
{
    string_field(payload, names)?
        .map(|s| s.parse().map_err(|e: CutoutError| CutoutError::input(e.to_string())))
        .transpose()
}

/// `[x, y]` or `{"x": .., "y": ..}`
fn point_field(payload: &Map<String, Value>) -> Result<Option<(f32, f32)>> {
    let Some(value) = field(payload, &["point"]) else {
        return Ok(None);
    };
    let coords = match value {
        Value::Array(items) if items.len() == 2 => (items[0].as_f64(), items[1].as_f64()),
        Value::Object(obj) => (
            obj.get("x").and_then(Value::as_f64),
            obj.get("y").and_then(Value::as_f64),
        ),
        _ => (None, None),
    };
    match coords {
        (Some(x), Some(y)) => Ok(Some((x as f32, y as f32))),
        _ => Err(CutoutError::input(format!(
            "point must be [x, y] in pixels, got {value}"
        ))),
    }
}

fn overrides(payload: &Map<String, Value>) -> Result<TuningOverrides> {
    Ok(TuningOverrides {
        conf: number_field(payload, &["conf"])?,
        iou: number_field(payload, &["iou"])?,
        max_det: number_field(payload, &["max_det"])?,
        imgsz: number_field(payload, &["imgsz"])?,
        retina_masks: bool_field(payload, &["retina_masks"])?,
        point: point_field(payload)?,
        policy: parsed_field(payload, &["policy"])?,
        scope: parsed_field(payload, &["scope"])?,
        return_mode: parsed_field(payload, &["return_mode", "return"])?,
        presign_expires: number_field(payload, &["presign_expires"])?,
    })
}

/// Build a request from a JSON payload
///
/// `bytes` carries an image that arrived outside the payload (binary body).
fn request_from_payload(
    payload: &Map<String, Value>,
    headers: &BTreeMap<String, String>,
    bytes: Option<Vec<u8>>,
) -> Result<CutoutRequest> {
    let url = string_field(payload, &["image_url"])?;
    let s3_url = string_field(payload, &["s3_url"])?;
    let inline = match string_field(payload, &["image_bytes", "imageBase64"])? {
        Some(data) => Some(decode_base64("image_bytes", &data)?),
        None => bytes,
    };
    let bucket = string_field(payload, &["bucket"])?;
    let key = string_field(payload, &["key"])?;

    if url.is_some() && inline.is_some() {
        return Err(CutoutError::input(
            "image_url and image_bytes are mutually exclusive",
        ));
    }
    if url.is_some() && s3_url.is_some() {
        return Err(CutoutError::input("image_url and s3_url are mutually exclusive"));
    }
    if s3_url.is_some() && inline.is_some() {
        return Err(CutoutError::input("s3_url and image_bytes are mutually exclusive"));
    }

    let mut target = ObjectTarget {
        bucket: string_field(payload, &["output_bucket"])?,
        key: string_field(payload, &["output_key", "s3Key"])?,
    };

    // without another source, `bucket` + `key` name the input object;
    // otherwise they name the destination
    let key_names_source = url.is_none() && s3_url.is_none() && inline.is_none();
    let source = if let Some(url) = url {
        ImageSource::from_reference(&url)?
    } else if let Some(uri) = s3_url {
        ImageSource::from_reference(&uri)?
    } else if let Some(bytes) = inline {
        ImageSource::Bytes(bytes)
    } else if let Some(key) = key.clone() {
        let bucket = bucket.clone().ok_or_else(|| {
            CutoutError::input("bucket is required when key names the source object")
        })?;
        ImageSource::Object(crate::types::ObjectLocation::new(bucket, key))
    } else {
        return Err(CutoutError::input(
            "image_url is required (or s3_url, bucket + key, image_bytes)",
        ));
    };

    if !key_names_source {
        target.bucket = target.bucket.or(bucket);
        target.key = target.key.or(key);
    }
    if target.key.is_none() {
        target.key = headers.get("x-s3-key").filter(|k| !k.is_empty()).cloned();
    }
    if target.bucket.is_none() {
        target.bucket = headers.get("x-s3-bucket").filter(|b| !b.is_empty()).cloned();
    }
    target.validate()?;

    Ok(CutoutRequest {
        source,
        target,
        overrides: overrides(payload)?,
    })
}

/// Normalize any accepted event shape into a [`CutoutRequest`]
///
/// # Errors
/// - `Input` for malformed bodies, missing or conflicting sources and
///   unparseable tuning values
pub fn decode_event(event: &Value) -> Result<CutoutRequest> {
    let event = event
        .as_object()
        .ok_or_else(|| CutoutError::input("Event must be a JSON object"))?;
    let headers = lowercase_headers(event);

    let body = match event.get("body") {
        None | Some(Value::Null) => return request_from_payload(event, &headers, None),
        Some(Value::Object(payload)) => return request_from_payload(payload, &headers, None),
        Some(Value::String(body)) => body,
        Some(other) => {
            return Err(CutoutError::input(format!(
                "Event body must be a string or object, got {other}"
            )))
        },
    };

    let is_base64 = event
        .get("isBase64Encoded")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let raw = if is_base64 {
        decode_base64("body", body)?
    } else {
        body.as_bytes().to_vec()
    };

    let content_type = headers.get("content-type").map(String::as_str).unwrap_or("");
    let declared_json = content_type.contains("json");
    let declared_binary = content_type.starts_with("image/")
        || content_type.starts_with("application/octet-stream");

    if declared_binary {
        return request_from_payload(&Map::new(), &headers, Some(raw));
    }
    if raw.iter().all(u8::is_ascii_whitespace) {
        return request_from_payload(&Map::new(), &headers, None);
    }
    match serde_json::from_slice::<Value>(&raw) {
        Ok(Value::Object(payload)) => request_from_payload(&payload, &headers, None),
        Ok(_) | Err(_) if declared_json => Err(CutoutError::input(
            "Request body must be a JSON object",
        )),
        _ => request_from_payload(&Map::new(), &headers, Some(raw)),
    }
}

fn reference_json(reference: &Reference) -> Value {
    match reference {
        Reference::Stored { location, url } => json!({
            "bucket": location.bucket,
            "key": location.key,
            "url": url,
        }),
        Reference::Inline { png, copy } => json!({
            "bucket": copy.as_ref().map(|c| c.bucket.clone()),
            "key": copy.as_ref().map(|c| c.key.clone()),
            "url": Value::Null,
            "png_base64": general_purpose::STANDARD.encode(png),
        }),
    }
}

/// A single inline cutout travels as a binary body
fn inline_response(
    png: &[u8],
    copy: Option<&crate::types::ObjectLocation>,
    detected: usize,
) -> InvocationResponse {
    let mut headers = BTreeMap::new();
    headers.insert("Content-Type".to_string(), PNG_CONTENT_TYPE.to_string());
    headers.insert("Cache-Control".to_string(), "no-store".to_string());
    headers.insert("X-Detected-Count".to_string(), detected.to_string());
    if let Some(copy) = copy {
        headers.insert("X-S3-Bucket".to_string(), copy.bucket.clone());
        headers.insert("X-S3-Key".to_string(), copy.key.clone());
        headers.insert("X-S3-URI".to_string(), copy.s3_uri());
    }
    InvocationResponse {
        status_code: 200,
        headers,
        body: general_purpose::STANDARD.encode(png),
        is_base64_encoded: true,
    }
}

/// Render a pipeline outcome as a response
#[must_use]
pub fn outcome_response(outcome: &CutoutOutcome) -> InvocationResponse {
    let diagnostics = outcome.diagnostics();
    match outcome {
        CutoutOutcome::NoDetection { detected_count, .. } => InvocationResponse::json(
            422,
            &json!({
                "error": "no_detection",
                "detected_count": detected_count,
                "config_used": diagnostics.config_used,
            }),
        ),
        CutoutOutcome::Stored {
            references,
            detected_count,
            ..
        } => {
            if let [Reference::Inline { png, copy }] = references.as_slice() {
                return inline_response(png, copy.as_ref(), *detected_count);
            }
            let first = references.first().map(reference_json);
            let pick = |name: &str| {
                first
                    .as_ref()
                    .and_then(|f| f.get(name).cloned())
                    .unwrap_or(Value::Null)
            };
            InvocationResponse::json(
                200,
                &json!({
                    "bucket": pick("bucket"),
                    "key": pick("key"),
                    "url": pick("url"),
                    "results": references.iter().map(reference_json).collect::<Vec<_>>(),
                    "detected_count": detected_count,
                    "passed_through": diagnostics.passed_through,
                    "config_used": diagnostics.config_used,
                    "timings": diagnostics.timings,
                }),
            )
        },
    }
}

/// Run one event through the pipeline; never fails, errors become responses
pub async fn handle(pipeline: &CutoutPipeline, event: &Value) -> InvocationResponse {
    let result = match decode_event(event) {
        Ok(request) => {
            info!("Invocation for {}", describe(&request.source));
            pipeline.run(&request).await
        },
        Err(err) => Err(err),
    };

    match result {
        Ok(outcome) => outcome_response(&outcome),
        Err(err) => {
            if err.is_client_error() {
                warn!("Rejected invocation ({}): {err}", err.kind());
            } else {
                error!("Invocation failed ({}): {err}", err.kind());
            }
            InvocationResponse::from_error(&err)
        },
    }
}

fn describe(source: &ImageSource) -> String {
    match source {
        ImageSource::Url(url) => url.clone(),
        ImageSource::Object(location) => location.s3_uri(),
        ImageSource::Bytes(bytes) => format!("{} inline bytes", bytes.len()),
    }
}
