//! Response envelope and the status/business-code classifier.

use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{BusinessError, Error, HttpError, Result};

/// Uniform `{code, data, message}` wrapper around every non-streaming response.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(bound(deserialize = "T: Deserialize<'de> + Default"))]
pub struct ResponseEnvelope<T = Value> {
    pub code: i64,
    #[serde(default)]
    pub data: T,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Business codes with fixed meaning. Everything else is an application error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusinessCodes {
    pub success: i64,
    pub unauthorized: i64,
}

impl Default for BusinessCodes {
    fn default() -> Self {
        Self {
            success: 200,
            unauthorized: 401,
        }
    }
}

/// Global observation hook invoked with every parsed envelope on a 2xx response.
pub type BusinessHook = Arc<dyn Fn(&ResponseEnvelope) + Send + Sync>;

/// Parsed response handed to response interceptors and returned to callers.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Value,
    pub request_id: Option<String>,
}

impl ApiResponse {
    /// Interpret the body as an envelope.
    pub fn envelope(&self) -> Result<ResponseEnvelope> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Interpret the body as an envelope with typed `data`.
    pub fn envelope_as<T: DeserializeOwned + Default>(&self) -> Result<ResponseEnvelope<T>> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Deserialize the envelope's `data` field.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self.body.get("data").cloned().unwrap_or(Value::Null);
        Ok(serde_json::from_value(data)?)
    }
}

/// Decode a buffered body. Empty bodies become `null`; non-JSON bodies become a string.
pub(crate) fn parse_body(body: &Bytes) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// Inputs to [`classify`] besides the response itself.
pub struct Classification<'a> {
    pub request_path: &'a str,
    pub skip_business_check: bool,
    pub codes: BusinessCodes,
    pub hook: Option<&'a BusinessHook>,
}

/// Route a response into success, HTTP error or business error.
pub fn classify(status: u16, body: &Value, rules: &Classification<'_>) -> Result<()> {
    let envelope_path = body
        .get("path")
        .and_then(Value::as_str)
        .map(str::to_string);

    if !(200..300).contains(&status) {
        let mut err = HttpError::new(
            status,
            envelope_path.or_else(|| Some(rules.request_path.to_string())),
        );
        if !body.is_null() {
            err.raw_body = Some(match body {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
        return Err(err.into());
    }

    let envelope = serde_json::from_value::<ResponseEnvelope>(body.clone()).ok();
    if let (Some(hook), Some(envelope)) = (rules.hook, envelope.as_ref()) {
        hook(envelope);
    }

    if rules.skip_business_check {
        return Ok(());
    }

    let Some(envelope) = envelope else {
        return Err(Error::Decode {
            message: "response is not a {code, data, message} envelope".to_string(),
            path: Some(rules.request_path.to_string()),
        });
    };

    if envelope.code == rules.codes.success {
        return Ok(());
    }

    let message = if envelope.message.trim().is_empty() {
        format!("Request failed (code {})", envelope.code)
    } else {
        envelope.message
    };
    Err(BusinessError {
        code: envelope.code,
        message,
        path: envelope.path.or_else(|| Some(rules.request_path.to_string())),
        unauthorized: envelope.code == rules.codes.unauthorized,
    }
    .into())
}
