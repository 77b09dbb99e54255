//! Canonical request shape shared by the pipeline, the dedupe cache and every transport.

use std::{sync::Arc, time::Duration};

use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Method, Url,
};
use serde_json::{Map, Value};

use crate::{
    credentials::CredentialProvider,
    errors::{Error, Result},
    http::{HeaderList, RequestOptions},
    REQUEST_ID_HEADER,
};

/// Rewrites params/body before they become part of the request identity.
pub trait ParamProcessor: Send + Sync {
    fn process(&self, value: Value) -> Value;
}

/// Removes `null` object fields at every depth.
#[derive(Clone, Copy, Debug, Default)]
pub struct StripNulls;

impl ParamProcessor for StripNulls {
    fn process(&self, value: Value) -> Value {
        strip_nulls(value)
    }
}

/// Leaves values untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct Passthrough;

impl ParamProcessor for Passthrough {
    fn process(&self, value: Value) -> Value {
        value
    }
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

/// A fully normalized request.
///
/// Built once by [`DescriptorBuilder`]; interceptors receive it by value and hand
/// back a (possibly modified) replacement.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    method: Method,
    url: Url,
    base_url: String,
    timeout: Option<Duration>,
    params: Option<Value>,
    body: Option<Value>,
    headers: HeaderMap,
    options: RequestOptions,
}

impl RequestDescriptor {
    pub fn builder(method: Method, url: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            method,
            url: url.into(),
            params: None,
            body: None,
            options: RequestOptions::default(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Full URL including the serialized query string.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// URL path, used in error messages so failures can be tied to an endpoint.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn params(&self) -> Option<&Value> {
        self.params.as_ref()
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Identity used to coalesce concurrent identical calls.
    pub fn dedupe_key(&self) -> String {
        let body = self
            .body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        format!("{} {} {}", self.method, self.url, body)
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value)
            .map_err(|err| Error::Config(format!("invalid header value: {err}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn serialized_body(&self) -> Result<Option<Vec<u8>>> {
        match &self.body {
            Some(body) => Ok(Some(serde_json::to_vec(body)?)),
            None => Ok(None),
        }
    }
}

/// Collaborators and defaults the builder resolves against.
pub struct BuildContext<'a> {
    pub base_url: &'a str,
    /// Applied when the call has no explicit timeout. `None` for streams.
    pub default_timeout: Option<Duration>,
    pub processor: &'a dyn ParamProcessor,
    pub default_headers: Option<&'a HeaderList>,
    pub credentials: &'a Arc<dyn CredentialProvider>,
    pub accept: &'static str,
}

/// Caller-facing input for a [`RequestDescriptor`].
#[derive(Clone, Debug)]
pub struct DescriptorBuilder {
    method: Method,
    url: String,
    params: Option<Value>,
    body: Option<Value>,
    options: RequestOptions,
}

impl DescriptorBuilder {
    pub fn params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Resolve the descriptor.
    ///
    /// The credential check runs here, synchronously, so an unauthenticated call never
    /// reaches an interceptor or the network.
    pub fn build(self, ctx: &BuildContext<'_>) -> Result<RequestDescriptor> {
        let credential = ctx.credentials.get();
        if self.options.require_auth && credential.is_none() {
            return Err(Error::AuthRequired {
                path: path_of(&self.url),
            });
        }

        let params = self.params.map(|p| ctx.processor.process(p));
        let body = self.body.map(|b| ctx.processor.process(b));

        let mut url = resolve_url(ctx.base_url, &self.url)?;
        if let Some(Value::Object(map)) = &params {
            append_query(&mut url, map);
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ctx.accept));
        if body.is_some() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        if let Some(token) = credential.filter(|_| same_origin(ctx.base_url, &url)) {
            let bearer = token
                .trim()
                .strip_prefix("Bearer ")
                .unwrap_or(token.trim())
                .to_string();
            let value = HeaderValue::from_str(&format!("Bearer {bearer}"))
                .map_err(|err| Error::Config(format!("invalid credential: {err}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(req_id) = self.options.request_id.as_deref() {
            if !req_id.trim().is_empty() {
                let value = HeaderValue::from_str(req_id.trim())
                    .map_err(|err| Error::Config(format!("invalid request id: {err}")))?;
                headers.insert(REQUEST_ID_HEADER, value);
            }
        }
        if let Some(defaults) = ctx.default_headers {
            defaults.apply_to(&mut headers)?;
        }
        self.options.headers.apply_to(&mut headers)?;

        Ok(RequestDescriptor {
            method: self.method,
            url,
            base_url: ctx.base_url.to_string(),
            timeout: self.options.timeout.or(ctx.default_timeout),
            params,
            body,
            headers,
            options: self.options,
        })
    }
}

/// The stored credential only travels to the configured API origin.
fn same_origin(base: &str, url: &Url) -> bool {
    Url::parse(base).is_ok_and(|base| base.origin() == url.origin())
}

fn is_absolute(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

pub(crate) fn resolve_url(base: &str, url: &str) -> Result<Url> {
    let full = if is_absolute(url) {
        url.to_string()
    } else if url.is_empty() {
        base.to_string()
    } else {
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            url.trim_start_matches('/')
        )
    };
    Url::parse(&full).map_err(|err| Error::Config(format!("invalid url {full:?}: {err}")))
}

fn path_of(url: &str) -> String {
    if is_absolute(url) {
        if let Ok(parsed) = Url::parse(url) {
            return parsed.path().to_string();
        }
    }
    let path = url.split('?').next().unwrap_or(url);
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn append_query(url: &mut Url, params: &Map<String, Value>) {
    if params.is_empty() {
        return;
    }
    let mut pairs = url.query_pairs_mut();
    for (key, value) in params {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    pairs.append_pair(key, &query_scalar(item));
                }
            }
            other => {
                pairs.append_pair(key, &query_scalar(other));
            }
        }
    }
}

fn query_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::credentials::MemoryCredentials;

    fn ctx<'a>(creds: &'a Arc<dyn CredentialProvider>) -> BuildContext<'a> {
        BuildContext {
            base_url: "https://api.example.com/api/v1/",
            default_timeout: Some(Duration::from_secs(60)),
            processor: &StripNulls,
            default_headers: None,
            credentials: creds,
            accept: "application/json",
        }
    }

    #[test]
    fn joins_base_and_relative_url() {
        let creds: Arc<dyn CredentialProvider> = Arc::new(MemoryCredentials::default());
        let desc = RequestDescriptor::builder(Method::GET, "/models")
            .build(&ctx(&creds))
            .unwrap();
        assert_eq!(desc.url().as_str(), "https://api.example.com/api/v1/models");
        assert_eq!(desc.path(), "/api/v1/models");
        assert_eq!(desc.timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn absolute_url_bypasses_base() {
        let creds: Arc<dyn CredentialProvider> = Arc::new(MemoryCredentials::default());
        let desc = RequestDescriptor::builder(Method::GET, "http://other.local/x")
            .build(&ctx(&creds))
            .unwrap();
        assert_eq!(desc.url().as_str(), "http://other.local/x");
    }

    #[test]
    fn params_are_stripped_and_sorted_into_query() {
        let creds: Arc<dyn CredentialProvider> = Arc::new(MemoryCredentials::default());
        let desc = RequestDescriptor::builder(Method::GET, "chats")
            .params(json!({"page": 2, "q": "hi there", "missing": null, "tag": ["a", "b"]}))
            .build(&ctx(&creds))
            .unwrap();
        assert_eq!(
            desc.url().query(),
            Some("page=2&q=hi+there&tag=a&tag=b")
        );
    }

    #[test]
    fn dedupe_key_ignores_null_fields() {
        let creds: Arc<dyn CredentialProvider> = Arc::new(MemoryCredentials::default());
        let a = RequestDescriptor::builder(Method::POST, "/chat")
            .body(json!({"model": "m", "temperature": null}))
            .build(&ctx(&creds))
            .unwrap();
        let b = RequestDescriptor::builder(Method::POST, "/chat")
            .body(json!({"model": "m"}))
            .build(&ctx(&creds))
            .unwrap();
        assert_eq!(a.dedupe_key(), b.dedupe_key());
        let c = RequestDescriptor::builder(Method::PUT, "/chat")
            .body(json!({"model": "m"}))
            .build(&ctx(&creds))
            .unwrap();
        assert_ne!(a.dedupe_key(), c.dedupe_key());
    }

    #[test]
    fn require_auth_fails_without_credential() {
        let creds: Arc<dyn CredentialProvider> = Arc::new(MemoryCredentials::default());
        let err = RequestDescriptor::builder(Method::GET, "/me?x=1")
            .options(RequestOptions::default().require_auth())
            .build(&ctx(&creds))
            .unwrap_err();
        match err {
            Error::AuthRequired { path } => assert_eq!(path, "/me"),
            other => panic!("expected auth error, got {other:?}"),
        }
    }

    #[test]
    fn credential_stays_on_the_api_origin() {
        let creds: Arc<dyn CredentialProvider> = Arc::new(MemoryCredentials::new("session"));
        let same = RequestDescriptor::builder(Method::GET, "https://api.example.com/other")
            .build(&ctx(&creds))
            .unwrap();
        assert_eq!(same.headers().get(AUTHORIZATION).unwrap(), "Bearer session");

        let foreign =
            RequestDescriptor::builder(Method::POST, "https://vendor.example/v1/messages")
                .build(&ctx(&creds))
                .unwrap();
        assert!(foreign.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn credential_becomes_bearer_header() {
        let creds: Arc<dyn CredentialProvider> = Arc::new(MemoryCredentials::new("Bearer tok_1"));
        let desc = RequestDescriptor::builder(Method::GET, "/me")
            .options(RequestOptions::default().require_auth())
            .build(&ctx(&creds))
            .unwrap();
        assert_eq!(desc.headers().get(AUTHORIZATION).unwrap(), "Bearer tok_1");
    }
}
