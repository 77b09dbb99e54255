use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::{
    errors::{Error, Result},
    vendor_stream::StreamFormat,
    REQUEST_ID_HEADER,
};

/// Per-call options layered over the client [`Config`](crate::Config).
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub request_id: Option<String>,
    pub headers: HeaderList,
    /// Overall deadline. Plain calls fall back to the client timeout; streams have none by default.
    pub timeout: Option<Duration>,
    /// Streaming only: maximum gap between two fragments.
    pub idle_timeout: Option<Duration>,
    /// Overrides `Config::dedupe` for this call.
    pub dedupe: Option<bool>,
    pub require_auth: bool,
    pub skip_request_interceptors: bool,
    pub skip_response_interceptors: bool,
    pub skip_error_interceptors: bool,
    pub skip_business_check: bool,
    /// Streaming only: payload dialect the decoder expects.
    pub stream_format: StreamFormat,
}

impl RequestOptions {
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(HeaderEntry::new(key.into(), value.into()));
        self
    }

    /// Override the overall request timeout for this call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe = Some(dedupe);
        self
    }

    /// Fail fast with [`Error::AuthRequired`] when no credential is stored.
    pub fn require_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }

    /// Bypass every interceptor chain. Used by infrastructure calls such as token refresh.
    pub fn skip_interceptors(mut self) -> Self {
        self.skip_request_interceptors = true;
        self.skip_response_interceptors = true;
        self.skip_error_interceptors = true;
        self
    }

    pub fn skip_request_interceptors(mut self) -> Self {
        self.skip_request_interceptors = true;
        self
    }

    pub fn skip_response_interceptors(mut self) -> Self {
        self.skip_response_interceptors = true;
        self
    }

    pub fn skip_error_interceptors(mut self) -> Self {
        self.skip_error_interceptors = true;
        self
    }

    pub fn skip_business_check(mut self) -> Self {
        self.skip_business_check = true;
        self
    }

    pub fn with_stream_format(mut self, format: StreamFormat) -> Self {
        self.stream_format = format;
        self
    }
}

/// Structured header list with validation.
#[derive(Clone, Debug, Default)]
pub struct HeaderList(Vec<HeaderEntry>);

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Add a header entry.
    ///
    /// # Panics
    /// Panics if the header key or value is empty or contains only whitespace.
    /// This is a fail-fast behavior to catch configuration errors early.
    pub fn push(&mut self, entry: HeaderEntry) {
        assert!(
            entry.is_valid(),
            "Invalid header: key and value must be non-empty (got key={:?}, value={:?})",
            entry.key,
            entry.value
        );
        self.0.push(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append every entry onto `map`, later entries replacing earlier ones.
    pub(crate) fn apply_to(&self, map: &mut HeaderMap) -> Result<()> {
        for entry in self.iter() {
            if !entry.is_valid() {
                continue;
            }
            let name = HeaderName::from_bytes(entry.key.trim().as_bytes())
                .map_err(|err| Error::Config(format!("invalid header name: {err}")))?;
            let val = HeaderValue::from_str(entry.value.trim())
                .map_err(|err| Error::Config(format!("invalid header value: {err}")))?;
            map.insert(name, val);
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct HeaderEntry {
    pub key: String,
    pub value: String,
}

impl HeaderEntry {
    pub fn new(key: String, value: String) -> Self {
        Self { key, value }
    }

    pub fn is_valid(&self) -> bool {
        !(self.key.trim().is_empty() || self.value.trim().is_empty())
    }
}

/// Non-empty string value of `name`, if present.
pub(crate) fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

pub(crate) fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    header_string(headers, REQUEST_ID_HEADER).or_else(|| header_string(headers, "X-Trace-Id"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_interceptors_sets_every_chain() {
        let opts = RequestOptions::default().skip_interceptors();
        assert!(opts.skip_request_interceptors);
        assert!(opts.skip_response_interceptors);
        assert!(opts.skip_error_interceptors);
        assert!(!opts.skip_business_check);
    }

    #[test]
    fn header_list_applies_onto_map() {
        let opts = RequestOptions::default()
            .with_header("X-Custom", "one")
            .with_header("x-custom", "two");
        let mut map = HeaderMap::new();
        opts.headers.apply_to(&mut map).unwrap();
        assert_eq!(map.get("x-custom").unwrap(), "two");
    }

    #[test]
    fn header_list_rejects_invalid_names() {
        let mut list = HeaderList::new();
        list.push(HeaderEntry::new("bad header".into(), "v".into()));
        let err = list.apply_to(&mut HeaderMap::new()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    #[should_panic(expected = "Invalid header")]
    fn header_list_panics_on_whitespace_only() {
        let mut list = HeaderList::new();
        list.push(HeaderEntry::new("   ".to_string(), "value".to_string()));
    }

    #[test]
    fn header_string_ignores_blank_values() {
        let mut map = HeaderMap::new();
        map.insert("x-refreshed-token", HeaderValue::from_static("  "));
        assert_eq!(header_string(&map, "x-refreshed-token"), None);
        map.insert("x-request-id", HeaderValue::from_static("req_1"));
        assert_eq!(request_id_from_headers(&map).as_deref(), Some("req_1"));
    }
}
