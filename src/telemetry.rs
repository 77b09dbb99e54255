use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{decoder::StreamEvent, errors::Error};

/// Metrics hooks. Both are optional; an unset hook costs nothing.
#[derive(Clone, Default)]
pub struct MetricsCallbacks {
    pub http_request: Option<Arc<dyn Fn(HttpRequestMetrics) + Send + Sync>>,
    pub stream_first_token: Option<Arc<dyn Fn(StreamFirstTokenMetrics) + Send + Sync>>,
}

impl fmt::Debug for MetricsCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCallbacks")
            .field("http_request", &self.http_request.is_some())
            .field("stream_first_token", &self.stream_first_token.is_some())
            .finish()
    }
}

/// Which call a metric belongs to.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub request_id: Option<String>,
    /// True when the call joined an in-flight duplicate instead of hitting the network.
    pub deduplicated: bool,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Missing or blank ids keep the current one.
    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        if let Some(id) = request_id.filter(|id| !id.trim().is_empty()) {
            self.request_id = Some(id);
        }
        self
    }
}

/// Latency and outcome of one plain call, or of a stream's response head.
#[derive(Clone, Debug)]
pub struct HttpRequestMetrics {
    pub latency: Duration,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub context: RequestContext,
}

/// Time from stream start to the first content, or to whatever ended the stream first.
#[derive(Clone, Debug)]
pub struct StreamFirstTokenMetrics {
    pub latency: Duration,
    pub error: Option<String>,
    pub context: RequestContext,
}

#[derive(Clone, Default)]
pub(crate) struct Telemetry {
    callbacks: MetricsCallbacks,
}

impl Telemetry {
    pub fn new(callbacks: Option<MetricsCallbacks>) -> Self {
        Self {
            callbacks: callbacks.unwrap_or_default(),
        }
    }

    pub fn http_enabled(&self) -> bool {
        self.callbacks.http_request.is_some()
    }

    pub fn record_http(&self, metrics: HttpRequestMetrics) {
        if let Some(cb) = &self.callbacks.http_request {
            cb(metrics);
        }
    }

    /// Clock for one stream, or `None` when no first-token hook is registered.
    pub fn first_token_clock(
        &self,
        context: RequestContext,
        start: Instant,
    ) -> Option<FirstTokenClock> {
        let hook = self.callbacks.stream_first_token.clone()?;
        Some(FirstTokenClock {
            hook,
            context,
            start,
            fired: false,
        })
    }
}

/// Fires the first-token hook at most once per stream.
pub(crate) struct FirstTokenClock {
    hook: Arc<dyn Fn(StreamFirstTokenMetrics) + Send + Sync>,
    context: RequestContext,
    start: Instant,
    fired: bool,
}

impl FirstTokenClock {
    /// Content and completion count as the first token; metadata does not.
    pub fn on_event(&mut self, event: &StreamEvent) {
        if matches!(
            event,
            StreamEvent::ContentDelta { .. } | StreamEvent::Done { .. }
        ) {
            self.fire(None);
        }
    }

    pub fn on_error(&mut self, error: &Error) {
        self.fire(Some(error.to_string()));
    }

    /// Stream cancelled or timed out before any content.
    pub fn on_closed(&mut self) {
        self.fire(Some("stream closed".to_string()));
    }

    fn fire(&mut self, error: Option<String>) {
        if std::mem::replace(&mut self.fired, true) {
            return;
        }
        (self.hook)(StreamFirstTokenMetrics {
            latency: self.start.elapsed(),
            error,
            context: self.context.clone(),
        });
    }
}
