use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderName},
    Method,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    cancel::CancelHandle,
    credentials::{CredentialProvider, MemoryCredentials},
    dedupe::{DedupeCache, SharedResult},
    envelope::{classify, parse_body, ApiResponse, BusinessCodes, BusinessHook, Classification},
    errors::{Error, Result},
    http::{header_string, request_id_from_headers, HeaderList, RequestOptions},
    interceptors::Interceptors,
    request::{
        resolve_url, BuildContext, DescriptorBuilder, ParamProcessor, RequestDescriptor, StripNulls,
    },
    session::{StreamCallbacks, StreamOutcome, StreamSession, StreamTask},
    telemetry::{HttpRequestMetrics, MetricsCallbacks, RequestContext, Telemetry},
    transport::Transport,
    DEFAULT_BASE_URL, DEFAULT_REFRESH_HEADER, DEFAULT_REQUEST_TIMEOUT,
};

const JSON_ACCEPT: &str = "application/json";
const STREAM_ACCEPT: &str = "text/event-stream";

/// Receives failures that leave the pipeline.
///
/// `on_unauthorized` is the login-redirect side effect: it fires for HTTP 401,
/// for the business-unauthorized envelope code, and for calls that required a
/// credential when none was stored. Cancellations never reach the handler.
pub trait ErrorHandler: Send + Sync {
    fn on_unauthorized(&self, error: &Error);

    fn on_error(&self, _error: &Error) {}
}

#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Defaults to `http://localhost`.
    pub base_url: Option<String>,
    /// Per-call timeout for plain requests (defaults to 60s). Streams have no default.
    pub timeout: Option<Duration>,
    /// Share identical in-flight calls (defaults to true).
    pub dedupe: Option<bool>,
    /// Skip envelope business-code checks on every call. HTTP status errors still fail.
    pub ignore_response_error: bool,
    pub business_codes: Option<BusinessCodes>,
    /// Response header carrying a renewed credential (defaults to `X-Refreshed-Token`).
    pub refresh_header: Option<String>,
    /// Default extra headers applied to all requests.
    pub default_headers: Option<HeaderList>,
    pub metrics: Option<MetricsCallbacks>,
}

/// Assembles a [`Client`] from its configuration and collaborators.
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    error_handler: Arc<dyn ErrorHandler>,
    config: Config,
    credentials: Option<Arc<dyn CredentialProvider>>,
    param_processor: Option<Arc<dyn ParamProcessor>>,
    business_hook: Option<BusinessHook>,
    interceptors: Interceptors,
}

impl ClientBuilder {
    pub fn new(transport: Arc<dyn Transport>, error_handler: Arc<dyn ErrorHandler>) -> Self {
        Self {
            transport,
            error_handler,
            config: Config::default(),
            credentials: None,
            param_processor: None,
            business_hook: None,
            interceptors: Interceptors::default(),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn param_processor(mut self, processor: Arc<dyn ParamProcessor>) -> Self {
        self.param_processor = Some(processor);
        self
    }

    pub fn business_hook(mut self, hook: BusinessHook) -> Self {
        self.business_hook = Some(hook);
        self
    }

    pub fn interceptors(mut self, interceptors: Interceptors) -> Self {
        self.interceptors = interceptors;
        self
    }

    pub fn build(self) -> Result<Client> {
        let cfg = self.config;
        let base_source = cfg
            .base_url
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = base_source.trim().trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url)
            .map_err(|err| Error::Config(format!("invalid base url: {err}")))?;

        let refresh_header = cfg
            .refresh_header
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_REFRESH_HEADER.to_string());
        HeaderName::from_bytes(refresh_header.as_bytes())
            .map_err(|err| Error::Config(format!("invalid refresh header: {err}")))?;

        if let Some(defaults) = &cfg.default_headers {
            defaults.apply_to(&mut HeaderMap::new())?;
        }

        Ok(Client {
            inner: Arc::new(ClientInner {
                base_url,
                request_timeout: cfg.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
                dedupe: cfg.dedupe.unwrap_or(true),
                ignore_response_error: cfg.ignore_response_error,
                codes: cfg.business_codes.unwrap_or_default(),
                refresh_header,
                default_headers: cfg.default_headers,
                transport: self.transport,
                error_handler: self.error_handler,
                credentials: self
                    .credentials
                    .unwrap_or_else(|| Arc::new(MemoryCredentials::default())),
                processor: self.param_processor.unwrap_or_else(|| Arc::new(StripNulls)),
                business_hook: self.business_hook,
                interceptors: self.interceptors,
                cache: DedupeCache::new(),
                telemetry: Telemetry::new(cfg.metrics),
            }),
        })
    }
}

/// Entry point for every data call and chat stream.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.base_url)
            .field("dedupe", &self.inner.dedupe)
            .field("interceptors", &self.inner.interceptors)
            .field("in_flight", &self.inner.cache)
            .finish_non_exhaustive()
    }
}

struct ClientInner {
    base_url: String,
    request_timeout: Duration,
    dedupe: bool,
    ignore_response_error: bool,
    codes: BusinessCodes,
    refresh_header: String,
    default_headers: Option<HeaderList>,
    transport: Arc<dyn Transport>,
    error_handler: Arc<dyn ErrorHandler>,
    credentials: Arc<dyn CredentialProvider>,
    processor: Arc<dyn ParamProcessor>,
    business_hook: Option<BusinessHook>,
    interceptors: Interceptors,
    cache: DedupeCache,
    telemetry: Telemetry,
}

impl Client {
    pub fn builder(
        transport: Arc<dyn Transport>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> ClientBuilder {
        ClientBuilder::new(transport, error_handler)
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn credentials(&self) -> Arc<dyn CredentialProvider> {
        self.inner.credentials.clone()
    }

    /// Start describing a call; finish with [`Client::send`].
    pub fn request(&self, method: Method, url: impl Into<String>) -> DescriptorBuilder {
        RequestDescriptor::builder(method, url)
    }

    /// Run a call through the full pipeline.
    ///
    /// Identical concurrent calls (same method, URL and body) share one transport
    /// exchange and observe the same response or error.
    pub async fn send(&self, request: DescriptorBuilder) -> Result<Arc<ApiResponse>> {
        let inner = &self.inner;
        let ctx = inner.build_context(Some(inner.request_timeout), JSON_ACCEPT);
        let descriptor = match request.build(&ctx) {
            Ok(descriptor) => descriptor,
            Err(err) => return Err(inner.settle_error(err, true).await),
        };
        let skip_errors = descriptor.options().skip_error_interceptors;
        let descriptor = if descriptor.options().skip_request_interceptors {
            descriptor
        } else {
            match inner.interceptors.run_request(descriptor).await {
                Ok(descriptor) => descriptor,
                Err(err) => return Err(inner.settle_error(err, skip_errors).await),
            }
        };

        let dedupe = descriptor.options().dedupe.unwrap_or(inner.dedupe);
        let method = descriptor.method().clone();
        let url = descriptor.url().clone();
        let ctx = RequestContext::new(method.as_str(), descriptor.path())
            .with_request_id(descriptor.options().request_id.clone());
        let key = descriptor.dedupe_key();

        let start = Instant::now();
        let work_inner = self.inner.clone();
        let (call, _cancel, joined) =
            inner
                .cache
                .join_or_start(key, method, &url, dedupe, move |cancel| {
                    Box::pin(async move { work_inner.execute(descriptor, cancel).await })
                });
        let result = call.await;
        if joined {
            inner.record_joined(&result, ctx, start);
        }
        result
    }

    /// Send and deserialize the envelope's `data` field.
    pub async fn send_data<T: DeserializeOwned>(&self, request: DescriptorBuilder) -> Result<T> {
        let response = self.send(request).await?;
        response.data().map_err(|err| match err {
            Error::Serialization(source) => Error::Decode {
                message: source.to_string(),
                path: Some(response.path_hint()),
            },
            other => other,
        })
    }

    pub async fn get(
        &self,
        url: impl Into<String>,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Arc<ApiResponse>> {
        let mut request = self.request(Method::GET, url).options(options);
        if let Some(params) = params {
            request = request.params(params);
        }
        self.send(request).await
    }

    pub async fn post(
        &self,
        url: impl Into<String>,
        body: Value,
        options: RequestOptions,
    ) -> Result<Arc<ApiResponse>> {
        self.send(self.request(Method::POST, url).body(body).options(options))
            .await
    }

    pub async fn put(
        &self,
        url: impl Into<String>,
        body: Value,
        options: RequestOptions,
    ) -> Result<Arc<ApiResponse>> {
        self.send(self.request(Method::PUT, url).body(body).options(options))
            .await
    }

    pub async fn delete(
        &self,
        url: impl Into<String>,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Arc<ApiResponse>> {
        let mut request = self.request(Method::DELETE, url).options(options);
        if let Some(params) = params {
            request = request.params(params);
        }
        self.send(request).await
    }

    /// Cancel live calls to `url` with `method`. The query string is ignored.
    pub fn cancel(&self, url: &str, method: Method) -> Result<usize> {
        let url = resolve_url(&self.inner.base_url, url)?;
        Ok(self.inner.cache.cancel(&url, &method))
    }

    pub fn cancel_all(&self) -> usize {
        self.inner.cache.cancel_all()
    }

    /// Number of in-flight entries in the dedupe cache.
    pub fn in_flight(&self) -> usize {
        self.inner.cache.len()
    }

    /// Start a streaming call on the current tokio runtime.
    ///
    /// Returns immediately; the task's cancel handle is live before the request is
    /// issued. Streams are never deduplicated and carry no default timeout.
    pub fn stream(
        &self,
        method: Method,
        url: impl Into<String>,
        body: Option<Value>,
        options: RequestOptions,
        callbacks: StreamCallbacks,
    ) -> StreamTask {
        let mut request = RequestDescriptor::builder(method, url).options(options);
        if let Some(body) = body {
            request = request.body(body);
        }
        self.stream_request(request, callbacks)
    }

    /// Like [`Client::stream`] for a prepared request, such as one produced by a
    /// [`ChatAdapter`](crate::ChatAdapter).
    pub fn stream_request(
        &self,
        request: DescriptorBuilder,
        callbacks: StreamCallbacks,
    ) -> StreamTask {
        let cancel = CancelHandle::new();
        let session = StreamSession::with_cancel(cancel.clone(), callbacks);
        let id = session.id();
        let inner = self.inner.clone();
        let join = tokio::spawn(async move { inner.drive_stream(request, session).await });
        StreamTask::new(id, cancel, join)
    }
}

impl ApiResponse {
    fn path_hint(&self) -> String {
        self.body
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

impl ClientInner {
    fn build_context(
        &self,
        default_timeout: Option<Duration>,
        accept: &'static str,
    ) -> BuildContext<'_> {
        BuildContext {
            base_url: &self.base_url,
            default_timeout,
            processor: self.processor.as_ref(),
            default_headers: self.default_headers.as_ref(),
            credentials: &self.credentials,
            accept,
        }
    }

    /// One network exchange, shared by every caller joined on its key.
    async fn execute(&self, descriptor: RequestDescriptor, cancel: CancelHandle) -> SharedResult {
        let start = Instant::now();
        let skip_errors = descriptor.options().skip_error_interceptors;
        let mut ctx = RequestContext::new(descriptor.method().as_str(), descriptor.path())
            .with_request_id(descriptor.options().request_id.clone());
        let timeout = descriptor.timeout();

        #[cfg(feature = "tracing")]
        let result = {
            use tracing::Instrument;
            let span =
                tracing::debug_span!("chatpipe.http", method = %ctx.method, path = %ctx.path);
            cancel
                .run(timeout, self.exchange(descriptor))
                .instrument(span)
                .await
        };
        #[cfg(not(feature = "tracing"))]
        let result = cancel.run(timeout, self.exchange(descriptor)).await;
        match result {
            Ok(response) => {
                ctx.request_id = response.request_id.clone().or(ctx.request_id);
                if self.telemetry.http_enabled() {
                    self.telemetry.record_http(HttpRequestMetrics {
                        latency: start.elapsed(),
                        status: Some(response.status),
                        error: None,
                        context: ctx,
                    });
                }
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    status = response.status,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "request completed"
                );
                Ok(Arc::new(response))
            }
            Err(err) => {
                if self.telemetry.http_enabled() {
                    self.telemetry.record_http(HttpRequestMetrics {
                        latency: start.elapsed(),
                        status: http_status(&err),
                        error: Some(err.to_string()),
                        context: ctx,
                    });
                }
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %err, "request failed");
                Err(self.settle_error(err, skip_errors).await)
            }
        }
    }

    async fn exchange(&self, descriptor: RequestDescriptor) -> Result<ApiResponse> {
        let path = descriptor.path().to_string();
        let options = descriptor.options().clone();
        let response = self.transport.request(descriptor).await?;
        self.refresh_credential(&response.headers);

        let body = parse_body(&response.body);
        let request_id = request_id_from_headers(&response.headers).or(options.request_id);
        classify(
            response.status,
            &body,
            &Classification {
                request_path: &path,
                skip_business_check: options.skip_business_check || self.ignore_response_error,
                codes: self.codes,
                hook: self.business_hook.as_ref(),
            },
        )
        .map_err(|err| match err {
            Error::Http(mut http) => {
                http.request_id = request_id.clone();
                Error::Http(http)
            }
            other => other,
        })?;

        let api = ApiResponse {
            status: response.status,
            request_id,
            headers: response.headers,
            body,
        };
        if options.skip_response_interceptors {
            Ok(api)
        } else {
            self.interceptors.run_response(api).await
        }
    }

    /// Store a renewed credential announced by the server.
    fn refresh_credential(&self, headers: &HeaderMap) {
        if let Some(token) = header_string(headers, &self.refresh_header) {
            #[cfg(feature = "tracing")]
            tracing::debug!("credential refreshed by response header");
            self.credentials.set(token);
        }
    }

    /// Error chain, then the handler. Cancellations pass through untouched.
    async fn settle_error(&self, err: Error, skip_interceptors: bool) -> Error {
        if err.is_cancelled() {
            return err;
        }
        let err = if skip_interceptors {
            err
        } else {
            self.interceptors.run_error(err).await
        };
        if err.is_unauthorized() {
            self.error_handler.on_unauthorized(&err);
        }
        self.error_handler.on_error(&err);
        err
    }

    fn record_joined(&self, result: &SharedResult, ctx: RequestContext, start: Instant) {
        if !self.telemetry.http_enabled() {
            return;
        }
        let mut ctx = ctx;
        ctx.deduplicated = true;
        let (status, error) = match result {
            Ok(response) => (Some(response.status), None),
            Err(err) => (http_status(err), Some(err.to_string())),
        };
        self.telemetry.record_http(HttpRequestMetrics {
            latency: start.elapsed(),
            status,
            error,
            context: ctx,
        });
    }

    async fn drive_stream(
        &self,
        request: DescriptorBuilder,
        session: StreamSession,
    ) -> StreamOutcome {
        let mut session = session;
        let cancel = session.cancel_handle();
        let descriptor = match request.build(&self.build_context(None, STREAM_ACCEPT)) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                session.fail(self.settle_error(err, true).await);
                return session.into_outcome();
            }
        };
        let skip_errors = descriptor.options().skip_error_interceptors;
        let descriptor = if descriptor.options().skip_request_interceptors {
            descriptor
        } else {
            match cancel.run(None, self.interceptors.run_request(descriptor)).await {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    session.fail(self.settle_error(err, skip_errors).await);
                    return session.into_outcome();
                }
            }
        };

        let start = Instant::now();
        let ctx = RequestContext::new(descriptor.method().as_str(), descriptor.path())
            .with_request_id(descriptor.options().request_id.clone());
        let mut session = session
            .with_format(descriptor.options().stream_format)
            .with_telemetry(self.telemetry.first_token_clock(ctx.clone(), start));
        let path = descriptor.path().to_string();
        let timeout = descriptor.timeout();
        let idle = descriptor.options().idle_timeout;

        #[cfg(feature = "tracing")]
        tracing::debug!(session = %session.id(), path = %path, "opening stream");

        let result = cancel
            .run(timeout, async {
                let response = self.transport.stream(descriptor).await?;
                self.refresh_credential(&response.headers);
                if self.telemetry.http_enabled() {
                    self.telemetry.record_http(HttpRequestMetrics {
                        latency: start.elapsed(),
                        status: Some(response.status),
                        error: None,
                        context: ctx
                            .clone()
                            .with_request_id(request_id_from_headers(&response.headers)),
                    });
                }
                if !(200..300).contains(&response.status) {
                    let status = response.status;
                    let body = response.read_to_string().await.unwrap_or_default();
                    classify(
                        status,
                        &parse_body(&Bytes::from(body)),
                        &Classification {
                            request_path: &path,
                            skip_business_check: true,
                            codes: self.codes,
                            hook: None,
                        },
                    )?;
                    return Ok(());
                }
                session.pump(response.fragments, idle).await
            })
            .await;

        if let Err(err) = result {
            #[cfg(feature = "tracing")]
            tracing::warn!(cancelled = err.is_cancelled(), error = %err, "stream ended early");
            session.fail(self.settle_error(err, skip_errors).await);
        }
        session.into_outcome()
    }
}

fn http_status(err: &Error) -> Option<u16> {
    match err {
        Error::Http(http) => Some(http.status),
        _ => None,
    }
}
