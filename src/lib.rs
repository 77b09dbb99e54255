//! Request pipeline and streaming chat decoder.
//!
//! Every data call flows through one [`Client`]: descriptor building, request
//! interceptors, in-flight deduplication, a pluggable [`Transport`], credential
//! refresh, envelope classification, response/error interceptors and finally the
//! [`ErrorHandler`]. Chat streams are decoded incrementally by a
//! [`StreamDecoder`] driven by a [`StreamSession`].
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(clippy::result_large_err)]

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "http://localhost";

/// Default connection timeout (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Default request timeout (60 seconds). Streams have no default.
pub const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// HTTP header name for request ID tracing.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Response header carrying a renewed credential.
pub const DEFAULT_REFRESH_HEADER: &str = "X-Refreshed-Token";

mod cancel;
mod client;
mod credentials;
mod decoder;
mod dedupe;
mod envelope;
mod errors;
mod http;
mod interceptors;
pub mod providers;
mod request;
mod session;
mod telemetry;
pub mod testing;
mod transport;
mod vendor_stream;

pub use cancel::CancelHandle;
pub use client::{Client, ClientBuilder, Config, ErrorHandler};
pub use credentials::{CredentialProvider, MemoryCredentials};
pub use decoder::{
    AssembledMessage, MetadataKind, StreamDecoder, StreamEvent, ToolCallState, ToolPhase,
    ToolStatus,
};
pub use envelope::{
    classify, ApiResponse, BusinessCodes, BusinessHook, Classification, ResponseEnvelope,
};
pub use errors::{
    BusinessError, CancelReason, Error, HttpError, HttpErrorKind, Result, TransportError,
    TransportErrorKind,
};
pub use http::{HeaderEntry, HeaderList, RequestOptions};
pub use interceptors::{
    sync_error_interceptor, sync_request_interceptor, sync_response_interceptor, ErrorInterceptor,
    Interceptors, RequestInterceptor, ResponseInterceptor,
};
pub use providers::{
    wrap, Capabilities, CallTransform, ChatAdapter, ChatCall, ChatMessage, GenericAdapter,
    ProviderConfig, ProviderKind, ProviderRegistry, WrappedAdapter,
};
pub use request::{
    BuildContext, DescriptorBuilder, ParamProcessor, Passthrough, RequestDescriptor, StripNulls,
};
pub use session::{StreamCallbacks, StreamOutcome, StreamSession, StreamTask};
pub use telemetry::{HttpRequestMetrics, MetricsCallbacks, RequestContext, StreamFirstTokenMetrics};
pub use transport::{
    BoxFuture, ChunkSink, Fragment, FragmentStream, HostBridge, ReqwestTransport, StreamResponse,
    TextChunkTransport, Transport, TransportResponse,
};
pub use vendor_stream::StreamFormat;
