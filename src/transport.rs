//! Transport strategies the pipeline executes through.
//!
//! The core only ever talks to [`Transport`]. [`ReqwestTransport`] delivers
//! streaming bodies as byte fragments; [`TextChunkTransport`] adapts runtimes that
//! perform the HTTP exchange themselves and push decoded text chunks back.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::{stream::BoxStream, StreamExt, TryStreamExt};
use reqwest::header::HeaderMap;
use tokio::sync::mpsc;

use crate::{
    errors::{Error, Result, TransportError, TransportErrorKind},
    request::RequestDescriptor,
    DEFAULT_CONNECT_TIMEOUT,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Buffered response of a plain call.
#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One piece of a streaming body as delivered by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fragment {
    Bytes(Bytes),
    Text(String),
}

impl From<&str> for Fragment {
    fn from(value: &str) -> Self {
        Fragment::Text(value.to_string())
    }
}

impl From<String> for Fragment {
    fn from(value: String) -> Self {
        Fragment::Text(value)
    }
}

impl From<Bytes> for Fragment {
    fn from(value: Bytes) -> Self {
        Fragment::Bytes(value)
    }
}

impl From<Vec<u8>> for Fragment {
    fn from(value: Vec<u8>) -> Self {
        Fragment::Bytes(Bytes::from(value))
    }
}

pub type FragmentStream = BoxStream<'static, Result<Fragment>>;

/// Streaming response head plus its body fragments.
pub struct StreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub fragments: FragmentStream,
}

impl std::fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl StreamResponse {
    /// Drain the remaining fragments into a string (used for error bodies).
    pub async fn read_to_string(self) -> Result<String> {
        let mut out = Vec::new();
        let mut fragments = self.fragments;
        while let Some(fragment) = fragments.next().await {
            match fragment? {
                Fragment::Bytes(b) => out.extend_from_slice(&b),
                Fragment::Text(t) => out.extend_from_slice(t.as_bytes()),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

/// Strategy contract consumed by the pipeline.
///
/// Implementations perform I/O only: no classification, retries or timeouts.
/// Dropping a returned future or fragment stream must abort the exchange.
pub trait Transport: Send + Sync {
    fn request(
        &self,
        descriptor: RequestDescriptor,
    ) -> BoxFuture<'static, Result<TransportResponse>>;

    fn stream(&self, descriptor: RequestDescriptor) -> BoxFuture<'static, Result<StreamResponse>>;
}

/// `reqwest`-backed transport.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|err| {
                TransportError::with_source(
                    TransportErrorKind::Connect,
                    "failed to build http client",
                    err,
                )
            })?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn builder(&self, descriptor: &RequestDescriptor) -> Result<reqwest::RequestBuilder> {
        let mut builder = self
            .http
            .request(descriptor.method().clone(), descriptor.url().clone())
            .headers(descriptor.headers().clone());
        if let Some(body) = descriptor.serialized_body()? {
            builder = builder.body(body);
        }
        Ok(builder)
    }
}

impl Transport for ReqwestTransport {
    fn request(
        &self,
        descriptor: RequestDescriptor,
    ) -> BoxFuture<'static, Result<TransportResponse>> {
        let builder = self.builder(&descriptor);
        Box::pin(async move {
            let resp = builder?
                .send()
                .await
                .map_err(TransportError::from_reqwest)?;
            let status = resp.status().as_u16();
            let headers = resp.headers().clone();
            let body = resp.bytes().await.map_err(TransportError::from_reqwest)?;
            Ok(TransportResponse {
                status,
                headers,
                body,
            })
        })
    }

    fn stream(&self, descriptor: RequestDescriptor) -> BoxFuture<'static, Result<StreamResponse>> {
        let builder = self.builder(&descriptor);
        Box::pin(async move {
            let resp = builder?
                .send()
                .await
                .map_err(TransportError::from_reqwest)?;
            let status = resp.status().as_u16();
            let headers = resp.headers().clone();
            let fragments = resp
                .bytes_stream()
                .map_ok(Fragment::Bytes)
                .map_err(|err| Error::Transport(TransportError::from_reqwest(err)))
                .boxed();
            Ok(StreamResponse {
                status,
                headers,
                fragments,
            })
        })
    }
}

/// Push side of a streaming exchange performed by a host runtime.
#[derive(Clone, Debug)]
pub struct ChunkSink {
    tx: mpsc::UnboundedSender<Result<Fragment>>,
}

impl ChunkSink {
    /// Forward one decoded text chunk. Returns `false` once the consumer is gone,
    /// which the host should treat as a request to abort its native task.
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.tx.send(Ok(Fragment::Text(text.into()))).is_ok()
    }

    /// Forward raw bytes for runtimes that hand out array buffers.
    pub fn push_bytes(&self, bytes: impl Into<Bytes>) -> bool {
        self.tx.send(Ok(Fragment::Bytes(bytes.into()))).is_ok()
    }

    /// Report a native failure; the stream ends after it.
    pub fn fail(&self, message: impl Into<String>) {
        let _ = self.tx.send(Err(Error::Transport(TransportError::new(
            TransportErrorKind::Other,
            message,
        ))));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Native request primitives of a constrained runtime.
pub trait HostBridge: Send + Sync {
    /// Perform a buffered request.
    fn request(
        &self,
        descriptor: RequestDescriptor,
    ) -> BoxFuture<'static, Result<TransportResponse>>;

    /// Start a streaming request. Resolves with the response head once the native
    /// layer reports it; chunks then flow through `sink` until it is dropped.
    fn open_stream(
        &self,
        descriptor: RequestDescriptor,
        sink: ChunkSink,
    ) -> BoxFuture<'static, Result<(u16, HeaderMap)>>;
}

/// Transport for runtimes that push text chunks instead of exposing a byte stream.
#[derive(Clone)]
pub struct TextChunkTransport {
    bridge: Arc<dyn HostBridge>,
}

impl TextChunkTransport {
    pub fn new(bridge: Arc<dyn HostBridge>) -> Self {
        Self { bridge }
    }
}

impl Transport for TextChunkTransport {
    fn request(
        &self,
        descriptor: RequestDescriptor,
    ) -> BoxFuture<'static, Result<TransportResponse>> {
        self.bridge.request(descriptor)
    }

    fn stream(&self, descriptor: RequestDescriptor) -> BoxFuture<'static, Result<StreamResponse>> {
        let bridge = self.bridge.clone();
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let (status, headers) = bridge.open_stream(descriptor, ChunkSink { tx }).await?;
            let fragments = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed();
            Ok(StreamResponse {
                status,
                headers,
                fragments,
            })
        })
    }
}

/// Sleep helper shared by test transports.
pub(crate) async fn delay(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use reqwest::Method;

    use super::*;
    use crate::{
        credentials::{CredentialProvider, MemoryCredentials},
        request::{BuildContext, Passthrough},
    };

    struct ScriptedBridge {
        chunks: Mutex<Vec<&'static str>>,
    }

    impl HostBridge for ScriptedBridge {
        fn request(
            &self,
            _descriptor: RequestDescriptor,
        ) -> BoxFuture<'static, Result<TransportResponse>> {
            Box::pin(async {
                Ok(TransportResponse {
                    status: 204,
                    headers: HeaderMap::new(),
                    body: Bytes::new(),
                })
            })
        }

        fn open_stream(
            &self,
            _descriptor: RequestDescriptor,
            sink: ChunkSink,
        ) -> BoxFuture<'static, Result<(u16, HeaderMap)>> {
            let chunks = std::mem::take(&mut *self.chunks.lock().unwrap());
            Box::pin(async move {
                tokio::spawn(async move {
                    for chunk in chunks {
                        delay(Duration::from_millis(1)).await;
                        if !sink.push(chunk) {
                            return;
                        }
                    }
                });
                Ok((200, HeaderMap::new()))
            })
        }
    }

    #[tokio::test]
    async fn text_chunks_arrive_in_order() {
        let bridge = Arc::new(ScriptedBridge {
            chunks: Mutex::new(vec!["data: a", "\n", "data: b\n"]),
        });
        let transport = TextChunkTransport::new(bridge);
        let creds: Arc<dyn CredentialProvider> = Arc::new(MemoryCredentials::default());
        let desc = RequestDescriptor::builder(Method::POST, "/chat")
            .build(&BuildContext {
                base_url: "http://localhost",
                default_timeout: None,
                processor: &Passthrough,
                default_headers: None,
                credentials: &creds,
                accept: "text/event-stream",
            })
            .unwrap();
        let resp = transport.stream(desc).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.read_to_string().await.unwrap(), "data: a\ndata: b\n");
    }
}
