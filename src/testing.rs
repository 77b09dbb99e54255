//! Test doubles and local servers for exercising the pipeline.

use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::{
    client::ErrorHandler,
    errors::{Error, Result, TransportError, TransportErrorKind},
    request::RequestDescriptor,
    transport::{delay, BoxFuture, Fragment, StreamResponse, Transport, TransportResponse},
};

struct ScriptedStream {
    status: u16,
    headers: HeaderMap,
    fragments: Vec<Fragment>,
    hang: bool,
}

#[derive(Default)]
struct Script {
    responses: VecDeque<Result<TransportResponse>>,
    streams: VecDeque<Result<ScriptedStream>>,
    requests: Vec<RequestDescriptor>,
}

/// Scripted [`Transport`] that counts the exchanges it performs.
///
/// Responses are served in the order they were scripted; an exhausted script
/// fails the call with a transport error.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<Script>,
    calls: AtomicUsize,
    latency: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response head by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn respond(mut self, response: TransportResponse) -> Self {
        self.script_mut().responses.push_back(Ok(response));
        self
    }

    pub fn respond_json(self, status: u16, body: Value) -> Self {
        self.respond(TransportResponse {
            status,
            headers: HeaderMap::new(),
            body: Bytes::from(body.to_string()),
        })
    }

    pub fn fail(mut self, error: TransportError) -> Self {
        self.script_mut().responses.push_back(Err(error.into()));
        self
    }

    /// Script a streaming response that ends after `fragments`.
    pub fn stream(mut self, status: u16, fragments: Vec<Fragment>) -> Self {
        self.script_mut().streams.push_back(Ok(ScriptedStream {
            status,
            headers: HeaderMap::new(),
            fragments,
            hang: false,
        }));
        self
    }

    /// Script a streaming response that stays open after `fragments`.
    pub fn stream_then_hang(mut self, status: u16, fragments: Vec<Fragment>) -> Self {
        self.script_mut().streams.push_back(Ok(ScriptedStream {
            status,
            headers: HeaderMap::new(),
            fragments,
            hang: true,
        }));
        self
    }

    pub fn stream_fail(mut self, error: TransportError) -> Self {
        self.script_mut().streams.push_back(Err(error.into()));
        self
    }

    /// Number of exchanges started (plain and streaming).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every descriptor the transport received, in order.
    pub fn requests(&self) -> Vec<RequestDescriptor> {
        self.lock().requests.clone()
    }

    fn script_mut(&mut self) -> &mut Script {
        self.script
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn exhausted() -> Error {
    TransportError::new(TransportErrorKind::Other, "no scripted response left").into()
}

impl Transport for MockTransport {
    fn request(
        &self,
        descriptor: RequestDescriptor,
    ) -> BoxFuture<'static, Result<TransportResponse>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut script = self.lock();
            script.requests.push(descriptor);
            script.responses.pop_front()
        };
        let latency = self.latency;
        Box::pin(async move {
            if let Some(latency) = latency {
                delay(latency).await;
            }
            next.unwrap_or_else(|| Err(exhausted()))
        })
    }

    fn stream(&self, descriptor: RequestDescriptor) -> BoxFuture<'static, Result<StreamResponse>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut script = self.lock();
            script.requests.push(descriptor);
            script.streams.pop_front()
        };
        let latency = self.latency;
        Box::pin(async move {
            if let Some(latency) = latency {
                delay(latency).await;
            }
            let scripted = next.unwrap_or_else(|| Err(exhausted()))?;
            let body = futures_util::stream::iter(scripted.fragments.into_iter().map(Ok));
            let fragments = if scripted.hang {
                body.chain(futures_util::stream::pending()).boxed()
            } else {
                body.boxed()
            };
            Ok(StreamResponse {
                status: scripted.status,
                headers: scripted.headers,
                fragments,
            })
        })
    }
}

/// [`ErrorHandler`] that records what it was told.
#[derive(Default)]
pub struct RecordingErrorHandler {
    unauthorized: AtomicUsize,
    errors: AtomicUsize,
    last: Mutex<Option<Error>>,
}

impl RecordingErrorHandler {
    /// Times the login-redirect side effect fired.
    pub fn login_redirects(&self) -> usize {
        self.unauthorized.load(Ordering::SeqCst)
    }

    /// Errors delivered to the handler, unauthorized ones included.
    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ErrorHandler for RecordingErrorHandler {
    fn on_unauthorized(&self, _error: &Error) {
        self.unauthorized.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, error: &Error) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        *self
            .last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(error.clone());
    }
}

/// Start a local server that answers one request with a chunked `text/event-stream`
/// body. Each step writes its text verbatim as one HTTP chunk after its delay.
pub async fn start_chunked_sse_server(
    steps: Vec<(Duration, String)>,
    finish_after: Option<Duration>,
) -> io::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        let (mut socket, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(_) => return,
        };

        let mut buf = [0u8; 4096];
        let mut received = Vec::new();
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(n) => n,
                Err(_) => return,
            };
            if n == 0 {
                return;
            }
            received.extend_from_slice(&buf[..n]);
            if received.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }

        let headers = concat!(
            "HTTP/1.1 200 OK\r\n",
            "Content-Type: text/event-stream\r\n",
            "Transfer-Encoding: chunked\r\n",
            "\r\n"
        );
        if socket.write_all(headers.as_bytes()).await.is_err() {
            return;
        }

        for (delay, text) in steps {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let chunk = format!("{:X}\r\n{}\r\n", text.len(), text);
            if socket.write_all(chunk.as_bytes()).await.is_err() {
                return;
            }
        }

        if let Some(delay) = finish_after {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let _ = socket.write_all(b"0\r\n\r\n").await;
    });

    Ok(format!("http://{}", addr))
}

/// Start a local SSE server that immediately emits every chunk.
pub async fn start_sse_server(chunks: Vec<String>) -> io::Result<String> {
    let steps = chunks
        .into_iter()
        .map(|chunk| (Duration::ZERO, chunk))
        .collect();
    start_chunked_sse_server(steps, None).await
}
