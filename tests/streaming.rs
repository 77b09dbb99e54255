use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chatpipe::{
    testing::{start_chunked_sse_server, start_sse_server, MockTransport, RecordingErrorHandler},
    BoxFuture, CancelReason, ChatAdapter, ChatCall, ChatMessage, ChunkSink, Client, Config, Error,
    Fragment, GenericAdapter, HostBridge, MemoryCredentials, ProviderConfig, ProviderKind,
    ReqwestTransport, RequestDescriptor, RequestOptions, Result, StreamCallbacks, StreamEvent,
    StreamOutcome, TextChunkTransport, Transport, TransportResponse,
};
use reqwest::{header::HeaderMap, Method};
use serde_json::json;

#[derive(Default)]
struct Recorded {
    deltas: Mutex<Vec<String>>,
    completions: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl Recorded {
    fn callbacks(self: &Arc<Self>) -> StreamCallbacks {
        let (a, b, c) = (self.clone(), self.clone(), self.clone());
        StreamCallbacks::new()
            .on_event(move |event| {
                if let StreamEvent::ContentDelta { delta, .. } = event {
                    a.deltas.lock().unwrap().push(delta.clone());
                }
            })
            .on_complete(move |message| b.completions.lock().unwrap().push(message.content))
            .on_error(move |err| c.errors.lock().unwrap().push(err.to_string()))
    }

    fn deltas(&self) -> Vec<String> {
        self.deltas.lock().unwrap().clone()
    }

    fn completions(&self) -> Vec<String> {
        self.completions.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

fn client_with(
    transport: Arc<dyn Transport>,
    base_url: &str,
) -> (Client, Arc<RecordingErrorHandler>) {
    let handler = Arc::new(RecordingErrorHandler::default());
    let client = Client::builder(transport, handler.clone())
        .config(Config {
            base_url: Some(base_url.to_string()),
            ..Default::default()
        })
        .build()
        .expect("client");
    (client, handler)
}

fn reqwest_client(base_url: &str) -> (Client, Arc<RecordingErrorHandler>) {
    client_with(Arc::new(ReqwestTransport::new().expect("transport")), base_url)
}

fn chat(
    client: &Client,
    options: RequestOptions,
    recorded: &Arc<Recorded>,
) -> chatpipe::StreamTask {
    client.stream(
        Method::POST,
        "/chat",
        Some(json!({ "message": "hi" })),
        options,
        recorded.callbacks(),
    )
}

#[tokio::test]
async fn split_sse_lines_assemble_into_one_completion() {
    let base_url = start_sse_server(vec![
        "data: {\"type\":\"chunk\",\"data\":\"Hel".to_string(),
        "lo\"}\n\ndata: {\"type\":\"chunk\",\"data\":\" world\"}\n\n".to_string(),
        "data: [DONE]\n\n".to_string(),
    ])
    .await
    .expect("server");
    let (client, handler) = reqwest_client(&base_url);
    let recorded = Arc::new(Recorded::default());

    let outcome = chat(&client, RequestOptions::default(), &recorded).wait().await;
    match outcome {
        StreamOutcome::Completed(message) => assert_eq!(message.content, "Hello world"),
        other => panic!("expected completion, got {other:?}"),
    }
    assert_eq!(recorded.deltas(), vec!["Hello", " world"]);
    assert_eq!(recorded.completions(), vec!["Hello world"]);
    assert!(recorded.errors().is_empty());
    assert_eq!(handler.errors(), 0);
}

#[tokio::test]
async fn multibyte_characters_survive_byte_splits() {
    let payload = "data: {\"type\":\"chunk\",\"data\":\"héllo 世界 👋\"}\ndata: [DONE]\n";
    let fragments = payload
        .as_bytes()
        .iter()
        .map(|b| Fragment::from(vec![*b]))
        .collect();
    let transport = Arc::new(MockTransport::new().stream(200, fragments));
    let (client, _) = client_with(transport, "http://localhost");
    let recorded = Arc::new(Recorded::default());

    let message = chat(&client, RequestOptions::default(), &recorded)
        .wait()
        .await
        .into_result()
        .expect("completed");
    assert_eq!(message.content, "héllo 世界 👋");
    assert_eq!(recorded.completions().len(), 1);
}

#[tokio::test]
async fn abort_before_first_fragment_delivers_nothing() {
    let base_url = start_chunked_sse_server(
        vec![(
            Duration::from_millis(300),
            "data: {\"type\":\"chunk\",\"data\":\"late\"}\n".to_string(),
        )],
        None,
    )
    .await
    .expect("server");
    let (client, handler) = reqwest_client(&base_url);
    let recorded = Arc::new(Recorded::default());

    let task = chat(&client, RequestOptions::default(), &recorded);
    task.abort();
    match task.wait().await {
        StreamOutcome::Cancelled(reason) => assert_eq!(reason, CancelReason::User),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(recorded.deltas().is_empty());
    assert!(recorded.completions().is_empty());
    assert!(recorded.errors().is_empty());
    assert_eq!(handler.errors(), 0);
}

#[tokio::test]
async fn abort_mid_stream_stops_delivery() {
    let transport = Arc::new(MockTransport::new().stream_then_hang(
        200,
        vec![Fragment::from("data: {\"type\":\"chunk\",\"data\":\"partial\"}\n")],
    ));
    let (client, _) = client_with(transport, "http://localhost");
    let recorded = Arc::new(Recorded::default());

    let task = chat(&client, RequestOptions::default(), &recorded);
    for _ in 0..50 {
        if !recorded.deltas().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    task.abort();
    assert!(matches!(task.wait().await, StreamOutcome::Cancelled(CancelReason::User)));
    assert_eq!(recorded.deltas(), vec!["partial"]);
    assert!(recorded.completions().is_empty());
}

#[tokio::test]
async fn total_timeout_cancels_silently() {
    let base_url = start_chunked_sse_server(
        vec![(Duration::from_millis(500), "data: [DONE]\n".to_string())],
        None,
    )
    .await
    .expect("server");
    let (client, handler) = reqwest_client(&base_url);
    let recorded = Arc::new(Recorded::default());

    let outcome = chat(
        &client,
        RequestOptions::default().with_timeout(Duration::from_millis(50)),
        &recorded,
    )
    .wait()
    .await;
    assert!(matches!(outcome, StreamOutcome::Cancelled(CancelReason::Timeout)));
    assert!(recorded.errors().is_empty());
    assert_eq!(handler.errors(), 0);
}

#[tokio::test]
async fn idle_timeout_fires_between_fragments() {
    let base_url = start_chunked_sse_server(
        vec![(
            Duration::ZERO,
            "data: {\"type\":\"chunk\",\"data\":\"hi\"}\n".to_string(),
        )],
        Some(Duration::from_millis(500)),
    )
    .await
    .expect("server");
    let (client, _) = reqwest_client(&base_url);
    let recorded = Arc::new(Recorded::default());

    let outcome = chat(
        &client,
        RequestOptions::default().with_idle_timeout(Duration::from_millis(50)),
        &recorded,
    )
    .wait()
    .await;
    assert!(matches!(outcome, StreamOutcome::Cancelled(CancelReason::Timeout)));
    assert_eq!(recorded.deltas(), vec!["hi"]);
    assert!(recorded.completions().is_empty());
}

#[tokio::test]
async fn error_payload_fails_once_without_completion() {
    let transport = Arc::new(MockTransport::new().stream(
        200,
        vec![
            Fragment::from("data: {\"type\":\"chunk\",\"data\":\"a\"}\n"),
            Fragment::from("data: {\"type\":\"error\",\"data\":{\"message\":\"overloaded\"}}\n"),
            Fragment::from("data: {\"type\":\"chunk\",\"data\":\"b\"}\ndata: [DONE]\n"),
        ],
    ));
    let (client, _) = client_with(transport, "http://localhost");
    let recorded = Arc::new(Recorded::default());

    let outcome = chat(&client, RequestOptions::default(), &recorded).wait().await;
    match outcome {
        StreamOutcome::Failed(Error::StreamProtocol { message }) => {
            assert_eq!(message, "overloaded")
        }
        other => panic!("expected protocol error, got {other:?}"),
    }
    assert_eq!(recorded.deltas(), vec!["a"]);
    assert_eq!(recorded.errors().len(), 1);
    assert!(recorded.completions().is_empty());
}

#[tokio::test]
async fn http_error_status_reaches_error_callback_and_handler() {
    let transport = Arc::new(MockTransport::new().stream(
        401,
        vec![Fragment::from("{\"code\":401,\"message\":\"expired\"}")],
    ));
    let (client, handler) = client_with(transport, "http://localhost");
    let recorded = Arc::new(Recorded::default());

    let outcome = chat(&client, RequestOptions::default(), &recorded).wait().await;
    match outcome {
        StreamOutcome::Failed(err) => assert!(err.is_unauthorized()),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(recorded.errors().len(), 1);
    assert_eq!(handler.login_redirects(), 1);
}

#[tokio::test]
async fn end_of_input_without_sentinel_completes() {
    let transport = Arc::new(MockTransport::new().stream(
        200,
        vec![Fragment::from("data: {\"type\":\"chunk\",\"data\":\"tail\"}")],
    ));
    let (client, _) = client_with(transport, "http://localhost");
    let recorded = Arc::new(Recorded::default());

    let outcome = chat(&client, RequestOptions::default(), &recorded).wait().await;
    assert_eq!(outcome.message().map(|m| m.content.as_str()), Some("tail"));
    assert_eq!(recorded.completions(), vec!["tail"]);
}

/// Host bridge that pushes its scripted chunks from a spawned task.
struct PushingBridge {
    chunks: Vec<String>,
}

impl HostBridge for PushingBridge {
    fn request(
        &self,
        _descriptor: RequestDescriptor,
    ) -> BoxFuture<'static, Result<TransportResponse>> {
        Box::pin(async { unreachable!("streaming only") })
    }

    fn open_stream(
        &self,
        _descriptor: RequestDescriptor,
        sink: ChunkSink,
    ) -> BoxFuture<'static, Result<(u16, HeaderMap)>> {
        let chunks = self.chunks.clone();
        Box::pin(async move {
            tokio::spawn(async move {
                for chunk in chunks {
                    if !sink.push(chunk) {
                        return;
                    }
                    tokio::task::yield_now().await;
                }
            });
            Ok((200, HeaderMap::new()))
        })
    }
}

#[tokio::test]
async fn text_chunk_transport_matches_byte_transport() {
    let chunks = vec![
        "data: {\"type\":\"reasoning\",\"data\":\"thinking\"}\n".to_string(),
        "data: {\"type\":\"chunk\",\"data\":\"Hel".to_string(),
        "lo\"}\n\ndata: {\"type\":\"chunk\",\"data\":\" world\"}\n".to_string(),
        "data: [DONE]\n".to_string(),
    ];

    let base_url = start_sse_server(chunks.clone()).await.expect("server");
    let (bytes_client, _) = reqwest_client(&base_url);
    let (text_client, _) = client_with(
        Arc::new(TextChunkTransport::new(Arc::new(PushingBridge { chunks }))),
        "http://localhost",
    );

    let recorded = Arc::new(Recorded::default());
    let from_bytes = chat(&bytes_client, RequestOptions::default(), &recorded)
        .wait()
        .await
        .into_result()
        .expect("bytes");
    let from_text = chat(&text_client, RequestOptions::default(), &recorded)
        .wait()
        .await
        .into_result()
        .expect("text");
    assert_eq!(from_bytes, from_text);
    assert_eq!(from_text.content, "Hello world");
    assert_eq!(from_text.reasoning, "thinking");
}

#[tokio::test]
async fn adapter_streams_decode_vendor_deltas_without_the_session_token() {
    let transport = Arc::new(
        MockTransport::new()
            .stream(
                200,
                vec![
                    Fragment::from("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n"),
                    Fragment::from("data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n"),
                    Fragment::from("data: [DONE]\n\n"),
                ],
            )
            .stream(
                200,
                vec![
                    Fragment::from("event: content_block_delta\n"),
                    Fragment::from(concat!(
                        "data: {\"type\":\"content_block_delta\",",
                        "\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
                    )),
                    Fragment::from("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"),
                ],
            ),
    );
    let client = Client::builder(transport.clone(), Arc::new(RecordingErrorHandler::default()))
        .credentials(Arc::new(MemoryCredentials::new("platform-session")))
        .build()
        .expect("client");

    let openai = GenericAdapter::new(
        ProviderConfig::new(ProviderKind::OpenAiCompatible, "https://llm.example/v1")
            .with_default_model("gpt-4o-mini"),
    );
    let anthropic = GenericAdapter::new(
        ProviderConfig::new(ProviderKind::Anthropic, "https://api.anthropic.com")
            .with_api_key("sk-ant")
            .with_default_model("claude"),
    );
    let call = ChatCall::new(vec![ChatMessage::user("hi")]).streaming();
    let recorded = Arc::new(Recorded::default());

    let request = openai.descriptor(call.clone()).expect("descriptor");
    let first = client
        .stream_request(request, recorded.callbacks())
        .wait()
        .await
        .into_result()
        .expect("openai stream");
    assert_eq!(first.content, "Hello");

    let request = anthropic.descriptor(call).expect("descriptor");
    let second = client
        .stream_request(request, recorded.callbacks())
        .wait()
        .await
        .into_result()
        .expect("anthropic stream");
    assert_eq!(second.content, "Hi");
    assert_eq!(recorded.deltas(), vec!["Hel", "lo", "Hi"]);

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests
        .iter()
        .all(|req| req.headers().get("authorization").is_none()));
    assert_eq!(requests[1].headers().get("x-api-key").unwrap(), "sk-ant");
}
