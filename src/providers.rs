//! Vendor adapters for chat endpoints.
//!
//! One [`GenericAdapter`] covers every vendor; the [`ProviderKind`] tag decides the
//! endpoint, the auth header and the body shape. Request mutation is explicit:
//! [`wrap`] layers pure [`CallTransform`]s over any adapter, and adapters are looked
//! up through a [`ProviderRegistry`] value owned by the caller.

use std::{collections::BTreeMap, fmt, sync::Arc};

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    errors::{Error, Result},
    http::{HeaderList, RequestOptions},
    request::{DescriptorBuilder, RequestDescriptor},
    vendor_stream::StreamFormat,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 4096;

/// Features a vendor family supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub streaming: bool,
    pub tools: bool,
    pub reasoning: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAiCompatible,
    Anthropic,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAiCompatible => "openai_compatible",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Ollama => "ollama",
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            ProviderKind::OpenAiCompatible | ProviderKind::Anthropic => Capabilities {
                streaming: true,
                tools: true,
                reasoning: true,
            },
            ProviderKind::Ollama => Capabilities {
                streaming: true,
                tools: true,
                reasoning: false,
            },
        }
    }

    /// Dialect of the vendor's streaming responses.
    pub fn stream_format(&self) -> StreamFormat {
        match self {
            ProviderKind::OpenAiCompatible => StreamFormat::OpenAi,
            ProviderKind::Anthropic => StreamFormat::Anthropic,
            ProviderKind::Ollama => StreamFormat::Ollama,
        }
    }

    fn default_chat_path(&self) -> &'static str {
        match self {
            ProviderKind::OpenAiCompatible => "/chat/completions",
            ProviderKind::Anthropic => "/v1/messages",
            ProviderKind::Ollama => "/api/chat",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: String,
    pub api_key: Option<String>,
    /// Overrides the vendor's default chat path.
    pub chat_path: Option<String>,
    pub default_model: Option<String>,
    pub extra_headers: HeaderList,
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind, base_url: impl Into<String>) -> Self {
        Self {
            kind,
            base_url: base_url.into(),
            api_key: None,
            chat_path: None,
            default_model: None,
            extra_headers: HeaderList::new(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into()).filter(|k| !k.trim().is_empty());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_chat_path(mut self, path: impl Into<String>) -> Self {
        self.chat_path = Some(path.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Vendor-neutral chat call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatCall {
    /// Falls back to the adapter's default model.
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub stream: bool,
    /// Tool definitions, passed through as JSON.
    pub tools: Vec<Value>,
}

impl ChatCall {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn tool(mut self, definition: Value) -> Self {
        self.tools.push(definition);
        self
    }
}

/// Turns a [`ChatCall`] into a request the client can send or stream.
pub trait ChatAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn descriptor(&self, call: ChatCall) -> Result<DescriptorBuilder>;
}

#[derive(Clone, Debug)]
pub struct GenericAdapter {
    config: ProviderConfig,
}

impl GenericAdapter {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        let path = self
            .config
            .chat_path
            .as_deref()
            .unwrap_or_else(|| self.config.kind.default_chat_path());
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn options(&self) -> RequestOptions {
        let mut options = RequestOptions::default()
            .with_dedupe(false)
            .skip_business_check()
            .with_stream_format(self.config.kind.stream_format());
        if let Some(key) = self.config.api_key.as_deref() {
            options = match self.config.kind {
                ProviderKind::Anthropic => options
                    .with_header("x-api-key", key)
                    .with_header("anthropic-version", ANTHROPIC_VERSION),
                ProviderKind::OpenAiCompatible | ProviderKind::Ollama => {
                    options.with_header("Authorization", format!("Bearer {key}"))
                }
            };
        } else if self.config.kind == ProviderKind::Anthropic {
            options = options.with_header("anthropic-version", ANTHROPIC_VERSION);
        }
        for entry in self.config.extra_headers.iter() {
            if entry.is_valid() {
                options = options.with_header(entry.key.clone(), entry.value.clone());
            }
        }
        options
    }

    fn body(&self, call: ChatCall, model: String) -> Result<Value> {
        let mut body = Map::new();
        body.insert("model".into(), Value::String(model));
        body.insert("stream".into(), Value::Bool(call.stream));

        match self.config.kind {
            ProviderKind::OpenAiCompatible => {
                body.insert("messages".into(), serde_json::to_value(&call.messages)?);
                if let Some(t) = call.temperature {
                    body.insert("temperature".into(), json!(t));
                }
            }
            ProviderKind::Anthropic => {
                let (system, messages): (Vec<_>, Vec<_>) =
                    call.messages.into_iter().partition(|m| m.role == "system");
                if !system.is_empty() {
                    let joined = system
                        .into_iter()
                        .map(|m| m.content)
                        .collect::<Vec<_>>()
                        .join("\n\n");
                    body.insert("system".into(), Value::String(joined));
                }
                body.insert("messages".into(), serde_json::to_value(&messages)?);
                body.insert("max_tokens".into(), json!(ANTHROPIC_MAX_TOKENS));
                if let Some(t) = call.temperature {
                    body.insert("temperature".into(), json!(t));
                }
            }
            ProviderKind::Ollama => {
                body.insert("messages".into(), serde_json::to_value(&call.messages)?);
                if let Some(t) = call.temperature {
                    body.insert("options".into(), json!({ "temperature": t }));
                }
            }
        }
        if !call.tools.is_empty() {
            body.insert("tools".into(), Value::Array(call.tools));
        }
        Ok(Value::Object(body))
    }
}

impl ChatAdapter for GenericAdapter {
    fn name(&self) -> &str {
        self.config.kind.as_str()
    }

    fn capabilities(&self) -> Capabilities {
        self.config.kind.capabilities()
    }

    fn descriptor(&self, call: ChatCall) -> Result<DescriptorBuilder> {
        let caps = self.capabilities();
        if call.stream && !caps.streaming {
            return Err(Error::Config(format!("{} does not support streaming", self.name())));
        }
        if !call.tools.is_empty() && !caps.tools {
            return Err(Error::Config(format!("{} does not support tools", self.name())));
        }
        if call.messages.is_empty() {
            return Err(Error::Config("chat call has no messages".into()));
        }
        let model = call
            .model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| Error::Config("model is required".into()))?;
        let body = self.body(call, model)?;
        Ok(RequestDescriptor::builder(Method::POST, self.endpoint())
            .body(body)
            .options(self.options()))
    }
}

/// Pure rewrite of a call, applied before the wrapped adapter sees it.
pub type CallTransform = Arc<dyn Fn(ChatCall) -> ChatCall + Send + Sync>;

/// Adapter decorated with an ordered list of transforms.
pub struct WrappedAdapter {
    inner: Arc<dyn ChatAdapter>,
    transforms: Vec<CallTransform>,
}

impl fmt::Debug for WrappedAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedAdapter")
            .field("inner", &self.inner.name())
            .field("transforms", &self.transforms.len())
            .finish()
    }
}

/// Decorate `adapter` so every call passes through `transforms` in order.
pub fn wrap(adapter: Arc<dyn ChatAdapter>, transforms: Vec<CallTransform>) -> WrappedAdapter {
    WrappedAdapter {
        inner: adapter,
        transforms,
    }
}

impl ChatAdapter for WrappedAdapter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn descriptor(&self, call: ChatCall) -> Result<DescriptorBuilder> {
        let call = self.transforms.iter().fold(call, |call, t| t(call));
        self.inner.descriptor(call)
    }
}

/// Named adapters. Construct one per application; there is no global instance.
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<String, Arc<dyn ChatAdapter>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` under `name`, returning the adapter it replaced.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        adapter: Arc<dyn ChatAdapter>,
    ) -> Option<Arc<dyn ChatAdapter>> {
        self.adapters.insert(name.into(), adapter)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChatAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Like [`ProviderRegistry::get`], but unknown names are a configuration error.
    pub fn require(&self, name: &str) -> Result<Arc<dyn ChatAdapter>> {
        self.get(name)
            .ok_or_else(|| Error::Config(format!("unknown provider: {name}")))
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn ChatAdapter>> {
        self.adapters.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
