// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat-completions client.
//!
//! Speaks the `/v1/chat/completions` SSE streaming wire format.  Partial
//! tool-call deltas are accumulated internally and emitted as fully
//! assembled [`StreamEvent::ToolCall`]s before the final `Done`, so
//! consumers never see an argument fragment.
//!
//! Two watchdog timeouts guard the stream: one for the first chunk (slow
//! queue admission on busy backends) and one between subsequent chunks.
//! Exceeding either produces a terminating [`StreamEvent::Error`].

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::{catalog, EventStream, Message, ModelClient, Prompt, StreamEvent, Usage};

/// How long to wait between chunks before aborting the stream.
const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(180);

/// How long to wait for the first chunk.  Providers with queued admission
/// (service tiers, batch backends) can sit for minutes before streaming.
const DEFAULT_INITIAL_TIMEOUT: Duration = Duration::from_secs(600);

pub struct OpenAiClient {
    model: String,
    api_key: Option<String>,
    chat_url: String,
    service_tier: Option<String>,
    reasoning_effort: Option<String>,
    response_format: Option<Value>,
    chunk_timeout: Duration,
    initial_timeout: Duration,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(model: impl Into<String>, api_key: Option<String>, base_url: Option<&str>) -> Self {
        let base = base_url.unwrap_or("https://api.openai.com/v1");
        let base = base.trim_end_matches('/');
        Self {
            model: model.into(),
            api_key,
            chat_url: format!("{base}/chat/completions"),
            service_tier: None,
            reasoning_effort: None,
            response_format: None,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            initial_timeout: DEFAULT_INITIAL_TIMEOUT,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_service_tier(mut self, tier: Option<String>) -> Self {
        self.service_tier = tier;
        self
    }

    pub fn with_reasoning_effort(mut self, effort: Option<String>) -> Self {
        self.reasoning_effort = effort;
        self
    }

    pub fn with_response_format(mut self, format: Option<Value>) -> Self {
        self.response_format = format;
        self
    }

    pub fn with_timeouts(mut self, chunk: Duration, initial: Duration) -> Self {
        self.chunk_timeout = chunk;
        self.initial_timeout = initial;
        self
    }

    fn build_body(&self, prompt: &Prompt, stream: bool) -> Value {
        let mut messages: Vec<Value> = Vec::with_capacity(prompt.messages.len() + 1);
        messages.push(json!({"role": "system", "content": prompt.system}));
        for msg in &prompt.messages {
            messages.push(serde_json::to_value(msg).unwrap_or(Value::Null));
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        if !prompt.tools.is_empty() {
            body["tools"] = serde_json::to_value(&prompt.tools).unwrap_or(Value::Null);
        }
        if let Some(tier) = &self.service_tier {
            body["service_tier"] = json!(tier);
        }
        if let Some(effort) = &self.reasoning_effort {
            body["reasoning_effort"] = json!(effort);
        }
        if let Some(format) = &self.response_format {
            body["response_format"] = format.clone();
        }
        body
    }

    async fn send(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        let mut req = self.http.post(&self.chat_url).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.context("chat completions request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("provider error {status}: {text}");
        }
        Ok(resp)
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(&self, prompt: Prompt) -> EventStream {
        let body = self.build_body(&prompt, true);
        debug!(
            model = %self.model,
            tool_count = prompt.tools.len(),
            message_count = prompt.messages.len(),
            "sending streaming completion request"
        );

        let resp = match self.send(&body).await {
            Ok(r) => r,
            Err(e) => {
                return Box::pin(futures::stream::iter(vec![StreamEvent::Error {
                    message: e.to_string(),
                }]));
            }
        };

        let (tx, rx) = mpsc::channel(64);
        let model = self.model.clone();
        let chunk_timeout = self.chunk_timeout;
        let initial_timeout = self.initial_timeout;
        tokio::spawn(async move {
            pump(resp, model, chunk_timeout, initial_timeout, tx).await;
        });
        Box::pin(ReceiverStream::new(rx))
    }

    async fn complete(&self, messages: Vec<Message>) -> anyhow::Result<(String, Usage)> {
        // The compaction prompt carries its own system message in `messages`;
        // split it out so the body builder does not duplicate the role.
        let mut messages = messages;
        let system = if messages
            .first()
            .map(|m| m.role == crate::Role::System)
            .unwrap_or(false)
        {
            messages.remove(0).content.unwrap_or_default()
        } else {
            String::new()
        };
        let prompt = Prompt {
            system,
            messages,
            tools: vec![],
        };
        let body = self.build_body(&prompt, false);
        let resp = self.send(&body).await?;
        let v: Value = resp.json().await.context("decoding completion response")?;

        let text = v["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let mut usage = parse_usage(&v["usage"]);
        if let Some(cost) = catalog::cost_usd(&self.model, &usage) {
            usage.cost_usd = cost;
        }
        Ok((text, usage))
    }
}

/// Read the SSE byte stream, enforcing the chunk watchdogs, and forward
/// parsed events.  Owns the end-of-stream flush.
async fn pump(
    resp: reqwest::Response,
    model: String,
    chunk_timeout: Duration,
    initial_timeout: Duration,
    tx: mpsc::Sender<StreamEvent>,
) {
    let mut bytes = resp.bytes_stream();
    let mut assembler = SseAssembler::new(model);
    let mut deadline = initial_timeout;

    loop {
        let next = match tokio::time::timeout(deadline, bytes.next()).await {
            Ok(n) => n,
            Err(_) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: format!(
                            "model stream timed out: no chunk received within {}s",
                            deadline.as_secs()
                        ),
                    })
                    .await;
                return;
            }
        };
        deadline = chunk_timeout;

        match next {
            Some(Ok(chunk)) => {
                for event in assembler.feed(&String::from_utf8_lossy(&chunk)) {
                    let terminal = matches!(event, StreamEvent::Done { .. } | StreamEvent::Error { .. });
                    if tx.send(event).await.is_err() {
                        return; // consumer went away
                    }
                    if terminal {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: format!("model stream transport error: {e}"),
                    })
                    .await;
                return;
            }
            None => {
                // Stream closed without a [DONE] sentinel — some proxies drop
                // it.  Flush whatever was assembled and terminate normally.
                for event in assembler.finish() {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                return;
            }
        }
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental SSE parser and tool-call assembler.
///
/// `feed` consumes raw bytes (as text) and returns the events ready so far;
/// an SSE event split across TCP packets stays buffered until its newline
/// arrives.  Tool-call deltas accumulate keyed by the provider's parallel
/// index and are flushed, ordered by index, when the stream terminates.
struct SseAssembler {
    model: String,
    buf: String,
    pending: BTreeMap<u64, PendingToolCall>,
    usage: Usage,
    finished: bool,
}

impl SseAssembler {
    fn new(model: String) -> Self {
        Self {
            model,
            buf: String::new(),
            pending: BTreeMap::new(),
            usage: Usage::default(),
            finished: false,
        }
    }

    fn feed(&mut self, text: &str) -> Vec<StreamEvent> {
        self.buf.push_str(text);
        let mut out = Vec::new();
        while let Some(nl) = self.buf.find('\n') {
            let line = self.buf[..nl].trim_end_matches('\r').to_string();
            self.buf.drain(..=nl);
            self.handle_line(&line, &mut out);
            if self.finished {
                break;
            }
        }
        out
    }

    /// Flush assembled tool calls and the terminating `Done` event.
    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut out = Vec::new();

        let pending = std::mem::take(&mut self.pending);
        let mut seen_ids: Vec<String> = Vec::new();
        for (_, call) in pending {
            if call.name.is_empty() {
                warn!(tool_call_id = %call.id, "dropping tool call with empty name");
                continue;
            }
            if !call.id.is_empty() && seen_ids.iter().any(|s| s == &call.id) {
                // A provider repeating ids would make tool results ambiguous;
                // reject the stream rather than silently merging.
                out.push(StreamEvent::Error {
                    message: format!("provider repeated tool_call id '{}' within one turn", call.id),
                });
                return out;
            }
            seen_ids.push(call.id.clone());
            out.push(StreamEvent::ToolCall {
                id: call.id,
                name: call.name,
                arguments: if call.arguments.is_empty() {
                    "{}".into()
                } else {
                    call.arguments
                },
            });
        }

        let mut usage = self.usage;
        if let Some(cost) = catalog::cost_usd(&self.model, &usage) {
            usage.cost_usd = cost;
        }
        out.push(StreamEvent::Done { usage });
        out
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<StreamEvent>) {
        let data = match line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
            Some(d) => d.trim(),
            None => return,
        };
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            out.extend(self.finish());
            return;
        }
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => return, // comment or malformed keep-alive line
        };

        // Usage-only chunk (stream_options.include_usage).
        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            self.usage = parse_usage(usage);
            return;
        }

        let delta = &v["choices"][0]["delta"];

        if let Some(calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for tc in calls {
                let index = tc["index"].as_u64().unwrap_or(0);
                let slot = self.pending.entry(index).or_default();
                if let Some(id) = tc["id"].as_str().filter(|s| !s.is_empty()) {
                    slot.id = id.to_string();
                }
                if let Some(name) = tc["function"]["name"].as_str().filter(|s| !s.is_empty()) {
                    slot.name = name.to_string();
                }
                if let Some(args) = tc["function"]["arguments"].as_str() {
                    slot.arguments.push_str(args);
                }
            }
            return;
        }

        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                out.push(StreamEvent::Text {
                    content: text.to_string(),
                });
            }
        }
    }
}

fn parse_usage(usage: &Value) -> Usage {
    Usage {
        input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        cached_tokens: usage["prompt_tokens_details"]["cached_tokens"]
            .as_u64()
            .unwrap_or(0),
        reasoning_tokens: usage["completion_tokens_details"]["reasoning_tokens"]
            .as_u64()
            .unwrap_or(0),
        cost_usd: 0.0,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
