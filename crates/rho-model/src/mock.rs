// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{EventStream, Message, ModelClient, Prompt, StreamEvent, Usage};

/// A pre-scripted mock client.  Each call to `stream` pops the next response
/// script from the front of the queue.  This lets tests specify exact event
/// sequences — including tool calls — without network access.
pub struct ScriptedMockClient {
    scripts: Mutex<Vec<Vec<StreamEvent>>>,
    /// Scripted `(text, usage)` responses for `complete` calls, popped FIFO.
    complete_scripts: Mutex<Vec<(String, Usage)>>,
    /// The last `Prompt` seen by `stream`, for test inspection.
    pub last_prompt: Arc<Mutex<Option<Prompt>>>,
}

impl ScriptedMockClient {
    /// Build a client from a list of response scripts.  The outer `Vec` is
    /// the ordered list of calls; the inner `Vec` is the event sequence
    /// emitted for that call.
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            complete_scripts: Mutex::new(Vec::new()),
            last_prompt: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: client that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![
            StreamEvent::Text {
                content: reply.into(),
            },
            StreamEvent::Done {
                usage: Usage {
                    input_tokens: 5,
                    output_tokens: 5,
                    ..Usage::default()
                },
            },
        ]])
    }

    /// Convenience: client that returns a tool call, then a text reply on
    /// the following call.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                StreamEvent::ToolCall {
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                StreamEvent::Done {
                    usage: Usage {
                        input_tokens: 10,
                        output_tokens: 5,
                        ..Usage::default()
                    },
                },
            ],
            vec![
                StreamEvent::Text {
                    content: final_text.into(),
                },
                StreamEvent::Done {
                    usage: Usage {
                        input_tokens: 15,
                        output_tokens: 3,
                        ..Usage::default()
                    },
                },
            ],
        ])
    }

    /// Queue a scripted response for the next `complete` call.
    pub fn push_complete(&self, text: impl Into<String>, usage: Usage) {
        self.complete_scripts
            .lock()
            .unwrap()
            .push((text.into(), usage));
    }
}

#[async_trait]
impl ModelClient for ScriptedMockClient {
    fn model(&self) -> &str {
        "scripted-mock"
    }

    async fn stream(&self, prompt: Prompt) -> EventStream {
        *self.last_prompt.lock().unwrap() = Some(prompt);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed.
                vec![
                    StreamEvent::Text {
                        content: "[no more scripts]".into(),
                    },
                    StreamEvent::Done {
                        usage: Usage::default(),
                    },
                ]
            } else {
                scripts.remove(0)
            }
        };
        Box::pin(stream::iter(events))
    }

    async fn complete(&self, _messages: Vec<Message>) -> anyhow::Result<(String, Usage)> {
        let mut scripts = self.complete_scripts.lock().unwrap();
        if scripts.is_empty() {
            return Ok((
                "[mock summary]".into(),
                Usage {
                    input_tokens: 8,
                    output_tokens: 4,
                    ..Usage::default()
                },
            ));
        }
        Ok(scripts.remove(0))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
