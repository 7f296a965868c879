// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{Message, Prompt, StreamEvent, Usage};

/// A typed event stream for one model call.
///
/// Transport failures do not surface as stream errors: every failure mode is
/// folded into a [`StreamEvent::Error`] terminator so consumers handle a
/// single event shape.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// A streaming model client.  The wire format is opaque to callers; the
/// contract is the [`StreamEvent`] sequence only.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Model identifier as reported to users and telemetry.
    fn model(&self) -> &str;

    /// Stream one completion for the given prompt.
    async fn stream(&self, prompt: Prompt) -> EventStream;

    /// Non-streaming completion over bare messages.  Used only by the
    /// compaction summarizer.
    async fn complete(&self, messages: Vec<Message>) -> anyhow::Result<(String, Usage)>;
}
