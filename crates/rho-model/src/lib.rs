// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod catalog;
mod client;
mod mock;
mod openai;
mod types;

pub use client::{EventStream, ModelClient};
pub use mock::ScriptedMockClient;
pub use openai::OpenAiClient;
pub use types::{
    FunctionCall, Message, Prompt, Role, StreamEvent, ToolCallSpec, ToolSpec, Usage,
};
