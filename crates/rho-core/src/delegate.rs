// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Delegate: spawn one child agent to execute a focused instruction.
//!
//! The child runs with the parent's configuration but a profile with
//! delegation stripped, so a delegate can never spawn another delegate.
//! It inherits the parent's approval callback and observes the parent's
//! cancellation through the shared [`SessionHooks`].

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rho_config::AgentConfig;
use rho_model::ModelClient;
use rho_tools::{CapabilityProfile, ToolHandler, ToolInvocation, ToolOutput};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::agent::Agent;
use crate::events::RunStatus;
use crate::session::{Session, SessionHooks};
use crate::state::State;

pub struct DelegateTool {
    parent_config: AgentConfig,
    parent_system_prompt: String,
    child_profile: CapabilityProfile,
    hooks: Arc<SessionHooks>,
    requires_approval: bool,
    /// Test seam: a fixed client for the child session instead of one
    /// built from the config.
    client_override: Option<Arc<dyn ModelClient>>,
}

impl DelegateTool {
    pub fn new(agent: &Agent, hooks: Arc<SessionHooks>) -> Self {
        let profile = agent.profile();
        Self {
            parent_config: agent.config().clone(),
            parent_system_prompt: agent.system_prompt().to_string(),
            child_profile: profile.without_delegate(),
            requires_approval: profile.requires_tool_approval("delegate"),
            hooks,
            client_override: None,
        }
    }

    pub fn with_client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.client_override = Some(client);
        self
    }
}

#[async_trait]
impl ToolHandler for DelegateTool {
    fn name(&self) -> &str {
        "delegate"
    }

    fn description(&self) -> &str {
        "Spawn a one-time child agent to execute a focused instruction and \
         return its final text output."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "instruction": {
                    "type": "string",
                    "description": "Instruction for the child agent to execute."
                },
                "full_context": {
                    "type": "boolean",
                    "description": "If true, the child receives a snapshot of the parent conversation history. If false, the child starts with empty history.",
                    "default": false
                }
            },
            "required": ["instruction"]
        })
    }

    fn requires_approval(&self) -> bool {
        self.requires_approval
    }

    async fn handle(&self, invocation: &ToolInvocation) -> anyhow::Result<ToolOutput> {
        let instruction = invocation.str_arg("instruction").unwrap_or("").trim().to_string();
        if instruction.is_empty() {
            return Ok(ToolOutput::err("Delegate requires a non-empty instruction."));
        }
        let full_context = invocation.bool_arg("full_context").unwrap_or(false);

        let child_agent = Arc::new(Agent::with_resolved(
            self.parent_config.clone(),
            self.parent_system_prompt.clone(),
            self.child_profile.clone(),
        ));

        let mut child_state = State::new();
        if full_context {
            child_state.messages = self.hooks.history_snapshot();
        }

        let client = match &self.client_override {
            Some(c) => Arc::clone(c),
            None => child_agent.create_client(),
        };
        let mut child_session = Session::with_client_and_state(child_agent, client, child_state);
        child_session.set_approval_callback(self.hooks.approval_callback());
        let parent_hooks = Arc::clone(&self.hooks);
        child_session.set_cancel_check(Some(Arc::new(move || parent_hooks.is_cancelled())));

        debug!(
            child_session_id = %child_session.id(),
            full_context,
            "delegate: spawning child agent"
        );

        let started = Instant::now();
        let child_id = child_session.id().to_string();
        let result = child_session.run(&instruction).await;

        let mut metadata = Map::new();
        metadata.insert(
            "child_usage".into(),
            serde_json::to_value(result.usage.usage).unwrap_or(Value::Null),
        );
        metadata.insert("child_status".into(), json!(result.status.as_str()));
        metadata.insert("child_session_id".into(), json!(child_id));
        metadata.insert(
            "duration_seconds".into(),
            json!((started.elapsed().as_secs_f64() * 100.0).round() / 100.0),
        );

        Ok(ToolOutput {
            content: result.text,
            success: result.status == RunStatus::Completed,
            metadata,
        })
    }
}
