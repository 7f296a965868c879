// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use rho_config::AgentConfig;
use rho_model::{catalog, ModelClient, OpenAiClient};
use rho_tools::{CapabilityProfile, ToolFactory, ToolRegistry};

/// The profile/registry pair, swapped as a unit by `reconfigure`.
struct ToolSurface {
    profile: CapabilityProfile,
    registry: Arc<ToolRegistry>,
}

/// Immutable agent identity: resolved system prompt, capability profile,
/// frozen tool registry, model configuration.
///
/// An agent owns no conversation data; it is a factory for model clients
/// and the template from which sessions freeze their tool surface.  The
/// single mutation it allows is an atomic `reconfigure`, which rebuilds the
/// profile/registry pair — sessions created before a reconfigure keep the
/// surface they froze.
pub struct Agent {
    config: AgentConfig,
    system_prompt: String,
    working_dir: PathBuf,
    surface: RwLock<ToolSurface>,
}

impl Agent {
    /// Build an agent from its config: resolve the system prompt and the
    /// capability profile, then materialize the tool registry.
    pub fn new(config: AgentConfig) -> anyhow::Result<Self> {
        let system_prompt = config.resolve_system_prompt()?;
        let profile = CapabilityProfile::load(&config.profile)?;
        Ok(Self::with_resolved(config, system_prompt, profile))
    }

    /// Build an agent from pre-resolved parts.  Used by the delegate tool,
    /// which hands a child a modified profile rather than a profile name.
    pub fn with_resolved(
        config: AgentConfig,
        system_prompt: String,
        profile: CapabilityProfile,
    ) -> Self {
        let working_dir = config
            .working_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let registry = Arc::new(
            ToolFactory::new(profile.clone()).create_registry(&working_dir, &config.databases),
        );
        Self {
            config,
            system_prompt,
            working_dir,
            surface: RwLock::new(ToolSurface { profile, registry }),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn profile(&self) -> CapabilityProfile {
        self.surface
            .read()
            .expect("tool surface lock poisoned")
            .profile
            .clone()
    }

    /// Snapshot of the current registry.  Sessions call this once at
    /// construction; the snapshot is their frozen tool surface.
    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.surface
            .read()
            .expect("tool surface lock poisoned")
            .registry
            .clone()
    }

    /// Atomically replace the tool surface with one rebuilt from a new
    /// profile.  Running sessions are unaffected; the next session picks
    /// up the new surface.
    pub fn reconfigure(&self, profile: CapabilityProfile) {
        let registry = Arc::new(
            ToolFactory::new(profile.clone())
                .create_registry(&self.working_dir, &self.config.databases),
        );
        let mut surface = self.surface.write().expect("tool surface lock poisoned");
        *surface = ToolSurface { profile, registry };
    }

    /// Construct a model client for one session.
    pub fn create_client(&self) -> Arc<dyn ModelClient> {
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        Arc::new(
            OpenAiClient::new(&self.config.model, api_key, self.config.base_url.as_deref())
                .with_service_tier(self.config.service_tier.clone())
                .with_reasoning_effort(self.config.reasoning_effort.clone())
                .with_response_format(self.config.response_format.clone()),
        )
    }

    /// Context window in tokens: the config override when present, else the
    /// catalog entry for the model.  `None` disables auto-compaction.
    pub fn context_window(&self) -> Option<u64> {
        self.config
            .context_window
            .or_else(|| catalog::context_window(&self.config.model))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
