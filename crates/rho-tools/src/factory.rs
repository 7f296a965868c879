// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use crate::builtin::{
    bash::BashTool, edit_file::EditFileTool, glob::GlobTool, grep::GrepTool,
    list_dir::ListDirTool, read_file::ReadFileTool, sqlite::SqliteTool,
    write_file::WriteFileTool,
};
use crate::{CapabilityProfile, DatabaseMode, FileWriteMode, ShellMode, ToolRegistry};

/// Materializes a [`CapabilityProfile`] into a configured [`ToolRegistry`].
///
/// Runtime-aware tools (the delegate sub-agent) are injected by the session
/// layer, not here — their construction needs the owning session's approval
/// callback and cancel check.
pub struct ToolFactory {
    profile: CapabilityProfile,
}

impl ToolFactory {
    pub fn new(profile: CapabilityProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &CapabilityProfile {
        &self.profile
    }

    /// Build a registry bound to a working directory.
    ///
    /// `databases` lists SQLite files exposed through the sqlite tool; an
    /// empty list leaves the tool unregistered.
    pub fn create_registry(&self, working_dir: &Path, databases: &[PathBuf]) -> ToolRegistry {
        let mut registry = ToolRegistry::new();

        self.register_bash(&mut registry, working_dir);
        if self.profile.bash_only {
            return registry;
        }

        self.register_core_tools(&mut registry);
        self.register_write_tools(&mut registry);
        self.register_database_tools(&mut registry, databases);

        registry
    }

    fn register_bash(&self, registry: &mut ToolRegistry, working_dir: &Path) {
        registry.register(BashTool {
            restricted: self.profile.shell == ShellMode::Restricted,
            working_dir: working_dir.to_path_buf(),
            timeout_secs: self.profile.shell_timeout_secs,
            requires_approval: self.profile.requires_tool_approval("bash"),
        });
    }

    fn register_core_tools(&self, registry: &mut ToolRegistry) {
        registry.register(ReadFileTool);
        registry.register(ListDirTool);
        registry.register(GlobTool);
        registry.register(GrepTool);
    }

    fn register_write_tools(&self, registry: &mut ToolRegistry) {
        if self.profile.file_write == FileWriteMode::Off {
            return;
        }
        registry.register(WriteFileTool {
            create_only: self.profile.file_write == FileWriteMode::CreateOnly,
            requires_approval: self.profile.requires_tool_approval("write_file"),
        });
        // Editing existing files is meaningful only with full write access.
        if self.profile.file_write == FileWriteMode::Full {
            registry.register(EditFileTool {
                requires_approval: self.profile.requires_tool_approval("edit_file"),
            });
        }
    }

    fn register_database_tools(&self, registry: &mut ToolRegistry, databases: &[PathBuf]) {
        if databases.is_empty() {
            return;
        }
        registry.register(SqliteTool::new(
            databases.to_vec(),
            self.profile.database == DatabaseMode::ReadOnly,
            self.profile.requires_tool_approval("sqlite"),
        ));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
