// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
mod capability;
mod factory;
mod registry;
mod tool;
mod truncate;

pub use capability::{
    ApprovalMode, CapabilityProfile, DatabaseMode, FileWriteMode, ShellMode,
};
pub use factory::ToolFactory;
pub use registry::{ToolRegistry, ToolSpec};
pub use tool::{Cancelled, ToolHandler, ToolInvocation, ToolOutput};
pub use truncate::{truncate_output, TruncateOptions};

pub use builtin::bash::BashTool;
pub use builtin::edit_file::EditFileTool;
pub use builtin::glob::GlobTool;
pub use builtin::grep::GrepTool;
pub use builtin::list_dir::ListDirTool;
pub use builtin::read_file::ReadFileTool;
pub use builtin::sqlite::SqliteTool;
pub use builtin::write_file::WriteFileTool;
