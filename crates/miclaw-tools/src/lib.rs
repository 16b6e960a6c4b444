// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod registry;
pub mod tool;
pub mod truncate;

pub use registry::ToolRegistry;
pub use tool::{Tool, ToolCall, ToolResult, BRIDGEABLE_TOOLS, PROCESS_TOOL};

pub use builtin::cron::{CronAddTool, CronListTool, CronRemoveTool};
pub use builtin::edit_file::EditFileTool;
pub use builtin::exec::ExecTool;
pub use builtin::glob::GlobTool;
pub use builtin::grep::GrepTool;
pub use builtin::list_dir::ListDirTool;
pub use builtin::memory_search::MemorySearchTool;
pub use builtin::message::{MessageSink, MessageTool};
pub use builtin::process::{ProcessManager, ProcessTool};
pub use builtin::read_file::ReadFileTool;
pub use builtin::sessions::{SessionsHistoryTool, SessionsListTool};
pub use builtin::write_file::WriteFileTool;
