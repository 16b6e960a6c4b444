// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod mock;
mod openai_compat;
mod provider;
mod types;

pub use mock::ScriptedProvider;
pub use openai_compat::OpenAICompatProvider;
pub use provider::{from_config, EventStream, Provider};
pub use types::{
    CompletionRequest, Message, Part, ProviderEvent, Role, ToolSchema, Usage,
};
