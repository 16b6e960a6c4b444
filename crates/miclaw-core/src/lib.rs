// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod agent;
mod bus;
mod compact;
mod events;
mod prompt;

pub use agent::{Agent, AgentTuning};
pub use bus::{EventBus, Subscription};
pub use compact::{last_user_text, repair_dangling_tool_calls, trim_to_assistant_tail};
pub use events::{AgentEvent, EventKind, Input, InputSink, Source};
pub use prompt::{build_system_prompt, PromptContext};
