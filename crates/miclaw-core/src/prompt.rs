// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Inputs to the per-turn system prompt.
///
/// The agent snapshots this before every turn, so `set_workspace` /
/// `set_skills` take effect on the next prompt build without touching
/// running turns.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    /// Workspace overview (path plus whatever the runtime chooses to
    /// surface, e.g. a top-level listing).
    pub workspace: Option<String>,
    /// Skill descriptions appended verbatim.
    pub skills: Vec<String>,
    /// Memory recall block, present when the memory index is enabled.
    pub memory_note: Option<String>,
}

pub fn build_system_prompt(ctx: &PromptContext) -> String {
    let mut prompt = String::from(
        "You are miclaw, an always-on assistant. You reply to messages from \
         several channels and can use tools to read and change the \
         workspace, run commands, search memory, and schedule reminders. \
         Keep replies concise; channel messages are read on small screens.",
    );
    if let Some(workspace) = &ctx.workspace {
        prompt.push_str("\n\n## Workspace\n");
        prompt.push_str(workspace);
    }
    if !ctx.skills.is_empty() {
        prompt.push_str("\n\n## Skills\n");
        for skill in &ctx.skills {
            prompt.push_str("- ");
            prompt.push_str(skill);
            prompt.push('\n');
        }
    }
    if let Some(memory) = &ctx.memory_note {
        prompt.push_str("\n\n## Memory\n");
        prompt.push_str(memory);
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_context_still_produces_identity() {
        let prompt = build_system_prompt(&PromptContext::default());
        assert!(prompt.contains("miclaw"));
        assert!(!prompt.contains("## Workspace"));
    }

    #[test]
    fn workspace_and_skills_are_included() {
        let ctx = PromptContext {
            workspace: Some("/home/user/notes".into()),
            skills: vec!["calendar: manage events".into()],
            memory_note: None,
        };
        let prompt = build_system_prompt(&ctx);
        assert!(prompt.contains("/home/user/notes"));
        assert!(prompt.contains("calendar: manage events"));
    }
}
