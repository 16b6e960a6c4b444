// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use miclaw_scheduler::CronScheduler;

use crate::tool::{Tool, ToolCall, ToolResult};

/// Schedule a recurring prompt.
pub struct CronAddTool {
    pub scheduler: Arc<CronScheduler>,
}

#[async_trait]
impl Tool for CronAddTool {
    fn name(&self) -> &str {
        "cron_add"
    }

    fn description(&self) -> &str {
        "Add a cron job. 'schedule' is a five-field cron expression \
         (minute granularity), 'prompt' is injected into the cron session \
         when it fires."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "schedule": { "type": "string", "description": "Cron expression, e.g. '*/15 * * * *'" },
                "prompt": { "type": "string", "description": "Prompt to run on schedule" }
            },
            "required": ["schedule", "prompt"],
            "additionalProperties": false
        })
    }

    async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult> {
        let Some(schedule) = call.str_arg("schedule") else {
            return Ok(ToolResult::err(&call.id, "missing 'schedule'"));
        };
        let Some(prompt) = call.str_arg("prompt") else {
            return Ok(ToolResult::err(&call.id, "missing 'prompt'"));
        };
        match self.scheduler.add_job(schedule, prompt) {
            Ok(id) => Ok(ToolResult::ok(&call.id, format!("added job {id}"))),
            Err(e) => Ok(ToolResult::err(&call.id, e.to_string())),
        }
    }
}

/// List scheduled jobs with their next firing time.
pub struct CronListTool {
    pub scheduler: Arc<CronScheduler>,
}

#[async_trait]
impl Tool for CronListTool {
    fn name(&self) -> &str {
        "cron_list"
    }

    fn description(&self) -> &str {
        "List scheduled cron jobs."
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult> {
        match self.scheduler.list_jobs() {
            Ok(jobs) if jobs.is_empty() => Ok(ToolResult::ok(&call.id, "(no jobs)")),
            Ok(jobs) => {
                let lines: Vec<String> = jobs
                    .iter()
                    .map(|j| {
                        format!(
                            "{} [{}] next {} — {}",
                            j.id,
                            j.schedule,
                            j.next_run.format("%Y-%m-%d %H:%M UTC"),
                            j.prompt
                        )
                    })
                    .collect();
                Ok(ToolResult::ok(&call.id, lines.join("\n")))
            }
            Err(e) => Ok(ToolResult::err(&call.id, e.to_string())),
        }
    }
}

/// Remove a job by id.
pub struct CronRemoveTool {
    pub scheduler: Arc<CronScheduler>,
}

#[async_trait]
impl Tool for CronRemoveTool {
    fn name(&self) -> &str {
        "cron_remove"
    }

    fn description(&self) -> &str {
        "Remove a cron job by its id."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "integer", "description": "Job id from cron_list" }
            },
            "required": ["id"],
            "additionalProperties": false
        })
    }

    async fn run(&self, call: &ToolCall) -> anyhow::Result<ToolResult> {
        let Some(id) = call.u64_arg("id") else {
            return Ok(ToolResult::err(&call.id, "missing 'id'"));
        };
        match self.scheduler.remove_job(id as i64) {
            Ok(()) => Ok(ToolResult::ok(&call.id, format!("removed job {id}"))),
            Err(e) => Ok(ToolResult::err(&call.id, e.to_string())),
        }
    }
}
