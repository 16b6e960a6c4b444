// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so a named function is required for enabled-by-default
/// fields.
fn default_true() -> bool {
    true
}

fn default_text_chunk_limit() -> usize {
    2000
}

fn default_media_max_mb() -> u64 {
    8
}

fn default_min_score() -> f32 {
    0.25
}

fn default_results() -> usize {
    6
}

fn default_max_tokens() -> u32 {
    8192
}

/// Error returned when a config field fails validation.  Carries the path of
/// the first offending field so the startup error message is actionable.
#[derive(Debug, thiserror::Error)]
#[error("invalid config: {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub signal: SignalConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Workspace directory the agent operates on.  Relative paths are
    /// resolved against the process working directory at startup.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    /// Directory holding all persistent state (SQLite stores, sandbox
    /// sockets and shims).  Defaults to `~/.miclaw/state`.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

impl Config {
    /// Validate the fully-defaulted config, reporting the first offending
    /// field.  Called once at startup; a failure here is fatal.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.provider.validate()?;
        self.signal.validate()?;
        self.webhook.validate()?;
        self.sandbox.validate()?;
        self.memory.validate()?;
        Ok(())
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.workspace.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".miclaw/state")
        })
    }
}

// ─── Provider ─────────────────────────────────────────────────────────────────

/// Which LLM backend the runtime talks to.  All three speak the
/// OpenAI-compatible `/chat/completions` SSE wire format; the backend
/// selects the default base URL and auth expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderBackend {
    Openrouter,
    Lmstudio,
    Codex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingEffort {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub backend: ProviderBackend,
    /// Base URL override; the backend default is used when empty.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub thinking_effort: ThinkingEffort,
    /// Opaque provider-side store flag forwarded verbatim (codex backend).
    #[serde(default)]
    pub store: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            backend: ProviderBackend::Openrouter,
            base_url: None,
            api_key: None,
            model: String::new(),
            max_tokens: default_max_tokens(),
            thinking_effort: ThinkingEffort::default(),
            store: false,
        }
    }
}

impl ProviderConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.model.is_empty() {
            return Err(ValidationError::new("provider.model", "must not be empty"));
        }
        if self.max_tokens == 0 {
            return Err(ValidationError::new("provider.max_tokens", "must be > 0"));
        }
        Ok(())
    }
}

// ─── Signal ───────────────────────────────────────────────────────────────────

/// Access policy for DMs or groups on the Signal channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessPolicy {
    Open,
    #[default]
    Disabled,
    Allowlist,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalConfig {
    #[serde(default)]
    pub enabled: bool,
    /// The account's own number; inbound envelopes from this sender are
    /// dropped as self-messages.
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub http_host: String,
    #[serde(default)]
    pub http_port: u16,
    /// Path to the signal-cli binary when auto_start is set.
    #[serde(default)]
    pub cli_path: Option<PathBuf>,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub dm_policy: AccessPolicy,
    #[serde(default)]
    pub group_policy: AccessPolicy,
    /// Phone numbers, UUIDs (DMs) and group ids accepted under the
    /// allowlist policies.
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default = "default_text_chunk_limit")]
    pub text_chunk_limit: usize,
    #[serde(default = "default_media_max_mb")]
    pub media_max_mb: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            account: String::new(),
            http_host: "127.0.0.1".into(),
            http_port: 8080,
            cli_path: None,
            auto_start: false,
            dm_policy: AccessPolicy::default(),
            group_policy: AccessPolicy::default(),
            allowlist: Vec::new(),
            text_chunk_limit: default_text_chunk_limit(),
            media_max_mb: default_media_max_mb(),
        }
    }
}

impl SignalConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if !self.enabled {
            return Ok(());
        }
        if self.account.is_empty() {
            return Err(ValidationError::new(
                "signal.account",
                "required when signal.enabled",
            ));
        }
        if self.http_host.is_empty() {
            return Err(ValidationError::new(
                "signal.http_host",
                "must not be empty",
            ));
        }
        if self.text_chunk_limit == 0 {
            return Err(ValidationError::new(
                "signal.text_chunk_limit",
                "must be > 0",
            ));
        }
        Ok(())
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.http_host, self.http_port)
    }
}

// ─── Webhook ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookConfig {
    pub id: String,
    pub path: String,
    /// HMAC-SHA256 secret; unsigned hooks (no secret) accept any request.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub format: HookFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub listen: String,
    #[serde(default)]
    pub hooks: Vec<HookConfig>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "127.0.0.1:8710".into(),
            hooks: Vec::new(),
        }
    }
}

impl WebhookConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if !self.enabled {
            return Ok(());
        }
        if self.listen.is_empty() {
            return Err(ValidationError::new(
                "webhook.listen",
                "required when webhook.enabled",
            ));
        }
        for hook in &self.hooks {
            if hook.id.is_empty() {
                return Err(ValidationError::new("webhook.hooks.id", "must not be empty"));
            }
            if !hook.path.starts_with('/') {
                return Err(ValidationError::new(
                    "webhook.hooks.path",
                    format!("{:?} must start with '/'", hook.path),
                ));
            }
        }
        Ok(())
    }
}

// ─── Sandbox ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    Ro,
    #[default]
    Rw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountConfig {
    pub host: PathBuf,
    pub container: PathBuf,
    #[serde(default)]
    pub mode: MountMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Docker network for the sidecar container ("none" for no network).
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
    /// uid:gid the container runs as; empty uses the current user.
    #[serde(default)]
    pub host_user: Option<String>,
    /// Commands the sandbox may execute on the host through the broker.
    #[serde(default)]
    pub host_commands: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            network: "none".into(),
            mounts: Vec::new(),
            host_user: None,
            host_commands: Vec::new(),
        }
    }
}

impl SandboxConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if !self.enabled {
            return Ok(());
        }
        for m in &self.mounts {
            if !m.container.is_absolute() {
                return Err(ValidationError::new(
                    "sandbox.mounts.container",
                    format!("{:?} must be absolute", m.container),
                ));
            }
        }
        for cmd in &self.host_commands {
            if cmd.is_empty() || cmd.contains('/') || cmd.chars().any(char::is_whitespace) {
                return Err(ValidationError::new(
                    "sandbox.host_commands",
                    format!("{cmd:?} must be a bare command name"),
                ));
            }
        }
        Ok(())
    }
}

// ─── Memory ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CitationsMode {
    On,
    Off,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub embedding_url: String,
    #[serde(default)]
    pub embedding_model: String,
    #[serde(default)]
    pub embedding_api_key: Option<String>,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default = "default_results")]
    pub default_results: usize,
    #[serde(default)]
    pub citations: CitationsMode,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            embedding_url: String::new(),
            embedding_model: String::new(),
            embedding_api_key: None,
            min_score: default_min_score(),
            default_results: default_results(),
            citations: CitationsMode::default(),
        }
    }
}

impl MemoryConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if !self.enabled {
            return Ok(());
        }
        if self.embedding_url.is_empty() {
            return Err(ValidationError::new(
                "memory.embedding_url",
                "required when memory.enabled",
            ));
        }
        if self.embedding_model.is_empty() {
            return Err(ValidationError::new(
                "memory.embedding_model",
                "required when memory.enabled",
            ));
        }
        if self.default_results == 0 {
            return Err(ValidationError::new(
                "memory.default_results",
                "must be > 0",
            ));
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut cfg = Config::default();
        cfg.provider.model = "gpt-test".into();
        cfg
    }

    #[test]
    fn default_config_fails_on_empty_model() {
        let err = Config::default().validate().unwrap_err();
        assert_eq!(err.field, "provider.model");
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn disabled_sections_skip_validation() {
        let mut cfg = valid_config();
        cfg.signal.enabled = false;
        cfg.signal.account = String::new();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn enabled_signal_requires_account() {
        let mut cfg = valid_config();
        cfg.signal.enabled = true;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.field, "signal.account");
    }

    #[test]
    fn webhook_hook_path_must_be_absolute() {
        let mut cfg = valid_config();
        cfg.webhook.enabled = true;
        cfg.webhook.hooks.push(HookConfig {
            id: "h".into(),
            path: "relative".into(),
            secret: None,
            format: HookFormat::Text,
        });
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.field, "webhook.hooks.path");
    }

    #[test]
    fn host_command_with_slash_rejected() {
        let mut cfg = valid_config();
        cfg.sandbox.enabled = true;
        cfg.sandbox.host_commands.push("/bin/sh".into());
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.field, "sandbox.host_commands");
    }

    #[test]
    fn host_command_with_whitespace_rejected() {
        let mut cfg = valid_config();
        cfg.sandbox.enabled = true;
        cfg.sandbox.host_commands.push("git push".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn enabled_memory_requires_embedding_url() {
        let mut cfg = valid_config();
        cfg.memory.enabled = true;
        cfg.memory.embedding_model = "m".into();
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.field, "memory.embedding_url");
    }

    #[test]
    fn provider_backend_parses_lowercase() {
        let p: ProviderBackend = serde_json::from_str("\"lmstudio\"").unwrap();
        assert_eq!(p, ProviderBackend::Lmstudio);
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let result: Result<Config, _> =
            serde_json::from_str(r#"{"provider": {"backend": "openrouter", "model": "m"}, "bogus": 1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn signal_base_url_formats_host_and_port() {
        let mut s = SignalConfig::default();
        s.http_host = "localhost".into();
        s.http_port = 9000;
        assert_eq!(s.base_url(), "http://localhost:9000");
    }
}
