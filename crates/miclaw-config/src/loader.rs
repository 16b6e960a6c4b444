// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Default config location: `~/.miclaw/config.json`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".miclaw/config.json")
}

/// Load and validate the configuration.
///
/// Defaults are applied during deserialization (serde `default` attributes),
/// then the fully-defaulted struct is validated strictly — the first
/// offending field aborts startup.  A missing file at the *default* location
/// yields the built-in defaults (which then fail validation on the empty
/// provider model, producing a useful first-run error); an explicitly passed
/// path must exist.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    let config: Config = if path.is_file() {
        debug!(path = %path.display(), "loading config");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
    } else if explicit.is_some() {
        anyhow::bail!("config file not found: {}", path.display());
    } else {
        Config::default()
    };

    config.validate()?;
    Ok(config)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_explicit_missing_path_errors() {
        let result = load(Some(Path::new("/tmp/miclaw_nonexistent_config_xyz.json")));
        assert!(result.is_err());
    }

    #[test]
    fn load_valid_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"provider": {{"backend": "lmstudio", "model": "qwen3"}}}}"#
        )
        .unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.provider.model, "qwen3");
    }

    #[test]
    fn load_rejects_invalid_field() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        // Empty model fails validation even though the JSON parses.
        write!(f, r#"{{"provider": {{"backend": "openrouter", "model": ""}}}}"#).unwrap();
        let err = load(Some(f.path())).unwrap_err();
        assert!(err.to_string().contains("provider.model"));
    }

    #[test]
    fn load_rejects_malformed_json() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "not json").unwrap();
        assert!(load(Some(f.path())).is_err());
    }
}
