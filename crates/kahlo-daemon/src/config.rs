// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! `kahlo.toml` loading (§3): `KAHLO_CONFIG` path, then `./kahlo.toml`, then
//! `$XDG_CONFIG_HOME/kahlo/config.toml`, else built-in defaults. Every field
//! is optional in the file; a missing or partial file still boots with the
//! spec's own defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("could not parse {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("could not determine a home directory for the default data/config paths")]
    NoHomeDir,
}

/// Resolved configuration, defaults already merged in.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub limits: Limits,
    pub timeouts: Timeouts,
    pub reload_watch: bool,
    /// §4.6 Start's runtime bundle, prepended to every job's script before
    /// injection. `None` means no bundle is configured.
    pub runtime_bundle_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub target_artifact_budget_bytes: u64,
    pub artifact_inline_threshold_bytes: u64,
    pub target_stream_capacity: usize,
    pub job_stream_capacity: usize,
    pub event_fetch_default_limit: usize,
    pub event_fetch_max_limit: usize,
    pub job_retention_secs: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub ping_ms: u64,
    pub device_resolve_ms: u64,
    pub attach_ms: u64,
    pub spawn_ms: u64,
    pub snapshot_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            target_artifact_budget_bytes: 524_288_000,
            artifact_inline_threshold_bytes: 32_768,
            target_stream_capacity: 5000,
            job_stream_capacity: 2000,
            event_fetch_default_limit: 200,
            event_fetch_max_limit: 5000,
            job_retention_secs: 3600,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self { ping_ms: 5000, device_resolve_ms: 10_000, attach_ms: 15_000, spawn_ms: 30_000, snapshot_ms: 10_000 }
    }
}

/// On-disk shape of `kahlo.toml`: every field and every section is optional.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    data: Option<RawData>,
    limits: Option<RawLimits>,
    timeouts: Option<RawTimeouts>,
    reload: Option<RawReload>,
    runtime: Option<RawRuntime>,
}

#[derive(Debug, Default, Deserialize)]
struct RawData {
    dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLimits {
    target_artifact_budget_bytes: Option<u64>,
    artifact_inline_threshold_bytes: Option<u64>,
    target_stream_capacity: Option<usize>,
    job_stream_capacity: Option<usize>,
    event_fetch_default_limit: Option<usize>,
    event_fetch_max_limit: Option<usize>,
    job_retention_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTimeouts {
    ping_ms: Option<u64>,
    device_resolve_ms: Option<u64>,
    attach_ms: Option<u64>,
    spawn_ms: Option<u64>,
    snapshot_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawReload {
    watch: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRuntime {
    bundle_path: Option<String>,
}

impl Config {
    /// Resolve the config file path (`KAHLO_CONFIG` > `./kahlo.toml` >
    /// `$XDG_CONFIG_HOME/kahlo/config.toml`), load it if present, and merge
    /// defaults for anything missing. `KAHLO_DATA_DIR` overrides
    /// `[data].dir` from either source.
    pub fn load() -> Result<Self, ConfigError> {
        let raw = match Self::config_path()? {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read { path: path.clone(), source })?;
                toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })?
            }
            _ => RawConfig::default(),
        };
        Self::from_raw(raw)
    }

    fn config_path() -> Result<Option<PathBuf>, ConfigError> {
        if let Ok(path) = std::env::var("KAHLO_CONFIG") {
            return Ok(Some(PathBuf::from(path)));
        }
        let cwd_candidate = PathBuf::from("kahlo.toml");
        if cwd_candidate.exists() {
            return Ok(Some(cwd_candidate));
        }
        Ok(Some(xdg_config_home()?.join("kahlo").join("config.toml")))
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let data_dir = std::env::var("KAHLO_DATA_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| raw.data.and_then(|d| d.dir).map(expand_tilde))
            .map(Ok)
            .unwrap_or_else(|| Ok(default_data_dir()?))?;

        let raw_limits = raw.limits.unwrap_or_default();
        let default_limits = Limits::default();
        let limits = Limits {
            target_artifact_budget_bytes: raw_limits.target_artifact_budget_bytes.unwrap_or(default_limits.target_artifact_budget_bytes),
            artifact_inline_threshold_bytes: raw_limits.artifact_inline_threshold_bytes.unwrap_or(default_limits.artifact_inline_threshold_bytes),
            target_stream_capacity: raw_limits.target_stream_capacity.unwrap_or(default_limits.target_stream_capacity),
            job_stream_capacity: raw_limits.job_stream_capacity.unwrap_or(default_limits.job_stream_capacity),
            event_fetch_default_limit: raw_limits.event_fetch_default_limit.unwrap_or(default_limits.event_fetch_default_limit),
            event_fetch_max_limit: raw_limits.event_fetch_max_limit.unwrap_or(default_limits.event_fetch_max_limit),
            job_retention_secs: raw_limits.job_retention_secs.unwrap_or(default_limits.job_retention_secs),
        };

        let raw_timeouts = raw.timeouts.unwrap_or_default();
        let default_timeouts = Timeouts::default();
        let timeouts = Timeouts {
            ping_ms: raw_timeouts.ping_ms.unwrap_or(default_timeouts.ping_ms),
            device_resolve_ms: raw_timeouts.device_resolve_ms.unwrap_or(default_timeouts.device_resolve_ms),
            attach_ms: raw_timeouts.attach_ms.unwrap_or(default_timeouts.attach_ms),
            spawn_ms: raw_timeouts.spawn_ms.unwrap_or(default_timeouts.spawn_ms),
            snapshot_ms: raw_timeouts.snapshot_ms.unwrap_or(default_timeouts.snapshot_ms),
        };

        let reload_watch = raw.reload.and_then(|r| r.watch).unwrap_or(false);

        let runtime_bundle_path = raw.runtime.and_then(|r| r.bundle_path).map(expand_tilde);

        Ok(Self { data_dir, limits, timeouts, reload_watch, runtime_bundle_path })
    }
}

fn xdg_config_home() -> Result<PathBuf, ConfigError> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg));
    }
    dirs::home_dir().map(|h| h.join(".config")).ok_or(ConfigError::NoHomeDir)
}

fn default_data_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().map(|h| h.join(".local/share/kahlo")).ok_or(ConfigError::NoHomeDir)
}

fn expand_tilde(raw: String) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map(|h| h.join(rest)).unwrap_or_else(|| PathBuf::from(raw)),
        None => PathBuf::from(raw),
    }
}

/// Convenience used by `kahlod config show` and tests; not part of `load`'s
/// own resolution path.
pub fn path_display(p: &Path) -> String {
    p.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let config = Config::from_raw(RawConfig::default()).expect("defaults resolve without a home dir override");
        assert_eq!(config.limits.target_artifact_budget_bytes, 524_288_000);
        assert_eq!(config.limits.artifact_inline_threshold_bytes, 32_768);
        assert_eq!(config.limits.target_stream_capacity, 5000);
        assert_eq!(config.limits.job_stream_capacity, 2000);
        assert_eq!(config.limits.event_fetch_default_limit, 200);
        assert_eq!(config.limits.event_fetch_max_limit, 5000);
        assert_eq!(config.limits.job_retention_secs, 3600);
        assert_eq!(config.timeouts.ping_ms, 5000);
        assert_eq!(config.timeouts.device_resolve_ms, 10_000);
        assert_eq!(config.timeouts.attach_ms, 15_000);
        assert_eq!(config.timeouts.spawn_ms, 30_000);
        assert_eq!(config.timeouts.snapshot_ms, 10_000);
        assert!(!config.reload_watch);
        assert!(config.runtime_bundle_path.is_none());
    }

    #[test]
    fn runtime_bundle_path_is_expanded_like_data_dir() {
        let raw: RawConfig = toml::from_str(
            r#"
            [runtime]
            bundle_path = "~/bundles/stdlib.js"
            "#,
        )
        .expect("parses");
        let config = Config::from_raw(raw).expect("resolves");
        assert!(config.runtime_bundle_path.unwrap().ends_with("bundles/stdlib.js"));
    }

    #[test]
    fn partial_file_only_overrides_what_it_sets() {
        let raw: RawConfig = toml::from_str(
            r#"
            [limits]
            job_retention_secs = 60
            "#,
        )
        .expect("parses");
        let config = Config::from_raw(raw).expect("resolves");
        assert_eq!(config.limits.job_retention_secs, 60);
        assert_eq!(config.limits.target_artifact_budget_bytes, 524_288_000);
    }

    #[test]
    fn expand_tilde_joins_home_dir() {
        let expanded = expand_tilde("~/.local/share/kahlo".to_string());
        assert!(expanded.ends_with(".local/share/kahlo"));
    }
}
