//! Per-instance configuration (A1, §6.6): the same key space as a control
//! file's backup-independent subset, resolved CLI flag > environment
//! variable > config file > built-in default, mirroring the teacher's
//! `load_config` precedence chain.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::paths::instance_config_path;
use crate::errors::{BackupError, Result};
use crate::fsutil;
use crate::page::CompressAlgorithm;

/// Environment variable carrying an override config file path, analogous to
/// `PG_PROBACKUP_CONF`.
pub const CONFIG_PATH_ENV: &str = "PBACKUP_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InstanceConfig {
    pub pgdata: Option<PathBuf>,
    pub compress_alg: Option<String>,
    pub compress_level: Option<i32>,
    pub wal_depth: Option<u32>,
    pub retention_redundancy: Option<u32>,
    pub retention_window: Option<u32>,
}

impl InstanceConfig {
    #[must_use]
    pub fn compress_algorithm(&self) -> CompressAlgorithm {
        self.compress_alg.as_deref().and_then(CompressAlgorithm::parse).unwrap_or_default()
    }

    fn merge_from(&mut self, other: Self) {
        if self.pgdata.is_none() {
            self.pgdata = other.pgdata;
        }
        if self.compress_alg.is_none() {
            self.compress_alg = other.compress_alg;
        }
        if self.compress_level.is_none() {
            self.compress_level = other.compress_level;
        }
        if self.wal_depth.is_none() {
            self.wal_depth = other.wal_depth;
        }
        if self.retention_redundancy.is_none() {
            self.retention_redundancy = other.retention_redundancy;
        }
        if self.retention_window.is_none() {
            self.retention_window = other.retention_window;
        }
    }
}

/// Resolved settings actually used at runtime, after applying the built-in
/// defaults spec.md §6.6 requires on top of whatever `InstanceConfig` leaves
/// unset.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedConfig {
    pub compress_algorithm: CompressAlgorithm,
    pub compress_level: i32,
    pub wal_depth: u32,
    pub retention_redundancy: u32,
    pub retention_window: u32,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            compress_algorithm: CompressAlgorithm::None,
            compress_level: 1,
            wal_depth: 0,
            retention_redundancy: 0,
            retention_window: 0,
        }
    }
}

impl From<&InstanceConfig> for ResolvedConfig {
    fn from(cfg: &InstanceConfig) -> Self {
        let default = Self::default();
        Self {
            compress_algorithm: cfg.compress_alg.as_deref().and_then(CompressAlgorithm::parse).unwrap_or(default.compress_algorithm),
            compress_level: cfg.compress_level.unwrap_or(default.compress_level),
            wal_depth: cfg.wal_depth.unwrap_or(default.wal_depth),
            retention_redundancy: cfg.retention_redundancy.unwrap_or(default.retention_redundancy),
            retention_window: cfg.retention_window.unwrap_or(default.retention_window),
        }
    }
}

/// CLI-supplied overrides; any field left `None` falls through to the next
/// source in the precedence chain.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub compress_alg: Option<String>,
    pub compress_level: Option<i32>,
    pub wal_depth: Option<u32>,
}

/// Load and merge an instance's config: CLI flags, then `PBACKUP_CONFIG`/
/// per-key env vars, then the instance's config file, then built-in
/// defaults (applied by [`ResolvedConfig::from`]).
///
/// # Errors
/// Returns an error if the config file exists but cannot be read or parsed.
pub fn load_instance_config(catalog_root: &Path, instance: &str, cli: &CliOverrides) -> Result<InstanceConfig> {
    let mut cfg = InstanceConfig {
        compress_alg: cli.compress_alg.clone(),
        compress_level: cli.compress_level,
        wal_depth: cli.wal_depth,
        ..InstanceConfig::default()
    };

    if cfg.compress_alg.is_none()
        && let Ok(s) = std::env::var("PBACKUP_COMPRESS_ALG")
    {
        cfg.compress_alg = Some(s);
    }
    if cfg.compress_level.is_none()
        && let Ok(s) = std::env::var("PBACKUP_COMPRESS_LEVEL")
        && let Ok(level) = s.parse()
    {
        cfg.compress_level = Some(level);
    }
    if cfg.wal_depth.is_none()
        && let Ok(s) = std::env::var("PBACKUP_WAL_DEPTH")
        && let Ok(depth) = s.parse()
    {
        cfg.wal_depth = Some(depth);
    }

    let path = cli
        .config_path
        .clone()
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| instance_config_path(catalog_root, instance));

    if path.exists() {
        let text = std::fs::read_to_string(&path)?;
        let from_file: InstanceConfig =
            toml::from_str(&text).map_err(|e| BackupError::Config(format!("{}: {e}", path.display())))?;
        cfg.merge_from(from_file);
    }

    Ok(cfg)
}

/// Rewrite an instance's config file, overlaying `updates` onto whatever is
/// already stored (`set-config`'s read-modify-write contract), using the
/// same temp-file + fsync + rename discipline as every other control file.
///
/// # Errors
/// Returns an error if the existing file can't be parsed, the new one can't
/// be serialized, or the write fails.
pub fn set_instance_config(catalog_root: &Path, instance: &str, updates: InstanceConfig) -> Result<()> {
    let path = instance_config_path(catalog_root, instance);
    let mut current = if path.exists() {
        let text = std::fs::read_to_string(&path)?;
        toml::from_str(&text).map_err(|e| BackupError::Config(format!("{}: {e}", path.display())))?
    } else {
        InstanceConfig::default()
    };

    if updates.pgdata.is_some() {
        current.pgdata = updates.pgdata;
    }
    if updates.compress_alg.is_some() {
        current.compress_alg = updates.compress_alg;
    }
    if updates.compress_level.is_some() {
        current.compress_level = updates.compress_level;
    }
    if updates.wal_depth.is_some() {
        current.wal_depth = updates.wal_depth;
    }
    if updates.retention_redundancy.is_some() {
        current.retention_redundancy = updates.retention_redundancy;
    }
    if updates.retention_window.is_some() {
        current.retention_window = updates.retention_window;
    }

    let rendered = toml::to_string_pretty(&current).map_err(|e| BackupError::Config(e.to_string()))?;
    fsutil::atomic_write(&path, rendered.as_bytes())?;
    Ok(())
}
