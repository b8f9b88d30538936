use std::path::Path;

use anyhow::Context;
use dtm_contracts::DTM_LIMITS_SCHEMA_VERSION;
use serde::{Deserialize, Serialize};

/// Number of argument slots a context can hold.
pub const MAX_ARGC: usize = 10;
/// Default bound on a materialized argument, terminator included.
pub const MAX_ARG_LEN: usize = 100;
/// Default capacity of the escaped snapshot buffer (two pages).
pub const SNAPSHOT_CAPACITY: usize = 4096 * 2;
/// Longest argument the platform accepts (32 pages), terminator included.
pub const MAX_ARG_STRLEN: usize = 4096 * 32;

pub const MIN_SNAPSHOT_CAPACITY: usize = 64;
pub const MAX_SNAPSHOT_CAPACITY: usize = 1024 * 1024;

pub const ENV_LIMITS: &str = "DTM_LIMITS";

fn default_schema_version() -> String {
    DTM_LIMITS_SCHEMA_VERSION.to_string()
}

fn default_max_argc() -> usize {
    MAX_ARGC
}

fn default_max_arg_len() -> usize {
    MAX_ARG_LEN
}

fn default_snapshot_capacity() -> usize {
    SNAPSHOT_CAPACITY
}

/// Bounds applied to one lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Limits {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// Highest number of argument slots considered, at most [`MAX_ARGC`].
    #[serde(default = "default_max_argc")]
    pub max_argc: usize,
    /// Bound on a materialized argument, terminator included.
    #[serde(default = "default_max_arg_len")]
    pub max_arg_len: usize,
    #[serde(default = "default_snapshot_capacity")]
    pub snapshot_capacity: usize,
    /// Apply `max_arg_len` to arguments decoded from a snapshot as well. Off by
    /// default: snapshot arguments are then bounded only by the snapshot capacity.
    #[serde(default)]
    pub clamp_snapshot_args: bool,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            schema_version: default_schema_version(),
            max_argc: MAX_ARGC,
            max_arg_len: MAX_ARG_LEN,
            snapshot_capacity: SNAPSHOT_CAPACITY,
            clamp_snapshot_args: false,
        }
    }
}

impl Limits {
    pub fn validate_basic(&self) -> Result<(), String> {
        if self.schema_version.trim() != DTM_LIMITS_SCHEMA_VERSION {
            return Err(format!(
                "limits.schema_version mismatch: expected {} got {:?}",
                DTM_LIMITS_SCHEMA_VERSION, self.schema_version
            ));
        }
        if self.max_argc == 0 || self.max_argc > MAX_ARGC {
            return Err(format!(
                "limits.max_argc must be 1..{MAX_ARGC} (got {})",
                self.max_argc
            ));
        }
        if self.max_arg_len < 2 || self.max_arg_len > MAX_ARG_STRLEN {
            return Err(format!(
                "limits.max_arg_len must be 2..{MAX_ARG_STRLEN} (got {})",
                self.max_arg_len
            ));
        }
        if self.snapshot_capacity < MIN_SNAPSHOT_CAPACITY
            || self.snapshot_capacity > MAX_SNAPSHOT_CAPACITY
        {
            return Err(format!(
                "limits.snapshot_capacity must be {MIN_SNAPSHOT_CAPACITY}..{MAX_SNAPSHOT_CAPACITY} (got {})",
                self.snapshot_capacity
            ));
        }
        Ok(())
    }

    /// Slots a context may materialize for `declared_argc` arguments.
    pub fn argc_bound(&self, declared_argc: usize) -> usize {
        declared_argc.min(self.max_argc).min(MAX_ARGC)
    }

    pub fn from_json_slice(bytes: &[u8]) -> anyhow::Result<Limits> {
        let limits: Limits = serde_json::from_slice(bytes).context("parse limits JSON")?;
        limits
            .validate_basic()
            .map_err(|e| anyhow::anyhow!("invalid limits: {e}"))?;
        Ok(limits)
    }

    pub fn load(path: &Path) -> anyhow::Result<Limits> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read limits file: {}", path.display()))?;
        Limits::from_json_slice(&bytes)
            .with_context(|| format!("load limits file: {}", path.display()))
    }

    /// Loads limits from the CLI path if given, else from `DTM_LIMITS`, else
    /// returns the defaults.
    pub fn resolve(cli_path: Option<&Path>) -> anyhow::Result<Limits> {
        let env_path = std::env::var_os(ENV_LIMITS);
        resolve_with_env(cli_path, env_path.as_deref().map(Path::new))
    }
}

fn resolve_with_env(cli_path: Option<&Path>, env_path: Option<&Path>) -> anyhow::Result<Limits> {
    match cli_path.or(env_path) {
        Some(path) => Limits::load(path),
        None => Ok(Limits::default()),
    }
}
