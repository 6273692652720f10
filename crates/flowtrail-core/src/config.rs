//! Tracking configuration
//!
//! `Configuration` is a plain value. The process-wide copy lives behind a
//! `ConfigHandle`, which is created once by the embedder and handed to the
//! `FlowTrail` facade; clones of the handle share the same settings.
//!
//! ## Environment
//!
//! `Configuration::from_env()` reads:
//!
//! - `FLOWTRAIL_ENABLED` (bool, default `true`)
//! - `FLOWTRAIL_RETENTION_DAYS` (integer, default `365`)
//! - `FLOWTRAIL_DEFAULT_CATEGORY` (`jobs|services|api|other`, default `jobs`)
//! - `FLOWTRAIL_MIRROR_LOGS` (bool, default `true`)
//!
//! Call `load_environment()` first to pull those from an env file.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::types::Category;

/// Alternative env file paths to check (in order of priority)
pub const ENV_FILE_PATHS: &[&str] = &["/etc/flowtrail/environment", ".env"];

pub const DEFAULT_RETENTION_DAYS: u32 = 365;

/// Tracking settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    /// When false every tracking call degrades to the null tracker.
    pub enabled: bool,
    /// Age in days after which flows are eligible for cleanup.
    pub retention_days: u32,
    /// Category given to processes created without an explicit one.
    pub default_category: Category,
    /// Mirror tracked log lines to the external log sink.
    pub mirror_to_external_logger: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: DEFAULT_RETENTION_DAYS,
            default_category: Category::Jobs,
            mirror_to_external_logger: true,
        }
    }
}

impl Configuration {
    /// Build from `FLOWTRAIL_*` variables. Unset or invalid values keep
    /// their default; invalid ones are logged with `warn!`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_value::<Switch>("FLOWTRAIL_ENABLED").map_or(defaults.enabled, |s| s.0),
            retention_days: env_value("FLOWTRAIL_RETENTION_DAYS")
                .unwrap_or(defaults.retention_days),
            default_category: env_value("FLOWTRAIL_DEFAULT_CATEGORY")
                .unwrap_or(defaults.default_category),
            mirror_to_external_logger: env_value::<Switch>("FLOWTRAIL_MIRROR_LOGS")
                .map_or(defaults.mirror_to_external_logger, |s| s.0),
        }
    }
}

/// Shared, replaceable configuration.
///
/// The value is created lazily on first read. Readers get an `Arc` snapshot,
/// so a replacement never changes settings under an in-flight execution.
#[derive(Clone, Default)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Option<Arc<Configuration>>>>,
}

impl ConfigHandle {
    pub fn new(config: Configuration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(Arc::new(config)))),
        }
    }

    /// Current settings, initializing defaults on first access.
    pub fn current(&self) -> Arc<Configuration> {
        if let Some(config) = self.inner.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return Arc::clone(config);
        }
        let mut slot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slot.get_or_insert_with(|| Arc::new(Configuration::default())))
    }

    /// Apply `f` to a copy of the current settings and swap it in.
    pub fn configure<F>(&self, f: F)
    where
        F: FnOnce(&mut Configuration),
    {
        let mut slot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut next = slot.as_deref().cloned().unwrap_or_default();
        f(&mut next);
        debug!(?next, "Configuration updated");
        *slot = Some(Arc::new(next));
    }

    /// Replace the settings wholesale.
    pub fn replace(&self, config: Configuration) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(config));
    }

    /// Drop back to defaults (mainly for test isolation).
    pub fn reset(&self) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Load the first env file found into the process environment.
///
/// Tries `$FLOWTRAIL_ENV_FILE`, then `ENV_FILE_PATHS`. Variables already set
/// are kept. Returns the path that was loaded.
pub fn load_environment() -> Option<PathBuf> {
    let custom = std::env::var_os("FLOWTRAIL_ENV_FILE").map(PathBuf::from);
    let candidates = custom.into_iter().chain(ENV_FILE_PATHS.iter().map(PathBuf::from));

    for path in candidates {
        match dotenvy::from_path(&path) {
            Ok(()) => {
                info!(path = %path.display(), "Environment file loaded");
                return Some(path);
            }
            Err(e) if e.not_found() => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable environment file")
            }
        }
    }

    debug!("No environment file found, using existing environment");
    None
}

/// Parsed value of `key`. Unset or empty yields `None`; an unparsable value
/// is reported and also yields `None`.
fn env_value<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = std::env::var(key).ok().filter(|v| !v.trim().is_empty())?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "Ignoring invalid setting");
            None
        }
    }
}

/// Boolean switch accepting `true/false`, `1/0`, `yes/no` and `on/off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Switch(bool);

impl FromStr for Switch {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Switch(true)),
            "false" | "0" | "no" | "off" => Ok(Switch(false)),
            other => Err(format!("expected a boolean, got '{}'", other)),
        }
    }
}
