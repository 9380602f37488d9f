//! Configuration using Figment
//!
//! This module provides strongly-typed configuration loading.
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with RUSTTSP_)
//! 3. caller overrides such as command-line flags
//!
//! # Environment Variable Overrides
//!
//! Sections and keys are separated by a double underscore, since keys
//! themselves contain single ones.
//!
//! ```text
//! RUSTTSP_APPLICATION__LOG_LEVEL=debug
//! RUSTTSP_SESSION__RESOURCE="192.168.1.50:5025"
//! RUSTTSP_DEPLOYMENT__FORCE_RELOAD=true
//! ```
//!
//! Script sources given as `source_file` are read relative to the
//! configuration file's directory and stored in `source`.

use crate::node::DEFAULT_CONTROLLER_NODE;
use crate::script::ScriptInfo;
use crate::session::CommandSet;
use figment::{
    providers::{Env, Format, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
    #[error("Failed to read script source {path}: {source}")]
    SourceFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TspConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Connection and timing settings
    pub session: SessionConfig,
    /// Command table overrides
    #[serde(default)]
    pub commands: CommandSet,
    /// Script manifest and deployment policy
    #[serde(default)]
    pub deployment: DeploymentConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Connection and timing constants for one instrument session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Resource address (e.g., "192.168.1.50:5025")
    pub resource: String,
    /// Optional model hint passed to the transport on open
    #[serde(default)]
    pub model_hint: Option<String>,
    /// Node number of the controller
    #[serde(default = "default_controller_node")]
    pub controller_node: u32,
    /// Upper bound on the interval between status byte samples
    #[serde(default = "default_status_read_delay")]
    pub status_read_delay_ms: u64,
    /// Timeout for reading one reply line
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Timeout for operation-complete waits
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,
    /// Maximum error-queue queries per drain
    #[serde(default = "default_error_drain_iterations")]
    pub error_drain_max_iterations: usize,
    /// Time budget per error-queue drain
    #[serde(default = "default_error_drain_timeout")]
    pub error_drain_timeout_ms: u64,
    /// Clear status and discard queued errors when the session opens
    #[serde(default = "default_clear_on_connect")]
    pub clear_on_connect: bool,
}

/// Deployment policy and manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Delete persisted scripts that the manifest does not list
    #[serde(default)]
    pub prune_unlisted: bool,
    /// Delete and redeploy every manifest script
    #[serde(default)]
    pub force_reload: bool,
    /// Ordered script manifest (dependencies first)
    #[serde(default)]
    pub scripts: Vec<ScriptInfo>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_controller_node() -> u32 {
    DEFAULT_CONTROLLER_NODE
}

fn default_status_read_delay() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    2000
}

fn default_operation_timeout() -> u64 {
    10000
}

fn default_error_drain_iterations() -> usize {
    64
}

fn default_error_drain_timeout() -> u64 {
    5000
}

fn default_clear_on_connect() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resource: String::new(),
            model_hint: None,
            controller_node: default_controller_node(),
            status_read_delay_ms: default_status_read_delay(),
            read_timeout_ms: default_read_timeout(),
            operation_timeout_ms: default_operation_timeout(),
            error_drain_max_iterations: default_error_drain_iterations(),
            error_drain_timeout_ms: default_error_drain_timeout(),
            clear_on_connect: default_clear_on_connect(),
        }
    }
}

impl SessionConfig {
    /// Session settings for `resource` with default timing.
    pub fn for_resource(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            ..Self::default()
        }
    }

    /// Status byte polling interval bound.
    pub fn status_read_delay(&self) -> Duration {
        Duration::from_millis(self.status_read_delay_ms)
    }

    /// Reply read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Operation-complete timeout.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Error-queue drain time budget.
    pub fn error_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.error_drain_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.resource.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "session: 'resource' cannot be empty".to_string(),
            ));
        }
        if self.status_read_delay_ms == 0 {
            return Err(ConfigError::ValidationError(
                "session: 'status_read_delay_ms' must be > 0".to_string(),
            ));
        }
        if self.error_drain_max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "session: 'error_drain_max_iterations' must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl TspConfig {
    /// Load configuration from `config/rust_tsp.toml` and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/rust_tsp.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Precedence (highest first): `RUSTTSP_` environment variables, the file.
    /// Script `source_file` entries are read and validation runs afterwards.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be loaded, a script source
    /// cannot be read, or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_overrides(path, Figment::new())
    }

    /// Load from `path` with `overrides` merged over the file and environment.
    ///
    /// Overrides take part in validation, so a flag can supply a value the
    /// file leaves empty:
    ///
    /// ```no_run
    /// use rust_tsp::config::TspConfig;
    ///
    /// let config = TspConfig::load_with_overrides(
    ///     "config/rust_tsp.toml",
    ///     ("session.resource", "10.0.0.9:5025"),
    /// )?;
    /// # Ok::<(), rust_tsp::config::ConfigError>(())
    /// ```
    pub fn load_with_overrides<P: AsRef<Path>, O: Provider>(
        path: P,
        overrides: O,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("RUSTTSP_").split("__"))
            .merge(overrides)
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_sources(base_dir)?;
        config.validate()?;
        Ok(config)
    }

    /// Read every `source_file` into `source`.
    pub fn resolve_sources(&mut self, base_dir: &Path) -> Result<(), ConfigError> {
        for script in &mut self.deployment.scripts {
            if script.source.is_some() {
                continue;
            }
            if let Some(file) = &script.source_file {
                let full = base_dir.join(file);
                let text = std::fs::read_to_string(&full).map_err(|source| {
                    ConfigError::SourceFile {
                        path: full.clone(),
                        source,
                    }
                })?;
                script.source = Some(text);
            }
        }
        Ok(())
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Session settings are usable
    /// - Script names are identifiers, unique per node, and carry a source
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.session.validate()?;

        let mut seen = HashSet::new();
        for script in &self.deployment.scripts {
            let node = script.node.unwrap_or(self.session.controller_node);
            if !seen.insert((node, script.name.as_str())) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate script '{}' on node {}",
                    script.name, node
                )));
            }
            script
                .validate()
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }

        Ok(())
    }
}
