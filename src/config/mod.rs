//! Configuration System
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Caller overrides ([`TspConfig::load_with_overrides`])
//! 2. Environment variables prefixed with `RUSTTSP_`
//! 3. TOML configuration file (default: `config/rust_tsp.toml`)
//!
//! # Example
//!
//! ```no_run
//! use rust_tsp::config::TspConfig;
//!
//! let config = TspConfig::load_from("config/rust_tsp.toml")?;
//! println!("Resource: {}", config.session.resource);
//! println!("Scripts: {}", config.deployment.scripts.len());
//! # Ok::<(), rust_tsp::config::ConfigError>(())
//! ```
//!
//! ```toml
//! [application]
//! name = "bench-7"
//! log_level = "info"
//!
//! [session]
//! resource = "192.168.1.50:5025"
//! status_read_delay_ms = 10
//!
//! [[deployment.scripts]]
//! name = "tsp_support"
//! source_file = "scripts/tsp_support.tsp"
//! namespaces = ["tsp_support"]
//! version = "1.2.0"
//! version_getter = "tsp_support.version"
//! ```

pub mod settings;

pub use settings::{ApplicationConfig, ConfigError, DeploymentConfig, SessionConfig, TspConfig};
