//! # rust_tsp
//!
//! Protocol engine for TSP instruments: the status/event register handshake,
//! the device error queue, node addressing and script deployment.
//!
//! ## Modules
//!
//! - [`registers`]: bitmask dictionaries and register layouts
//! - [`transport`]: the line-oriented link contract plus simulated and socket links
//! - [`session`]: the connection owner, status waits and error-queue drains
//! - [`node`]: controller and remote node addressing
//! - [`script`]: script entities and the deployment engine
//! - [`config`]: figment-based configuration
//!
//! ## Example
//!
//! ```
//! use rust_tsp::config::SessionConfig;
//! use rust_tsp::script::{DeployOptions, DeploymentEngine, ScriptInfo};
//! use rust_tsp::session::{CommandSet, TspSession};
//! use rust_tsp::transport::SimulatedInstrument;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> rust_tsp::TspResult<()> {
//! let session = TspSession::connect(
//!     Box::new(SimulatedInstrument::new()),
//!     SessionConfig::for_resource("sim"),
//!     CommandSet::default(),
//! )
//! .await?;
//!
//! let manifest = vec![ScriptInfo::new("boot_me", "booted = 1")
//!     .boot()
//!     .with_namespaces(["booted"])];
//! let mut engine = DeploymentEngine::new(session.clone(), DeployOptions::default());
//! let report = engine.deploy(&manifest).await?;
//! assert!(report.succeeded());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod node;
pub mod registers;
pub mod script;
pub mod session;
pub mod transport;

pub use error::{TspError, TspResult};
pub use node::NodeEntity;
pub use session::TspSession;
