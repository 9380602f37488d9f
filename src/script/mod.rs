//! Script lifecycle and deployment
//!
//! - [`ScriptInfo`]: static definition, one manifest entry
//! - [`ScriptEntity`]: live state of one script on one node
//! - [`ScriptEntityCollection`]: a node's scripts in dependency order
//! - [`DeploymentEngine`]: brings nodes in line with a manifest

pub mod collection;
pub mod deploy;
pub mod entity;
pub mod info;

pub use collection::ScriptEntityCollection;
pub use deploy::{
    DeployOptions, DeploymentEngine, DeploymentFailure, DeploymentReport, ScriptAction,
    ScriptOutcome,
};
pub use entity::{fetch_catalog, ScriptEntity, ScriptFailure, ScriptStage};
pub use info::ScriptInfo;
