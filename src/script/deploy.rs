//! Script deployment
//!
//! One pass brings every node named by the manifest to the manifest's state:
//!
//! 1. **Diff**: probe each script, run loaded-but-inactive ones, compare
//!    versions. The first stale script marks every later script on the same
//!    node stale too, since later scripts may depend on it.
//! 2. **Delete**: stale and (optionally) unlisted scripts, last first.
//! 3. **Install**: load, convert, run, save in manifest order.
//! 4. **Verify**: every script must be activated and, where required, embedded.
//!
//! Device failures are collected per script and stage; the pass continues and
//! fails once at the end with a [`DeploymentReport`]. Running a pass against an
//! up-to-date node only probes, apart from scripts flagged `run_always`.

use super::entity::{fetch_catalog, ScriptFailure, ScriptStage};
use super::{ScriptEntity, ScriptEntityCollection, ScriptInfo};
use crate::error::{TspError, TspResult};
use crate::session::TspSession;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Policy for one deployment pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployOptions {
    /// Delete and reinstall every manifest script.
    pub force_reload: bool,
    /// Delete persisted scripts the manifest does not list.
    pub prune_unlisted: bool,
}

/// What a pass decided for one script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptAction {
    /// Up to date.
    Keep,
    /// Present; needs running and/or saving.
    Complete,
    /// Absent; installed.
    Install,
    /// Stale; deleted and reinstalled.
    Redeploy,
    /// Not in the manifest; deleted.
    Prune,
}

/// One script's line in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOutcome {
    /// Script name.
    pub script: String,
    /// Node number.
    pub node: u32,
    /// What the pass did with it.
    pub action: ScriptAction,
}

/// A script that diverged, and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentFailure {
    /// Script name.
    pub script: String,
    /// Node number.
    pub node: u32,
    /// Step that failed.
    pub stage: ScriptStage,
    /// Error text.
    pub detail: String,
}

/// Summary of one deployment pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentReport {
    /// One entry per manifest script, in manifest order.
    pub outcomes: Vec<ScriptOutcome>,
    /// Scripts whose step failed.
    pub failures: Vec<DeploymentFailure>,
}

impl DeploymentReport {
    /// No script failed.
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    /// Action taken for `script` on `node`.
    pub fn action(&self, node: u32, script: &str) -> Option<ScriptAction> {
        self.outcomes
            .iter()
            .find(|o| o.node == node && o.script == script)
            .map(|o| o.action)
    }
}

impl fmt::Display for DeploymentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.is_empty() {
            return write!(f, "{} scripts deployed", self.outcomes.len());
        }
        write!(f, "{} of {} scripts failed", self.failures.len(), self.outcomes.len())?;
        for failure in &self.failures {
            write!(
                f,
                "; '{}' on node {} at {}: {}",
                failure.script, failure.node, failure.stage, failure.detail
            )?;
        }
        Ok(())
    }
}

/// Device-side outcomes that a pass records instead of aborting on.
fn is_recordable(error: &TspError) -> bool {
    matches!(
        error,
        TspError::Device { .. } | TspError::OperationTimeout { .. }
    )
}

/// Orchestrates manifest deployment over one session.
pub struct DeploymentEngine {
    session: TspSession,
    options: DeployOptions,
    collections: Vec<ScriptEntityCollection>,
}

impl DeploymentEngine {
    /// Engine deploying over `session`.
    pub fn new(session: TspSession, options: DeployOptions) -> Self {
        Self {
            session,
            options,
            collections: Vec::new(),
        }
    }

    /// Policy in use.
    pub fn options(&self) -> DeployOptions {
        self.options
    }

    /// Entities from the last pass.
    pub fn collections(&self) -> &[ScriptEntityCollection] {
        &self.collections
    }

    /// Tracked entity for `name` on `node`.
    pub fn entity(&self, node: u32, name: &str) -> Option<&ScriptEntity> {
        self.collections
            .iter()
            .find(|c| c.node().number() == node)
            .and_then(|c| c.get(name))
    }

    /// Group the manifest by node, keeping entities known from earlier passes.
    fn plan_collections(&mut self, manifest: &[ScriptInfo]) -> TspResult<()> {
        let previous = std::mem::take(&mut self.collections);
        let controller = self.session.config().controller_node;
        let mut collections: Vec<ScriptEntityCollection> = Vec::new();

        for info in manifest {
            info.validate()?;
            let node = self.session.node(info.node.unwrap_or(controller));
            let known = previous
                .iter()
                .find(|c| c.node() == node)
                .and_then(|c| c.get(&info.name))
                .filter(|e| e.info() == info)
                .cloned();
            let entity = known.unwrap_or_else(|| ScriptEntity::new(info.clone(), node));

            match collections.iter_mut().find(|c| c.node() == node) {
                Some(collection) => collection.push(entity)?,
                None => {
                    let mut collection = ScriptEntityCollection::new(node);
                    collection.push(entity)?;
                    collections.push(collection);
                }
            }
        }
        self.collections = collections;
        Ok(())
    }

    /// Run one deployment pass over `manifest`.
    ///
    /// # Errors
    /// - `TspError::Deployment` listing every script that diverged
    /// - transport and invariant errors abort the pass immediately
    pub async fn deploy(&mut self, manifest: &[ScriptInfo]) -> TspResult<DeploymentReport> {
        self.plan_collections(manifest)?;
        info!(
            scripts = manifest.len(),
            nodes = self.collections.len(),
            force_reload = self.options.force_reload,
            "Deployment pass started"
        );

        let session = self.session.clone();
        let options = self.options;
        let mut report = DeploymentReport::default();

        for collection in &mut self.collections {
            let node = collection.node();
            let actions = diff(&session, options, collection).await?;

            let mut pruned = Vec::new();
            if options.prune_unlisted {
                for name in fetch_catalog(&session, node).await? {
                    if collection.get(&name).is_none() {
                        pruned.push(ScriptEntity::from_catalog(&name, node));
                    }
                }
            }
            for entity in pruned.iter_mut().rev() {
                entity.delete(&session).await?;
                report.outcomes.push(ScriptOutcome {
                    script: entity.name().to_string(),
                    node: node.number(),
                    action: ScriptAction::Prune,
                });
            }

            for (entity, action) in collection.iter_mut().zip(actions.iter()).rev() {
                if *action == ScriptAction::Redeploy {
                    entity.delete(&session).await?;
                }
            }

            for (entity, action) in collection.iter_mut().zip(actions.iter()) {
                let result = match action {
                    ScriptAction::Install | ScriptAction::Redeploy => install(&session, entity).await,
                    ScriptAction::Complete => complete(&session, entity).await,
                    ScriptAction::Keep if entity.info().run_always => {
                        entity.run(&session, true).await.map_err(|e| (ScriptStage::Run, e))
                    }
                    ScriptAction::Keep | ScriptAction::Prune => Ok(()),
                };
                match result {
                    Ok(()) => {}
                    Err((stage, e)) if is_recordable(&e) => {
                        warn!(script = %entity.name(), %stage, error = %e, "Deployment step failed");
                        report.failures.push(DeploymentFailure {
                            script: entity.name().to_string(),
                            node: node.number(),
                            stage,
                            detail: e.to_string(),
                        });
                    }
                    Err((_, e)) => return Err(e),
                }
                if let Some(ScriptFailure { stage, detail }) = entity.last_failure().cloned() {
                    if !report
                        .failures
                        .iter()
                        .any(|f| f.node == node.number() && f.script == entity.name())
                    {
                        report.failures.push(DeploymentFailure {
                            script: entity.name().to_string(),
                            node: node.number(),
                            stage,
                            detail,
                        });
                    }
                }
                report.outcomes.push(ScriptOutcome {
                    script: entity.name().to_string(),
                    node: node.number(),
                    action: *action,
                });
            }

            verify(&session, collection, &mut report).await?;
        }

        if report.succeeded() {
            info!(%report, "Deployment pass finished");
            Ok(report)
        } else {
            warn!(%report, "Deployment pass failed");
            Err(TspError::Deployment(report))
        }
    }
}

/// Decide what each script of a node needs.
async fn diff(
    session: &TspSession,
    options: DeployOptions,
    collection: &mut ScriptEntityCollection,
) -> TspResult<Vec<ScriptAction>> {
    let mut actions = Vec::with_capacity(collection.len());
    let mut stale = options.force_reload;

    for entity in collection.iter_mut() {
        entity.clear_failure();
        entity.refresh(session).await?;

        if !entity.is_loaded() {
            actions.push(if stale {
                ScriptAction::Redeploy
            } else {
                ScriptAction::Install
            });
            continue;
        }
        if stale {
            actions.push(ScriptAction::Redeploy);
            continue;
        }

        if !entity.is_activated() {
            entity.run(session, false).await?;
            if let Some(failure) = entity.last_failure() {
                debug!(script = %entity.name(), detail = %failure.detail, "Inactive script failed to run, redeploying");
                entity.clear_failure();
                stale = true;
                actions.push(ScriptAction::Redeploy);
                continue;
            }
        }

        if let Some(expected) = &entity.info().version {
            let deployed = entity.deployed_version(session).await?;
            if deployed.as_deref() != Some(expected.as_str()) {
                info!(
                    script = %entity.name(),
                    expected = %expected,
                    deployed = ?deployed,
                    "Stale script version"
                );
                stale = true;
                actions.push(ScriptAction::Redeploy);
                continue;
            }
        }

        if entity.info().byte_code && !entity.is_byte_code() {
            stale = true;
            actions.push(ScriptAction::Redeploy);
            continue;
        }

        let needs_save = entity.info().embed && !entity.is_embedded();
        actions.push(if needs_save || !entity.is_activated() {
            ScriptAction::Complete
        } else {
            ScriptAction::Keep
        });
    }

    debug!(node = collection.node().number(), ?actions, "Deployment diff");
    Ok(actions)
}

/// Load, convert, run and save one script.
async fn install(
    session: &TspSession,
    entity: &mut ScriptEntity,
) -> Result<(), (ScriptStage, TspError)> {
    entity
        .load(session)
        .await
        .map_err(|e| (ScriptStage::Load, e))?;
    if entity.info().byte_code {
        entity
            .convert_to_byte_code(session)
            .await
            .map_err(|e| (ScriptStage::Convert, e))?;
    }
    entity
        .run(session, false)
        .await
        .map_err(|e| (ScriptStage::Run, e))?;
    if entity.last_failure().is_some() {
        return Ok(());
    }
    if entity.info().embed {
        entity
            .save(session)
            .await
            .map_err(|e| (ScriptStage::Save, e))?;
    }
    Ok(())
}

/// Finish a present, current script: run it if inactive, save it if required.
async fn complete(
    session: &TspSession,
    entity: &mut ScriptEntity,
) -> Result<(), (ScriptStage, TspError)> {
    let always = entity.info().run_always;
    entity
        .run(session, always)
        .await
        .map_err(|e| (ScriptStage::Run, e))?;
    if entity.last_failure().is_some() {
        return Ok(());
    }
    if entity.info().embed && !entity.is_embedded() {
        entity
            .save(session)
            .await
            .map_err(|e| (ScriptStage::Save, e))?;
    }
    Ok(())
}

/// Re-probe every script and record the ones that are not where they should be.
async fn verify(
    session: &TspSession,
    collection: &mut ScriptEntityCollection,
    report: &mut DeploymentReport,
) -> TspResult<()> {
    let node = collection.node().number();
    for entity in collection.iter_mut() {
        if report
            .failures
            .iter()
            .any(|f| f.node == node && f.script == entity.name())
        {
            continue;
        }
        entity.refresh(session).await?;
        let problem = if !entity.is_activated() {
            Some("not activated")
        } else if entity.info().embed && !entity.is_embedded() {
            Some("not embedded")
        } else {
            None
        };
        if let Some(problem) = problem {
            report.failures.push(DeploymentFailure {
                script: entity.name().to_string(),
                node,
                stage: ScriptStage::Verify,
                detail: problem.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_display_lists_every_failure() {
        let report = DeploymentReport {
            outcomes: vec![
                ScriptOutcome {
                    script: "lib".into(),
                    node: 1,
                    action: ScriptAction::Install,
                },
                ScriptOutcome {
                    script: "app".into(),
                    node: 1,
                    action: ScriptAction::Install,
                },
            ],
            failures: vec![
                DeploymentFailure {
                    script: "lib".into(),
                    node: 1,
                    stage: ScriptStage::Run,
                    detail: "syntax".into(),
                },
                DeploymentFailure {
                    script: "app".into(),
                    node: 1,
                    stage: ScriptStage::Verify,
                    detail: "not activated".into(),
                },
            ],
        };
        let text = report.to_string();
        assert!(text.starts_with("2 of 2 scripts failed"));
        assert!(text.contains("'lib' on node 1 at run: syntax"));
        assert!(text.contains("'app' on node 1 at verify: not activated"));
        assert_eq!(report.action(1, "app"), Some(ScriptAction::Install));
    }

    #[test]
    fn test_only_device_outcomes_are_recorded() {
        assert!(is_recordable(&TspError::Device {
            context: "run".into(),
            report: "x".into()
        }));
        assert!(!is_recordable(&TspError::InvalidOperation("helper".into())));
    }
}
