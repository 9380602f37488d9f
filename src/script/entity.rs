//! Per-script state on one node.
//!
//! ```text
//! Absent -> Loaded -> Activated -> Embedded -> Deleted
//!              \_ byte_code (orthogonal)
//! ```
//!
//! State-changing steps (load, convert, save) fail on a confirmed device
//! error. Running records its failure on the entity instead of returning it.
//! Deletion is teardown and only warns.

use super::ScriptInfo;
use crate::error::{TspError, TspResult};
use crate::node::NodeEntity;
use crate::session::{CommandSet, FirmwareRules, TspSession};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Step of the script lifecycle, used to report where a script diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptStage {
    /// Upload of the source.
    Load,
    /// Byte-code conversion.
    Convert,
    /// Running the script.
    Run,
    /// Saving to non-volatile memory.
    Save,
    /// Post-deploy state check.
    Verify,
    /// Removal.
    Delete,
}

impl fmt::Display for ScriptStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScriptStage::Load => "load",
            ScriptStage::Convert => "convert",
            ScriptStage::Run => "run",
            ScriptStage::Save => "save",
            ScriptStage::Verify => "verify",
            ScriptStage::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A failure recorded on an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptFailure {
    /// Step that failed.
    pub stage: ScriptStage,
    /// Error text.
    pub detail: String,
}

/// Persisted script names on `node`.
pub async fn fetch_catalog(session: &TspSession, node: NodeEntity) -> TspResult<Vec<String>> {
    let reply = session.query_value(node, &session.commands().catalog).await?;
    let names = reply
        .trim()
        .trim_matches('"')
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    Ok(names)
}

/// One script on one node, keyed by `(node, name)`.
#[derive(Debug, Clone)]
pub struct ScriptEntity {
    info: ScriptInfo,
    node: NodeEntity,
    loaded: bool,
    byte_code: bool,
    activated: bool,
    embedded: bool,
    embedded_firmware_version: Option<String>,
    last_failure: Option<ScriptFailure>,
}

impl ScriptEntity {
    /// Entity for `info` on `node`, in the not-loaded state.
    pub fn new(info: ScriptInfo, node: NodeEntity) -> Self {
        Self {
            info,
            node,
            loaded: false,
            byte_code: false,
            activated: false,
            embedded: false,
            embedded_firmware_version: None,
            last_failure: None,
        }
    }

    /// Entity for a persisted script known only by name.
    pub fn from_catalog(name: &str, node: NodeEntity) -> Self {
        let info = ScriptInfo {
            name: name.to_string(),
            source: None,
            source_file: None,
            node: Some(node.number()),
            boot: false,
            embed: true,
            byte_code: false,
            namespaces: Vec::new(),
            version: None,
            version_getter: None,
            run_always: false,
        };
        let mut entity = Self::new(info, node);
        entity.loaded = true;
        entity.embedded = true;
        entity
    }

    /// Script name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Node the script lives on.
    pub fn node(&self) -> NodeEntity {
        self.node
    }

    /// Script description.
    pub fn info(&self) -> &ScriptInfo {
        &self.info
    }

    /// The script exists in the node's run-time environment.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// The script source has been replaced by byte code.
    pub fn is_byte_code(&self) -> bool {
        self.byte_code
    }

    /// The script has run and its namespaces exist.
    pub fn is_activated(&self) -> bool {
        self.activated
    }

    /// The script is saved in non-volatile memory.
    pub fn is_embedded(&self) -> bool {
        self.embedded
    }

    /// Firmware revision the script was last saved under.
    pub fn embedded_firmware_version(&self) -> Option<&str> {
        self.embedded_firmware_version.as_deref()
    }

    /// Most recent recorded failure.
    pub fn last_failure(&self) -> Option<&ScriptFailure> {
        self.last_failure.as_ref()
    }

    /// Forget the recorded failure.
    pub fn clear_failure(&mut self) {
        self.last_failure = None;
    }

    fn render(&self, commands: &CommandSet, template: &str) -> TspResult<String> {
        commands.script(template, self.name())
    }

    fn context(&self, stage: ScriptStage) -> String {
        format!("{} '{}' on {}", stage, self.name(), self.node)
    }

    async fn confirm(&self, session: &TspSession, stage: ScriptStage) -> TspResult<()> {
        let timeout = session.config().operation_timeout();
        session
            .confirm_completion(self.node, &self.context(stage), timeout)
            .await
    }

    async fn upload(&self, session: &TspSession, name: &str, body: &str) -> TspResult<()> {
        let commands = session.commands();
        let mut lines = vec![commands.script(&commands.load_begin, name)?];
        lines.extend(body.lines().map(str::to_string));
        lines.push(commands.load_end.clone());
        session.write_lines(&lines).await
    }

    /// Push the source to the node and confirm the name is defined there.
    ///
    /// Remote nodes receive a copy of a staging script loaded on the
    /// controller.
    pub async fn load(&mut self, session: &TspSession) -> TspResult<()> {
        let body = self.info.body()?.to_string();
        let controller = session.controller();

        if self.node.is_controller() {
            self.upload(session, self.name(), &body).await?;
            self.confirm(session, ScriptStage::Load).await?;
        } else {
            let stage = format!("{}_stage", self.name());
            self.upload(session, &stage, &body).await?;
            let timeout = session.config().operation_timeout();
            session
                .confirm_completion(controller, &format!("stage '{}'", stage), timeout)
                .await?;

            let copy = CommandSet::render(
                &session.commands().copy_to_node,
                &[
                    ("node", &self.node.number().to_string()),
                    ("name", self.name()),
                    ("source", &stage),
                ],
            )?;
            session.write(&copy).await?;
            self.confirm(session, ScriptStage::Load).await?;

            let release = session
                .commands()
                .script(&session.commands().null_identifier, &stage)?;
            session.write(&release).await?;
        }

        self.loaded = !session.is_nil(self.node, self.name()).await?;
        if !self.loaded {
            return Err(TspError::Device {
                context: self.context(ScriptStage::Load),
                report: "script is nil after loading".to_string(),
            });
        }
        self.byte_code = false;
        self.activated = false;
        self.embedded = false;
        info!(script = %self.name(), node = self.node.number(), "Script loaded");
        Ok(())
    }

    /// Convert the loaded script to byte-code under the session's firmware rules.
    ///
    /// # Errors
    /// - `InvalidOperation` if the compiling helper is missing; nothing is sent
    /// - `Protocol` if the script does not report byte-code afterwards
    pub async fn convert_to_byte_code(&mut self, session: &TspSession) -> TspResult<()> {
        if !self.loaded {
            return Err(TspError::InvalidOperation(format!(
                "Cannot convert '{}': not loaded",
                self.name()
            )));
        }
        let commands = session.commands();
        let conversion = match session.rules() {
            FirmwareRules::Compiled => {
                if session.is_nil(self.node, &commands.bytecode_helper).await? {
                    return Err(TspError::InvalidOperation(format!(
                        "Byte-code helper '{}' is not defined on {}",
                        commands.bytecode_helper, self.node
                    )));
                }
                self.render(commands, &commands.compile_byte_code)?
            }
            FirmwareRules::Legacy => self.render(commands, &commands.legacy_byte_code)?,
        };
        session.execute(self.node, &conversion).await?;
        self.confirm(session, ScriptStage::Convert).await?;

        let probe = self.render(commands, &commands.is_byte_code)?;
        self.byte_code = session.query_bool(self.node, &probe).await?;
        if !self.byte_code {
            return Err(TspError::Protocol(format!(
                "'{}' on {} does not report byte-code after conversion",
                self.name(),
                self.node
            )));
        }
        debug!(script = %self.name(), rules = ?session.rules(), "Converted to byte-code");
        Ok(())
    }

    /// Run the script unless it is already active (or `always` is set).
    ///
    /// Any failure leaves the entity neither activated nor embedded and is
    /// recorded on it. Device errors and completion timeouts end there; other
    /// errors are also returned.
    pub async fn run(&mut self, session: &TspSession, always: bool) -> TspResult<()> {
        if self.activated && !always {
            debug!(script = %self.name(), "Already active, skipping run");
            return Ok(());
        }
        let command = self.render(session.commands(), &session.commands().run)?;
        let result = match session.execute(self.node, &command).await {
            Ok(()) => self.confirm(session, ScriptStage::Run).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.activated = true;
                self.last_failure = None;
                self.refresh(session).await?;
                info!(script = %self.name(), node = self.node.number(), activated = self.activated, "Script ran");
                Ok(())
            }
            Err(e) => {
                warn!(script = %self.name(), error = %e, "Script run failed");
                self.activated = false;
                self.embedded = false;
                self.last_failure = Some(ScriptFailure {
                    stage: ScriptStage::Run,
                    detail: e.to_string(),
                });
                match e {
                    TspError::Device { .. } | TspError::OperationTimeout { .. } => Ok(()),
                    other => Err(other),
                }
            }
        }
    }

    /// Persist the script, marking it for power-up when it is a boot script.
    ///
    /// Catalog verification only warns; `is_embedded` reports the outcome.
    pub async fn save(&mut self, session: &TspSession) -> TspResult<()> {
        let commands = session.commands();
        if self.info.boot {
            let autorun = self.render(commands, &commands.autorun)?;
            session.execute(self.node, &autorun).await?;
        }
        let save = self.render(commands, &commands.save)?;
        session.execute(self.node, &save).await?;
        self.confirm(session, ScriptStage::Save).await?;

        self.embedded = fetch_catalog(session, self.node)
            .await?
            .iter()
            .any(|name| name == self.name());
        if self.embedded {
            self.embedded_firmware_version = Some(session.firmware().to_string());
            info!(script = %self.name(), node = self.node.number(), boot = self.info.boot, "Script saved");
        } else {
            warn!(script = %self.name(), node = self.node.number(), "Saved script missing from catalog");
        }
        Ok(())
    }

    /// Remove the script from the node. Best effort: problems are logged.
    pub async fn delete(&mut self, session: &TspSession) -> TspResult<()> {
        let commands = session.commands();
        let timeout = session.config().operation_timeout();

        let delete = self.render(commands, &commands.delete)?;
        session.execute(self.node, &delete).await?;
        if session
            .await_operation_completion(self.node, timeout)
            .await?
            .timed_out()
        {
            warn!(script = %self.name(), "Delete did not complete in time");
        }

        let release = self.render(commands, &commands.null_identifier)?;
        session.execute(self.node, &release).await?;
        if !session.is_nil(self.node, self.name()).await? {
            warn!(script = %self.name(), "Identifier still defined after delete");
        }

        session.execute(self.node, &commands.collect_garbage).await?;
        if session
            .await_operation_completion(self.node, timeout)
            .await?
            .timed_out()
        {
            warn!(script = %self.name(), "Garbage collection not confirmed");
        }

        let residual = session.drain_error_queue().await?;
        if !residual.is_empty() {
            warn!(script = %self.name(), errors = %residual.report(), "Errors left after delete");
        }

        self.loaded = false;
        self.byte_code = false;
        self.activated = false;
        self.embedded = false;
        self.embedded_firmware_version = None;
        info!(script = %self.name(), node = self.node.number(), "Script deleted");
        Ok(())
    }

    /// Re-probe loaded, byte-code, activated and embedded from the node.
    ///
    /// Activation is probed through the namespace symbols. A script without
    /// namespaces keeps its last known activation while it stays loaded.
    pub async fn refresh(&mut self, session: &TspSession) -> TspResult<()> {
        let commands = session.commands();
        self.loaded = !session.is_nil(self.node, self.name()).await?;
        if !self.loaded {
            self.byte_code = false;
            self.activated = false;
        } else {
            let probe = self.render(commands, &commands.is_byte_code)?;
            self.byte_code = session.query_bool(self.node, &probe).await?;
            if !self.info.namespaces.is_empty() {
                let mut all = true;
                for ns in &self.info.namespaces {
                    if session.is_nil(self.node, ns).await? {
                        all = false;
                        break;
                    }
                }
                self.activated = all;
            }
        }
        self.embedded = fetch_catalog(session, self.node)
            .await?
            .iter()
            .any(|name| name == self.name());
        if !self.embedded {
            self.embedded_firmware_version = None;
        }
        debug!(
            script = %self.name(),
            node = self.node.number(),
            loaded = self.loaded,
            byte_code = self.byte_code,
            activated = self.activated,
            embedded = self.embedded,
            "Script state refreshed"
        );
        Ok(())
    }

    /// Version reported by the script's getter, if it has one and it is defined.
    pub async fn deployed_version(&self, session: &TspSession) -> TspResult<Option<String>> {
        let Some(getter) = &self.info.version_getter else {
            return Ok(None);
        };
        if session.is_nil(self.node, getter).await? {
            return Ok(None);
        }
        let reply = session.query_value(self.node, getter).await?;
        Ok(Some(reply.trim().trim_matches('"').to_string()))
    }
}
