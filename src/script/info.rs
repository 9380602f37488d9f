//! Static script definitions (the deployment manifest entries).

use crate::error::{TspError, TspResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")
        .unwrap_or_else(|e| panic!("invalid identifier pattern: {e}"))
});

fn default_embed() -> bool {
    true
}

/// One script the station wants on an instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptInfo {
    /// Global identifier of the script on its node.
    pub name: String,
    /// Script body.
    #[serde(default)]
    pub source: Option<String>,
    /// File holding the body, relative to the configuration file.
    #[serde(default)]
    pub source_file: Option<PathBuf>,
    /// Target node; the controller when absent.
    #[serde(default)]
    pub node: Option<u32>,
    /// Run automatically at power-up.
    #[serde(default)]
    pub boot: bool,
    /// Persist to non-volatile memory.
    #[serde(default = "default_embed")]
    pub embed: bool,
    /// Convert to byte-code before saving.
    #[serde(default)]
    pub byte_code: bool,
    /// Global symbols that exist once the script has run.
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Version this manifest expects.
    #[serde(default)]
    pub version: Option<String>,
    /// Expression returning the deployed version.
    #[serde(default)]
    pub version_getter: Option<String>,
    /// Run on every deployment pass, even when already active.
    #[serde(default)]
    pub run_always: bool,
}

impl ScriptInfo {
    /// Controller script with default flags.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: Some(source.into()),
            source_file: None,
            node: None,
            boot: false,
            embed: true,
            byte_code: false,
            namespaces: Vec::new(),
            version: None,
            version_getter: None,
            run_always: false,
        }
    }

    /// Deploy to `node` instead of the controller.
    pub fn on_node(mut self, node: u32) -> Self {
        self.node = Some(node);
        self
    }

    /// Run at power-up.
    pub fn boot(mut self) -> Self {
        self.boot = true;
        self
    }

    /// Convert to byte code before saving.
    pub fn byte_code(mut self) -> Self {
        self.byte_code = true;
        self
    }

    /// Never save to non-volatile memory.
    pub fn transient(mut self) -> Self {
        self.embed = false;
        self
    }

    /// Run on every pass even when active.
    pub fn run_always(mut self) -> Self {
        self.run_always = true;
        self
    }

    /// Globals whose presence shows the script ran.
    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    /// Expected version and the expression that reads it back.
    pub fn with_version(mut self, version: impl Into<String>, getter: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self.version_getter = Some(getter.into());
        self
    }

    /// Body to upload.
    pub fn body(&self) -> TspResult<&str> {
        self.source.as_deref().ok_or_else(|| {
            TspError::InvalidOperation(format!("Script '{}' has no source", self.name))
        })
    }

    /// Check the definition is deployable.
    pub fn validate(&self) -> TspResult<()> {
        if !IDENTIFIER.is_match(&self.name) {
            return Err(TspError::InvalidOperation(format!(
                "Script name '{}' is not a valid identifier",
                self.name
            )));
        }
        if self.source.is_none() && self.source_file.is_none() {
            return Err(TspError::InvalidOperation(format!(
                "Script '{}' needs 'source' or 'source_file'",
                self.name
            )));
        }
        if let Some(ns) = self.namespaces.iter().find(|ns| {
            !ns.split('.').all(|part| IDENTIFIER.is_match(part))
        }) {
            return Err(TspError::InvalidOperation(format!(
                "Script '{}' namespace '{}' is not a valid symbol",
                self.name, ns
            )));
        }
        if self.version_getter.is_some() != self.version.is_some() {
            return Err(TspError::InvalidOperation(format!(
                "Script '{}' must set 'version' and 'version_getter' together",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(ScriptInfo::new("boot_me", "x=1").validate().is_ok());
        assert!(ScriptInfo::new("1bad", "x=1").validate().is_err());
        assert!(ScriptInfo::new("bad-name", "x=1").validate().is_err());
    }

    #[test]
    fn test_version_requires_getter() {
        let mut info = ScriptInfo::new("lib", "lib={}");
        info.version = Some("1.0".into());
        assert!(info.validate().is_err());
        let info = ScriptInfo::new("lib", "lib={}").with_version("1.0", "lib.version");
        assert!(info.validate().is_ok());
    }

    #[test]
    fn test_manifest_entry_defaults() {
        let info: ScriptInfo = toml::from_str(
            r#"
            name = "lib"
            source = "lib = {}"
            namespaces = ["lib"]
            "#,
        )
        .unwrap();
        assert!(info.embed);
        assert!(!info.boot);
        assert_eq!(info.node, None);
        assert_eq!(info.namespaces, vec!["lib".to_string()]);
    }
}
