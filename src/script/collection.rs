//! Ordered scripts sharing one node.

use super::ScriptEntity;
use crate::error::{TspError, TspResult};
use crate::node::NodeEntity;
use crate::session::TspSession;

/// Scripts of one node in load (dependency) order.
#[derive(Debug, Clone)]
pub struct ScriptEntityCollection {
    node: NodeEntity,
    entities: Vec<ScriptEntity>,
}

impl ScriptEntityCollection {
    /// Empty collection for `node`.
    pub fn new(node: NodeEntity) -> Self {
        Self {
            node,
            entities: Vec::new(),
        }
    }

    /// Node every member lives on.
    pub fn node(&self) -> NodeEntity {
        self.node
    }

    /// Append a script. It must live on this collection's node and carry a new name.
    pub fn push(&mut self, entity: ScriptEntity) -> TspResult<()> {
        if entity.node() != self.node {
            return Err(TspError::InvalidOperation(format!(
                "Script '{}' belongs to {}, not {}",
                entity.name(),
                entity.node(),
                self.node
            )));
        }
        if self.get(entity.name()).is_some() {
            return Err(TspError::InvalidOperation(format!(
                "Script '{}' already present on {}",
                entity.name(),
                self.node
            )));
        }
        self.entities.push(entity);
        Ok(())
    }

    /// Member by script name.
    pub fn get(&self, name: &str) -> Option<&ScriptEntity> {
        self.entities.iter().find(|e| e.name() == name)
    }

    /// Mutable member by script name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut ScriptEntity> {
        self.entities.iter_mut().find(|e| e.name() == name)
    }

    /// Members in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, ScriptEntity> {
        self.entities.iter()
    }

    /// Mutable members in insertion order.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, ScriptEntity> {
        self.entities.iter_mut()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// No members.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Re-probe every script.
    pub async fn refresh_all(&mut self, session: &TspSession) -> TspResult<()> {
        for entity in &mut self.entities {
            entity.refresh(session).await?;
        }
        Ok(())
    }

    /// Delete every script, last loaded first.
    pub async fn delete_all(&mut self, session: &TspSession) -> TspResult<()> {
        for entity in self.entities.iter_mut().rev() {
            entity.delete(session).await?;
        }
        Ok(())
    }

    /// True when every script is active.
    pub fn all_activated(&self) -> bool {
        self.entities.iter().all(ScriptEntity::is_activated)
    }
}
