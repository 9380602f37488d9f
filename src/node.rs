//! Node addressing
//!
//! A TSP-Link bus carries one controller node and any number of remote nodes.
//! Commands for the controller go out verbatim; commands for a remote node are
//! wrapped in `node[N].execute('...')`. Remote execution completes
//! asynchronously relative to the controller's round trip, so callers follow a
//! wrapped command with an operation-complete wait.
//!
//! Remote values cannot be printed directly. A remote query hands the value to
//! the node's data queue and the controller fetches it afterwards.

use crate::error::TspResult;
use crate::session::CommandSet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Node number reserved for the controller by default.
pub const DEFAULT_CONTROLLER_NODE: u32 = 1;

/// One addressable controller on the bus. The node number is its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeEntity {
    number: u32,
    controller_number: u32,
}

/// Commands that fetch one value from a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeQuery {
    /// Write-only command to issue first (remote nodes only).
    pub setup: Option<String>,
    /// Query whose single reply line is the value.
    pub query: String,
}

impl NodeEntity {
    /// Node `number` on a bus whose controller is `controller_number`.
    pub fn new(number: u32, controller_number: u32) -> Self {
        Self {
            number,
            controller_number,
        }
    }

    /// The controller node itself.
    pub fn controller(controller_number: u32) -> Self {
        Self::new(controller_number, controller_number)
    }

    /// Node number.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// True for the controller node.
    pub fn is_controller(&self) -> bool {
        self.number == self.controller_number
    }

    /// Address `command` to this node.
    pub fn wrap(&self, commands: &CommandSet, command: &str) -> TspResult<String> {
        if self.is_controller() {
            return Ok(command.to_string());
        }
        CommandSet::render(
            &commands.remote_execute,
            &[
                ("node", &self.number.to_string()),
                ("command", &escape_single_quoted(command)),
            ],
        )
    }

    /// Commands that bring the value of `expr` on this node back to the caller.
    pub fn query(&self, commands: &CommandSet, expr: &str) -> TspResult<NodeQuery> {
        if self.is_controller() {
            return Ok(NodeQuery {
                setup: None,
                query: commands.print_expr(expr)?,
            });
        }
        let node = self.number.to_string();
        let hand_off = CommandSet::render(&commands.remote_queue_value, &[("expr", expr)])?;
        Ok(NodeQuery {
            setup: Some(self.wrap(commands, &hand_off)?),
            query: CommandSet::render(&commands.remote_fetch_value, &[("node", &node)])?,
        })
    }

    /// Operation-complete handshake for this node.
    pub fn completion_query(&self, commands: &CommandSet) -> TspResult<String> {
        if self.is_controller() {
            Ok(commands.operation_complete.clone())
        } else {
            CommandSet::render(
                &commands.operation_complete_node,
                &[("node", &self.number.to_string())],
            )
        }
    }
}

impl fmt::Display for NodeEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_controller() {
            write!(f, "node {} (controller)", self.number)
        } else {
            write!(f, "node {}", self.number)
        }
    }
}

/// Escape a command for a single-quoted Lua string literal.
pub fn escape_single_quoted(command: &str) -> String {
    command.replace('\\', "\\\\").replace('\'', "\\'")
}
