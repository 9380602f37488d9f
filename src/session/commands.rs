//! Command capability table
//!
//! Every literal the engine sends lives here as a `strfmt` template. Instruments
//! that deviate from the default TSP dialect override individual entries
//! (usually from the `[commands]` config section) instead of subclassing.
//!
//! Placeholders: `{name}` script name, `{node}` node number, `{expr}` Lua
//! expression, `{command}` escaped command, `{value}` integer, `{helper}`
//! byte-code helper, `{source}` staging script name.

use crate::error::{TspError, TspResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Command-format strings plus the few behaviours that differ per instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSet {
    /// Clear status (`*CLS`).
    pub clear_execution_state: String,
    /// Reset to defaults (`*RST`).
    pub reset: String,
    /// Identity query.
    pub identity: String,
    /// Status byte as a query, for links without a serial poll.
    pub status_byte_query: String,
    /// Print a value on the controller.
    pub print: String,
    /// Pop one entry from the error queue.
    pub next_error: String,
    /// Reply returned by `next_error` on an empty queue.
    pub no_error_reply: String,
    /// Remote-node wrapper.
    pub remote_execute: String,
    /// Executed on a remote node to hand a value back to the controller.
    pub remote_queue_value: String,
    /// Fetches a value handed back by `remote_queue_value`.
    pub remote_fetch_value: String,
    /// Operation-complete handshake on the controller; replies `1`.
    pub operation_complete: String,
    /// Operation-complete handshake for a remote node; replies `1`.
    pub operation_complete_node: String,
    /// Firmware revision expression.
    pub firmware_revision: String,
    /// Service request enable assignment.
    pub service_request_enable: String,
    /// Standard event enable assignment.
    pub standard_event_enable: String,
    /// Standard event register expression (read clears).
    pub standard_event_register: String,
    /// Operation event register expression.
    pub operation_event_register: String,
    /// Questionable event register expression.
    pub questionable_event_register: String,
    /// Measurement event register expression.
    pub measurement_event_register: String,
    /// Nil test.
    pub is_nil: String,
    /// First line of a script upload.
    pub load_begin: String,
    /// Last line of a script upload.
    pub load_end: String,
    /// Copy a controller script to a remote node.
    pub copy_to_node: String,
    /// Byte-code test.
    pub is_byte_code: String,
    /// Byte-code conversion before the compiling helper existed.
    pub legacy_byte_code: String,
    /// Byte-code conversion through the compiling helper.
    pub compile_byte_code: String,
    /// Name of the compiling helper function.
    pub bytecode_helper: String,
    /// Run a script.
    pub run: String,
    /// Mark a script to run at power-up.
    pub autorun: String,
    /// Persist a script to non-volatile memory.
    pub save: String,
    /// Delete a script from non-volatile memory.
    pub delete: String,
    /// Null a global identifier.
    pub null_identifier: String,
    /// Trigger garbage collection.
    pub collect_garbage: String,
    /// Comma-separated catalog of persisted scripts.
    pub catalog: String,
    /// Whether `*CLS` leaves the enable registers untouched.
    pub clear_preserves_enables: bool,
}

impl Default for CommandSet {
    fn default() -> Self {
        Self {
            clear_execution_state: "*CLS".into(),
            reset: "*RST".into(),
            identity: "*IDN?".into(),
            status_byte_query: "*STB?".into(),
            print: "_G.print({expr})".into(),
            next_error: "_G.print(_G.string.format('%d,%q,%d',_G.errorqueue.next()))".into(),
            no_error_reply: "0,\"Queue Is Empty\",0".into(),
            remote_execute: "_G.node[{node}].execute('{command}')".into(),
            remote_queue_value: "_G.dataqueue.add({expr})".into(),
            remote_fetch_value: "_G.waitcomplete({node}) _G.print(_G.node[{node}].dataqueue.next())"
                .into(),
            operation_complete: "_G.waitcomplete() _G.print(1)".into(),
            operation_complete_node: "_G.waitcomplete({node}) _G.print(1)".into(),
            firmware_revision: "_G.localnode.revision".into(),
            service_request_enable: "_G.status.request_enable={value}".into(),
            standard_event_enable: "_G.status.standard.enable={value}".into(),
            standard_event_register: "_G.status.standard.event".into(),
            operation_event_register: "_G.status.operation.event".into(),
            questionable_event_register: "_G.status.questionable.event".into(),
            measurement_event_register: "_G.status.measurement.event".into(),
            is_nil: "{expr}==nil".into(),
            load_begin: "loadscript {name}".into(),
            load_end: "endscript".into(),
            copy_to_node: r"_G.node[{node}].execute('{name}=script.new([[' .. _G.{source}.source .. ']],\'{name}\')')"
                .into(),
            is_byte_code: "{name}.source==nil".into(),
            legacy_byte_code: "{name}.source=nil".into(),
            compile_byte_code: "{helper}({name})".into(),
            bytecode_helper: "_G.tsp_support.compile".into(),
            run: "{name}.run()".into(),
            autorun: "{name}.autorun='yes'".into(),
            save: "{name}.save()".into(),
            delete: "_G.script.delete('{name}')".into(),
            null_identifier: "_G.{name}=nil".into(),
            collect_garbage: "_G.collectgarbage()".into(),
            catalog: "(function() local s='' for n in _G.script.user.catalog() do s=s..n..',' end return s end)()"
                .into(),
            clear_preserves_enables: false,
        }
    }
}

impl CommandSet {
    /// Render `template` with the given placeholder values.
    pub fn render(template: &str, values: &[(&str, &str)]) -> TspResult<String> {
        let vars: HashMap<String, String> = values
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        strfmt::strfmt(template, &vars)
            .map_err(|e| TspError::CommandFormat(format!("'{}': {}", template, e)))
    }

    /// `print` for an expression.
    pub fn print_expr(&self, expr: &str) -> TspResult<String> {
        Self::render(&self.print, &[("expr", expr)])
    }

    /// Nil-test expression for `expr`.
    pub fn nil_expr(&self, expr: &str) -> TspResult<String> {
        Self::render(&self.is_nil, &[("expr", expr)])
    }

    /// Render a per-script template.
    pub fn script(&self, template: &str, name: &str) -> TspResult<String> {
        Self::render(template, &[("name", name), ("helper", &self.bytecode_helper)])
    }

    /// Enable-register assignment.
    pub fn assign(&self, template: &str, value: u32) -> TspResult<String> {
        Self::render(template, &[("value", &value.to_string())])
    }
}
