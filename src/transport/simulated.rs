//! Simulated TSP instrument
//!
//! An in-memory instrument that understands the default [`CommandSet`]
//! dialect well enough to exercise the whole engine without hardware:
//!
//! - status byte (EAV, MAV, ESB, RQS) derived from live state, plus
//!   scheduled bits for wait tests
//! - error queue with `errorqueue.next()` replies
//! - scripts per node (`loadscript`/`endscript`, run, save, delete, byte-code)
//! - non-volatile catalog that survives [`power_cycle`](SimulatedInstrument::power_cycle)
//! - remote nodes reached through `node[N].execute(...)` and the data queue
//! - completion latency, command log and failure injection
//!
//! Running a script defines the globals its body assigns at top level
//! (`name = ...`, `function name(...)`). A top-level `error('...')` line makes
//! the run fail with a runtime error.
//!
//! [`CommandSet`]: crate::session::CommandSet
//!
//! # Example
//!
//! ```
//! use rust_tsp::transport::SimulatedInstrument;
//!
//! let instrument = SimulatedInstrument::new().with_firmware("2.1.7").with_node(2);
//! assert_eq!(instrument.firmware(), "2.1.7");
//! assert!(instrument.commands().is_empty());
//! ```

use super::{Transport, TransportCapabilities};
use crate::node::DEFAULT_CONTROLLER_NODE;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Severity the simulator reports for its own errors.
const ERROR_SEVERITY: i32 = 30;

fn pattern(re: &str) -> Regex {
    Regex::new(re).unwrap_or_else(|e| panic!("invalid simulator pattern {re}: {e}"))
}

static LOADSCRIPT: Lazy<Regex> = Lazy::new(|| pattern(r"^loadscript\s+(\w+)$"));
static WAITCOMPLETE: Lazy<Regex> = Lazy::new(|| pattern(r"^waitcomplete\((\d*)\)\s*(.*)$"));
static COPY_TO_NODE: Lazy<Regex> = Lazy::new(|| {
    pattern(r"^node\[(\d+)\]\.execute\('(\w+)=script\.new\(\[\[' \.\. (\w+)\.source \.\. '\]\],\\'(\w+)\\'\)'\)$")
});
static EXECUTE: Lazy<Regex> = Lazy::new(|| pattern(r"^node\[(\d+)\]\.execute\('(.*)'\)$"));
static PRINT: Lazy<Regex> = Lazy::new(|| pattern(r"^print\((.*)\)$"));
static DATAQUEUE_ADD: Lazy<Regex> = Lazy::new(|| pattern(r"^dataqueue\.add\((.*)\)$"));
static DATAQUEUE_NEXT: Lazy<Regex> = Lazy::new(|| pattern(r"^node\[(\d+)\]\.dataqueue\.next\(\)$"));
static REQUEST_ENABLE: Lazy<Regex> = Lazy::new(|| pattern(r"^status\.request_enable=(\d+)$"));
static STANDARD_ENABLE: Lazy<Regex> = Lazy::new(|| pattern(r"^status\.standard\.enable=(\d+)$"));
static RUN: Lazy<Regex> = Lazy::new(|| pattern(r"^(\w+)\.run\(\)$"));
static SAVE: Lazy<Regex> = Lazy::new(|| pattern(r"^(\w+)\.save\(\)$"));
static AUTORUN: Lazy<Regex> = Lazy::new(|| pattern(r"^(\w+)\.autorun='yes'$"));
static NULL_SOURCE: Lazy<Regex> = Lazy::new(|| pattern(r"^(\w+)\.source=nil$"));
static DELETE: Lazy<Regex> = Lazy::new(|| pattern(r"^script\.delete\('(\w+)'\)$"));
static NULL_IDENTIFIER: Lazy<Regex> = Lazy::new(|| pattern(r"^(\w+)=nil$"));
static HELPER_CALL: Lazy<Regex> = Lazy::new(|| pattern(r"^([A-Za-z_][\w.]*)\((\w+)\)$"));
static NIL_TEST: Lazy<Regex> = Lazy::new(|| pattern(r"^(.*?)\s*(==|~=)\s*nil$"));
static EVENT_REGISTER: Lazy<Regex> =
    Lazy::new(|| pattern(r"^status\.(standard|operation|questionable|measurement)\.event$"));
static BODY_FUNCTION: Lazy<Regex> =
    Lazy::new(|| pattern(r"^function\s+([A-Za-z_][\w.]*)\s*\("));
static BODY_ASSIGN: Lazy<Regex> =
    Lazy::new(|| pattern(r"^([A-Za-z_][\w.]*)\s*=\s*(.+?)\s*$"));
static BODY_ERROR: Lazy<Regex> = Lazy::new(|| pattern(r#"^error\(\s*['"](.*?)['"]"#));

/// A global value as far as the simulator cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimValue {
    /// Printable scalar (numbers and strings, quotes stripped).
    Literal(String),
    /// Callable.
    Function,
    /// Namespace table.
    Table,
}

/// A script object held in a node's runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimScript {
    /// Source text as loaded.
    pub body: String,
    /// Source was replaced by byte code.
    pub byte_code: bool,
    /// Runs at power-up.
    pub autorun: bool,
}

#[derive(Debug, Default)]
struct NodeState {
    globals: HashMap<String, SimValue>,
    scripts: HashMap<String, SimScript>,
    saved: BTreeMap<usize, (String, SimScript)>,
    dataqueue: VecDeque<String>,
}

impl NodeState {
    fn saved_names(&self) -> Vec<String> {
        self.saved.values().map(|(name, _)| name.clone()).collect()
    }

    fn saved_index(&self, name: &str) -> Option<usize> {
        self.saved
            .iter()
            .find(|(_, (n, _))| n == name)
            .map(|(index, _)| *index)
    }

    fn has_prefix(&self, path: &str) -> bool {
        let prefix = format!("{path}.");
        self.globals.keys().any(|k| k.starts_with(&prefix))
    }

    fn resolve(&self, path: &str) -> Option<String> {
        if self.scripts.contains_key(path) {
            return Some(format!("script: {path}"));
        }
        if let Some((name, field)) = path.split_once('.') {
            if let Some(script) = self.scripts.get(name) {
                match field {
                    "source" if script.byte_code => return None,
                    "source" => return Some(script.body.clone()),
                    "autorun" => {
                        return Some(if script.autorun { "yes" } else { "no" }.to_string())
                    }
                    _ => {}
                }
            }
        }
        match self.globals.get(path) {
            Some(SimValue::Literal(v)) => Some(v.clone()),
            Some(SimValue::Function) => Some(format!("function: {path}")),
            Some(SimValue::Table) => Some(format!("table: {path}")),
            None if self.has_prefix(path) => Some(format!("table: {path}")),
            None => None,
        }
    }

    fn remove_identifier(&mut self, name: &str) {
        self.scripts.remove(name);
        let prefix = format!("{name}.");
        self.globals
            .retain(|k, _| k != name && !k.starts_with(&prefix));
    }
}

#[derive(Debug)]
struct Reply {
    text: String,
    ready_at: Instant,
}

#[derive(Debug)]
struct SimState {
    open: bool,
    address: Option<String>,
    model_hint: Option<String>,
    firmware: String,
    nodes: BTreeMap<u32, NodeState>,
    next_saved_index: usize,
    errors: VecDeque<(i32, String, i32)>,
    output: VecDeque<Reply>,
    loading: Option<(String, Vec<String>)>,
    scheduled: Vec<(u8, Instant)>,
    service_request_enable: u8,
    standard_event_enable: u8,
    standard_event: u32,
    operation_event: u32,
    questionable_event: u32,
    measurement_event: u32,
    completion_latency: Duration,
    clear_preserves_enables: bool,
    max_message_length: usize,
    log: Vec<String>,
    status_reads: usize,
}

impl SimState {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(DEFAULT_CONTROLLER_NODE, NodeState::default());
        Self {
            open: false,
            address: None,
            model_hint: None,
            firmware: "3.0.2".to_string(),
            nodes,
            next_saved_index: 0,
            errors: VecDeque::new(),
            output: VecDeque::new(),
            loading: None,
            scheduled: Vec::new(),
            service_request_enable: 0,
            standard_event_enable: 0,
            standard_event: 0,
            operation_event: 0,
            questionable_event: 0,
            measurement_event: 0,
            completion_latency: Duration::from_millis(5),
            clear_preserves_enables: false,
            max_message_length: TransportCapabilities::default().max_message_length,
            log: Vec::new(),
            status_reads: 0,
        }
    }

    fn push_error(&mut self, number: i32, message: impl Into<String>) {
        self.push_error_with_severity(number, message, ERROR_SEVERITY);
    }

    fn push_error_with_severity(&mut self, number: i32, message: impl Into<String>, severity: i32) {
        // Command errors raise CME, execution errors EXE, anything else DDE.
        self.standard_event |= match number {
            -199..=-100 => 0x20,
            -299..=-200 => 0x10,
            _ => 0x08,
        };
        self.errors.push_back((number, message.into(), severity));
    }

    fn reply(&mut self, text: String, delay: Duration) {
        self.output.push_back(Reply {
            text,
            ready_at: Instant::now() + delay,
        });
    }

    fn status_byte(&self) -> u8 {
        let now = Instant::now();
        let mut stb = 0u8;
        if !self.errors.is_empty() {
            stb |= 0x04;
        }
        if self.output.front().is_some_and(|r| r.ready_at <= now) {
            stb |= 0x10;
        }
        if self.standard_event & u32::from(self.standard_event_enable) != 0 {
            stb |= 0x20;
        }
        for (mask, at) in &self.scheduled {
            if *at <= now {
                stb |= mask;
            }
        }
        if stb & self.service_request_enable & !0x40 != 0 {
            stb |= 0x40;
        }
        stb
    }

    fn node_mut(&mut self, node: u32) -> Option<&mut NodeState> {
        self.nodes.get_mut(&node)
    }

    fn handle_line(&mut self, line: &str) {
        if let Some((name, body)) = self.loading.as_mut() {
            if line.trim() == "endscript" {
                let script = SimScript {
                    body: body.join("\n"),
                    byte_code: false,
                    autorun: false,
                };
                let name = name.clone();
                self.loading = None;
                if let Some(controller) = self.node_mut(DEFAULT_CONTROLLER_NODE) {
                    controller.globals.remove(&name);
                    controller.scripts.insert(name, script);
                }
            } else {
                body.push(line.to_string());
            }
            return;
        }

        let statement = line.replace("_G.", "");
        self.execute(DEFAULT_CONTROLLER_NODE, statement.trim(), Duration::ZERO);
    }

    fn execute(&mut self, node: u32, stmt: &str, delay: Duration) {
        if let Some(caps) = LOADSCRIPT.captures(stmt) {
            self.loading = Some((caps[1].to_string(), Vec::new()));
            return;
        }
        if let Some(caps) = WAITCOMPLETE.captures(stmt) {
            let rest = caps[2].trim().to_string();
            if !rest.is_empty() {
                let latency = self.completion_latency;
                self.execute(node, &rest, latency);
            }
            return;
        }
        if let Some(caps) = COPY_TO_NODE.captures(stmt) {
            let target: u32 = caps[1].parse().unwrap_or(0);
            let source = caps[3].to_string();
            let name = caps[4].to_string();
            let body = self
                .nodes
                .get(&node)
                .and_then(|n| n.scripts.get(&source))
                .filter(|s| !s.byte_code)
                .map(|s| s.body.clone());
            let Some(body) = body else {
                self.push_error(-286, format!("TSP Runtime error: {source}.source is nil"));
                return;
            };
            match self.node_mut(target) {
                Some(remote) => {
                    remote.globals.remove(&name);
                    remote.scripts.insert(
                        name,
                        SimScript {
                            body,
                            byte_code: false,
                            autorun: false,
                        },
                    );
                }
                None => self.push_error(-1203, format!("node[{target}] not found")),
            }
            return;
        }
        if let Some(caps) = EXECUTE.captures(stmt) {
            let target: u32 = caps[1].parse().unwrap_or(0);
            let inner = caps[2].replace("\\'", "'").replace("\\\\", "\\");
            if self.nodes.contains_key(&target) {
                self.execute(target, inner.trim(), delay);
            } else {
                self.push_error(-1203, format!("node[{target}] not found"));
            }
            return;
        }
        if let Some(caps) = PRINT.captures(stmt) {
            let text = self.evaluate(node, caps[1].trim());
            self.reply(text, delay);
            return;
        }
        if let Some(caps) = DATAQUEUE_ADD.captures(stmt) {
            let value = self.evaluate(node, caps[1].trim());
            if let Some(state) = self.node_mut(node) {
                state.dataqueue.push_back(value);
            }
            return;
        }

        match stmt {
            "*CLS" => {
                self.errors.clear();
                self.standard_event = 0;
                self.operation_event = 0;
                self.questionable_event = 0;
                self.measurement_event = 0;
                if !self.clear_preserves_enables {
                    self.service_request_enable = 0;
                    self.standard_event_enable = 0;
                }
                return;
            }
            "*RST" => return,
            "*IDN?" => {
                let idn = format!(
                    "Keithley Instruments Inc., Model 2602B, 04089762, {}",
                    self.firmware
                );
                self.reply(idn, delay);
                return;
            }
            "*STB?" => {
                let stb = self.status_byte();
                self.reply(stb.to_string(), delay);
                return;
            }
            "errorqueue.clear()" => {
                self.errors.clear();
                return;
            }
            "collectgarbage()" => return,
            _ => {}
        }

        if let Some(caps) = REQUEST_ENABLE.captures(stmt) {
            self.service_request_enable = caps[1].parse().unwrap_or(0);
            return;
        }
        if let Some(caps) = STANDARD_ENABLE.captures(stmt) {
            self.standard_event_enable = caps[1].parse().unwrap_or(0);
            return;
        }
        if let Some(caps) = RUN.captures(stmt) {
            self.run_script(node, &caps[1]);
            return;
        }
        if let Some(caps) = SAVE.captures(stmt) {
            let name = caps[1].to_string();
            self.save_script(node, &name);
            return;
        }
        if let Some(caps) = AUTORUN.captures(stmt) {
            let name = caps[1].to_string();
            match self.node_mut(node).and_then(|n| n.scripts.get_mut(&name)) {
                Some(script) => script.autorun = true,
                None => self.push_error(-286, format!("TSP Runtime error: attempt to index {name} (nil)")),
            }
            return;
        }
        if let Some(caps) = NULL_SOURCE.captures(stmt) {
            let name = caps[1].to_string();
            match self.node_mut(node).and_then(|n| n.scripts.get_mut(&name)) {
                Some(script) => script.byte_code = true,
                None => self.push_error(-286, format!("TSP Runtime error: attempt to index {name} (nil)")),
            }
            return;
        }
        if let Some(caps) = DELETE.captures(stmt) {
            let name = caps[1].to_string();
            if let Some(state) = self.node_mut(node) {
                if let Some(index) = state.saved_index(&name) {
                    state.saved.remove(&index);
                }
            }
            return;
        }
        if let Some(caps) = NULL_IDENTIFIER.captures(stmt) {
            let name = caps[1].to_string();
            if let Some(state) = self.node_mut(node) {
                state.remove_identifier(&name);
            }
            return;
        }
        if let Some(caps) = HELPER_CALL.captures(stmt) {
            let helper = caps[1].to_string();
            let name = caps[2].to_string();
            let is_function = self
                .nodes
                .get(&node)
                .and_then(|n| n.globals.get(&helper))
                .is_some_and(|v| *v == SimValue::Function);
            if !is_function {
                self.push_error(-286, format!("TSP Runtime error: attempt to call {helper} (nil)"));
                return;
            }
            match self.node_mut(node).and_then(|n| n.scripts.get_mut(&name)) {
                Some(script) => script.byte_code = true,
                None => self.push_error(-286, format!("TSP Runtime error: {name} is not a script")),
            }
            return;
        }

        self.push_error(-285, format!("Syntax error at line 1: {stmt}"));
    }

    fn run_script(&mut self, node: u32, name: &str) {
        let Some(body) = self
            .nodes
            .get(&node)
            .and_then(|n| n.scripts.get(name))
            .map(|s| s.body.clone())
        else {
            self.push_error(-286, format!("TSP Runtime error: attempt to index {name} (nil)"));
            return;
        };
        let mut defined = Vec::new();
        for line in body.lines().map(str::trim) {
            if let Some(caps) = BODY_ERROR.captures(line) {
                self.push_error(-286, format!("TSP Runtime error: {}", &caps[1]));
                return;
            }
            if line.starts_with("local ") {
                continue;
            }
            if let Some(caps) = BODY_FUNCTION.captures(line) {
                defined.push((caps[1].to_string(), SimValue::Function));
            } else if let Some(caps) = BODY_ASSIGN.captures(line) {
                let value = caps[2].trim_end_matches(';').trim();
                let value = if value.starts_with('{') {
                    SimValue::Table
                } else if value.starts_with("function") {
                    SimValue::Function
                } else {
                    SimValue::Literal(value.trim_matches(|c| c == '"' || c == '\'').to_string())
                };
                defined.push((caps[1].to_string(), value));
            }
        }
        if let Some(state) = self.node_mut(node) {
            state.globals.extend(defined);
        }
    }

    fn save_script(&mut self, node: u32, name: &str) {
        let Some(script) = self
            .nodes
            .get(&node)
            .and_then(|n| n.scripts.get(name))
            .cloned()
        else {
            self.push_error(-286, format!("TSP Runtime error: attempt to index {name} (nil)"));
            return;
        };
        let index = self.next_saved_index;
        let Some(state) = self.node_mut(node) else {
            return;
        };
        match state.saved_index(name) {
            Some(existing) => {
                state.saved.insert(existing, (name.to_string(), script));
            }
            None => {
                state.saved.insert(index, (name.to_string(), script));
                self.next_saved_index += 1;
            }
        }
    }

    fn evaluate(&mut self, node: u32, expr: &str) -> String {
        if expr.contains("errorqueue.next()") {
            return match self.errors.pop_front() {
                Some((number, message, severity)) => format!(
                    "{},\"{}\",{}",
                    number,
                    message.replace('\\', "\\\\").replace('"', "\\\""),
                    severity
                ),
                None => "0,\"Queue Is Empty\",0".to_string(),
            };
        }
        if let Some(caps) = DATAQUEUE_NEXT.captures(expr) {
            let target: u32 = caps[1].parse().unwrap_or(0);
            return self
                .node_mut(target)
                .and_then(|n| n.dataqueue.pop_front())
                .unwrap_or_else(|| "nil".to_string());
        }
        if expr.contains("script.user.catalog()") {
            return self
                .nodes
                .get(&node)
                .map(|n| {
                    n.saved_names()
                        .into_iter()
                        .map(|name| format!("{name},"))
                        .collect::<String>()
                })
                .unwrap_or_default();
        }
        if let Some(caps) = NIL_TEST.captures(expr) {
            let is_nil = self.resolve(node, caps[1].trim()).is_none();
            let result = if &caps[2] == "==" { is_nil } else { !is_nil };
            return result.to_string();
        }
        if let Some(caps) = EVENT_REGISTER.captures(expr) {
            let register = match &caps[1] {
                "standard" => &mut self.standard_event,
                "operation" => &mut self.operation_event,
                "questionable" => &mut self.questionable_event,
                _ => &mut self.measurement_event,
            };
            let value = std::mem::take(register);
            return value.to_string();
        }
        if expr == "localnode.revision" {
            return self.firmware.clone();
        }
        if expr.parse::<f64>().is_ok() {
            return expr.to_string();
        }
        if expr.len() >= 2 && (expr.starts_with('"') || expr.starts_with('\'')) {
            return expr[1..expr.len() - 1].to_string();
        }
        self.resolve(node, expr).unwrap_or_else(|| "nil".to_string())
    }

    fn resolve(&self, node: u32, path: &str) -> Option<String> {
        self.nodes.get(&node).and_then(|n| n.resolve(path))
    }
}

/// In-memory TSP instrument implementing [`Transport`].
///
/// Clones share state, so a test keeps one clone for inspection and hands
/// another to the session.
#[derive(Clone)]
pub struct SimulatedInstrument {
    state: Arc<Mutex<SimState>>,
    fail_next: Arc<AtomicBool>,
}

impl Default for SimulatedInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedInstrument {
    /// Controller-only instrument on firmware 3.0.2.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
            fail_next: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the firmware revision reported by `localnode.revision`.
    pub fn with_firmware(self, revision: &str) -> Self {
        self.state.lock().firmware = revision.to_string();
        self
    }

    /// Add a remote node.
    pub fn with_node(self, node: u32) -> Self {
        self.state.lock().nodes.entry(node).or_default();
        self
    }

    /// Delay before an operation-complete reply becomes available.
    pub fn with_completion_latency(self, latency: Duration) -> Self {
        self.state.lock().completion_latency = latency;
        self
    }

    /// Keep enable registers across `*CLS`.
    pub fn with_clear_preserving_enables(self) -> Self {
        self.state.lock().clear_preserves_enables = true;
        self
    }

    /// Longest accepted command line.
    pub fn with_max_message_length(self, length: usize) -> Self {
        self.state.lock().max_message_length = length;
        self
    }

    /// Reported firmware revision.
    pub fn firmware(&self) -> String {
        self.state.lock().firmware.clone()
    }

    /// Address and model hint given to the last `open`.
    pub fn opened_with(&self) -> (Option<String>, Option<String>) {
        let state = self.state.lock();
        (state.address.clone(), state.model_hint.clone())
    }

    /// Change the completion latency of an already built instrument.
    pub fn set_completion_latency(&self, latency: Duration) {
        self.state.lock().completion_latency = latency;
    }

    /// Make the next transport operation fail.
    pub fn inject_next_failure(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            bail!("Injected transport failure");
        }
        Ok(())
    }

    /// Every line written so far, as sent.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Forget the command log.
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Number of status byte reads so far.
    pub fn status_reads(&self) -> usize {
        self.state.lock().status_reads
    }

    /// Put an unsolicited reply line in the output queue.
    pub fn push_reply(&self, text: &str) {
        self.state.lock().reply(text.to_string(), Duration::ZERO);
    }

    /// Queue a device error with the default severity.
    pub fn push_error(&self, number: i32, message: &str) {
        self.state.lock().push_error(number, message);
    }

    /// Queue a device error with an explicit severity.
    pub fn push_error_with_severity(&self, number: i32, message: &str, severity: i32) {
        self.state
            .lock()
            .push_error_with_severity(number, message, severity);
    }

    /// Errors still in the instrument's queue.
    pub fn pending_errors(&self) -> usize {
        self.state.lock().errors.len()
    }

    /// Turn on status byte bits `mask` once `after` has elapsed.
    pub fn schedule_status(&self, mask: u8, after: Duration) {
        self.state
            .lock()
            .scheduled
            .push((mask, Instant::now() + after));
    }

    /// Drop every scheduled status bit.
    pub fn clear_scheduled_status(&self) {
        self.state.lock().scheduled.clear();
    }

    /// Set bits in the operation event register.
    pub fn raise_operation_event(&self, bits: u32) {
        self.state.lock().operation_event |= bits;
    }

    /// Current service request enable register.
    pub fn service_request_enable(&self) -> u8 {
        self.state.lock().service_request_enable
    }

    /// Current standard event enable register.
    pub fn standard_event_enable(&self) -> u8 {
        self.state.lock().standard_event_enable
    }

    /// Define a global on `node` directly.
    pub fn define_global(&self, node: u32, path: &str, value: SimValue) {
        if let Some(state) = self.state.lock().node_mut(node) {
            state.globals.insert(path.to_string(), value);
        }
    }

    /// Runtime script `name` on `node`.
    pub fn script(&self, node: u32, name: &str) -> Option<SimScript> {
        self.state
            .lock()
            .nodes
            .get(&node)
            .and_then(|n| n.scripts.get(name).cloned())
    }

    /// Names in the non-volatile catalog of `node`, in save order.
    pub fn saved_scripts(&self, node: u32) -> Vec<String> {
        self.state
            .lock()
            .nodes
            .get(&node)
            .map(NodeState::saved_names)
            .unwrap_or_default()
    }

    /// Whether `path` currently resolves on `node`.
    pub fn is_defined(&self, node: u32, path: &str) -> bool {
        self.state.lock().resolve(node, path).is_some()
    }

    /// Put a script straight into non-volatile memory of `node`.
    pub fn persist_script(&self, node: u32, name: &str, body: &str) {
        let mut state = self.state.lock();
        let index = state.next_saved_index;
        state.next_saved_index += 1;
        if let Some(n) = state.node_mut(node) {
            n.saved.insert(
                index,
                (
                    name.to_string(),
                    SimScript {
                        body: body.to_string(),
                        byte_code: false,
                        autorun: false,
                    },
                ),
            );
        }
    }

    /// Simulate a power cycle: runtime state is lost, saved scripts are
    /// reloaded, and auto-run scripts are run.
    pub fn power_cycle(&self) {
        let mut state = self.state.lock();
        state.errors.clear();
        state.output.clear();
        state.loading = None;
        state.scheduled.clear();
        state.standard_event = 0;
        state.service_request_enable = 0;
        state.standard_event_enable = 0;

        let mut autorun = Vec::new();
        for (number, node) in state.nodes.iter_mut() {
            node.globals.clear();
            node.dataqueue.clear();
            node.scripts = node
                .saved
                .values()
                .map(|(name, script)| (name.clone(), script.clone()))
                .collect();
            autorun.extend(
                node.saved
                    .values()
                    .filter(|(_, script)| script.autorun)
                    .map(|(name, _)| (*number, name.clone())),
            );
        }
        for (node, name) in autorun {
            state.run_script(node, &name);
        }
    }
}

#[async_trait]
impl Transport for SimulatedInstrument {
    async fn open(&mut self, address: &str, model_hint: Option<&str>) -> Result<()> {
        self.check_failure()?;
        let mut state = self.state.lock();
        state.open = true;
        state.address = Some(address.to_string());
        state.model_hint = model_hint.map(str::to_string);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().open = false;
        Ok(())
    }

    async fn write_line(&mut self, command: &str) -> Result<usize> {
        self.check_failure()?;
        let mut state = self.state.lock();
        if !state.open {
            bail!("Not connected");
        }
        if command.len() > state.max_message_length {
            bail!(
                "Message of {} bytes exceeds {} byte limit",
                command.len(),
                state.max_message_length
            );
        }
        state.log.push(command.to_string());
        state.handle_line(command);
        Ok(command.len() + 1)
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String> {
        self.check_failure()?;
        let deadline = Instant::now() + timeout;
        loop {
            let ready_at = {
                let mut state = self.state.lock();
                if !state.open {
                    bail!("Not connected");
                }
                let front = state.output.front().map(|reply| reply.ready_at);
                match front {
                    Some(at) if at <= Instant::now() => {
                        if let Some(reply) = state.output.pop_front() {
                            return Ok(reply.text);
                        }
                        None
                    }
                    other => other,
                }
            };
            match ready_at {
                Some(at) if at <= deadline => tokio::time::sleep_until(at).await,
                _ => {
                    tokio::time::sleep_until(deadline).await;
                    return Err(anyhow!("Read timed out after {:?}", timeout));
                }
            }
        }
    }

    async fn read_status_byte(&mut self, _timeout: Duration) -> Result<Option<u8>> {
        self.check_failure()?;
        let mut state = self.state.lock();
        if !state.open {
            bail!("Not connected");
        }
        state.status_reads += 1;
        Ok(Some(state.status_byte()))
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            max_message_length: self.state.lock().max_message_length,
            ..TransportCapabilities::default()
        }
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn opened() -> SimulatedInstrument {
        let mut sim = SimulatedInstrument::new();
        sim.open("sim", None).await.unwrap();
        sim
    }

    #[tokio::test(start_paused = true)]
    async fn test_print_and_status_byte() {
        let mut sim = opened().await;
        assert_eq!(sim.read_status_byte(Duration::ZERO).await.unwrap().unwrap() & 0x10, 0);
        sim.write_line("_G.print(_G.localnode.revision)").await.unwrap();
        assert_eq!(sim.read_status_byte(Duration::ZERO).await.unwrap().unwrap() & 0x10, 0x10);
        assert_eq!(sim.read_line(Duration::from_secs(1)).await.unwrap(), "3.0.2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_command_queues_syntax_error() {
        let mut sim = opened().await;
        sim.write_line("bogus(").await.unwrap();
        assert_eq!(sim.read_status_byte(Duration::ZERO).await.unwrap().unwrap() & 0x04, 0x04);
        sim.write_line("_G.print(_G.string.format('%d,%q,%d',_G.errorqueue.next()))")
            .await
            .unwrap();
        let reply = sim.read_line(Duration::from_secs(1)).await.unwrap();
        assert!(reply.starts_with("-285,\"Syntax error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loadscript_run_defines_globals() {
        let mut sim = opened().await;
        for line in ["loadscript lib_script", "lib = {}", "lib.version = \"1.2\"", "endscript"] {
            sim.write_line(line).await.unwrap();
        }
        assert!(sim.script(1, "lib_script").is_some());
        assert!(!sim.is_defined(1, "lib"));
        sim.write_line("lib_script.run()").await.unwrap();
        assert!(sim.is_defined(1, "lib.version"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out_without_reply() {
        let mut sim = opened().await;
        let start = Instant::now();
        assert!(sim.read_line(Duration::from_millis(50)).await.is_err());
        assert_eq!(start.elapsed(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_cycle_reloads_saved_scripts() {
        let mut sim = opened().await;
        for line in ["loadscript app", "app_ready = 1", "endscript", "app.autorun='yes'", "app.save()"] {
            sim.write_line(line).await.unwrap();
        }
        sim.power_cycle();
        assert_eq!(sim.saved_scripts(1), vec!["app".to_string()]);
        assert!(sim.script(1, "app").is_some());
        assert!(sim.is_defined(1, "app_ready"));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let mut sim = opened().await;
        sim.inject_next_failure();
        assert!(sim.write_line("*CLS").await.is_err());
        assert!(sim.write_line("*CLS").await.is_ok());
    }
}
