//! Configuration facade: the read-only snapshot the core reconciles
//! against.
//!
//! All enumerations (goals, handle kinds), the built-in default actions,
//! and the user-declared overlays are resolved when a snapshot is built.
//! Reloads construct a fresh snapshot and swap the `Arc` from the core
//! loop, so readers never observe a half-applied config.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use desd_protocol::registry::{is_handle_name, is_killscript_field, is_service_name};

use crate::errors::{DaemonError, Result};

/// The stop action's default signal sequence.
pub const DEFAULT_STOP_SCRIPT: &str = "SIGTERM SIGCONT 30 SIGTERM 20 SIGQUIT 5 SIGKILL 20";

/// Declared intent for a service's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Goal {
    Up,
    #[default]
    Down,
    Once,
    Cycle,
}

impl Goal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Goal::Up => "up",
            Goal::Down => "down",
            Goal::Once => "once",
            Goal::Cycle => "cycle",
        }
    }
}

impl std::fmt::Display for Goal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One argv element of an exec-style run spec: a literal, or a late-bound
/// reference into the service environment (`$NAME`). `$$` escapes a
/// literal dollar sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgToken {
    Literal(String),
    Env(String),
}

impl ArgToken {
    pub fn parse(raw: &str) -> Result<ArgToken> {
        if let Some(rest) = raw.strip_prefix("$$") {
            return Ok(ArgToken::Literal(format!("${rest}")));
        }
        if let Some(name) = raw.strip_prefix('$') {
            if !is_env_var_name(name) {
                return Err(DaemonError::Config(format!(
                    "invalid environment reference '{raw}'"
                )));
            }
            return Ok(ArgToken::Env(name.to_string()));
        }
        Ok(ArgToken::Literal(raw.to_string()))
    }

    /// Resolve against an already-merged environment. An unset reference
    /// resolves to the empty string.
    pub fn resolve(&self, env: &HashMap<String, String>) -> String {
        match self {
            ArgToken::Literal(s) => s.clone(),
            ArgToken::Env(name) => env.get(name).cloned().unwrap_or_default(),
        }
    }
}

fn is_env_var_name(s: &str) -> bool {
    let bytes = s.as_bytes();
    match bytes.first() {
        Some(&b) if b.is_ascii_alphabetic() || b == b'_' => {}
        _ => return false,
    }
    bytes[1..]
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'_')
}

/// The closed set of in-process operations an action may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalMethod {
    Killscript,
    ExecUnlessRunning,
    StopStart,
    WaitForUptime,
}

impl InternalMethod {
    pub fn from_name(name: &str) -> Option<InternalMethod> {
        match name {
            "killscript" => Some(InternalMethod::Killscript),
            "exec_unless_running" => Some(InternalMethod::ExecUnlessRunning),
            "stop_start" => Some(InternalMethod::StopStart),
            "wait_for_uptime" => Some(InternalMethod::WaitForUptime),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InternalMethod::Killscript => "killscript",
            InternalMethod::ExecUnlessRunning => "exec_unless_running",
            InternalMethod::StopStart => "stop_start",
            InternalMethod::WaitForUptime => "wait_for_uptime",
        }
    }
}

/// What an action runs: an internal operation, or an exec-style argv the
/// spawner launches as a transient child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunSpec {
    Internal {
        method: InternalMethod,
        args: Vec<String>,
    },
    Exec {
        argv: Vec<ArgToken>,
        argv0: Option<ArgToken>,
    },
}

/// The set of other actions this action may run concurrently with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parallelism {
    All,
    Named(Vec<String>),
}

impl Parallelism {
    pub fn allows(&self, other: &str) -> bool {
        match self {
            Parallelism::All => true,
            Parallelism::Named(names) => names.iter().any(|n| n == other),
        }
    }
}

impl Default for Parallelism {
    fn default() -> Self {
        Parallelism::Named(Vec::new())
    }
}

/// A resolved action on a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub run: RunSpec,
    /// Env overlay applied over the service env; `None` unsets.
    pub env: HashMap<String, Option<String>>,
    pub goal: Option<Goal>,
    pub parallel: Parallelism,
    /// Handle list for exec actions; defaults to the service's `io`.
    pub io: Option<Vec<String>>,
    /// Tokens that grant this action beyond the standard
    /// `service_action:SERVICE:ACTION` form. Extension point.
    pub tokens: Vec<String>,
}

/// A resolved service declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub run: Vec<String>,
    pub io: Vec<String>,
    pub goal: Goal,
    pub env: HashMap<String, Option<String>>,
    pub actions: HashMap<String, Action>,
}

impl Service {
    /// Merge the declared env overlay over a base environment. A `None`
    /// value deletes the variable.
    pub fn merged_env(&self, overlay: &HashMap<String, Option<String>>) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = HashMap::new();
        for (key, value) in &self.env {
            match value {
                Some(v) => {
                    env.insert(key.clone(), v.clone());
                }
                None => {
                    env.remove(key);
                }
            }
        }
        for (key, value) in overlay {
            match value {
                Some(v) => {
                    env.insert(key.clone(), v.clone());
                }
                None => {
                    env.remove(key);
                }
            }
        }
        env
    }
}

/// Named filehandle kinds owned by the spawner.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum HandleKind {
    #[serde(rename = "null")]
    Null,
    #[serde(rename = "log")]
    Log,
    #[serde(rename = "pipe")]
    Pipe {
        #[serde(default)]
        to: Option<String>,
    },
    #[serde(rename = "tcp.listen")]
    TcpListen { addr: String },
    #[serde(rename = "udp")]
    UdpSocket { addr: String },
    #[serde(rename = "file")]
    File {
        path: String,
        #[serde(default)]
        mode: Option<String>,
    },
    #[serde(rename = "fd")]
    InheritedFd { fd: u32 },
}

// ---------------------------------------------------------------------------
// Raw file model
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    service: HashMap<String, RawService>,
    #[serde(default)]
    handle: HashMap<String, HandleKind>,
    #[serde(default)]
    control: RawControl,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawControl {
    #[serde(default)]
    tokens: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawService {
    #[serde(default)]
    run: Vec<String>,
    #[serde(default)]
    io: Vec<String>,
    #[serde(default)]
    goal: Goal,
    #[serde(default)]
    env: HashMap<String, Option<String>>,
    #[serde(default)]
    action: HashMap<String, RawAction>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAction {
    run: RawRun,
    #[serde(default)]
    env: HashMap<String, Option<String>>,
    #[serde(default)]
    goal: Option<Goal>,
    #[serde(default)]
    concurrent: Option<RawConcurrent>,
    #[serde(default)]
    io: Option<Vec<String>>,
    #[serde(default)]
    tokens: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRun {
    Internal {
        internal: String,
    },
    Exec {
        exec: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawConcurrent {
    Star(String),
    List(Vec<String>),
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// The frozen configuration view the core reads from.
#[derive(Debug, Default)]
pub struct ConfigSnapshot {
    services: HashMap<String, Service>,
    handles: HashMap<String, HandleKind>,
    control_tokens: Vec<String>,
}

impl ConfigSnapshot {
    pub fn load(path: &Path) -> Result<ConfigSnapshot> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DaemonError::ConfigNotFound(path.to_path_buf())
            } else {
                DaemonError::Internal(format!("failed to read '{}': {}", path.display(), e))
            }
        })?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<ConfigSnapshot> {
        let de = serde_yaml::Deserializer::from_str(text);
        let file: ConfigFile =
            serde_path_to_error::deserialize(de).map_err(|source| DaemonError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::build(file)
    }

    fn build(file: ConfigFile) -> Result<ConfigSnapshot> {
        let mut handles = HashMap::new();
        for (name, kind) in file.handle {
            if !is_handle_name(&name) {
                return Err(DaemonError::Config(format!("invalid handle name '{name}'")));
            }
            handles.insert(name, kind);
        }

        let mut services = HashMap::new();
        for (name, raw) in file.service {
            if !is_service_name(&name) {
                return Err(DaemonError::Config(format!("invalid service name '{name}'")));
            }
            let service = build_service(&name, raw, &handles)?;
            services.insert(name, service);
        }

        Ok(ConfigSnapshot {
            services,
            handles,
            control_tokens: file.control.tokens,
        })
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn action(&self, service: &str, action: &str) -> Option<&Action> {
        self.services.get(service)?.actions.get(action)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn services(&self) -> impl Iterator<Item = (&str, &Service)> {
        self.services.iter().map(|(name, svc)| (name.as_str(), svc))
    }

    pub fn handle(&self, name: &str) -> Option<&HandleKind> {
        self.handles.get(name)
    }

    pub fn control_tokens(&self) -> &[String] {
        &self.control_tokens
    }
}

fn build_service(
    name: &str,
    raw: RawService,
    handles: &HashMap<String, HandleKind>,
) -> Result<Service> {
    for handle in &raw.io {
        if !is_handle_name(handle) {
            return Err(DaemonError::Config(format!(
                "service '{name}': invalid handle name '{handle}'"
            )));
        }
        // "null" and "-" are spawner built-ins; everything else must be
        // declared.
        if handle != "null" && handle != "-" && !handles.contains_key(handle) {
            return Err(DaemonError::Config(format!(
                "service '{name}': io references undeclared handle '{handle}'"
            )));
        }
    }

    let mut actions = builtin_actions();
    for (action_name, raw_action) in raw.action {
        if !is_service_name(&action_name) {
            return Err(DaemonError::Config(format!(
                "service '{name}': invalid action name '{action_name}'"
            )));
        }
        let action = build_action(name, &action_name, raw_action)?;
        actions.insert(action_name, action);
    }

    Ok(Service {
        name: name.to_string(),
        run: raw.run,
        io: raw.io,
        goal: raw.goal,
        env: raw.env,
        actions,
    })
}

fn build_action(service: &str, name: &str, raw: RawAction) -> Result<Action> {
    let run = match raw.run {
        RawRun::Internal { internal: spec } => {
            let mut parts = spec.split_whitespace();
            let method_name = parts.next().unwrap_or("");
            let method = InternalMethod::from_name(method_name).ok_or_else(|| {
                DaemonError::Config(format!(
                    "service '{service}' action '{name}': unknown internal method '{method_name}'"
                ))
            })?;
            let args: Vec<String> = parts.map(str::to_string).collect();
            if method == InternalMethod::Killscript {
                let script = args.join(" ");
                if !is_killscript_field(&script) {
                    return Err(DaemonError::Config(format!(
                        "service '{service}' action '{name}': malformed kill script '{script}'"
                    )));
                }
            }
            RunSpec::Internal { method, args }
        }
        RawRun::Exec { exec: argv } => {
            if argv.is_empty() {
                return Err(DaemonError::Config(format!(
                    "service '{service}' action '{name}': empty exec argv"
                )));
            }
            let argv = argv
                .iter()
                .map(|a| ArgToken::parse(a))
                .collect::<Result<Vec<_>>>()?;
            RunSpec::Exec { argv, argv0: None }
        }
    };

    if let Some(io) = &raw.io {
        for handle in io {
            if !is_handle_name(handle) {
                return Err(DaemonError::Config(format!(
                    "service '{service}' action '{name}': invalid handle name '{handle}'"
                )));
            }
        }
    }

    let parallel = match raw.concurrent {
        None => Parallelism::default(),
        Some(RawConcurrent::Star(s)) if s == "*" => Parallelism::All,
        Some(RawConcurrent::Star(s)) => {
            return Err(DaemonError::Config(format!(
                "service '{service}' action '{name}': concurrent must be '*' or a list, got '{s}'"
            )))
        }
        Some(RawConcurrent::List(names)) => Parallelism::Named(names),
    };

    Ok(Action {
        run,
        env: raw.env,
        goal: raw.goal,
        parallel,
        io: raw.io,
        tokens: raw.tokens,
    })
}

/// The four built-in actions every service carries unless overridden.
pub fn builtin_actions() -> HashMap<String, Action> {
    let mut actions = HashMap::new();
    actions.insert(
        "start".to_string(),
        Action {
            run: RunSpec::Internal {
                method: InternalMethod::ExecUnlessRunning,
                args: Vec::new(),
            },
            env: HashMap::new(),
            goal: None,
            parallel: Parallelism::default(),
            io: None,
            tokens: Vec::new(),
        },
    );
    actions.insert(
        "stop".to_string(),
        Action {
            run: RunSpec::Internal {
                method: InternalMethod::Killscript,
                args: DEFAULT_STOP_SCRIPT
                    .split(' ')
                    .map(str::to_string)
                    .collect(),
            },
            env: HashMap::new(),
            goal: None,
            parallel: Parallelism::default(),
            io: None,
            tokens: Vec::new(),
        },
    );
    actions.insert(
        "restart".to_string(),
        Action {
            run: RunSpec::Internal {
                method: InternalMethod::StopStart,
                args: Vec::new(),
            },
            env: HashMap::new(),
            goal: Some(Goal::Cycle),
            parallel: Parallelism::default(),
            io: None,
            tokens: Vec::new(),
        },
    );
    actions.insert(
        "check".to_string(),
        Action {
            run: RunSpec::Internal {
                method: InternalMethod::WaitForUptime,
                args: vec!["3".to_string()],
            },
            env: HashMap::new(),
            goal: None,
            parallel: Parallelism::All,
            io: None,
            tokens: Vec::new(),
        },
    );
    actions
}
