pub mod client;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const METHOD_PING: &str = "ping";
pub const METHOD_SHUTDOWN: &str = "shutdown";
pub const METHOD_REFRESH: &str = "refresh";
pub const METHOD_START: &str = "start";
pub const METHOD_STOP: &str = "stop";
pub const METHOD_STOP_ALL: &str = "stop_all";
pub const METHOD_STATUS: &str = "status";
pub const METHOD_LOGS: &str = "logs";
pub const METHOD_PROMPTS: &str = "prompts";
pub const METHOD_RESOLVE: &str = "resolve";
pub const METHOD_NOTICES: &str = "notices";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// One of the managed external process kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Compile,
    Devmode,
    Codeserver,
    Jetty,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Compile, Role::Devmode, Role::Codeserver, Role::Jetty];

    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Compile => "compile",
            Role::Devmode => "devmode",
            Role::Codeserver => "codeserver",
            Role::Jetty => "jetty",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Role::Compile => "Compile",
            Role::Devmode => "DevMode",
            Role::Codeserver => "CodeServer",
            Role::Jetty => "Jetty",
        }
    }

    /// Roles whose stdout announces the port the code server is listening on.
    pub const fn announces_port(self) -> bool {
        matches!(self, Role::Devmode | Role::Codeserver)
    }

    fn all_roles() -> Vec<Role> {
        Role::ALL.to_vec()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "compile" => Ok(Role::Compile),
            "devmode" => Ok(Role::Devmode),
            "codeserver" => Ok(Role::Codeserver),
            "jetty" => Ok(Role::Jetty),
            other => Err(format!(
                "unknown role '{other}' (expected compile, devmode, codeserver or jetty)"
            )),
        }
    }
}

/// A detected Maven project. `key` is the canonical path of its `pom.xml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDescriptor {
    pub key: String,
    pub name: String,
    pub plugin_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codeserver_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devmode_port: Option<u16>,
    #[serde(default = "Role::all_roles")]
    pub roles: Vec<Role>,
}

impl ProjectDescriptor {
    pub fn supports(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Directory containing the build descriptor; processes run from here.
    pub fn directory(&self) -> PathBuf {
        Path::new(&self.key)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn configured_port(&self, role: Role) -> Option<u16> {
        match role {
            Role::Codeserver => self.codeserver_port,
            Role::Devmode => self.devmode_port,
            Role::Compile | Role::Jetty => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedBinding {
    #[serde(default)]
    pub role_active: BTreeMap<Role, bool>,
    #[serde(default)]
    pub discovered_port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub projects: Vec<ProjectDescriptor>,
    #[serde(default)]
    pub bindings: BTreeMap<String, PersistedBinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingState {
    Idle,
    Starting,
    Running,
    Disconnected,
}

impl BindingState {
    pub const fn as_str(self) -> &'static str {
        match self {
            BindingState::Idle => "idle",
            BindingState::Starting => "starting",
            BindingState::Running => "running",
            BindingState::Disconnected => "disconnected",
        }
    }

    pub const fn is_live(self) -> bool {
        matches!(self, BindingState::Starting | BindingState::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleStatus {
    pub role: Role,
    pub state: BindingState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStatus {
    pub project: ProjectDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered_port: Option<u16>,
    pub roles: Vec<RoleStatus>,
}

impl ProjectStatus {
    pub fn role(&self, role: Role) -> Option<&RoleStatus> {
        self.roles.iter().find(|status| status.role == role)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusParams {
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    pub revision: u64,
    pub projects: Vec<ProjectStatus>,
    #[serde(default)]
    pub prompts: Vec<ReconcilePrompt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleParams {
    pub key: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResult {
    pub key: String,
    pub role: Role,
    pub pid: Option<u32>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResult {
    pub key: String,
    pub role: Role,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopAllResult {
    pub stopped: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResult {
    pub projects: usize,
    pub live_processes: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsParams {
    pub key: String,
    pub role: Role,
    #[serde(default)]
    pub tail: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResult {
    pub key: String,
    pub role: Role,
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromptAction {
    ShowLogs,
    StopByPort,
    ClearState,
    CheckPort,
    Restart,
}

impl PromptAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            PromptAction::ShowLogs => "show-logs",
            PromptAction::StopByPort => "stop-by-port",
            PromptAction::ClearState => "clear-state",
            PromptAction::CheckPort => "check-port",
            PromptAction::Restart => "restart",
        }
    }
}

impl fmt::Display for PromptAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromptAction {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "show-logs" | "logs" => Ok(PromptAction::ShowLogs),
            "stop-by-port" | "stop" => Ok(PromptAction::StopByPort),
            "clear-state" | "clear" => Ok(PromptAction::ClearState),
            "check-port" | "check" => Ok(PromptAction::CheckPort),
            "restart" => Ok(PromptAction::Restart),
            other => Err(format!("unknown action '{other}'")),
        }
    }
}

/// A process believed active before a restart that still appears to hold its port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilePrompt {
    pub key: String,
    pub role: Role,
    pub port: u16,
    pub message: String,
    pub actions: Vec<PromptAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsResult {
    pub prompts: Vec<ReconcilePrompt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveParams {
    pub key: String,
    pub role: Role,
    pub action: PromptAction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolveResult {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pids: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Short user-facing message emitted after a state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// Identity of a running daemon; `workspace` is the canonical root it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResult {
    pub pong: bool,
    pub daemon: String,
    pub version: String,
    pub workspace: String,
    pub revision: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticesResult {
    pub notices: Vec<Notice>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShutdownParams {
    /// Terminate every live process before the daemon exits.
    #[serde(default)]
    pub stop_all: bool,
}

/// Canonical workspace root: the explicit path, else `GWTD_WORKSPACE`, else the current directory.
pub fn resolve_workspace(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    use anyhow::Context;

    let workspace = match explicit.or_else(|| env::var_os("GWTD_WORKSPACE").map(PathBuf::from)) {
        Some(path) => path,
        None => env::current_dir().context("failed to determine current directory")?,
    };
    std::fs::canonicalize(&workspace)
        .with_context(|| format!("workspace does not exist: {}", workspace.display()))
}

/// Socket of the daemon serving `workspace`; one daemon per workspace root.
pub fn default_socket_path(workspace: &Path) -> PathBuf {
    let name = workspace_socket_name(workspace);
    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("gwtd").join(name);
    }

    default_data_dir().join("sockets").join(name)
}

/// Short enough for `sun_path`: a readable prefix plus an FNV-1a hash of the full path.
fn workspace_socket_name(workspace: &Path) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in workspace.to_string_lossy().bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let label: String = workspace
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '-' || *ch == '_')
        .take(24)
        .collect();
    if label.is_empty() {
        format!("gwtd-{hash:016x}.sock")
    } else {
        format!("gwtd-{label}-{hash:016x}.sock")
    }
}

pub fn default_data_dir() -> PathBuf {
    if let Some(data_dir) = dirs::data_local_dir() {
        return data_dir.join("gwtd");
    }

    PathBuf::from(".gwtd")
}

/// State file scoped to one workspace root.
pub fn default_state_path(workspace: &Path) -> PathBuf {
    default_data_dir()
        .join("workspaces")
        .join(workspace_slug(workspace))
        .join("state.json")
}

pub fn workspace_slug(workspace: &Path) -> String {
    let raw = workspace.to_string_lossy();
    let mut slug = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '.' {
            slug.push(ch);
        } else {
            slug.push('_');
        }
    }
    let trimmed = slug.trim_matches('_');
    if trimmed.is_empty() {
        "workspace".to_string()
    } else {
        trimmed.to_string()
    }
}
