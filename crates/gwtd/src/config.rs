use anyhow::{Context, Result};
use gwtd_types::Role;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = ".gwtd.toml";

const DEFAULT_MAVEN_COMMAND: &str = "mvn";

/// How processes are launched for a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub maven_command: String,
    pub java_home: Option<String>,
    pub compile_goals: Vec<String>,
    pub devmode_goals: Vec<String>,
    pub codeserver_goals: Vec<String>,
    pub jetty_goals: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            maven_command: DEFAULT_MAVEN_COMMAND.to_string(),
            java_home: None,
            compile_goals: vec!["gwt:compile".to_string()],
            devmode_goals: vec!["gwt:devmode".to_string()],
            codeserver_goals: vec!["gwt:codeserver".to_string()],
            jetty_goals: vec!["jetty:run".to_string()],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSettings {
    maven_command: Option<String>,
    java_home: Option<String>,
    compile_goals: Option<String>,
    devmode_goals: Option<String>,
    codeserver_goals: Option<String>,
    jetty_goals: Option<String>,
}

impl Settings {
    /// Reads `<workspace>/.gwtd.toml` when present, then applies env overrides.
    pub fn load(workspace: &Path) -> Result<Self> {
        let path = config_path(workspace);
        let raw = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<RawSettings>(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            RawSettings::default()
        };

        let mut settings = Self::from_raw(raw);
        if let Some(command) = env_value("GWTD_MAVEN_CMD") {
            settings.maven_command = command;
        }
        if let Some(home) = env_value("GWTD_JAVA_HOME") {
            settings.java_home = normalize_java_home(&home);
        }
        Ok(settings)
    }

    fn from_raw(raw: RawSettings) -> Self {
        let defaults = Self::default();
        Self {
            maven_command: raw
                .maven_command
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.maven_command),
            java_home: raw.java_home.as_deref().and_then(normalize_java_home),
            compile_goals: goals_or(raw.compile_goals, defaults.compile_goals),
            devmode_goals: goals_or(raw.devmode_goals, defaults.devmode_goals),
            codeserver_goals: goals_or(raw.codeserver_goals, defaults.codeserver_goals),
            jetty_goals: goals_or(raw.jetty_goals, defaults.jetty_goals),
        }
    }

    pub fn goals(&self, role: Role) -> &[String] {
        match role {
            Role::Compile => &self.compile_goals,
            Role::Devmode => &self.devmode_goals,
            Role::Codeserver => &self.codeserver_goals,
            Role::Jetty => &self.jetty_goals,
        }
    }
}

pub fn config_path(workspace: &Path) -> PathBuf {
    workspace.join(CONFIG_FILE_NAME)
}

/// An empty value or the bare word `java` means "use whatever is on PATH".
pub fn normalize_java_home(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "java" {
        return None;
    }
    Some(trimmed.to_string())
}

fn goals_or(raw: Option<String>, fallback: Vec<String>) -> Vec<String> {
    let goals: Vec<String> = raw
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if goals.is_empty() {
        fallback
    } else {
        goals
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
