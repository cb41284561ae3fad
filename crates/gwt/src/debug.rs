use anyhow::{bail, Result};
use gwtd_types::ProjectStatus;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_DEBUG_URL: &str = "http://localhost:8080";

/// A Chrome `launch` configuration that maps code server source maps back to `src/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChromeLaunch {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub request: &'static str,
    pub name: String,
    pub url: String,
    pub web_root: String,
    pub source_maps: bool,
    pub trace: bool,
    pub source_map_path_overrides: BTreeMap<String, String>,
}

/// The configured code server port wins over the one announced in its output.
pub fn code_server_port(status: &ProjectStatus) -> Option<u16> {
    status.project.codeserver_port.or(status.discovered_port)
}

pub fn chrome_launch(status: &ProjectStatus, workspace: &Path, url: &str) -> Result<ChromeLaunch> {
    let project = &status.project;
    let Some(port) = code_server_port(status) else {
        bail!(
            "no code server port known for {}; start it first with `gwt start code-server`",
            project.name
        );
    };

    let folder = workspace
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let web_root = format!("${{workspaceFolder:{folder}}}");
    let module = project.name.to_lowercase();

    let mut overrides = BTreeMap::new();
    overrides.insert(
        format!("http://127.0.0.1:{port}/sourcemaps/{module}/*"),
        format!("{web_root}/src/*"),
    );

    Ok(ChromeLaunch {
        kind: "chrome",
        request: "launch",
        name: format!("GWT Debug {}", project.name),
        url: url.to_string(),
        web_root,
        source_maps: true,
        trace: true,
        source_map_path_overrides: overrides,
    })
}
