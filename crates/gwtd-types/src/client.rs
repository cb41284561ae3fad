use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::{default_socket_path, PingResult, Request, Response, METHOD_PING};

const DAEMON_BINARY: &str = "gwtd";

/// The daemon that serves one workspace root, reached through its socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonTarget {
    pub socket_path: PathBuf,
    pub workspace: PathBuf,
}

impl DaemonTarget {
    /// `workspace` should already be canonical; the socket defaults to one derived from it.
    pub fn new(workspace: PathBuf, socket_override: Option<PathBuf>) -> Self {
        let socket_path = socket_override.unwrap_or_else(|| default_socket_path(&workspace));
        Self {
            socket_path,
            workspace,
        }
    }

    pub fn request(&self, method: &str, params: Value) -> Result<Response> {
        request(&self.socket_path, method, params)
    }

    pub fn ping(&self) -> Result<PingResult> {
        parse_ok_response(self.request(METHOD_PING, Value::Null)?)
    }

    /// Makes sure a daemon for this workspace answers on the socket.
    ///
    /// Returns whether it had to be started. A daemon that answers for another
    /// workspace is an error, never silently reused.
    pub fn connect(&self, autostart: bool) -> Result<bool> {
        let started = match self.ping() {
            Ok(ping) => {
                self.check_workspace(&ping)?;
                return Ok(false);
            }
            Err(_) if autostart => {
                eprintln!(
                    "daemon unavailable, starting gwtd for {}...",
                    self.workspace.display()
                );
                self.start_daemon()?;
                true
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "no gwtd daemon for {} (run `gwt daemon start`)",
                        self.workspace.display()
                    )
                })
            }
        };
        let ping = self.wait_for_ping(Duration::from_secs(5))?;
        self.check_workspace(&ping)?;
        Ok(started)
    }

    pub fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
        autostart: bool,
    ) -> Result<R> {
        let params = serde_json::to_value(params)
            .with_context(|| format!("failed to serialize {method} params"))?;
        self.connect(autostart)?;
        parse_ok_response(self.request(method, params)?)
    }

    pub fn check_workspace(&self, ping: &PingResult) -> Result<()> {
        if Path::new(&ping.workspace) != self.workspace {
            bail!(
                "gwtd at {} serves workspace {}, not {}",
                self.socket_path.display(),
                ping.workspace,
                self.workspace.display()
            );
        }
        Ok(())
    }

    pub fn wait_for_ping(&self, timeout: Duration) -> Result<PingResult> {
        let attempts = (timeout.as_millis() / 100).max(1) as usize;
        let mut last_error: Option<anyhow::Error> = None;

        for _ in 0..attempts {
            match self.ping() {
                Ok(ping) => return Ok(ping),
                Err(err) => {
                    last_error = Some(err);
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("timed out waiting for daemon")))
    }

    /// Spawns `gwtd` for this workspace, preferring PATH and then a sibling binary.
    pub fn start_daemon(&self) -> Result<()> {
        match self.daemon_command(Path::new(DAEMON_BINARY)).spawn() {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let local_gwtd = detect_local_gwtd_binary()
                    .context("gwtd is not on PATH and no sibling binary was found")?;
                self.daemon_command(&local_gwtd)
                    .spawn()
                    .context("failed to spawn local gwtd binary")?;
                Ok(())
            }
            Err(err) => Err(err).context("failed to spawn gwtd"),
        }
    }

    pub fn daemon_command(&self, program: &Path) -> Command {
        let mut command = Command::new(program);
        command
            .arg("--socket")
            .arg(&self.socket_path)
            .arg("--workspace")
            .arg(&self.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }
}

pub fn request(socket_path: &Path, method: &str, params: Value) -> Result<Response> {
    let stream = UnixStream::connect(socket_path)
        .with_context(|| format!("failed to connect to socket {}", socket_path.display()))?;
    let mut writer = BufWriter::new(
        stream
            .try_clone()
            .context("failed to clone socket stream")?,
    );
    let mut reader = BufReader::new(stream);

    let req = Request {
        id: 1,
        method: method.to_string(),
        params,
    };

    serde_json::to_writer(&mut writer, &req).context("failed to serialize request")?;
    writer
        .write_all(b"\n")
        .context("failed to write request newline")?;
    writer.flush().context("failed to flush request")?;

    let mut line = String::new();
    reader
        .read_line(&mut line)
        .context("failed to read daemon response")?;
    if line.trim().is_empty() {
        bail!("daemon returned empty response");
    }

    serde_json::from_str::<Response>(&line).context("failed to parse daemon response")
}

pub fn parse_ok_response<T: DeserializeOwned>(response: Response) -> Result<T> {
    if !response.ok {
        bail!(
            "{}",
            response.error.unwrap_or_else(|| "unknown daemon error".to_string())
        );
    }
    serde_json::from_value(response.result.unwrap_or(Value::Null))
        .context("failed to parse daemon response body")
}

fn detect_local_gwtd_binary() -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let bin_dir = current_exe.parent()?;
    let found = [Some(bin_dir), bin_dir.parent()]
        .into_iter()
        .flatten()
        .map(|dir| dir.join(DAEMON_BINARY))
        .find(|candidate| candidate.is_file());
    found
}
