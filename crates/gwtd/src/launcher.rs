use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use gwtd_types::{ProjectDescriptor, Role};
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::SpawnError;

/// Lines kept per buffer for post-mortem diagnostics.
pub const MAX_BUFFERED_LINES: usize = 50;

const ERROR_MARKERS: &[&str] = &["ERROR", "Exception", "Failure", "Caused by:", "Failed to"];

const JETTY_ADD_OPENS: &[&str] = &[
    "--add-opens=java.base/java.net=ALL-UNNAMED",
    "--add-opens=java.base/java.lang=ALL-UNNAMED",
    "--add-opens=java.base/java.util=ALL-UNNAMED",
    "--add-opens=java.base/java.io=ALL-UNNAMED",
    "--add-opens=java.base/java.lang.reflect=ALL-UNNAMED",
    "--add-opens=java.naming/javax.naming=ALL-UNNAMED",
];

pub type ProcessId = u64;

/// A live spawned process. Deliberately not `Clone`: exactly one owner at a time.
#[derive(Debug, PartialEq, Eq)]
pub struct ProcessHandle {
    id: ProcessId,
    pid: u32,
}

impl ProcessHandle {
    pub fn new(id: ProcessId, pid: u32) -> Self {
        Self { id, pid }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Everything a launched process reports back to the daemon loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchEvent {
    /// Launcher-side diagnostics written to the sink, never scanned.
    Note {
        process: ProcessId,
        key: String,
        role: Role,
        line: String,
    },
    Output {
        process: ProcessId,
        key: String,
        role: Role,
        stream: OutputStream,
        line: String,
    },
    /// Sent only after both output streams reached EOF.
    Exited {
        process: ProcessId,
        key: String,
        role: Role,
        code: Option<i32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub key: String,
    pub role: Role,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub java_home: Option<String>,
}

impl LaunchSpec {
    pub fn for_project(project: &ProjectDescriptor, role: Role, settings: &Settings) -> Self {
        let mut env = Vec::new();
        if let Some(home) = settings.java_home.as_deref() {
            env.push(("JAVA_HOME".to_string(), home.to_string()));
        }
        Self {
            key: project.key.clone(),
            role,
            program: settings.maven_command.clone(),
            args: settings.goals(role).to_vec(),
            cwd: project.directory(),
            env,
            java_home: settings.java_home.clone(),
        }
    }

    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    fn env_value(&self, key: &str) -> Option<String> {
        self.env
            .iter()
            .rev()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.clone())
    }

    fn set_env(&mut self, key: &str, value: String) {
        self.env.retain(|(name, _)| name != key);
        self.env.push((key.to_string(), value));
    }
}

/// Starts external processes and delivers their output as events.
pub trait Launcher {
    fn spawn(
        &mut self,
        spec: &LaunchSpec,
        events: Sender<LaunchEvent>,
    ) -> Result<ProcessHandle, SpawnError>;

    /// Fire-and-forget; the exit arrives later as a [`LaunchEvent::Exited`].
    fn terminate(&mut self, handle: ProcessHandle);
}

#[derive(Debug, Default)]
pub struct SystemLauncher {
    next_id: ProcessId,
}

impl Launcher for SystemLauncher {
    fn spawn(
        &mut self,
        spec: &LaunchSpec,
        events: Sender<LaunchEvent>,
    ) -> Result<ProcessHandle, SpawnError> {
        let mut spec = spec.clone();
        let mut notes = vec![format!("Executing command: {}", spec.command_line())];
        if spec.role == Role::Jetty {
            if java_is_legacy(spec.java_home.as_deref()) {
                notes.push("Detected Java 8, --add-opens flags are not needed".to_string());
            } else {
                notes.push("Detected Java 9+, adding --add-opens flags to MAVEN_OPTS".to_string());
                let current = spec
                    .env_value("MAVEN_OPTS")
                    .or_else(|| std::env::var("MAVEN_OPTS").ok());
                spec.set_env("MAVEN_OPTS", with_add_opens(current.as_deref()));
            }
        }
        notes.push(format!(
            "JAVA_HOME: {}",
            spec.java_home.as_deref().unwrap_or("(inherited)")
        ));
        if let Some(opts) = spec.env_value("MAVEN_OPTS") {
            notes.push(format!("MAVEN_OPTS: {opts}"));
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.process_group(0);
        let mut child = command
            .spawn()
            .map_err(|err| SpawnError::from_io(&spec.program, err))?;

        self.next_id += 1;
        let process = self.next_id;
        let pid = child.id();
        debug!(
            "spawned {} for '{}' as pid {pid}: {}",
            spec.role,
            spec.key,
            spec.command_line()
        );

        for line in notes {
            let _ = events.send(LaunchEvent::Note {
                process,
                key: spec.key.clone(),
                role: spec.role,
                line,
            });
        }

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(
                stdout,
                OutputStream::Stdout,
                process,
                &spec,
                events.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(
                stderr,
                OutputStream::Stderr,
                process,
                &spec,
                events.clone(),
            ));
        }

        let key = spec.key.clone();
        let role = spec.role;
        thread::spawn(move || {
            for reader in readers {
                let _ = reader.join();
            }
            let code = match child.wait() {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!("failed waiting for {role} of '{key}' (pid {pid}): {err}");
                    None
                }
            };
            let _ = events.send(LaunchEvent::Exited {
                process,
                key,
                role,
                code,
            });
        });

        Ok(ProcessHandle::new(process, pid))
    }

    fn terminate(&mut self, handle: ProcessHandle) {
        if let Err(err) = terminate_tree(handle.pid()) {
            warn!("failed to terminate pid {}: {err}", handle.pid());
        }
    }
}

fn spawn_line_reader<R>(
    reader: R,
    stream: OutputStream,
    process: ProcessId,
    spec: &LaunchSpec,
    events: Sender<LaunchEvent>,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    let key = spec.key.clone();
    let role = spec.role;
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    let event = LaunchEvent::Output {
                        process,
                        key: key.clone(),
                        role,
                        stream,
                        line,
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Signals the whole process group, falling back to the process itself.
pub fn terminate_tree(pid: u32) -> io::Result<()> {
    let pid = pid as libc::pid_t;
    let group_status = unsafe { libc::kill(-pid, libc::SIGTERM) };
    if group_status == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    let direct = unsafe { libc::kill(pid, libc::SIGTERM) };
    if direct != 0 {
        let direct_err = io::Error::last_os_error();
        if direct_err.raw_os_error() != Some(libc::ESRCH) {
            return Err(direct_err);
        }
    }
    Ok(())
}

pub fn terminate_pid(pid: u32) -> io::Result<()> {
    let status = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if status != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

fn java_binary(java_home: Option<&str>) -> PathBuf {
    match java_home {
        Some(home) => Path::new(home).join("bin").join("java"),
        None => PathBuf::from("java"),
    }
}

/// Failing to run `java -version` counts as a modern runtime.
fn java_is_legacy(java_home: Option<&str>) -> bool {
    let binary = java_binary(java_home);
    match Command::new(&binary).arg("-version").output() {
        Ok(output) => {
            let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stdout));
            is_legacy_java_version(&text)
        }
        Err(err) => {
            debug!("could not run {} -version: {err}", binary.display());
            false
        }
    }
}

pub fn is_legacy_java_version(text: &str) -> bool {
    text.contains("version \"1.8")
        || text
            .lines()
            .any(|line| line.trim_start().starts_with("jdk1.8"))
}

fn with_add_opens(current: Option<&str>) -> String {
    let flags = JETTY_ADD_OPENS.join(" ");
    match current.map(str::trim).filter(|value| !value.is_empty()) {
        Some(existing) => format!("{existing} {flags}"),
        None => flags,
    }
}

/// Extracts the port from a `... ready at http://host:port/` line.
pub fn extract_ready_port(line: &str) -> Option<u16> {
    const MARKER: &str = "ready at ";
    let start = line.find(MARKER)? + MARKER.len();
    let (scheme, rest) = line[start..].split_once("://")?;
    if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
        return None;
    }
    let authority = rest
        .split(|ch: char| ch == '/' || ch.is_whitespace())
        .next()?;
    let (_, port) = authority.rsplit_once(':')?;
    port.parse::<u16>().ok().filter(|port| *port != 0)
}

pub fn is_error_line(line: &str) -> bool {
    ERROR_MARKERS.iter().any(|marker| line.contains(marker))
}

/// Scans one process's output for its port and for diagnostics worth replaying.
#[derive(Debug)]
pub struct OutputMonitor {
    role: Role,
    errors: VecDeque<String>,
    tail: VecDeque<String>,
    produced_output: bool,
}

impl OutputMonitor {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            errors: VecDeque::new(),
            tail: VecDeque::new(),
            produced_output: false,
        }
    }

    /// Returns a port when the line announces one.
    pub fn observe(&mut self, stream: OutputStream, line: &str) -> Option<u16> {
        self.produced_output = true;
        if line.trim().is_empty() {
            return None;
        }
        match stream {
            OutputStream::Stderr => {
                push_bounded(&mut self.errors, line);
                None
            }
            OutputStream::Stdout => {
                push_bounded(&mut self.tail, line);
                if is_error_line(line) {
                    push_bounded(&mut self.errors, line);
                }
                if self.role.announces_port() {
                    extract_ready_port(line)
                } else {
                    None
                }
            }
        }
    }

    pub fn produced_output(&self) -> bool {
        self.produced_output
    }

    /// Buffered error lines, or the recent output when no errors were seen.
    pub fn diagnostic_lines(&self) -> (bool, Vec<String>) {
        if self.errors.is_empty() {
            (false, self.tail.iter().cloned().collect())
        } else {
            (true, self.errors.iter().cloned().collect())
        }
    }
}

fn push_bounded(buffer: &mut VecDeque<String>, line: &str) {
    if buffer.len() == MAX_BUFFERED_LINES {
        buffer.pop_front();
    }
    buffer.push_back(line.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn ready_line_yields_port() {
        assert_eq!(
            extract_ready_port("[INFO] The code server is ready at http://127.0.0.1:9876/"),
            Some(9876)
        );
        assert_eq!(
            extract_ready_port("Code server ready at https://localhost:9997"),
            Some(9997)
        );
        assert_eq!(extract_ready_port("ready at http://localhost/"), None);
        assert_eq!(extract_ready_port("ready at ftp://host:21/"), None);
        assert_eq!(extract_ready_port("Listening on port 8888"), None);
    }

    #[test]
    fn legacy_java_signatures() {
        assert!(is_legacy_java_version(
            "java version \"1.8.0_392\"\nJava(TM) SE Runtime Environment"
        ));
        assert!(is_legacy_java_version("openjdk version \"1.8.0_412\""));
        assert!(is_legacy_java_version("jdk1.8.0_202"));
        assert!(!is_legacy_java_version("openjdk version \"17.0.9\" 2023-10-17"));
        assert!(!is_legacy_java_version("openjdk version \"11.0.1.8\""));
    }

    #[test]
    fn add_opens_are_appended_to_existing_options() {
        let merged = with_add_opens(Some("-Xmx1g"));
        assert!(merged.starts_with("-Xmx1g --add-opens=java.base/java.net=ALL-UNNAMED"));
        assert!(merged.ends_with("--add-opens=java.naming/javax.naming=ALL-UNNAMED"));
        assert_eq!(with_add_opens(Some("  ")), JETTY_ADD_OPENS.join(" "));
    }

    #[test]
    fn monitor_scans_ports_only_for_announcing_roles() {
        let ready = "The code server is ready at http://127.0.0.1:9876/";
        let mut devmode = OutputMonitor::new(Role::Devmode);
        assert_eq!(devmode.observe(OutputStream::Stdout, ready), Some(9876));
        let mut compile = OutputMonitor::new(Role::Compile);
        assert_eq!(compile.observe(OutputStream::Stdout, ready), None);
        assert!(compile.produced_output());
    }

    #[test]
    fn monitor_prefers_errors_and_bounds_buffers() {
        let mut monitor = OutputMonitor::new(Role::Jetty);
        for index in 0..60 {
            monitor.observe(OutputStream::Stdout, &format!("[INFO] line {index}"));
        }
        let (from_errors, lines) = monitor.diagnostic_lines();
        assert!(!from_errors);
        assert_eq!(lines.len(), MAX_BUFFERED_LINES);
        assert_eq!(lines[0], "[INFO] line 10");

        monitor.observe(OutputStream::Stdout, "[ERROR] Failed to execute goal");
        monitor.observe(OutputStream::Stderr, "warning: something on stderr");
        monitor.observe(OutputStream::Stderr, "   ");
        let (from_errors, lines) = monitor.diagnostic_lines();
        assert!(from_errors);
        assert_eq!(
            lines,
            vec![
                "[ERROR] Failed to execute goal".to_string(),
                "warning: something on stderr".to_string()
            ]
        );
    }

    #[test]
    fn spec_uses_settings_goals_and_project_directory() {
        let project = ProjectDescriptor {
            key: "/ws/app/pom.xml".to_string(),
            name: "app".to_string(),
            plugin_version: "1.1.0".to_string(),
            codeserver_port: None,
            devmode_port: None,
            roles: Role::ALL.to_vec(),
        };
        let settings = Settings {
            java_home: Some("/opt/jdk".to_string()),
            ..Settings::default()
        };
        let spec = LaunchSpec::for_project(&project, Role::Codeserver, &settings);
        assert_eq!(spec.cwd, PathBuf::from("/ws/app"));
        assert_eq!(spec.command_line(), format!("{} gwt:codeserver", settings.maven_command));
        assert_eq!(spec.env, vec![("JAVA_HOME".to_string(), "/opt/jdk".to_string())]);
    }

    #[test]
    fn system_launcher_reports_output_before_exit() {
        let dir = std::env::temp_dir();
        let spec = LaunchSpec {
            key: "/tmp/pom.xml".to_string(),
            role: Role::Compile,
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo one; echo two 1>&2; exit 3".to_string(),
            ],
            cwd: dir,
            env: Vec::new(),
            java_home: None,
        };
        let (tx, rx) = mpsc::channel();
        let mut launcher = SystemLauncher::default();
        let handle = launcher.spawn(&spec, tx).unwrap();
        assert_eq!(handle.id(), 1);

        let mut lines = Vec::new();
        let code = loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                LaunchEvent::Output { line, .. } => lines.push(line),
                LaunchEvent::Note { .. } => {}
                LaunchEvent::Exited { code, process, .. } => {
                    assert_eq!(process, handle.id());
                    break code;
                }
            }
        };
        lines.sort();
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(code, Some(3));
    }

    #[test]
    fn missing_program_is_a_spawn_failure() {
        let spec = LaunchSpec {
            key: "/tmp/pom.xml".to_string(),
            role: Role::Compile,
            program: "gwtd-definitely-missing-mvn".to_string(),
            args: Vec::new(),
            cwd: std::env::temp_dir(),
            env: Vec::new(),
            java_home: None,
        };
        let (tx, _rx) = mpsc::channel();
        let err = SystemLauncher::default().spawn(&spec, tx).unwrap_err();
        assert!(matches!(err, SpawnError::NotFound { .. }));
    }
}
