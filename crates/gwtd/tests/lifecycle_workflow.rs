use gwtd_types::client::DaemonTarget;
use gwtd_types::{
    BindingState, LogsParams, LogsResult, PromptAction, PromptsResult, Request, ResolveParams,
    ResolveResult, Response, Role, RoleParams, StartResult, StatusParams, StatusResult,
    StopAllResult, METHOD_LOGS, METHOD_PING, METHOD_PROMPTS, METHOD_RESOLVE, METHOD_SHUTDOWN,
    METHOD_START, METHOD_STATUS, METHOD_STOP_ALL,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const POM: &str = r#"<project>
  <build><plugins>
    <plugin>
      <artifactId>gwt-maven-plugin</artifactId>
      <version>1.1.0</version>
      <configuration>
        <moduleName>com.example.Demo</moduleName>
      </configuration>
    </plugin>
  </plugins></build>
</project>
"#;

struct Workspace {
    root_dir: PathBuf,
    workspace_dir: PathBuf,
    state_path: PathBuf,
}

impl Workspace {
    /// A workspace with one GWT project whose "mvn" announces `port` and then sleeps.
    fn create(label: &str, port: u16) -> Self {
        let root_dir = unique_temp_dir(label);
        let workspace_dir = root_dir.join("workspace");
        let project_dir = workspace_dir.join("demo");
        fs::create_dir_all(&project_dir).expect("failed to create project dir");
        fs::write(project_dir.join("pom.xml"), POM).expect("failed to write pom.xml");

        let fake_mvn = root_dir.join("fake-mvn.sh");
        write_executable_script(
            &fake_mvn,
            &format!(
                "#!/bin/sh\n\
echo \"[INFO] Scanning for projects...\"\n\
echo \"[INFO] The code server is ready at http://127.0.0.1:{port}/\"\n\
exec sleep 30\n"
            ),
        );
        fs::write(
            workspace_dir.join(".gwtd.toml"),
            format!("maven_command = \"{}\"\n", fake_mvn.display()),
        )
        .expect("failed to write .gwtd.toml");

        Self {
            state_path: root_dir.join("state").join("state.json"),
            root_dir,
            workspace_dir,
        }
    }

    fn project_key(&self) -> String {
        fs::canonicalize(self.workspace_dir.join("demo").join("pom.xml"))
            .expect("failed to canonicalize pom path")
            .to_string_lossy()
            .to_string()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root_dir);
    }
}

struct DaemonHarness {
    child: Child,
    socket_path: PathBuf,
}

impl DaemonHarness {
    fn start(workspace: &Workspace, socket_name: &str) -> Self {
        Self::start_with_path(workspace, socket_name, None)
    }

    /// `search_path` replaces the daemon's PATH, hiding tools such as lsof.
    fn start_with_path(
        workspace: &Workspace,
        socket_name: &str,
        search_path: Option<&Path>,
    ) -> Self {
        let socket_path = workspace.root_dir.join(socket_name);
        let child = spawn_gwtd(
            &socket_path,
            &workspace.state_path,
            &workspace.workspace_dir,
            search_path,
        );
        let harness = Self { child, socket_path };
        harness.wait_for_ping();
        harness
    }

    fn wait_for_ping(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(response) = request(&self.socket_path, METHOD_PING, Value::Null) {
                if response.ok {
                    return;
                }
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("timed out waiting for daemon to respond to ping");
    }

    fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> R {
        let response = request(&self.socket_path, method, params)
            .unwrap_or_else(|err| panic!("{method} request failed: {err}"));
        assert!(response.ok, "{method} failed: {:?}", response.error);
        serde_json::from_value(response.result.expect("missing result"))
            .unwrap_or_else(|err| panic!("failed to decode {method} result: {err}"))
    }

    fn status(&self) -> StatusResult {
        self.call(
            METHOD_STATUS,
            serde_json::to_value(StatusParams { key: None }).unwrap(),
        )
    }

    fn wait_for_port(&self, port: u16) -> StatusResult {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let status = self.status();
            if status.projects.first().and_then(|p| p.discovered_port) == Some(port) {
                return status;
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("timed out waiting for port {port} to be discovered");
    }

    fn shutdown(mut self, stop_all: bool) {
        let _ = request(
            &self.socket_path,
            METHOD_SHUTDOWN,
            json!({ "stop_all": stop_all }),
        );
        wait_for_exit(&mut self.child);
    }
}

impl Drop for DaemonHarness {
    fn drop(&mut self) {
        let _ = request(&self.socket_path, METHOD_SHUTDOWN, json!({ "stop_all": true }));
        wait_for_exit(&mut self.child);
    }
}

#[test]
fn started_devmode_reports_port_and_stops_with_stop_all() {
    let workspace = Workspace::create("lifecycle", 9876);
    let key = workspace.project_key();
    let harness = DaemonHarness::start(&workspace, "gwtd.sock");

    let status = harness.status();
    assert_eq!(status.projects.len(), 1);
    assert_eq!(status.projects[0].project.name, "com.example.Demo");

    let started: StartResult = harness.call(
        METHOD_START,
        serde_json::to_value(RoleParams {
            key: key.clone(),
            role: Role::Devmode,
        })
        .unwrap(),
    );
    assert_eq!(started.role, Role::Devmode);
    assert!(started.pid.is_some());

    let status = harness.wait_for_port(9876);
    let devmode = status.projects[0].role(Role::Devmode).unwrap();
    assert_eq!(devmode.state, BindingState::Running);
    assert!(workspace.state_path.is_file());

    let logs: LogsResult = harness.call(
        METHOD_LOGS,
        serde_json::to_value(LogsParams {
            key: key.clone(),
            role: Role::Devmode,
            tail: None,
        })
        .unwrap(),
    );
    assert!(logs.content.contains("The code server is ready"));
    assert!(logs.content.contains("Port detected: 9876"));

    let stopped: StopAllResult = harness.call(METHOD_STOP_ALL, Value::Null);
    assert_eq!(stopped.stopped, 1);

    let status = harness.status();
    let devmode = status.projects[0].role(Role::Devmode).unwrap();
    assert_eq!(devmode.state, BindingState::Idle);
}

#[test]
fn restarted_daemon_prompts_for_process_still_holding_its_port() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind probe listener");
    let port = listener.local_addr().unwrap().port();
    let workspace = Workspace::create("reconcile", port);
    let key = workspace.project_key();

    let first = DaemonHarness::start(&workspace, "first.sock");
    let started: StartResult = first.call(
        METHOD_START,
        serde_json::to_value(RoleParams {
            key: key.clone(),
            role: Role::Codeserver,
        })
        .unwrap(),
    );
    let orphan_pid = started.pid.expect("codeserver pid");
    first.wait_for_port(port);
    first.shutdown(false);

    let second = DaemonHarness::start(&workspace, "second.sock");
    let prompts: PromptsResult = second.call(METHOD_PROMPTS, Value::Null);
    assert_eq!(prompts.prompts.len(), 1);
    assert_eq!(prompts.prompts[0].role, Role::Codeserver);
    assert_eq!(prompts.prompts[0].port, port);

    let status = second.status();
    let codeserver = status.projects[0].role(Role::Codeserver).unwrap();
    assert_eq!(codeserver.state, BindingState::Disconnected);

    let resolved: ResolveResult = second.call(
        METHOD_RESOLVE,
        serde_json::to_value(ResolveParams {
            key: key.clone(),
            role: Role::Codeserver,
            action: PromptAction::ClearState,
        })
        .unwrap(),
    );
    assert!(!resolved.message.is_empty());

    let prompts: PromptsResult = second.call(METHOD_PROMPTS, Value::Null);
    assert!(prompts.prompts.is_empty());
    let status = second.status();
    let codeserver = status.projects[0].role(Role::Codeserver).unwrap();
    assert_eq!(codeserver.state, BindingState::Idle);

    let _ = Command::new("kill")
        .arg(orphan_pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    drop(listener);
}

#[test]
fn port_with_unidentifiable_owner_keeps_its_state() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind probe listener");
    let port = listener.local_addr().unwrap().port();
    let workspace = Workspace::create("no-lsof", port);
    let key = workspace.project_key();

    let first = DaemonHarness::start(&workspace, "first.sock");
    let started: StartResult = first.call(
        METHOD_START,
        serde_json::to_value(RoleParams {
            key: key.clone(),
            role: Role::Codeserver,
        })
        .unwrap(),
    );
    let orphan_pid = started.pid.expect("codeserver pid");
    first.wait_for_port(port);
    first.shutdown(false);

    let empty_path = workspace.root_dir.join("empty-bin");
    fs::create_dir_all(&empty_path).expect("failed to create empty PATH dir");
    let second = DaemonHarness::start_with_path(&workspace, "second.sock", Some(&empty_path));
    let prompts: PromptsResult = second.call(METHOD_PROMPTS, Value::Null);
    assert_eq!(prompts.prompts.len(), 1);
    assert_eq!(prompts.prompts[0].port, port);

    let params = serde_json::to_value(ResolveParams {
        key: key.clone(),
        role: Role::Codeserver,
        action: PromptAction::CheckPort,
    })
    .unwrap();
    let checked: ResolveResult = second.call(METHOD_RESOLVE, params);
    assert!(
        checked.message.contains("owner cannot be identified"),
        "unexpected message: {}",
        checked.message
    );

    let params = serde_json::to_value(ResolveParams {
        key: key.clone(),
        role: Role::Codeserver,
        action: PromptAction::StopByPort,
    })
    .unwrap();
    let response = request(&second.socket_path, METHOD_RESOLVE, params).unwrap();
    assert!(!response.ok);
    assert!(response.error.unwrap_or_default().contains("still held"));

    let status = second.status();
    let codeserver = status.projects[0].role(Role::Codeserver).unwrap();
    assert_eq!(codeserver.state, BindingState::Disconnected);

    drop(second);
    let _ = Command::new("kill")
        .arg(orphan_pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    drop(listener);
}

#[test]
fn client_refuses_a_daemon_serving_another_workspace() {
    let workspace = Workspace::create("scoped", 9877);
    let harness = DaemonHarness::start(&workspace, "scoped.sock");

    let served = fs::canonicalize(&workspace.workspace_dir).unwrap();
    let own = DaemonTarget::new(served.clone(), Some(harness.socket_path.clone()));
    assert!(!own.connect(false).unwrap());

    let other_dir = workspace.root_dir.join("other");
    fs::create_dir_all(&other_dir).expect("failed to create second workspace");
    let other = DaemonTarget::new(
        fs::canonicalize(&other_dir).unwrap(),
        Some(harness.socket_path.clone()),
    );
    let err = other.connect(true).unwrap_err();
    assert!(err
        .to_string()
        .contains(&format!("serves workspace {}", served.display())));
}

fn wait_for_exit(child: &mut Child) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => return,
            Ok(None) => thread::sleep(Duration::from_millis(50)),
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn write_executable_script(path: &Path, content: &str) {
    fs::write(path, content).expect("failed to write script");
    let mut perms = fs::metadata(path)
        .expect("failed to stat script")
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("failed to chmod script");
}

fn spawn_gwtd(
    socket_path: &Path,
    state_path: &Path,
    workspace_dir: &Path,
    search_path: Option<&Path>,
) -> Child {
    let binary = PathBuf::from(env!("CARGO_BIN_EXE_gwtd"));
    let mut command = Command::new(binary);
    if let Some(search_path) = search_path {
        command.env("PATH", search_path);
    }
    command
        .arg("--socket")
        .arg(socket_path)
        .arg("--state")
        .arg(state_path)
        .arg("--workspace")
        .arg(workspace_dir)
        .env_remove("GWTD_MAVEN_CMD")
        .env_remove("GWTD_JAVA_HOME")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn gwtd")
}

fn request(socket_path: &Path, method: &str, params: Value) -> Result<Response, String> {
    let stream = UnixStream::connect(socket_path)
        .map_err(|err| format!("failed to connect to {}: {err}", socket_path.display()))?;
    let mut writer = BufWriter::new(
        stream
            .try_clone()
            .map_err(|err| format!("failed to clone socket stream: {err}"))?,
    );
    let mut reader = BufReader::new(stream);

    let request = Request {
        id: 1,
        method: method.to_string(),
        params,
    };

    serde_json::to_writer(&mut writer, &request)
        .map_err(|err| format!("failed to serialize request: {err}"))?;
    writer
        .write_all(b"\n")
        .map_err(|err| format!("failed to write request newline: {err}"))?;
    writer
        .flush()
        .map_err(|err| format!("failed to flush request: {err}"))?;

    let mut line = String::new();
    reader
        .read_line(&mut line)
        .map_err(|err| format!("failed to read daemon response: {err}"))?;
    if line.trim().is_empty() {
        return Err("daemon returned empty response".to_string());
    }

    serde_json::from_str::<Response>(&line)
        .map_err(|err| format!("failed to parse daemon response JSON: {err}"))
}

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock drift before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("gwtd-it-{label}-{nanos}"))
}
