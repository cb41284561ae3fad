mod config;
mod detector;
mod diagnostics;
mod error;
mod launcher;
mod orchestrator;
mod prober;
mod registry;
mod sink;

use anyhow::{bail, Context, Result};
use clap::Parser;
use gwtd_types::{
    default_socket_path, default_state_path, resolve_workspace, LogsParams, NoticesResult,
    PingResult, PromptsResult, Request, ResolveParams, Response, RoleParams, ShutdownParams,
    StatusParams, METHOD_LOGS, METHOD_NOTICES, METHOD_PING, METHOD_PROMPTS, METHOD_REFRESH,
    METHOD_RESOLVE, METHOD_SHUTDOWN, METHOD_START, METHOD_STATUS, METHOD_STOP, METHOD_STOP_ALL,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use config::Settings;
use detector::PomDetector;
use error::LifecycleError;
use launcher::SystemLauncher;
use orchestrator::Orchestrator;
use prober::SystemPortProber;
use registry::{JsonFileStore, Registry};
use sink::FileLogSink;

#[derive(Debug, Parser)]
#[command(name = "gwtd", version, about = "GWT and Jetty process daemon for the gwt CLI")]
struct Args {
    #[arg(long)]
    socket: Option<PathBuf>,
    #[arg(long)]
    state: Option<PathBuf>,
    /// Directory scanned for pom.xml files; defaults to the current directory.
    #[arg(long)]
    workspace: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let workspace = resolve_workspace(args.workspace)?;
    let socket_path = args
        .socket
        .unwrap_or_else(|| default_socket_path(&workspace));
    let state_path = args
        .state
        .or_else(|| std::env::var_os("GWTD_STATE_PATH").map(PathBuf::from))
        .unwrap_or_else(|| default_state_path(&workspace));

    let mut app_state = AppState::load(workspace, state_path)?;
    if let Err(err) = app_state.refresh() {
        warn!("initial project detection failed: {err:#}");
    }
    let prompts = app_state.orchestrator.reconcile();
    if !prompts.is_empty() {
        info!("{} process(es) need attention after restart", prompts.len());
    }

    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory: {}", parent.display()))?;
    }
    let listener = bind_daemon_socket(&socket_path)?;
    listener
        .set_nonblocking(true)
        .context("failed to set listener as non-blocking")?;

    info!(
        "gwtd listening on {} for {}",
        socket_path.display(),
        app_state.workspace.display()
    );
    let running = Arc::new(AtomicBool::new(true));
    install_signal_handler(running.clone());

    while running.load(Ordering::SeqCst) {
        app_state.orchestrator.pump_events();
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_client(stream, running.clone(), &mut app_state) {
                    error!("client handling failed: {err:#}");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(err) => {
                warn!("accept error: {err}");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }

    if socket_path.exists() {
        let _ = fs::remove_file(&socket_path);
    }
    info!("gwtd shutdown complete");
    Ok(())
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("GWTD_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),
        )
        .with_writer(io::stderr)
        .try_init();
}

static SIGNAL_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate_signal(_sig: libc::c_int) {
    SIGNAL_RECEIVED.store(true, Ordering::SeqCst);
}

fn install_signal_handler(running: Arc<AtomicBool>) {
    unsafe {
        libc::signal(
            libc::SIGTERM,
            on_terminate_signal as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            on_terminate_signal as *const () as libc::sighandler_t,
        );
    }

    // The handler may only touch the static; this thread forwards it.
    thread::spawn(move || {
        while !SIGNAL_RECEIVED.load(Ordering::SeqCst) {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
        info!("received signal, initiating graceful shutdown");
        running.store(false, Ordering::SeqCst);
    });
}

fn bind_daemon_socket(socket_path: &Path) -> Result<UnixListener> {
    match UnixListener::bind(socket_path) {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            if daemon_is_reachable(socket_path) {
                bail!(
                    "failed to bind socket: {} (another gwtd instance is already running)",
                    socket_path.display()
                );
            }
            if socket_path.exists() {
                fs::remove_file(socket_path).with_context(|| {
                    format!("failed to remove stale socket: {}", socket_path.display())
                })?;
            }
            UnixListener::bind(socket_path)
                .with_context(|| format!("failed to bind socket: {}", socket_path.display()))
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind socket: {}", socket_path.display()))
        }
    }
}

fn daemon_is_reachable(socket_path: &Path) -> bool {
    let Ok(stream) = UnixStream::connect(socket_path) else {
        return false;
    };
    let Ok(clone) = stream.try_clone() else {
        return false;
    };
    let mut writer = BufWriter::new(clone);
    let mut reader = BufReader::new(stream);
    let ping = Request {
        id: 0,
        method: METHOD_PING.to_string(),
        params: Value::Null,
    };

    if serde_json::to_writer(&mut writer, &ping).is_err() {
        return false;
    }
    if writer.write_all(b"\n").is_err() || writer.flush().is_err() {
        return false;
    }

    let mut line = String::new();
    if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
        return false;
    }
    serde_json::from_str::<Response>(&line)
        .map(|response| response.ok)
        .unwrap_or(false)
}

fn handle_client(
    stream: UnixStream,
    running: Arc<AtomicBool>,
    app_state: &mut AppState,
) -> Result<()> {
    stream
        .set_nonblocking(false)
        .context("failed to set client stream as blocking")?;
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .context("failed to set client read timeout")?;
    let reader = BufReader::new(
        stream
            .try_clone()
            .context("failed to clone client stream")?,
    );
    let mut writer = BufWriter::new(stream);

    for line in reader.lines() {
        let line = line.context("failed reading client request")?;
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(err) => {
                let response = Response::err(0, format!("invalid request JSON: {err}"));
                write_response(&mut writer, &response)?;
                continue;
            }
        };

        let (response, should_shutdown) = handle_request(&request, app_state);
        write_response(&mut writer, &response)?;

        if should_shutdown {
            running.store(false, Ordering::SeqCst);
            break;
        }
    }

    Ok(())
}

fn write_response(writer: &mut BufWriter<UnixStream>, response: &Response) -> Result<()> {
    serde_json::to_writer(&mut *writer, response).context("failed to serialize response")?;
    writer.write_all(b"\n").context("failed to write newline")?;
    writer.flush().context("failed to flush response")?;
    Ok(())
}

/// Failure surfaced to the client; lifecycle errors keep their remediation hint.
enum RequestError {
    Lifecycle(LifecycleError),
    Other(anyhow::Error),
}

impl RequestError {
    fn message(&self) -> String {
        match self {
            RequestError::Lifecycle(err) => err.user_message(),
            RequestError::Other(err) => format!("{err:#}"),
        }
    }
}

impl From<LifecycleError> for RequestError {
    fn from(err: LifecycleError) -> Self {
        RequestError::Lifecycle(err)
    }
}

impl From<anyhow::Error> for RequestError {
    fn from(err: anyhow::Error) -> Self {
        RequestError::Other(err)
    }
}

fn respond<T: Serialize>(id: u64, result: Result<T, RequestError>) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => Response::ok(id, value),
            Err(err) => {
                error!("failed to serialize response {id}: {err}");
                Response::err(id, format!("failed to serialize response: {err}"))
            }
        },
        Err(err) => Response::err(id, err.message()),
    }
}

fn handle_request(request: &Request, app_state: &mut AppState) -> (Response, bool) {
    app_state.orchestrator.pump_events();
    let id = request.id;
    let params = &request.params;
    match request.method.as_str() {
        METHOD_PING => (
            respond(
                id,
                Ok(PingResult {
                    pong: true,
                    daemon: "gwtd".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    workspace: app_state.workspace.to_string_lossy().to_string(),
                    revision: app_state.orchestrator.registry().revision(),
                }),
            ),
            false,
        ),
        METHOD_SHUTDOWN => match parse_params_or_default::<ShutdownParams>(params) {
            Ok(params) => {
                let stopped = if params.stop_all {
                    app_state.orchestrator.stop_all().stopped
                } else {
                    0
                };
                (
                    Response::ok(id, json!({"stopping": true, "stopped": stopped})),
                    true,
                )
            }
            Err(err) => (Response::err(id, format!("{err:#}")), false),
        },
        METHOD_REFRESH => (respond(id, app_state.refresh().map_err(RequestError::from)), false),
        METHOD_START => {
            let result = parse_params::<RoleParams>(params)
                .map_err(RequestError::from)
                .and_then(|params| {
                    app_state
                        .orchestrator
                        .start(&params.key, params.role)
                        .map_err(RequestError::from)
                });
            (respond(id, result), false)
        }
        METHOD_STOP => {
            let result = parse_params::<RoleParams>(params)
                .map_err(RequestError::from)
                .and_then(|params| {
                    app_state
                        .orchestrator
                        .stop(&params.key, params.role)
                        .map_err(RequestError::from)
                });
            (respond(id, result), false)
        }
        METHOD_STOP_ALL => (
            respond(id, Ok(app_state.orchestrator.stop_all())),
            false,
        ),
        METHOD_STATUS => {
            let result = parse_params_or_default::<StatusParams>(params)
                .map_err(RequestError::from)
                .and_then(|params| {
                    app_state
                        .orchestrator
                        .status(params.key.as_deref())
                        .map_err(RequestError::from)
                });
            (respond(id, result), false)
        }
        METHOD_LOGS => {
            let result = parse_params::<LogsParams>(params)
                .map_err(RequestError::from)
                .and_then(|params| {
                    app_state
                        .orchestrator
                        .logs(&params.key, params.role, params.tail)
                        .map_err(RequestError::from)
                });
            (respond(id, result), false)
        }
        METHOD_PROMPTS => {
            let prompts = PromptsResult {
                prompts: app_state.orchestrator.prompts().to_vec(),
            };
            (respond(id, Ok(prompts)), false)
        }
        METHOD_RESOLVE => {
            let result = parse_params::<ResolveParams>(params)
                .map_err(RequestError::from)
                .and_then(|params| {
                    app_state
                        .orchestrator
                        .resolve_prompt(&params.key, params.role, params.action)
                        .map_err(RequestError::from)
                });
            (respond(id, result), false)
        }
        METHOD_NOTICES => {
            let notices = NoticesResult {
                notices: app_state.orchestrator.drain_notices(),
            };
            (respond(id, Ok(notices)), false)
        }
        other => (Response::err(id, format!("unknown method: {other}")), false),
    }
}

fn parse_params<T: DeserializeOwned>(params: &Value) -> Result<T> {
    serde_json::from_value(params.clone()).context("invalid request params")
}

fn parse_params_or_default<T: DeserializeOwned + Default>(params: &Value) -> Result<T> {
    if params.is_null() {
        return Ok(T::default());
    }
    parse_params(params)
}

struct AppState {
    workspace: PathBuf,
    detector: PomDetector,
    orchestrator: Orchestrator<SystemLauncher, SystemPortProber>,
}

impl AppState {
    fn load(workspace: PathBuf, state_path: PathBuf) -> Result<Self> {
        let settings = Settings::load(&workspace)?;
        let store = JsonFileStore::new(state_path.clone());
        let mut registry = Registry::new(store.load()?);
        registry.add_observer(Box::new(store));

        let logs_path = state_path
            .parent()
            .map(|path| path.join("logs"))
            .unwrap_or_else(|| gwtd_types::default_data_dir().join("logs"));
        let detector = PomDetector::new(vec![workspace.clone()])?;
        let orchestrator = Orchestrator::new(
            registry,
            SystemLauncher::default(),
            SystemPortProber::default(),
            Box::new(FileLogSink::new(logs_path)),
            settings,
        );
        Ok(Self {
            workspace,
            detector,
            orchestrator,
        })
    }

    fn refresh(&mut self) -> Result<gwtd_types::RefreshResult> {
        self.orchestrator.refresh(&self.detector)
    }
}
