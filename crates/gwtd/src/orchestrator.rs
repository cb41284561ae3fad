//! Lifecycle decisions for every (project, role) pair.
//!
//! All registry mutations happen here, on the daemon's single thread. Launcher
//! threads only talk back through the event channel drained by
//! [`Orchestrator::pump_events`].

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};

use anyhow::{Context, Result};
use gwtd_types::{
    BindingState, LogsResult, Notice, NoticeLevel, ProjectDescriptor, ProjectStatus,
    PromptAction, ReconcilePrompt, RefreshResult, ResolveResult, Role, RoleStatus, StartResult,
    StatusResult, StopAllResult, StopResult,
};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::detector::Detector;
use crate::diagnostics::{self, FailureContext};
use crate::error::LifecycleError;
use crate::launcher::{LaunchEvent, LaunchSpec, Launcher, OutputMonitor, ProcessHandle, ProcessId};
use crate::prober::{PortOwners, PortProber};
use crate::registry::Registry;
use crate::sink::LogSink;

const MAX_NOTICES: usize = 100;
const SHOW_LOGS_TAIL: usize = 200;

const PROMPT_ACTIONS: [PromptAction; 5] = [
    PromptAction::ShowLogs,
    PromptAction::StopByPort,
    PromptAction::CheckPort,
    PromptAction::ClearState,
    PromptAction::Restart,
];

/// Outcome of trying to free a port held by a process without a handle.
enum PortRelease {
    Killed,
    Free,
    Held(String),
}

pub struct Orchestrator<L, P> {
    registry: Registry,
    launcher: L,
    prober: P,
    sink: Box<dyn LogSink>,
    settings: Settings,
    events_tx: Sender<LaunchEvent>,
    events_rx: Receiver<LaunchEvent>,
    monitors: HashMap<ProcessId, OutputMonitor>,
    prompts: Vec<ReconcilePrompt>,
    notices: VecDeque<Notice>,
}

impl<L: Launcher, P: PortProber> Orchestrator<L, P> {
    pub fn new(
        registry: Registry,
        launcher: L,
        prober: P,
        sink: Box<dyn LogSink>,
        settings: Settings,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            registry,
            launcher,
            prober,
            sink,
            settings,
            events_tx,
            events_rx,
            monitors: HashMap::new(),
            prompts: Vec::new(),
            notices: VecDeque::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn prompts(&self) -> &[ReconcilePrompt] {
        &self.prompts
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        self.notices.drain(..).collect()
    }

    pub fn state(&self, key: &str, role: Role) -> BindingState {
        match self.registry.get_handle(key, role) {
            Some(handle) => {
                let running = self
                    .monitors
                    .get(&handle.id())
                    .is_some_and(OutputMonitor::produced_output);
                if running {
                    BindingState::Running
                } else {
                    BindingState::Starting
                }
            }
            None if self.registry.was_active(key, role) => BindingState::Disconnected,
            None => BindingState::Idle,
        }
    }

    pub fn refresh(&mut self, detector: &dyn Detector) -> Result<RefreshResult> {
        let projects = detector.detect().context("project detection failed")?;
        let discarded = self.registry.set_projects(projects);
        let registry = &self.registry;
        self.prompts
            .retain(|prompt| registry.project(&prompt.key).is_some());

        let project_count = self.registry.projects().count();
        let live_processes = self.registry.all_live_handles().len();
        let message =
            format!("Detected {project_count} project(s). Active processes: {live_processes}.");
        info!("{message}");
        if discarded > 0 {
            self.notify(Notice::warning(format!(
                "{discarded} running process(es) belong to projects that are no longer detected"
            )));
        }
        Ok(RefreshResult {
            projects: project_count,
            live_processes,
            message,
        })
    }

    pub fn start(&mut self, key: &str, role: Role) -> Result<StartResult, LifecycleError> {
        let project = self.project(key)?.clone();
        if !project.supports(role) {
            return Err(LifecycleError::UnsupportedRole {
                key: key.to_string(),
                role,
            });
        }
        if self.state(key, role).is_live() {
            return Err(LifecycleError::StartConflict {
                key: key.to_string(),
                role,
            });
        }

        let spec = LaunchSpec::for_project(&project, role, &self.settings);
        self.sink.append(
            key,
            role,
            &format!("[{}] Starting {} for {}", role.label(), role.label(), project.name),
        );
        let handle = match self.launcher.spawn(&spec, self.events_tx.clone()) {
            Ok(handle) => handle,
            Err(err) => {
                let hint = err.hint().map(str::to_string);
                self.sink.append(key, role, &format!("Failed to start: {err}"));
                if let Some(hint) = &hint {
                    self.sink.append(key, role, hint);
                }
                let failure = LifecycleError::SpawnFailure {
                    key: key.to_string(),
                    role,
                    message: err.to_string(),
                    hint,
                };
                self.notify(Notice::error(failure.user_message()));
                return Err(failure);
            }
        };

        let pid = handle.pid();
        self.monitors.insert(handle.id(), OutputMonitor::new(role));
        if let Some(stale) = self.registry.bind(key, role, Some(handle)) {
            self.monitors.remove(&stale.id());
            self.launcher.terminate(stale);
        }
        self.clear_prompt(key, role);

        let message = format!("{} started for {} (pid {pid})", role.label(), project.name);
        self.notify(Notice::info(message.clone()));
        Ok(StartResult {
            key: key.to_string(),
            role,
            pid: Some(pid),
            message,
        })
    }

    pub fn stop(&mut self, key: &str, role: Role) -> Result<StopResult, LifecycleError> {
        let name = self.project(key)?.name.clone();
        let message = match self.state(key, role) {
            BindingState::Idle => {
                return Err(LifecycleError::NothingToStop {
                    key: key.to_string(),
                    role,
                })
            }
            BindingState::Disconnected => {
                let released = match self.known_port(key, role) {
                    Some(port) if self.prober.is_port_in_use(port) => {
                        Some((port, self.release_port(port)))
                    }
                    _ => None,
                };
                if let Some((port, PortRelease::Held(reason))) = released {
                    return Err(LifecycleError::PortStillHeld {
                        key: key.to_string(),
                        role,
                        port,
                        reason,
                    });
                }
                self.registry.bind(key, role, None);
                self.clear_prompt(key, role);
                match released {
                    Some((port, PortRelease::Killed)) => {
                        format!("{} on port {port} stopped for {name}", role.label())
                    }
                    _ => format!("{} state cleared for {name}", role.label()),
                }
            }
            BindingState::Starting | BindingState::Running => {
                if let Some(handle) = self.registry.bind(key, role, None) {
                    self.monitors.remove(&handle.id());
                    self.launcher.terminate(handle);
                }
                format!("{} stopped for {name}", role.label())
            }
        };
        self.sink.append(key, role, &format!("[{}] {message}", role.label()));
        self.notify(Notice::info(message.clone()));
        Ok(StopResult {
            key: key.to_string(),
            role,
            message,
        })
    }

    pub fn stop_all(&mut self) -> StopAllResult {
        let handles = self.registry.drain_handles();
        let stopped = handles.len();
        for handle in handles {
            self.monitors.remove(&handle.id());
            self.launcher.terminate(handle);
        }
        self.prompts.clear();

        let message = if stopped == 0 {
            "No GWT or Jetty processes running.".to_string()
        } else {
            format!("Stopped {stopped} process(es).")
        };
        self.notify(Notice::info(message.clone()));
        StopAllResult { stopped, message }
    }

    /// Settles beliefs left over from a previous daemon run.
    pub fn reconcile(&mut self) -> Vec<ReconcilePrompt> {
        for (key, role) in self.registry.orphaned_beliefs() {
            let name = self
                .registry
                .project(&key)
                .map(|project| project.name.clone())
                .unwrap_or_else(|| key.clone());
            let port = if role.announces_port() {
                self.known_port(&key, role)
            } else {
                None
            };
            match port {
                Some(port) if self.prober.is_port_in_use(port) => {
                    let message = format!(
                        "{} for {name} still appears to be running on port {port}",
                        role.label()
                    );
                    self.clear_prompt(&key, role);
                    self.prompts.push(ReconcilePrompt {
                        key: key.clone(),
                        role,
                        port,
                        message: message.clone(),
                        actions: PROMPT_ACTIONS.to_vec(),
                    });
                    self.notify(Notice::warning(message));
                }
                Some(port) => {
                    self.registry.bind(&key, role, None);
                    debug!("{role} for '{key}' no longer holds port {port}");
                    self.notify(Notice::info(format!(
                        "{} for {name} is no longer running (port {port} is free)",
                        role.label()
                    )));
                }
                None => {
                    self.registry.bind(&key, role, None);
                    self.notify(Notice::info(format!(
                        "{} for {name} was running before the restart; state cleared",
                        role.label()
                    )));
                }
            }
        }
        self.prompts.clone()
    }

    pub fn resolve_prompt(
        &mut self,
        key: &str,
        role: Role,
        action: PromptAction,
    ) -> Result<ResolveResult, LifecycleError> {
        let name = self.project(key)?.name.clone();
        match action {
            PromptAction::ShowLogs => {
                let excerpt = self.sink.excerpt(key, role, Some(SHOW_LOGS_TAIL));
                let message = match &excerpt {
                    Some(excerpt) => format!("Logs for {} of {name}: {}", role.label(), excerpt.path),
                    None => format!("No logs recorded for {} of {name}", role.label()),
                };
                Ok(ResolveResult {
                    message,
                    content: excerpt.map(|excerpt| excerpt.content),
                    pids: Vec::new(),
                })
            }
            PromptAction::StopByPort => {
                if self.state(key, role).is_live() {
                    let stopped = self.stop(key, role)?;
                    return Ok(ResolveResult {
                        message: stopped.message,
                        ..ResolveResult::default()
                    });
                }
                let port = self.require_port(key, role)?;
                let message = match self.release_port(port) {
                    PortRelease::Killed => format!(
                        "Stopped the process on port {port}; {} state cleared",
                        role.label()
                    ),
                    PortRelease::Free => format!(
                        "No process found on port {port}; {} state cleared",
                        role.label()
                    ),
                    PortRelease::Held(reason) => {
                        return Err(LifecycleError::PortStillHeld {
                            key: key.to_string(),
                            role,
                            port,
                            reason,
                        })
                    }
                };
                self.registry.bind(key, role, None);
                self.clear_prompt(key, role);
                self.notify(Notice::info(message.clone()));
                Ok(ResolveResult {
                    message,
                    ..ResolveResult::default()
                })
            }
            PromptAction::ClearState => {
                if self.state(key, role).is_live() {
                    return Err(LifecycleError::StartConflict {
                        key: key.to_string(),
                        role,
                    });
                }
                self.registry.bind(key, role, None);
                self.clear_prompt(key, role);
                let message = format!("{} state cleared for {name}", role.label());
                self.notify(Notice::info(message.clone()));
                Ok(ResolveResult {
                    message,
                    ..ResolveResult::default()
                })
            }
            PromptAction::CheckPort => {
                let port = self.require_port(key, role)?;
                let pids = match self.prober.owners_of_port(port) {
                    PortOwners::Known(pids) => pids,
                    PortOwners::Unknown(reason) if self.prober.is_port_in_use(port) => {
                        return Ok(ResolveResult {
                            message: format!(
                                "Port {port} is in use but its owner cannot be identified \
                                 ({reason}); {} state kept",
                                role.label()
                            ),
                            ..ResolveResult::default()
                        });
                    }
                    PortOwners::Unknown(_) => Vec::new(),
                };
                if pids.is_empty() {
                    if !self.state(key, role).is_live() {
                        self.registry.bind(key, role, None);
                        self.clear_prompt(key, role);
                    }
                    return Ok(ResolveResult {
                        message: format!(
                            "No process found using port {port}; {} state cleared",
                            role.label()
                        ),
                        ..ResolveResult::default()
                    });
                }
                let listed = pids
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                Ok(ResolveResult {
                    message: format!("Port {port} is in use by PID {listed}"),
                    content: None,
                    pids,
                })
            }
            PromptAction::Restart => {
                if self.state(key, role) == BindingState::Disconnected {
                    self.stop(key, role)?;
                }
                let started = self.start(key, role)?;
                Ok(ResolveResult {
                    message: started.message,
                    pids: started.pid.into_iter().collect(),
                    ..ResolveResult::default()
                })
            }
        }
    }

    pub fn status(&self, key: Option<&str>) -> Result<StatusResult, LifecycleError> {
        let projects: Vec<&ProjectDescriptor> = match key {
            Some(key) => vec![self.project(key)?],
            None => self.registry.projects().collect(),
        };
        let projects = projects
            .into_iter()
            .map(|project| self.project_status(project))
            .collect();
        Ok(StatusResult {
            revision: self.registry.revision(),
            projects,
            prompts: self.prompts.clone(),
        })
    }

    pub fn logs(
        &self,
        key: &str,
        role: Role,
        tail: Option<usize>,
    ) -> Result<LogsResult, LifecycleError> {
        self.project(key)?;
        let excerpt = self.sink.excerpt(key, role, tail);
        Ok(LogsResult {
            key: key.to_string(),
            role,
            path: excerpt
                .as_ref()
                .map(|excerpt| excerpt.path.clone())
                .unwrap_or_default(),
            content: excerpt.map(|excerpt| excerpt.content).unwrap_or_default(),
        })
    }

    /// Applies every queued launcher event in arrival order.
    pub fn pump_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.apply_event(event);
            handled += 1;
        }
        handled
    }

    #[cfg(test)]
    pub(crate) fn event_sender(&self) -> Sender<LaunchEvent> {
        self.events_tx.clone()
    }

    fn apply_event(&mut self, event: LaunchEvent) {
        match event {
            LaunchEvent::Note { key, role, line, .. } => self.sink.append(&key, role, &line),
            LaunchEvent::Output {
                process,
                key,
                role,
                stream,
                line,
            } => {
                self.sink.append(&key, role, &line);
                let port = self
                    .monitors
                    .get_mut(&process)
                    .and_then(|monitor| monitor.observe(stream, &line));
                if let Some(port) = port {
                    self.record_port(&key, role, port);
                }
            }
            LaunchEvent::Exited {
                process,
                key,
                role,
                code,
            } => self.apply_exit(process, &key, role, code),
        }
    }

    fn record_port(&mut self, key: &str, role: Role, port: u16) {
        if self.registry.get_discovered_port(key) == Some(port) {
            return;
        }
        self.registry.set_discovered_port(key, port);
        self.sink
            .append(key, role, &format!("[{}] Port detected: {port}", role.label()));
        let name = self.display_name(key);
        self.notify(Notice::info(format!(
            "{} for {name} is ready on port {port}",
            role.label()
        )));
    }

    fn apply_exit(&mut self, process: ProcessId, key: &str, role: Role, code: Option<i32>) {
        let monitor = self.monitors.remove(&process);
        let bound = self.registry.get_handle(key, role).map(ProcessHandle::id);
        if bound != Some(process) {
            debug!("ignoring stale exit of process {process} ({role} for '{key}')");
            return;
        }
        self.registry.bind(key, role, None);

        let name = self.display_name(key);
        if code == Some(0) {
            self.sink.append(key, role, "Process completed successfully.");
            self.notify(Notice::info(format!("{} finished for {name}", role.label())));
            return;
        }

        let code_text = code.map_or_else(|| "signal".to_string(), |code| code.to_string());
        self.sink
            .append(key, role, &format!("Process ended with error (code: {code_text})"));
        let (from_errors, lines) = monitor
            .as_ref()
            .map(OutputMonitor::diagnostic_lines)
            .unwrap_or_default();
        if !lines.is_empty() {
            let header = if from_errors {
                "Errors detected:"
            } else {
                "Last output lines:"
            };
            self.sink.append(key, role, header);
            for line in &lines {
                self.sink.append(key, role, line);
            }
        }

        let corpus = lines.join("\n");
        let remedy = diagnostics::classify(&corpus, self.settings.java_home.is_some());
        let directory = self
            .registry
            .project(key)
            .map(|project| project.directory().to_string_lossy().to_string())
            .unwrap_or_default();
        let command_line = self
            .registry
            .project(key)
            .map(|project| LaunchSpec::for_project(project, role, &self.settings).command_line())
            .unwrap_or_default();
        let context = FailureContext {
            java_home: self.settings.java_home.as_deref(),
            directory: &directory,
            command_line: &command_line,
        };
        for line in diagnostics::suggestions(remedy, &context) {
            self.sink.append(key, role, &line);
        }
        self.notify(Notice::error(format!(
            "{} for {name} exited with code {code_text}: {remedy}",
            role.label()
        )));
    }

    fn project(&self, key: &str) -> Result<&ProjectDescriptor, LifecycleError> {
        self.registry
            .project(key)
            .ok_or_else(|| LifecycleError::UnknownProject {
                key: key.to_string(),
            })
    }

    fn project_status(&self, project: &ProjectDescriptor) -> ProjectStatus {
        let roles = project
            .roles
            .iter()
            .map(|role| RoleStatus {
                role: *role,
                state: self.state(&project.key, *role),
                pid: self
                    .registry
                    .get_handle(&project.key, *role)
                    .map(ProcessHandle::pid),
            })
            .collect();
        ProjectStatus {
            project: project.clone(),
            discovered_port: self.registry.get_discovered_port(&project.key),
            roles,
        }
    }

    fn known_port(&self, key: &str, role: Role) -> Option<u16> {
        self.registry.get_discovered_port(key).or_else(|| {
            self.registry
                .project(key)
                .and_then(|project| project.configured_port(role))
        })
    }

    fn require_port(&self, key: &str, role: Role) -> Result<u16, LifecycleError> {
        self.known_port(key, role)
            .ok_or_else(|| LifecycleError::NoKnownPort {
                key: key.to_string(),
                role,
            })
    }

    /// Kills whoever holds `port`; a port that stays bound with no killable owner is `Held`.
    fn release_port(&self, port: u16) -> PortRelease {
        if self.prober.kill_by_port(port) {
            return PortRelease::Killed;
        }
        if !self.prober.is_port_in_use(port) {
            return PortRelease::Free;
        }
        match self.prober.owners_of_port(port) {
            PortOwners::Unknown(reason) => PortRelease::Held(reason),
            PortOwners::Known(pids) if pids.is_empty() => {
                PortRelease::Held("no owning process is visible".to_string())
            }
            PortOwners::Known(pids) => PortRelease::Held(format!(
                "PID {} could not be signaled",
                pids.iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }

    fn clear_prompt(&mut self, key: &str, role: Role) {
        self.prompts
            .retain(|prompt| !(prompt.key == key && prompt.role == role));
    }

    fn display_name(&self, key: &str) -> String {
        self.registry
            .project(key)
            .map(|project| project.name.clone())
            .unwrap_or_else(|| key.to_string())
    }

    fn notify(&mut self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info => info!("{}", notice.message),
            NoticeLevel::Warning => warn!("{}", notice.message),
            NoticeLevel::Error => error!("{}", notice.message),
        }
        if self.notices.len() == MAX_NOTICES {
            self.notices.pop_front();
        }
        self.notices.push_back(notice);
    }
}
