mod debug;
mod tree;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use gwtd_types::client::{parse_ok_response, DaemonTarget};
use gwtd_types::{
    resolve_workspace, LogsParams, LogsResult, NoticeLevel, NoticesResult, PromptAction,
    PromptsResult, RefreshResult, ResolveParams, ResolveResult, Role, RoleParams,
    ShutdownParams, StartResult, StatusParams, StatusResult, StopAllResult, StopResult,
    METHOD_LOGS, METHOD_NOTICES, METHOD_PROMPTS, METHOD_REFRESH, METHOD_RESOLVE,
    METHOD_SHUTDOWN, METHOD_START, METHOD_STATUS, METHOD_STOP, METHOD_STOP_ALL,
};
use serde_json::Value;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "gwt", version, about = "CLI for the gwtd daemon")]
struct Cli {
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Workspace root served by the daemon; defaults to $GWTD_WORKSPACE or the current directory.
    #[arg(long)]
    workspace: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Args)]
struct AutostartArgs {
    #[arg(long = "autostart", default_value_t = true, action = ArgAction::Set)]
    autostart: bool,
    #[arg(long = "no-autostart")]
    no_autostart: bool,
}

impl AutostartArgs {
    fn resolve(&self) -> bool {
        self.autostart && !self.no_autostart
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Re-scan the workspace for GWT and Jetty projects.
    Refresh {
        #[command(flatten)]
        autostart: AutostartArgs,
    },
    /// Start compile, devmode, codeserver or jetty for a project.
    Start {
        role: Role,
        /// Project key, name or directory; optional when only one project exists.
        project: Option<String>,
        #[command(flatten)]
        autostart: AutostartArgs,
    },
    Stop {
        role: Role,
        project: Option<String>,
        #[command(flatten)]
        autostart: AutostartArgs,
    },
    /// Stop every running process.
    StopAll {
        #[command(flatten)]
        autostart: AutostartArgs,
    },
    /// Show the project tree with process states.
    Status {
        project: Option<String>,
        #[command(flatten)]
        autostart: AutostartArgs,
        #[arg(long, default_value_t = false)]
        json: bool,
        #[arg(long, default_value_t = false)]
        watch: bool,
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Show captured output of a process.
    Logs {
        role: Role,
        project: Option<String>,
        #[command(flatten)]
        autostart: AutostartArgs,
        #[arg(long)]
        tail: Option<usize>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List processes that survived a daemon restart and need a decision.
    Prompts {
        #[command(flatten)]
        autostart: AutostartArgs,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Answer a restart prompt: show-logs, stop-by-port, clear-state, check-port, restart.
    Resolve {
        project: String,
        role: Role,
        action: PromptAction,
        #[command(flatten)]
        autostart: AutostartArgs,
    },
    /// Print and clear pending notifications.
    Notices {
        #[command(flatten)]
        autostart: AutostartArgs,
    },
    /// Print a Chrome launch configuration for debugging through the code server.
    DebugConfig {
        project: Option<String>,
        #[command(flatten)]
        autostart: AutostartArgs,
        /// Page Chrome opens.
        #[arg(long, default_value = debug::DEFAULT_DEBUG_URL)]
        url: String,
    },
    Ping {
        #[command(flatten)]
        autostart: AutostartArgs,
    },
    /// Manage daemon lifecycle.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DaemonCommand {
    Start,
    Stop {
        /// Terminate running processes before the daemon exits.
        #[arg(long, default_value_t = false)]
        stop_all: bool,
    },
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let workspace = resolve_workspace(cli.workspace)?;
    let target = DaemonTarget::new(workspace, cli.socket);

    match cli.command {
        Commands::Refresh { autostart } => cmd_refresh(&target, autostart.resolve()),
        Commands::Start {
            role,
            project,
            autostart,
        } => cmd_start(&target, role, project.as_deref(), autostart.resolve()),
        Commands::Stop {
            role,
            project,
            autostart,
        } => cmd_stop(&target, role, project.as_deref(), autostart.resolve()),
        Commands::StopAll { autostart } => cmd_stop_all(&target, autostart.resolve()),
        Commands::Status {
            project,
            autostart,
            json,
            watch,
            interval_ms,
        } => cmd_status(
            &target,
            project.as_deref(),
            autostart.resolve(),
            json,
            watch,
            interval_ms,
        ),
        Commands::Logs {
            role,
            project,
            autostart,
            tail,
            json,
        } => cmd_logs(
            &target,
            role,
            project.as_deref(),
            autostart.resolve(),
            tail,
            json,
        ),
        Commands::Prompts { autostart, json } => {
            cmd_prompts(&target, autostart.resolve(), json)
        }
        Commands::Resolve {
            project,
            role,
            action,
            autostart,
        } => cmd_resolve(&target, &project, role, action, autostart.resolve()),
        Commands::Notices { autostart } => cmd_notices(&target, autostart.resolve()),
        Commands::DebugConfig {
            project,
            autostart,
            url,
        } => cmd_debug_config(&target, project.as_deref(), autostart.resolve(), &url),
        Commands::Ping { autostart } => cmd_ping(&target, autostart.resolve()),
        Commands::Daemon { command } => match command {
            DaemonCommand::Start => cmd_daemon_start(&target),
            DaemonCommand::Stop { stop_all } => cmd_daemon_stop(&target, stop_all),
            DaemonCommand::Status => cmd_daemon_status(&target),
        },
    }
}

fn cmd_refresh(target: &DaemonTarget, autostart: bool) -> Result<()> {
    let result: RefreshResult = target.call(METHOD_REFRESH, &Value::Null, autostart)?;
    println!("{}", result.message);
    Ok(())
}

fn cmd_start(
    target: &DaemonTarget,
    role: Role,
    project: Option<&str>,
    autostart: bool,
) -> Result<()> {
    let key = resolve_project_key(target, project, autostart)?;
    let result: StartResult = target.call(METHOD_START, &RoleParams { key, role }, autostart)?;
    println!("{}", result.message);
    Ok(())
}

fn cmd_stop(
    target: &DaemonTarget,
    role: Role,
    project: Option<&str>,
    autostart: bool,
) -> Result<()> {
    let key = resolve_project_key(target, project, autostart)?;
    let result: StopResult = target.call(METHOD_STOP, &RoleParams { key, role }, autostart)?;
    println!("{}", result.message);
    Ok(())
}

fn cmd_stop_all(target: &DaemonTarget, autostart: bool) -> Result<()> {
    let result: StopAllResult = target.call(METHOD_STOP_ALL, &Value::Null, autostart)?;
    println!("{}", result.message);
    Ok(())
}

fn cmd_status(
    target: &DaemonTarget,
    project: Option<&str>,
    autostart: bool,
    json_output: bool,
    watch: bool,
    interval_ms: u64,
) -> Result<()> {
    let key = match project {
        Some(selector) => Some(resolve_project_key(target, Some(selector), autostart)?),
        None => None,
    };
    if !watch {
        let result = request_status(target, key.clone(), autostart)?;
        print!("{}", format_status_output(&result, json_output)?);
        return Ok(());
    }

    let interval = Duration::from_millis(interval_ms.max(200));
    let mut last_revision = None;
    loop {
        let result = request_status(target, key.clone(), autostart)?;
        if last_revision != Some(result.revision) {
            last_revision = Some(result.revision);
            if json_output {
                println!(
                    "{}",
                    serde_json::to_string(&result).context("failed to serialize status JSON")?
                );
            } else {
                print!("\x1b[2J\x1b[H");
                print!("{}", format_status_output(&result, false)?);
            }
            io::stdout()
                .flush()
                .context("failed to flush status watch output")?;
        }
        thread::sleep(interval);
    }
}

fn request_status(
    target: &DaemonTarget,
    key: Option<String>,
    autostart: bool,
) -> Result<StatusResult> {
    target.call(METHOD_STATUS, &StatusParams { key }, autostart)
}

fn format_status_output(result: &StatusResult, json_output: bool) -> Result<String> {
    if json_output {
        return serde_json::to_string(result).context("failed to serialize status JSON");
    }
    if result.projects.is_empty() {
        return Ok("no GWT or Jetty projects detected\n".to_string());
    }
    Ok(tree::format_tree(result))
}

fn cmd_logs(
    target: &DaemonTarget,
    role: Role,
    project: Option<&str>,
    autostart: bool,
    tail: Option<usize>,
    json_output: bool,
) -> Result<()> {
    let key = resolve_project_key(target, project, autostart)?;
    let logs: LogsResult = target.call(METHOD_LOGS, &LogsParams { key, role, tail }, autostart)?;

    if json_output {
        println!(
            "{}",
            serde_json::to_string(&logs).context("failed to serialize logs JSON")?
        );
        return Ok(());
    }
    if logs.content.is_empty() {
        println!("no logs for {} of {}", role.label(), logs.key);
        return Ok(());
    }
    print!("{}", logs.content);
    if !logs.content.ends_with('\n') {
        println!();
    }
    Ok(())
}

fn cmd_prompts(target: &DaemonTarget, autostart: bool, json_output: bool) -> Result<()> {
    let result: PromptsResult = target.call(METHOD_PROMPTS, &Value::Null, autostart)?;
    if json_output {
        println!(
            "{}",
            serde_json::to_string(&result).context("failed to serialize prompts JSON")?
        );
        return Ok(());
    }
    if result.prompts.is_empty() {
        println!("nothing needs attention");
        return Ok(());
    }
    for prompt in &result.prompts {
        println!("{}", prompt.message);
        for action in &prompt.actions {
            println!(
                "  gwt resolve {} {} {}",
                prompt.key,
                prompt.role.as_str(),
                action.as_str()
            );
        }
    }
    Ok(())
}

fn cmd_resolve(
    target: &DaemonTarget,
    project: &str,
    role: Role,
    action: PromptAction,
    autostart: bool,
) -> Result<()> {
    let key = resolve_project_key(target, Some(project), autostart)?;
    let result: ResolveResult =
        target.call(METHOD_RESOLVE, &ResolveParams { key, role, action }, autostart)?;
    println!("{}", result.message);
    if let Some(content) = result.content {
        print!("{content}");
        if !content.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn cmd_notices(target: &DaemonTarget, autostart: bool) -> Result<()> {
    let result: NoticesResult = target.call(METHOD_NOTICES, &Value::Null, autostart)?;
    for notice in result.notices {
        let level = match notice.level {
            NoticeLevel::Info => "info",
            NoticeLevel::Warning => "warning",
            NoticeLevel::Error => "error",
        };
        println!("[{level}] {}", notice.message);
    }
    Ok(())
}

fn cmd_debug_config(
    target: &DaemonTarget,
    project: Option<&str>,
    autostart: bool,
    url: &str,
) -> Result<()> {
    let status = request_status(target, None, autostart)?;
    let key = select_project(&status, project)?;
    let Some(project) = status.projects.iter().find(|project| project.project.key == key) else {
        bail!("project {key} disappeared from daemon status");
    };
    let launch = debug::chrome_launch(project, &target.workspace, url)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&launch).context("failed to format launch configuration")?
    );
    Ok(())
}

fn cmd_ping(target: &DaemonTarget, autostart: bool) -> Result<()> {
    target.connect(autostart)?;
    let ping = target.ping()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&ping).context("failed to format ping response")?
    );
    Ok(())
}

fn cmd_daemon_start(target: &DaemonTarget) -> Result<()> {
    if let Ok(ping) = target.ping() {
        target.check_workspace(&ping)?;
        println!("gwtd already running ({})", target.socket_path.display());
        return Ok(());
    }
    target.start_daemon()?;
    let ping = target.wait_for_ping(Duration::from_secs(3))?;
    target.check_workspace(&ping)?;
    println!(
        "gwtd started for {} ({})",
        target.workspace.display(),
        target.socket_path.display()
    );
    Ok(())
}

fn cmd_daemon_stop(target: &DaemonTarget, stop_all: bool) -> Result<()> {
    let ping = target
        .ping()
        .with_context(|| format!("failed to stop daemon at {}", target.socket_path.display()))?;
    target.check_workspace(&ping)?;
    let params = serde_json::to_value(ShutdownParams { stop_all })
        .context("failed to serialize shutdown params")?;
    let _: Value = parse_ok_response(target.request(METHOD_SHUTDOWN, params)?)?;
    println!("gwtd stopping");
    Ok(())
}

fn cmd_daemon_status(target: &DaemonTarget) -> Result<()> {
    println!("{}", daemon_status_line(target));
    Ok(())
}

fn daemon_status_line(target: &DaemonTarget) -> String {
    let socket = target.socket_path.display();
    match target.ping() {
        Ok(ping) => match target.check_workspace(&ping) {
            Ok(()) => format!("running for {} ({socket})", ping.workspace),
            Err(_) => format!("socket {socket} is held by the daemon for {}", ping.workspace),
        },
        Err(_) => format!("stopped ({socket})"),
    }
}

fn resolve_project_key(
    target: &DaemonTarget,
    selector: Option<&str>,
    autostart: bool,
) -> Result<String> {
    let status = request_status(target, None, autostart)?;
    select_project(&status, selector)
}

/// Matches a key, module name or directory name; with no selector the sole project wins.
fn select_project(status: &StatusResult, selector: Option<&str>) -> Result<String> {
    let keys: Vec<&str> = status
        .projects
        .iter()
        .map(|project| project.project.key.as_str())
        .collect();
    let Some(selector) = selector else {
        return match keys.as_slice() {
            [only] => Ok((*only).to_string()),
            [] => bail!("no GWT or Jetty projects detected; run `gwt refresh`"),
            _ => bail!(
                "several projects detected, name one of:\n  {}",
                keys.join("\n  ")
            ),
        };
    };

    if let Some(key) = keys.iter().find(|key| **key == selector) {
        return Ok((*key).to_string());
    }
    let canonical = std::fs::canonicalize(selector).ok().map(|path| {
        if path.is_dir() {
            path.join("pom.xml")
        } else {
            path
        }
    });
    let matches: Vec<&str> = status
        .projects
        .iter()
        .filter(|project| {
            let descriptor = &project.project;
            descriptor.name == selector
                || Path::new(&descriptor.key)
                    .parent()
                    .and_then(Path::file_name)
                    .is_some_and(|name| name == selector)
                || canonical
                    .as_deref()
                    .is_some_and(|path| path == Path::new(&descriptor.key))
        })
        .map(|project| project.project.key.as_str())
        .collect();
    match matches.as_slice() {
        [only] => Ok((*only).to_string()),
        [] => bail!("no project matches '{selector}'"),
        _ => bail!(
            "'{selector}' matches several projects, use the full key:\n  {}",
            matches.join("\n  ")
        ),
    }
}
