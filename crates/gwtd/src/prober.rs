use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, warn};

use crate::launcher::terminate_pid;

/// Answers "is something listening on this port" and can kill whoever is.
pub trait PortProber {
    fn is_port_in_use(&self, port: u16) -> bool;
    fn owners_of_port(&self, port: u16) -> PortOwners;
    fn kill_by_port(&self, port: u16) -> bool;
}

/// Who holds a port, as far as the socket table can tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortOwners {
    Known(Vec<u32>),
    /// The socket table could not be queried; the port may still be held.
    Unknown(String),
}

/// Queries the socket table through `lsof`.
#[derive(Debug, Clone, Copy)]
pub struct SystemPortProber {
    lsof: &'static str,
}

impl Default for SystemPortProber {
    fn default() -> Self {
        Self { lsof: "lsof" }
    }
}

enum ProbeFailure {
    ToolMissing(&'static str),
    Failed(String),
}

impl SystemPortProber {
    #[cfg(test)]
    fn with_tool(lsof: &'static str) -> Self {
        Self { lsof }
    }

    fn listening_pids(&self, port: u16) -> Result<Vec<u32>, ProbeFailure> {
        let output = Command::new(self.lsof)
            .arg("-nP")
            .arg(format!("-iTCP:{port}"))
            .arg("-sTCP:LISTEN")
            .arg("-t")
            .output()
            .map_err(|err| spawn_failure(self.lsof, err))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        // lsof exits 1 with empty output when nothing matches.
        if !output.status.success() && !output.stderr.is_empty() && stdout.trim().is_empty() {
            return Err(ProbeFailure::Failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(parse_lsof_pids(&stdout))
    }
}

impl PortProber for SystemPortProber {
    fn is_port_in_use(&self, port: u16) -> bool {
        match self.listening_pids(port) {
            Ok(pids) => !pids.is_empty(),
            Err(ProbeFailure::ToolMissing(tool)) => {
                debug!("{tool} unavailable, probing port {port} by connecting");
                is_port_reachable(port)
            }
            Err(ProbeFailure::Failed(reason)) => {
                warn!("port probe for {port} failed, assuming free: {reason}");
                false
            }
        }
    }

    fn owners_of_port(&self, port: u16) -> PortOwners {
        match self.listening_pids(port) {
            Ok(pids) => PortOwners::Known(pids),
            Err(ProbeFailure::ToolMissing(tool)) => {
                warn!("cannot list owners of port {port}: {tool} is not installed");
                PortOwners::Unknown(format!("{tool} is not installed"))
            }
            Err(ProbeFailure::Failed(reason)) => {
                warn!("cannot list owners of port {port}: {reason}");
                PortOwners::Unknown(reason)
            }
        }
    }

    fn kill_by_port(&self, port: u16) -> bool {
        let PortOwners::Known(pids) = self.owners_of_port(port) else {
            return false;
        };
        let mut signaled = false;
        for pid in pids {
            match terminate_pid(pid) {
                Ok(()) => {
                    debug!("signaled pid {pid} listening on port {port}");
                    signaled = true;
                }
                Err(err) => warn!("failed to terminate pid {pid} on port {port}: {err}"),
            }
        }
        signaled
    }
}

fn spawn_failure(tool: &'static str, err: io::Error) -> ProbeFailure {
    if err.kind() == io::ErrorKind::NotFound {
        ProbeFailure::ToolMissing(tool)
    } else {
        ProbeFailure::Failed(format!("failed to run {tool}: {err}"))
    }
}

/// `lsof -t` prints one PID per line; anything else is noise.
fn parse_lsof_pids(output: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for line in output.lines() {
        if let Ok(pid) = line.trim().parse::<u32>() {
            if pid != 0 && !pids.contains(&pid) {
                pids.push(pid);
            }
        }
    }
    pids
}

pub fn is_port_reachable(port: u16) -> bool {
    TcpStream::connect_timeout(
        &SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        Duration::from_millis(60),
    )
    .is_ok()
        || TcpStream::connect_timeout(
            &SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port),
            Duration::from_millis(60),
        )
        .is_ok()
}
