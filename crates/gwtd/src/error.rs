use gwtd_types::Role;
use std::io;
use thiserror::Error;

/// The external process could not be started at all.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("executable '{program}' not found")]
    NotFound { program: String },

    #[error("failed to spawn '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl SpawnError {
    pub fn from_io(program: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            SpawnError::NotFound {
                program: program.to_string(),
            }
        } else {
            SpawnError::Io {
                program: program.to_string(),
                source,
            }
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            SpawnError::NotFound { .. } => Some("make sure Maven is installed and on PATH"),
            SpawnError::Io { .. } => None,
        }
    }
}

/// Domain failures of lifecycle operations, each terminal at the orchestrator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("project '{key}' is not registered")]
    UnknownProject { key: String },

    #[error("project '{key}' does not support {role}")]
    UnsupportedRole { key: String, role: Role },

    #[error("{} is already running for '{key}'", .role.label())]
    StartConflict { key: String, role: Role },

    #[error("no {} process to stop for '{key}'", .role.label())]
    NothingToStop { key: String, role: Role },

    #[error("no known port for {} of '{key}'", .role.label())]
    NoKnownPort { key: String, role: Role },

    #[error(
        "port {port} is still held by a process that cannot be identified ({reason}); \
         {} state kept for '{key}'",
        .role.label()
    )]
    PortStillHeld {
        key: String,
        role: Role,
        port: u16,
        reason: String,
    },

    #[error("failed to start {} for '{key}': {message}", .role.label())]
    SpawnFailure {
        key: String,
        role: Role,
        message: String,
        hint: Option<String>,
    },
}

impl LifecycleError {
    /// Message with the remediation hint appended, for user-facing output.
    pub fn user_message(&self) -> String {
        match self {
            LifecycleError::SpawnFailure {
                hint: Some(hint), ..
            } => format!("{self} ({hint})"),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_executable_gets_install_hint() {
        let err = SpawnError::from_io("mvn", io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(err.to_string(), "executable 'mvn' not found");
        assert_eq!(err.hint(), Some("make sure Maven is installed and on PATH"));

        let denied = SpawnError::from_io("mvn", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(denied.hint().is_none());
    }

    #[test]
    fn spawn_failure_message_includes_hint() {
        let err = LifecycleError::SpawnFailure {
            key: "/ws/pom.xml".to_string(),
            role: Role::Devmode,
            message: "executable 'mvn' not found".to_string(),
            hint: Some("make sure Maven is installed and on PATH".to_string()),
        };
        assert_eq!(
            err.user_message(),
            "failed to start DevMode for '/ws/pom.xml': executable 'mvn' not found \
             (make sure Maven is installed and on PATH)"
        );
    }

    #[test]
    fn held_port_message_names_port_and_reason() {
        let err = LifecycleError::PortStillHeld {
            key: "/ws/pom.xml".to_string(),
            role: Role::Codeserver,
            port: 9876,
            reason: "lsof is not installed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "port 9876 is still held by a process that cannot be identified \
             (lsof is not installed); CodeServer state kept for '/ws/pom.xml'"
        );
    }
}
