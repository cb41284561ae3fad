//! Advisory classification of abnormal process exits.

use std::fmt;

/// Most likely cause of a failed build or server run, judged from its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remedy {
    MissingRuntime,
    PortInUse,
    OutOfMemory,
    DependencyResolution,
    CompilationFailure,
    Unknown,
}

impl Remedy {
    pub const fn summary(self) -> &'static str {
        match self {
            Remedy::MissingRuntime => "Java runtime not found",
            Remedy::PortInUse => "port already in use",
            Remedy::OutOfMemory => "out of memory",
            Remedy::DependencyResolution => "dependency resolution failed",
            Remedy::CompilationFailure => "compilation failed",
            Remedy::Unknown => "unknown failure",
        }
    }
}

impl fmt::Display for Remedy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.summary())
    }
}

/// First match wins; the order matters when output mentions several causes.
pub fn classify(output: &str, java_home_set: bool) -> Remedy {
    if output.contains("no java executable found")
        || (java_home_set && output.contains("No such file or directory"))
    {
        Remedy::MissingRuntime
    } else if output.contains("Address already in use")
        || output.contains("Port is already in use")
        || output.contains("BindException")
    {
        Remedy::PortInUse
    } else if output.contains("OutOfMemoryError") || output.contains("PermGen space") {
        Remedy::OutOfMemory
    } else if output.contains("Failed to resolve artifact")
        || output.contains("Could not resolve dependencies")
    {
        Remedy::DependencyResolution
    } else if output.contains("Compilation failure") {
        Remedy::CompilationFailure
    } else {
        Remedy::Unknown
    }
}

/// What the failed process was, so suggestions can name it.
pub struct FailureContext<'a> {
    pub java_home: Option<&'a str>,
    pub directory: &'a str,
    pub command_line: &'a str,
}

pub fn suggestions(remedy: Remedy, context: &FailureContext<'_>) -> Vec<String> {
    match remedy {
        Remedy::MissingRuntime => {
            let mut lines = vec!["Java executable not found.".to_string()];
            match context.java_home {
                Some(home) => {
                    lines.push(format!("Check that JAVA_HOME points to a JDK: {home}"));
                    lines.push(format!("Expected to find {home}/bin/java"));
                }
                None => lines.push(
                    "Set java_home in .gwtd.toml or GWTD_JAVA_HOME, or put java on PATH."
                        .to_string(),
                ),
            }
            lines
        }
        Remedy::PortInUse => vec![
            "Another process is already listening on the port.".to_string(),
            "Stop the other GWT process or kill the owner of the port, then retry.".to_string(),
        ],
        Remedy::OutOfMemory => vec![
            "The JVM ran out of memory.".to_string(),
            "Raise the heap in MAVEN_OPTS, for example MAVEN_OPTS=\"-Xmx2g\".".to_string(),
        ],
        Remedy::DependencyResolution => vec![
            "Maven could not resolve project dependencies.".to_string(),
            "Check repository access, then run: mvn dependency:resolve -U".to_string(),
        ],
        Remedy::CompilationFailure => vec![
            "Java compilation failed; see the errors above.".to_string(),
            "Fix the reported sources and start again.".to_string(),
        ],
        Remedy::Unknown => vec![
            "Try running the command manually:".to_string(),
            format!("cd \"{}\" && {}", context.directory, context.command_line),
        ],
    }
}
