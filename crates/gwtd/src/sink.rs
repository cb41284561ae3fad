use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use gwtd_types::Role;
use tracing::warn;

/// Destination for per-process output. Writes never fail the caller.
pub trait LogSink {
    fn append(&mut self, key: &str, role: Role, line: &str);

    /// Recent content for display, when the sink keeps any.
    fn excerpt(&self, _key: &str, _role: Role, _tail: Option<usize>) -> Option<LogExcerpt> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogExcerpt {
    pub path: String,
    pub content: String,
}

/// Appends to `<root>/<project>/<role>.log`.
pub struct FileLogSink {
    root: PathBuf,
    files: HashMap<PathBuf, File>,
}

impl FileLogSink {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            files: HashMap::new(),
        }
    }

    pub fn log_file_path(&self, key: &str, role: Role) -> PathBuf {
        self.root
            .join(sanitize_log_component(key))
            .join(format!("{}.log", role.as_str()))
    }

    fn open(&mut self, path: &Path) -> std::io::Result<&mut File> {
        if !self.files.contains_key(path) {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.files.insert(path.to_path_buf(), file);
        }
        self.files
            .get_mut(path)
            .ok_or_else(|| std::io::Error::other("log file handle vanished"))
    }
}

impl LogSink for FileLogSink {
    fn append(&mut self, key: &str, role: Role, line: &str) {
        let path = self.log_file_path(key, role);
        let result = self
            .open(&path)
            .and_then(|file| writeln!(file, "{line}"));
        if let Err(err) = result {
            warn!("failed to write log {}: {err}", path.display());
            self.files.remove(&path);
        }
    }

    fn excerpt(&self, key: &str, role: Role, tail: Option<usize>) -> Option<LogExcerpt> {
        let path = self.log_file_path(key, role);
        let content = fs::read_to_string(&path).ok()?;
        let content = match tail {
            Some(count) => tail_lines(&content, count),
            None => content,
        };
        Some(LogExcerpt {
            path: path.to_string_lossy().to_string(),
            content,
        })
    }
}

fn tail_lines(content: &str, count: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(count);
    let mut output = lines[start..].join("\n");
    if !output.is_empty() {
        output.push('\n');
    }
    output
}

pub fn sanitize_log_component(raw: &str) -> String {
    let mut output = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            output.push(ch);
        } else {
            output.push('_');
        }
    }
    let trimmed = output.trim_matches('_');
    if trimmed.is_empty() {
        "project".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every appended line; clones share the same buffer.
    #[derive(Clone, Default)]
    pub struct MemoryLogSink {
        lines: Arc<Mutex<Vec<(String, Role, String)>>>,
    }

    impl MemoryLogSink {
        pub fn lines_for(&self, key: &str, role: Role) -> Vec<String> {
            self.lines
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, r, _)| k == key && *r == role)
                .map(|(_, _, line)| line.clone())
                .collect()
        }
    }

    impl LogSink for MemoryLogSink {
        fn append(&mut self, key: &str, role: Role, line: &str) {
            self.lines
                .lock()
                .unwrap()
                .push((key.to_string(), role, line.to_string()));
        }

        fn excerpt(&self, key: &str, role: Role, _tail: Option<usize>) -> Option<LogExcerpt> {
            let lines = self.lines_for(key, role);
            if lines.is_empty() {
                return None;
            }
            Some(LogExcerpt {
                path: format!("memory://{key}/{role}"),
                content: lines.join("\n"),
            })
        }
    }
}
