//! Persisted per-session log directory: a strftime-expanded directory
//! holding one `<label>.log`/`<label>.stderr` pair per host, the combined
//! `out.log`/`err.log`, a `fleetssh.log` process log, a `session.commands`
//! transcript of every template an operator ran, and an `events.jsonl`
//! structured companion for callers that tail the session programmatically.
//!
//! Ported from RadSSH's `ssh.py` `logdir=session_%Y%m%d_%H%M%S` session
//! logging: each finished command is appended to its host's log behind a
//! `=== "<command>" <status> [<rc>] ===` banner, and mirrored (ANSI stripped)
//! into the combined logs tagged `[<label>]`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;

use crate::session::CommandResult;

/// One structured `events.jsonl` line recorded alongside the human-readable
/// per-host logs, for callers that tail the session programmatically instead
/// of scraping text.
#[derive(Debug, Serialize)]
struct CommandEvent<'a> {
    ts_ms: i64,
    label: &'a str,
    command: &'a str,
    status: &'a str,
    return_code: Option<i32>,
}

/// Expand a strftime-style template (e.g. `session_%Y%m%d_%H%M%S`) against the current local time.
pub fn expand_template(template: &str) -> String {
    Local::now().format(template).to_string()
}

/// One open session's log directory.
pub struct SessionLogDir {
    root: PathBuf,
    out_log: File,
    err_log: File,
    process_log: File,
    commands_log: File,
    events_log: File,
    host_logs: HashMap<String, File>,
    host_stderr_logs: HashMap<String, File>,
}

impl SessionLogDir {
    /// Create (or reopen) the directory named by expanding `template` against the current time.
    pub fn open(template: &str) -> std::io::Result<Self> {
        Self::open_at(&PathBuf::from(expand_template(template)))
    }

    /// Create (or reopen) the directory at the literal path `root`.
    pub fn open_at(root: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(root)?;
        Ok(SessionLogDir {
            out_log: append(root, "out.log")?,
            err_log: append(root, "err.log")?,
            process_log: append(root, "fleetssh.log")?,
            commands_log: append(root, "session.commands")?,
            events_log: append(root, "events.jsonl")?,
            root: root.to_path_buf(),
            host_logs: HashMap::new(),
            host_stderr_logs: HashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_log(&mut self, label: &str) -> std::io::Result<&mut File> {
        if !self.host_logs.contains_key(label) {
            let file = append(&self.root, &format!("{label}.log"))?;
            self.host_logs.insert(label.to_string(), file);
        }
        Ok(self.host_logs.get_mut(label).unwrap())
    }

    fn host_stderr_log(&mut self, label: &str) -> std::io::Result<&mut File> {
        if !self.host_stderr_logs.contains_key(label) {
            let file = append(&self.root, &format!("{label}.stderr"))?;
            self.host_stderr_logs.insert(label.to_string(), file);
        }
        Ok(self.host_stderr_logs.get_mut(label).unwrap())
    }

    /// Record one finished command for `label`: a banner line plus its
    /// stdout/stderr into the per-host logs, and each line mirrored into
    /// the combined `out.log`/`err.log` tagged `[<label>]`.
    pub fn record(&mut self, label: &str, command: &str, result: &CommandResult) -> std::io::Result<()> {
        let rc = result.return_code.map(|c| format!(" [{c}]")).unwrap_or_default();
        let banner = format!("=== \"{command}\" {}{} ===\n", result.status, rc);
        self.host_log(label)?.write_all(banner.as_bytes())?;

        if !result.stdout.is_empty() {
            self.host_log(label)?.write_all(result.stdout.as_bytes())?;
            for line in result.stdout.lines() {
                writeln!(self.out_log, "[{label}] {}", strip_ansi(line))?;
            }
        }
        if !result.stderr.is_empty() {
            self.host_stderr_log(label)?.write_all(result.stderr.as_bytes())?;
            for line in result.stderr.lines() {
                writeln!(self.err_log, "[{label}] {}", strip_ansi(line))?;
            }
        }
        self.out_log.flush()?;
        self.err_log.flush()?;

        let event = CommandEvent {
            ts_ms: Local::now().timestamp_millis(),
            label,
            command,
            status: &result.status,
            return_code: result.return_code,
        };
        writeln!(
            self.events_log,
            "{}",
            serde_json::to_string(&event).expect("CommandEvent serializes without error")
        )?;
        self.events_log.flush()?;
        Ok(())
    }

    /// Append one operator-entered command template to `session.commands`.
    pub fn record_command(&mut self, command: &str) -> std::io::Result<()> {
        writeln!(self.commands_log, "{command}")?;
        self.commands_log.flush()
    }

    /// Append one timestamped process-level line to `fleetssh.log`.
    pub fn record_process_event(&mut self, message: &str) -> std::io::Result<()> {
        writeln!(self.process_log, "{} {message}", Local::now().format("%Y-%m-%d %H:%M:%S"))?;
        self.process_log.flush()
    }
}

fn append(root: &Path, name: &str) -> std::io::Result<File> {
    fs::OpenOptions::new().create(true).append(true).open(root.join(name))
}

/// Strip SGR ANSI escape sequences (`\x1b[...m`) so the combined logs stay plain text.
fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for c2 in chars.by_ref() {
                if c2.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_template_substitutes_strftime_tokens() {
        let expanded = expand_template("session_%Y");
        assert!(expanded.starts_with("session_"));
        assert_eq!(expanded.len(), "session_".len() + 4);
    }

    #[test]
    fn strip_ansi_removes_color_codes() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m"), "red");
    }

    #[test]
    fn record_writes_per_host_and_combined_logs() {
        let dir = tempfile::tempdir().unwrap();
        let mut logdir = SessionLogDir::open_at(dir.path()).unwrap();
        let result = CommandResult {
            status: "*** Complete ***".to_string(),
            return_code: Some(0),
            stdout: "line one\n".to_string(),
            stderr: String::new(),
        };
        logdir.record("sw1", "show version", &result).unwrap();

        let combined = fs::read_to_string(dir.path().join("out.log")).unwrap();
        assert!(combined.contains("[sw1] line one"));
        let per_host = fs::read_to_string(dir.path().join("sw1.log")).unwrap();
        assert!(per_host.contains("show version"));
        assert!(per_host.contains("*** Complete ***"));

        let events = fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(events.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["label"], "sw1");
        assert_eq!(parsed["command"], "show version");
        assert_eq!(parsed["return_code"], 0);
    }

    #[test]
    fn record_command_and_process_event_append_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let mut logdir = SessionLogDir::open_at(dir.path()).unwrap();
        logdir.record_command("show version").unwrap();
        logdir.record_command("show interfaces").unwrap();
        logdir.record_process_event("connected to 4 hosts").unwrap();

        let commands = fs::read_to_string(dir.path().join("session.commands")).unwrap();
        assert_eq!(commands.lines().count(), 2);
        let process_log = fs::read_to_string(dir.path().join("fleetssh.log")).unwrap();
        assert!(process_log.contains("connected to 4 hosts"));
    }
}
