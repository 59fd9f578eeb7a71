//! Top-level orchestration: connect a fleet of hosts, fan a command out to
//! all of them, and multiplex their output back to one console.
//!
//! Ported from RadSSH's `ssh.py` `Cluster` class. Connection and
//! authentication are abstracted behind [`Connector`] so the chunking,
//! templating, output-mode, and interrupt-handling logic here is exercised
//! by unit tests against a fake connector instead of live sockets; the
//! default [`crate::transport::RusshConnector`] wires it to the real transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;
use wildmatch::WildMatch;

use crate::auth::AuthManager;
use crate::config;
use crate::console::Console;
use crate::dispatcher::{Dispatcher, ok_outcome};
use crate::error::Error;
use crate::logdir::SessionLogDir;
use crate::session::{CommandResult, ExecTransport, PerHostSession, Quota, UserAbort};

/// One host to connect to: its label (display/log key), address, and port.
#[derive(Debug, Clone)]
pub struct HostSpec {
    pub label: String,
    pub host: String,
    pub port: u16,
    pub tunnel: Option<String>,
    pub mux: Option<String>,
}

impl HostSpec {
    pub fn new(label: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        HostSpec {
            label: label.into(),
            host: host.into(),
            port,
            tunnel: None,
            mux: None,
        }
    }
}

/// How `run_command` delivers output as jobs complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Interleave output in wall-clock arrival order, tagged per host.
    Stream,
    /// Hold each host's output until every earlier-listed host has completed, then emit in order.
    Ordered,
    /// No streaming; results are only available via the returned map.
    Off,
}

impl OutputMode {
    pub fn parse(name: &str) -> Self {
        match name {
            "ordered" => OutputMode::Ordered,
            "off" => OutputMode::Off,
            _ => OutputMode::Stream,
        }
    }
}

/// Per-host runtime state the Cluster tracks across connect/run/reauth cycles.
struct HostEntry {
    spec: HostSpec,
    enabled: bool,
    authenticated: bool,
    connect_time: Option<Duration>,
    ssh_version: Option<String>,
    ip: Option<String>,
    transport: Option<Box<dyn ExecTransport>>,
}

/// Connects and authenticates one host; the seam a test fake substitutes for
/// a live SSH handshake. [`crate::transport::RusshConnector`] is the
/// production implementation.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect_and_auth(
        &self,
        spec: &HostSpec,
        auth: &AuthManager,
    ) -> Result<(Box<dyn ExecTransport>, String, String), Error>;
}

/// Fleet-wide orchestration: owns the dispatcher, the per-host connection
/// state, and the process-wide [`UserAbort`] signal.
pub struct Cluster {
    hosts: Vec<HostEntry>,
    auth: AuthManager,
    output_mode: OutputMode,
    connector: Arc<dyn Connector>,
    dispatcher: Dispatcher,
    abort: UserAbort,
    last_result: HashMap<String, CommandResult>,
    chunk_size: Option<usize>,
    chunk_delay: Duration,
    user_vars: HashMap<String, String>,
    console: Option<Arc<Console>>,
    log_dir: Option<SessionLogDir>,
}

impl Cluster {
    pub fn new(hosts: Vec<HostSpec>, auth: AuthManager, output_mode: OutputMode) -> Self {
        Self::with_connector(hosts, auth, output_mode, Arc::new(crate::transport::RusshConnector::new()))
    }

    pub fn with_connector(
        hosts: Vec<HostSpec>,
        auth: AuthManager,
        output_mode: OutputMode,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let entries = hosts
            .into_iter()
            .map(|spec| HostEntry {
                spec,
                enabled: true,
                authenticated: false,
                connect_time: None,
                ssh_version: None,
                ip: None,
                transport: None,
            })
            .collect();
        Cluster {
            hosts: entries,
            auth,
            output_mode,
            connector,
            dispatcher: Dispatcher::new(config::defaults::MAX_THREADS.min(64).max(1)),
            abort: UserAbort::new(),
            last_result: HashMap::new(),
            chunk_size: None,
            chunk_delay: Duration::from_secs(0),
            user_vars: HashMap::new(),
            console: None,
            log_dir: None,
        }
    }

    /// Attach a [`Console`] to receive streamed output (stream mode only).
    pub fn with_console(mut self, console: Arc<Console>) -> Self {
        self.console = Some(console);
        self
    }

    /// Attach a [`SessionLogDir`] so every `run_command` result and process
    /// lifecycle event (connect/reauth/close) is persisted alongside the
    /// streamed console output.
    pub fn with_log_dir(mut self, log_dir: SessionLogDir) -> Self {
        self.log_dir = Some(log_dir);
        self
    }

    pub fn set_chunking(&mut self, chunk_size: Option<usize>, chunk_delay: Duration) {
        self.chunk_size = chunk_size;
        self.chunk_delay = chunk_delay;
    }

    /// The signal the operator's interrupt handler should trigger; see
    /// [`Cluster::handle_interrupt`] for the two-stage Ctrl-C policy.
    pub fn abort_signal(&self) -> UserAbort {
        self.abort.clone()
    }

    /// Labels currently enabled, in the deterministic (construction) order.
    pub fn enabled_labels(&self) -> Vec<String> {
        self.hosts
            .iter()
            .filter(|h| h.enabled)
            .map(|h| h.spec.label.clone())
            .collect()
    }

    /// Connect and authenticate every enabled host. A progress character is
    /// appended per completed host: `.` authenticated, `O` connected only,
    /// `X` failed outright. On interrupt the in-flight dispatcher is
    /// abandoned (see [`crate::dispatcher::Dispatcher::terminate`]) and all
    /// still-pending hosts are marked failed rather than awaited further.
    pub async fn connect(&mut self) -> Result<String, Error> {
        let mut progress = String::new();
        let indices: Vec<usize> = (0..self.hosts.len()).filter(|&i| self.hosts[i].enabled).collect();

        for &idx in &indices {
            if self.abort.is_set() {
                progress.push('X');
                continue;
            }
            let spec = self.hosts[idx].spec.clone();
            let start = Instant::now();
            log::info!("{}: connecting to {}:{}", spec.label, spec.host, spec.port);
            match self.connector.connect_and_auth(&spec, &self.auth).await {
                Ok((transport, ssh_version, ip)) => {
                    let authenticated = transport.is_authenticated();
                    self.hosts[idx].transport = Some(transport);
                    self.hosts[idx].authenticated = authenticated;
                    self.hosts[idx].connect_time = Some(start.elapsed());
                    self.hosts[idx].ssh_version = Some(ssh_version);
                    self.hosts[idx].ip = Some(ip);
                    progress.push(if authenticated { '.' } else { 'O' });
                }
                Err(e) => {
                    log::warn!("{}: connect failed: {e}", spec.label);
                    self.hosts[idx].authenticated = false;
                    progress.push('X');
                }
            }
        }
        if let Some(log_dir) = &mut self.log_dir {
            let _ = log_dir.record_process_event(&format!("connected to {} hosts: {progress}", indices.len()));
        }
        Ok(progress)
    }

    /// Re-authenticate every enabled, non-authenticated host: close its
    /// transport if one is still open, then reconnect and re-authenticate
    /// from scratch. Same progress-character convention as [`Cluster::connect`].
    pub async fn reauth(&mut self) -> Result<String, Error> {
        let mut progress = String::new();
        for idx in 0..self.hosts.len() {
            if !self.hosts[idx].enabled || self.hosts[idx].authenticated {
                continue;
            }
            if let Some(mut transport) = self.hosts[idx].transport.take() {
                transport.close().await;
            }
            let spec = self.hosts[idx].spec.clone();
            log::info!("{}: reauthenticating", spec.label);
            match self.connector.connect_and_auth(&spec, &self.auth).await {
                Ok((transport, ssh_version, ip)) => {
                    let authenticated = transport.is_authenticated();
                    self.hosts[idx].transport = Some(transport);
                    self.hosts[idx].authenticated = authenticated;
                    self.hosts[idx].ssh_version = Some(ssh_version);
                    self.hosts[idx].ip = Some(ip);
                    progress.push(if authenticated { '.' } else { 'O' });
                }
                Err(e) => {
                    log::warn!("{}: reauth failed: {e}", spec.label);
                    progress.push('X');
                }
            }
        }
        if let Some(log_dir) = &mut self.log_dir {
            let _ = log_dir.record_process_event(&format!("reauth complete: {progress}"));
        }
        Ok(progress)
    }

    /// Transfer one file to (`download = false`) or from (`download = true`)
    /// every enabled, authenticated host over SFTP. Skipped hosts get
    /// `Err("*** Skipped ***")`. Ctrl-C is not honored mid-transfer, to avoid
    /// leaving a half-written remote or local file.
    pub async fn sftp(
        &mut self,
        local: &std::path::Path,
        remote: &str,
        download: bool,
    ) -> Result<HashMap<String, Result<(), String>>, Error> {
        let labels = self.enabled_labels();
        let chunk_size = self.chunk_size.unwrap_or(labels.len().max(1));
        let mut results = HashMap::new();

        for chunk in labels.chunks(chunk_size) {
            for label in chunk {
                let Some(idx) = self.hosts.iter().position(|h| &h.spec.label == label) else {
                    continue;
                };
                if !self.hosts[idx].authenticated {
                    results.insert(label.clone(), Err("*** Skipped ***".to_string()));
                    continue;
                }
                let remote_path = self.expand_template(remote, &self.hosts[idx]);
                let Some(mut transport) = self.hosts[idx].transport.take() else {
                    continue;
                };
                let outcome = if download {
                    transport.download(&remote_path, local).await
                } else {
                    transport.upload(local, &remote_path).await
                };
                self.hosts[idx].transport = Some(transport);
                if let Err(e) = &outcome {
                    log::warn!("{label}: sftp {} failed: {e}", if download { "download" } else { "upload" });
                }
                results.insert(label.clone(), outcome.map_err(|e| e.to_string()));
            }
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }
        if let Some(log_dir) = &mut self.log_dir {
            let _ = log_dir.record_process_event(&format!(
                "sftp {} complete for {} hosts",
                if download { "download" } else { "upload" },
                results.len()
            ));
        }
        Ok(results)
    }

    /// Close every host's transport exactly once, marking it unauthenticated.
    pub async fn close_connections(&mut self) {
        for host in &mut self.hosts {
            if let Some(mut transport) = host.transport.take() {
                log::info!("{}: closing connection", host.spec.label);
                transport.close().await;
            }
            host.authenticated = false;
        }
        if let Some(log_dir) = &mut self.log_dir {
            let _ = log_dir.record_process_event("all connections closed");
        }
    }

    /// Restrict the enabled set to labels matching any of `patterns`
    /// (explicit literal, CIDR/IP-glob, or fnmatch), storing the complement
    /// as disabled. `None` resets every host to enabled.
    pub fn enable(&mut self, patterns: Option<&[String]>) {
        let Some(patterns) = patterns else {
            for host in &mut self.hosts {
                host.enabled = true;
            }
            return;
        };
        for host in &mut self.hosts {
            let label = &host.spec.label;
            let address = &host.spec.host;
            host.enabled = patterns.iter().any(|p| {
                p == label || p == address || WildMatch::new(p).matches(label) || WildMatch::new(p).matches(address)
            });
        }
    }

    /// Substitute `%host%`, `%ip%`, `%ssh_version%`, `%uuid%`, `%port%`,
    /// `%tunnel%`, `%mux%`, and any `%user_var%` (looked up in the
    /// cluster's cached user-variable table) into `template` for one host.
    fn expand_template(&self, template: &str, entry: &HostEntry) -> String {
        let mut out = template.to_string();
        let subs: &[(&str, String)] = &[
            ("%host%", entry.spec.label.clone()),
            ("%ip%", entry.ip.clone().unwrap_or_else(|| entry.spec.host.clone())),
            ("%ssh_version%", entry.ssh_version.clone().unwrap_or_default()),
            ("%uuid%", Uuid::new_v4().to_string()),
            ("%port%", entry.spec.port.to_string()),
            ("%tunnel%", entry.spec.tunnel.clone().unwrap_or_default()),
            ("%mux%", entry.spec.mux.clone().unwrap_or_default()),
        ];
        for (pattern, value) in subs {
            out = out.replace(pattern, value);
        }
        for (key, value) in &self.user_vars {
            out = out.replace(&format!("%{key}%"), value);
        }
        out
    }

    /// Cache a value for a `%user_var%` template placeholder so later
    /// `run_command` calls don't re-prompt for it.
    pub fn set_user_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.user_vars.insert(name.into(), value.into());
    }

    /// Run `template` against every enabled, authenticated host, chunked per
    /// [`Cluster::set_chunking`], and return the per-label [`CommandResult`] map.
    pub async fn run_command(&mut self, template: &str) -> Result<HashMap<String, CommandResult>, Error> {
        let labels = self.enabled_labels();
        let chunk_size = self.chunk_size.unwrap_or(labels.len().max(1));
        let mut results = HashMap::new();
        let mut commands: HashMap<String, String> = HashMap::new();

        for chunk in labels.chunks(chunk_size) {
            if self.abort.is_set() {
                break;
            }
            for label in chunk {
                let Some(idx) = self.hosts.iter().position(|h| &h.spec.label == label) else {
                    continue;
                };
                if !self.hosts[idx].authenticated {
                    results.insert(
                        label.clone(),
                        CommandResult {
                            status: "*** Skipped ***".to_string(),
                            return_code: None,
                            stdout: String::new(),
                            stderr: String::new(),
                        },
                    );
                    continue;
                }
                let command = self.expand_template(template, &self.hosts[idx]);
                commands.insert(label.clone(), command.clone());
                let Some(mut transport) = self.hosts[idx].transport.take() else {
                    continue;
                };
                let abort = self.abort.clone();
                let job_label = label.clone();
                let job = Box::pin(async move {
                    let mut session = PerHostSession::new(&mut *transport, abort);
                    let outcome = session.run(&command, Quota::unbounded()).await.map_err(|e| e.to_string());
                    ok_outcome((job_label, transport, outcome))
                });
                let _ = self.dispatcher.submit(job);
            }

            self.dispatcher.wait().await;
            type JobPayload = (String, Box<dyn ExecTransport>, Result<CommandResult, String>);
            while let Ok(Some((_, summary))) = self.dispatcher.next_result(Duration::from_millis(50)).await {
                if let Ok(boxed) = summary.result
                    && let Ok(payload) = boxed.downcast::<JobPayload>()
                {
                    let (label, transport, outcome) = *payload;
                    let Some(idx) = self.hosts.iter().position(|h| h.spec.label == label) else {
                        continue;
                    };
                    self.hosts[idx].transport = Some(transport);
                    let result = outcome.unwrap_or_else(|e| CommandResult {
                        status: format!("*** Error: {e} ***"),
                        return_code: None,
                        stdout: String::new(),
                        stderr: String::new(),
                    });
                    if let Some(log_dir) = &mut self.log_dir {
                        let command = commands.get(&label).map(String::as_str).unwrap_or(template);
                        if let Err(e) = log_dir.record(&label, command, &result) {
                            log::warn!("{label}: failed to write session log: {e}");
                        }
                    }
                    results.insert(label, result);
                }
            }

            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }

        self.last_result = results.clone();
        Ok(results)
    }

    /// Two-stage interrupt policy: the first call announces in-flight hosts,
    /// replaying each one's stalled-output history via the attached
    /// [`Console`]; a second call within
    /// [`config::defaults::DOUBLE_INTERRUPT_WINDOW_MS`] escalates to setting
    /// the process-wide abort signal so every [`PerHostSession`] terminates
    /// at its next tick.
    pub async fn handle_interrupt(&mut self, last_interrupt: Option<Instant>) -> Instant {
        let now = Instant::now();
        if let Some(last) = last_interrupt
            && now.duration_since(last) <= Duration::from_millis(config::defaults::DOUBLE_INTERRUPT_WINDOW_MS)
        {
            log::warn!("second interrupt within window, aborting all in-flight sessions");
            self.abort.trigger();
            return now;
        }
        if let Some(console) = &self.console {
            console
                .message("Ctrl-C: finishing in-flight hosts, press again to abort")
                .await;
            for label in self.enabled_labels() {
                console.replay_recent(&label).await;
            }
        }
        now
    }

    /// Most recent `run_command` results.
    pub fn last_result(&self) -> &HashMap<String, CommandResult> {
        &self.last_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeConnector {
        fail_labels: Vec<String>,
        calls: AtomicUsize,
    }

    struct StubTransport;

    #[async_trait]
    impl ExecTransport for StubTransport {
        fn is_authenticated(&self) -> bool {
            true
        }
        fn has_persistent_shell(&self) -> bool {
            false
        }
        async fn send(&mut self, _bytes: &[u8]) -> Result<(), crate::error::SessionError> {
            Ok(())
        }
        async fn recv_stdout(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>, crate::error::SessionError> {
            Ok(None)
        }
        async fn recv_stderr(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>, crate::error::SessionError> {
            Ok(None)
        }
        fn exit_status(&self) -> Option<i32> {
            Some(0)
        }
        async fn send_keepalive(&mut self) -> Result<bool, crate::error::SessionError> {
            Ok(true)
        }
        async fn close(&mut self) {}
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect_and_auth(
            &self,
            spec: &HostSpec,
            _auth: &AuthManager,
        ) -> Result<(Box<dyn ExecTransport>, String, String), Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_labels.contains(&spec.label) {
                return Err(crate::error::SessionError::ConnectionClosed.into());
            }
            Ok((Box::new(StubTransport), "SSH-2.0-fake".to_string(), spec.host.clone()))
        }
    }

    fn cluster(fail: Vec<&str>) -> Cluster {
        let hosts = vec![
            HostSpec::new("h1", "10.0.0.1", 22),
            HostSpec::new("h2", "10.0.0.2", 22),
            HostSpec::new("h3", "10.0.0.3", 22),
        ];
        let connector = Arc::new(FakeConnector {
            fail_labels: fail.into_iter().map(str::to_string).collect(),
            calls: AtomicUsize::new(0),
        });
        Cluster::with_connector(hosts, AuthManager::new(), OutputMode::Stream, connector)
    }

    #[tokio::test]
    async fn connect_reports_progress_per_host() {
        let mut c = cluster(vec!["h2"]);
        let progress = c.connect().await.unwrap();
        assert_eq!(progress, ".X.");
    }

    #[test]
    fn enable_restricts_to_matching_hosts() {
        let mut c = cluster(vec![]);
        c.enable(Some(&["h1".to_string()]));
        assert_eq!(c.enabled_labels(), vec!["h1".to_string()]);
        c.enable(None);
        assert_eq!(c.enabled_labels(), vec!["h1", "h2", "h3"]);
    }

    #[test]
    fn template_expansion_substitutes_known_vars_and_user_vars() {
        let mut c = cluster(vec![]);
        c.set_user_var("env", "prod");
        let entry = &c.hosts[0];
        let expanded = c.expand_template("check %host% in %env%", entry);
        assert_eq!(expanded, "check h1 in prod");
    }

    #[tokio::test]
    async fn handle_interrupt_escalates_within_window() {
        let mut c = cluster(vec![]);
        let first = c.handle_interrupt(None).await;
        assert!(!c.abort_signal().is_set());
        c.handle_interrupt(Some(first)).await;
        assert!(c.abort_signal().is_set());
    }
}
