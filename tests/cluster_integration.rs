//! End-to-end exercise of `Cluster` against a scripted fake transport: the
//! orchestration pieces (chunking, template substitution, enable/disable,
//! per-host result aggregation) driven without any live network I/O.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetssh::auth::AuthManager;
use fleetssh::cluster::{Cluster, Connector, HostSpec, OutputMode};
use fleetssh::error::{Error, SessionError};
use fleetssh::session::ExecTransport;

struct ScriptedTransport {
    lines: Vec<Vec<u8>>,
    exit_code: i32,
}

#[async_trait]
impl ExecTransport for ScriptedTransport {
    fn is_authenticated(&self) -> bool {
        true
    }
    fn has_persistent_shell(&self) -> bool {
        false
    }
    async fn send(&mut self, _bytes: &[u8]) -> Result<(), SessionError> {
        Ok(())
    }
    async fn recv_stdout(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>, SessionError> {
        Ok(self.lines.pop())
    }
    async fn recv_stderr(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>, SessionError> {
        Ok(None)
    }
    fn exit_status(&self) -> Option<i32> {
        if self.lines.is_empty() {
            Some(self.exit_code)
        } else {
            None
        }
    }
    async fn send_keepalive(&mut self) -> Result<bool, SessionError> {
        Ok(true)
    }
    async fn close(&mut self) {}
}

struct ScriptedConnector;

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect_and_auth(
        &self,
        spec: &HostSpec,
        _auth: &AuthManager,
    ) -> Result<(Box<dyn ExecTransport>, String, String), Error> {
        if spec.label == "unreachable" {
            return Err(SessionError::ConnectionClosed.into());
        }
        let transport = ScriptedTransport {
            // recv_stdout pops from the end, so list lines last-to-first.
            lines: vec![b"System uptime: 3 days\n".to_vec(), b"Version: 15.1\n".to_vec()],
            exit_code: 0,
        };
        Ok((Box::new(transport), "SSH-2.0-scripted".to_string(), spec.host.clone()))
    }
}

#[tokio::test]
async fn run_command_collects_per_host_results_and_skips_disabled_hosts() {
    let hosts = vec![
        HostSpec::new("sw1", "10.1.0.1", 22),
        HostSpec::new("sw2", "10.1.0.2", 22),
        HostSpec::new("unreachable", "10.1.0.3", 22),
    ];
    let mut cluster = Cluster::with_connector(hosts, AuthManager::new(), OutputMode::Stream, Arc::new(ScriptedConnector));

    let progress = cluster.connect().await.unwrap();
    assert_eq!(progress, "..X");

    cluster.enable(Some(&["sw1".to_string(), "sw2".to_string()]));
    let results = cluster.run_command("show version").await.unwrap();

    assert_eq!(results.len(), 2);
    let sw1 = results.get("sw1").unwrap();
    assert_eq!(sw1.status, "*** Complete ***");
    assert_eq!(sw1.return_code, Some(0));
    assert!(sw1.stdout.contains("System uptime"));
    assert!(results.get("unreachable").is_none());
}

#[tokio::test]
async fn connect_marks_unreachable_hosts_failed_without_blocking_others() {
    let hosts = vec![HostSpec::new("unreachable", "10.1.0.3", 22), HostSpec::new("sw1", "10.1.0.1", 22)];
    let mut cluster = Cluster::with_connector(hosts, AuthManager::new(), OutputMode::Off, Arc::new(ScriptedConnector));
    let progress = cluster.connect().await.unwrap();
    assert_eq!(progress, "X.");
}
