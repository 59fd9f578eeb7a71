//! # fleetssh - parallel SSH execution engine
//!
//! `fleetssh` fans a command, or a file transfer, out to many hosts at once
//! and multiplexes their output back to one console. It is built around a
//! small set of composable pieces: a bounded [`dispatcher::Dispatcher`] worker
//! pool, per-host [`session::PerHostSession`] exec state machines, a
//! [`stream_buffer::StreamBuffer`]/[`console::Console`] output pipeline, and
//! [`auth::AuthManager`]/[`known_hosts`] for credentials and host-key trust.
//! [`cluster::Cluster`] ties these together into the orchestration surface
//! most callers use directly.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fleetssh::auth::{AuthManager, Credential};
//! use fleetssh::cluster::{Cluster, HostSpec, OutputMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut auth = AuthManager::new();
//!     auth.add(Credential::password("admin", "hunter2"));
//!
//!     let hosts = vec![
//!         HostSpec::new("core-sw1", "10.0.0.1", 22),
//!         HostSpec::new("core-sw2", "10.0.0.2", 22),
//!     ];
//!
//!     let mut cluster = Cluster::new(hosts, auth, OutputMode::Stream);
//!     cluster.connect().await?;
//!     let results = cluster.run_command("show version").await?;
//!     for (label, summary) in results {
//!         println!("{label}: {}", summary.status);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`dispatcher::Dispatcher`] - bounded async worker pool with stalled-job detection
//! - [`session::PerHostSession`] - one-shot exec / persistent-shell state machine
//! - [`stream_buffer::StreamBuffer`] / [`console::Console`] - per-host output pipeline
//! - [`known_hosts`] - OpenSSH-compatible host-key trust store
//! - [`auth::AuthManager`] - ordered, host-scoped credential chain
//! - [`options::SshOptions`] - layered OpenSSH-style option composition
//! - [`cluster::Cluster`] - top-level orchestration: connect, run, sftp, enable, reauth
//! - [`transport`] - the live `russh`-backed [`session::ExecTransport`]/[`cluster::Connector`] implementation
//! - [`logdir`] - persisted per-session log directory
//! - [`error`] - per-subsystem error types
//! - [`config`] - ambient defaults and SSH algorithm policy

pub mod auth;
pub mod cluster;
pub mod config;
pub mod console;
pub mod dispatcher;
pub mod error;
pub mod known_hosts;
pub mod logdir;
pub mod options;
pub mod pkcs;
pub mod session;
pub mod stream_buffer;
pub mod transport;
