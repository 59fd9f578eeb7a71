//! Error types for cluster orchestration, SSH session execution, authentication,
//! and host-key verification.
//!
//! Each subsystem gets its own `thiserror` enum so call sites can match on the
//! failure kind that actually applies to them; [`Error`] aggregates all of them
//! for APIs (like [`crate::cluster::Cluster::new`](crate::cluster::Cluster::new))
//! that must return a single error type.

use thiserror::Error;

/// Errors raised while driving one command against one SSH transport.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The SSH channel was disconnected while waiting for output.
    #[error("channel disconnected while waiting for prompt")]
    ChannelDisconnect,

    /// The SSH connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Command execution timed out waiting for the channel to open.
    #[error("exec command timeout: {0}")]
    ExecTimeout(String),

    /// SSH connection initialization timed out while waiting for the initial prompt.
    #[error("connection initialization timeout: {0}")]
    InitTimeout(String),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),

    /// Failed to send a job or result through an internal channel.
    #[error("failed to send internal message: {0}")]
    SendError(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors raised by the [`crate::dispatcher::Dispatcher`] worker pool.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// `submit` was called after `terminate`.
    #[error("dispatcher has been terminated: unable to submit calls")]
    Terminated,

    /// `asyncResults(timeout)` elapsed with jobs still outstanding.
    ///
    /// This is the "stalled" signal described in the dispatcher design, not a
    /// failure: the caller may resume iteration afterwards.
    #[error("waiting on {remaining} of {total} results")]
    UnfinishedJobs {
        /// Jobs neither completed nor drained from the output channel.
        remaining: usize,
        /// Total jobs submitted since the last `wait()`.
        total: usize,
    },
}

/// Errors raised while authenticating a transport.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The key file failed to parse under any supported key type.
    #[error("unable to decode key file {0}: {1}")]
    KeyDecodeFailed(String, String),

    /// The server rejected public-key authentication outright.
    #[error("server rejected public-key authentication")]
    BadAuthenticationType,

    /// PKCS#1 OAEP decryption of a stored password failed.
    #[error("OAEP decryption failed: {0}")]
    OaepDecrypt(String),

    /// No RSA private key was available to decrypt an `EncryptedPassword`.
    #[error("no RSA private key loaded for OAEP decryption")]
    NoOaepKey,

    /// All candidate authentication methods were exhausted without success.
    #[error("authentication exhausted for user {0}")]
    Exhausted(String),

    /// ssh-agent connection, identity-listing, or signing failure.
    #[error("ssh-agent error: {0}")]
    Agent(String),

    /// An authfile line did not parse under any recognized tag.
    #[error("authfile parse error: {0}")]
    AuthfileParse(String),

    /// I/O failure reading an authfile.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Underlying transport error while attempting a method.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Errors raised while parsing or matching an OpenSSH `known_hosts` file.
#[derive(Error, Debug)]
pub enum KnownHostsError {
    /// A `@marker` line used a marker other than `@revoked`/`@cert-authority`.
    #[error("[{file}:{line}] invalid marker: {marker}")]
    InvalidMarker {
        /// Path of the offending known_hosts file.
        file: String,
        /// 1-based line number.
        line: usize,
        /// The unrecognized marker token.
        marker: String,
    },

    /// A host key is present under one known_hosts entry with a different
    /// fingerprint than the one the live transport offered.
    #[error("host {host} failed SSH key validation - conflicting entry [{file}:{line}]")]
    Conflict {
        /// Hostname (or IP) being verified.
        host: String,
        /// Path of the conflicting known_hosts file.
        file: String,
        /// 1-based line number of the conflicting entry.
        line: usize,
    },

    /// No known_hosts entry matched and `StrictHostKeyChecking=yes`.
    #[error("missing known_hosts entry for: {0}")]
    Missing(String),

    /// The operator declined to accept a newly seen host key.
    #[error("declined host key for {0} - aborting connection")]
    Declined(String),

    /// I/O failure reading or writing a known_hosts file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while composing or reading an [`crate::options::SshOptions`] chain.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required configuration key was missing.
    #[error("missing required configuration key: {0}")]
    MissingKey(String),

    /// A configuration value could not be parsed into its expected type.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Offending key.
        key: String,
        /// Offending raw value.
        value: String,
    },

    /// I/O failure reading a configuration or `ssh_config`-style file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Aggregate crate-level error, used where callers need one error type across
/// subsystem boundaries (cluster construction, CLI-style entry points).
#[derive(Error, Debug)]
pub enum Error {
    /// A session-level failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A dispatcher-level failure.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// An authentication failure.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A known_hosts failure.
    #[error(transparent)]
    KnownHosts(#[from] KnownHostsError),

    /// A configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
