//! Credential storage and per-host authentication ordering.
//!
//! Ported from RadSSH's `authmgr.py`: an [`AuthManager`] holds an ordered list
//! of [`Credential`]s, each scoped to an optional CIDR/glob host filter, and
//! hands a connecting session the subset that apply to its host in the order
//! they were registered. A password credential may be stored OAEP-encrypted
//! (see [`crate::pkcs::OaepDecoder`]) so the cleartext never sits in memory
//! until the moment it's tried.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use ipnet::IpNet;
use wildmatch::WildMatch;

use crate::config::defaults::FORCE10_PASSWORD_RETRY_CAP;
use crate::error::AuthError;
use crate::pkcs::OaepDecoder;

/// One host filter: a glob over hostnames, a CIDR block, or "matches everything".
#[derive(Debug, Clone)]
pub enum HostFilter {
    Any,
    Glob(String),
    Cidr(IpNet),
}

impl HostFilter {
    /// Parse a filter spec: an IP/CIDR literal if it parses as one, else a glob pattern.
    pub fn parse(spec: &str) -> Self {
        if let Ok(net) = IpNet::from_str(spec) {
            return HostFilter::Cidr(net);
        }
        if let Ok(addr) = IpAddr::from_str(spec) {
            return HostFilter::Cidr(IpNet::from(addr));
        }
        HostFilter::Glob(spec.to_string())
    }

    /// Whether `host` (a hostname or address literal) matches this filter.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostFilter::Any => true,
            HostFilter::Glob(pattern) => WildMatch::new(pattern).matches(host),
            HostFilter::Cidr(net) => host
                .parse::<IpAddr>()
                .map(|addr| net.contains(&addr))
                .unwrap_or(false),
        }
    }
}

/// A single candidate secret: a key file, an agent reference, or a password
/// (cleartext or OAEP-encrypted pending decryption).
#[derive(Clone)]
pub enum Secret {
    /// Path to a private key file plus optional passphrase.
    KeyFile {
        path: String,
        passphrase: Option<String>,
    },
    /// Cleartext password, tried via `password` or `keyboard-interactive`.
    Password(String),
    /// Base64 RSAES-OAEP/SHA-1 ciphertext, decrypted lazily via a shared [`OaepDecoder`].
    EncryptedPassword {
        ciphertext_b64: String,
        decoder: Arc<OaepDecoder>,
    },
    /// An identity to request from a running `ssh-agent`, matched against
    /// the agent's loaded identities by base64 public key blob.
    AgentKey { public_key_blob_b64: String },
}

/// One registered credential: a secret plus the hosts it applies to.
#[derive(Clone)]
pub struct Credential {
    pub username: Option<String>,
    pub secret: Secret,
    pub filter: HostFilter,
}

impl Credential {
    /// A password credential good for every host.
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential {
            username: Some(username.into()),
            secret: Secret::Password(password.into()),
            filter: HostFilter::Any,
        }
    }

    /// A key-file credential good for every host.
    pub fn key_file(username: impl Into<String>, path: impl Into<String>, passphrase: Option<String>) -> Self {
        Credential {
            username: Some(username.into()),
            secret: Secret::KeyFile {
                path: path.into(),
                passphrase,
            },
            filter: HostFilter::Any,
        }
    }

    /// An agent-backed credential good for every host: the agent is asked
    /// for the identity matching `public_key_blob_b64` at authentication time.
    pub fn agent_key(username: impl Into<String>, public_key_blob_b64: impl Into<String>) -> Self {
        Credential {
            username: Some(username.into()),
            secret: Secret::AgentKey {
                public_key_blob_b64: public_key_blob_b64.into(),
            },
            filter: HostFilter::Any,
        }
    }

    /// Restrict this credential to hosts matching `spec` (CIDR or glob).
    pub fn scoped_to(mut self, spec: &str) -> Self {
        self.filter = HostFilter::parse(spec);
        self
    }

    /// Resolve this credential's secret to the concrete value a session needs
    /// to attempt (decrypting an `EncryptedPassword` if necessary).
    pub fn resolve(&self) -> Result<ResolvedSecret, AuthError> {
        match &self.secret {
            Secret::KeyFile { path, passphrase } => Ok(ResolvedSecret::KeyFile {
                path: path.clone(),
                passphrase: passphrase.clone(),
            }),
            Secret::Password(p) => Ok(ResolvedSecret::Password(p.clone())),
            Secret::EncryptedPassword {
                ciphertext_b64,
                decoder,
            } => {
                let plaintext = decoder.decrypt(ciphertext_b64)?;
                Ok(ResolvedSecret::Password(
                    String::from_utf8(plaintext).map_err(|e| AuthError::OaepDecrypt(e.to_string()))?,
                ))
            }
            Secret::AgentKey { public_key_blob_b64 } => Ok(ResolvedSecret::AgentKey {
                public_key_blob_b64: public_key_blob_b64.clone(),
            }),
        }
    }
}

/// A [`Credential`]'s secret after any decryption, ready to hand to a transport.
#[derive(Clone)]
pub enum ResolvedSecret {
    KeyFile { path: String, passphrase: Option<String> },
    Password(String),
    AgentKey { public_key_blob_b64: String },
}

/// Ordered set of credentials, tried in registration order for each host
/// they apply to, honoring the per-vendor retry cap ([`FORCE10_PASSWORD_RETRY_CAP`]).
#[derive(Clone, Default)]
pub struct AuthManager {
    credentials: Vec<Credential>,
}

impl AuthManager {
    pub fn new() -> Self {
        AuthManager {
            credentials: Vec::new(),
        }
    }

    /// Register a credential, appended to the end of the try order.
    pub fn add(&mut self, credential: Credential) -> &mut Self {
        self.credentials.push(credential);
        self
    }

    /// Credentials registered for `host`, in registration order.
    pub fn candidates_for(&self, host: &str) -> Vec<&Credential> {
        self.credentials
            .iter()
            .filter(|c| c.filter.matches(host))
            .collect()
    }

    /// Number of consecutive attempts allowed against the *same* credential
    /// before advancing to the next one. Force10-family devices (see
    /// `force_tty` in [`crate::config::defaults`]) re-prompt for the same
    /// password rather than rejecting it outright, so they get
    /// [`FORCE10_PASSWORD_RETRY_CAP`] attempts; every other host advances to
    /// the next credential after a single failure.
    pub fn retry_cap(&self, is_force10: bool) -> u32 {
        if is_force10 { FORCE10_PASSWORD_RETRY_CAP } else { 1 }
    }

    /// Attempt each candidate credential for `host` in order via `try_one`,
    /// stopping at the first success. On a Force10-family host the same
    /// credential is retried up to [`AuthManager::retry_cap`] times before
    /// moving on, matching the device's "keeps re-prompting" quirk. Returns
    /// [`AuthError::Exhausted`] if every candidate is used up.
    pub async fn authenticate<F>(
        &self,
        host: &str,
        is_force10: bool,
        mut try_one: F,
    ) -> Result<(), AuthError>
    where
        F: AsyncFnMut(Credential, ResolvedSecret) -> Result<(), AuthError>,
    {
        let candidates = self.candidates_for(host);
        let cap = self.retry_cap(is_force10);
        for credential in candidates {
            let mut attempts = 0u32;
            loop {
                let resolved = credential.resolve()?;
                attempts += 1;
                log::debug!("{host}: authentication attempt {attempts}/{cap}");
                match try_one(credential.clone(), resolved).await {
                    Ok(()) => return Ok(()),
                    Err(e) if is_force10 && attempts < cap => {
                        log::debug!("{host}: credential rejected ({e}), retrying before advancing");
                        continue;
                    }
                    Err(e) => {
                        log::debug!("{host}: credential rejected ({e}), advancing to next candidate");
                        break;
                    }
                }
            }
        }
        log::warn!("{host}: authentication exhausted");
        Err(AuthError::Exhausted(host.to_string()))
    }
}

/// Parse RadSSH-style authfile lines: blank lines and `#`-comments are
/// skipped; the rest is a bare password, or `tag|value`, or `tag|filter|value`
/// where `tag` is one of `password` / `pkcsoaep` / `keyfile` (case-insensitive)
/// and `filter` is a CIDR/glob host scope. `decoder` is required for any
/// `pkcsoaep|` line and ignored otherwise.
pub fn parse_authfile(contents: &str, decoder: Option<&Arc<OaepDecoder>>) -> Result<Vec<Credential>, AuthError> {
    let mut credentials = Vec::new();
    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.splitn(3, '|').collect();
        let (tag, filter, value) = match fields.as_slice() {
            [value] => ("password", None, *value),
            [tag, value] => (*tag, None, *value),
            [tag, filter, value] => (*tag, Some(*filter), *value),
            _ => unreachable!(),
        };

        let secret = match tag.to_ascii_lowercase().as_str() {
            "password" => Secret::Password(value.to_string()),
            "pkcsoaep" => {
                let decoder = decoder.ok_or(AuthError::NoOaepKey)?;
                Secret::EncryptedPassword {
                    ciphertext_b64: value.to_string(),
                    decoder: decoder.clone(),
                }
            }
            "keyfile" => Secret::KeyFile {
                path: value.to_string(),
                passphrase: None,
            },
            other => {
                return Err(AuthError::AuthfileParse(format!(
                    "line {}: unrecognized tag {other:?}",
                    idx + 1
                )));
            }
        };

        let mut credential = Credential {
            username: None,
            secret,
            filter: HostFilter::Any,
        };
        if let Some(filter) = filter {
            credential = credential.scoped_to(filter);
        }
        credentials.push(credential);
    }
    Ok(credentials)
}

/// Read and parse an authfile from `path`.
pub fn load_authfile(path: &std::path::Path, decoder: Option<&Arc<OaepDecoder>>) -> Result<Vec<Credential>, AuthError> {
    let contents = std::fs::read_to_string(path)?;
    parse_authfile(&contents, decoder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_filter_matches_contained_address() {
        let filter = HostFilter::parse("10.0.0.0/24");
        assert!(filter.matches("10.0.0.5"));
        assert!(!filter.matches("10.0.1.5"));
    }

    #[test]
    fn glob_filter_matches_hostname_pattern() {
        let filter = HostFilter::parse("core-*.example.com");
        assert!(filter.matches("core-sw1.example.com"));
        assert!(!filter.matches("edge-sw1.example.com"));
    }

    #[test]
    fn candidates_for_host_respects_scoping() {
        let mut mgr = AuthManager::new();
        mgr.add(Credential::password("admin", "p1").scoped_to("10.0.0.0/24"));
        mgr.add(Credential::password("admin", "p2"));
        assert_eq!(mgr.candidates_for("10.0.0.5").len(), 2);
        assert_eq!(mgr.candidates_for("192.168.1.1").len(), 1);
    }

    #[tokio::test]
    async fn authenticate_stops_at_first_success() {
        let mut mgr = AuthManager::new();
        mgr.add(Credential::password("admin", "wrong"));
        mgr.add(Credential::password("admin", "right"));
        let mut tried = Vec::new();
        let result = mgr
            .authenticate("host1", false, |_cred, secret| {
                let ResolvedSecret::Password(p) = secret else {
                    unreachable!()
                };
                tried.push(p.clone());
                async move {
                    if p == "right" {
                        Ok(())
                    } else {
                        Err(AuthError::BadAuthenticationType)
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(tried, vec!["wrong".to_string(), "right".to_string()]);
    }

    #[tokio::test]
    async fn force10_host_caps_retry_attempts_on_same_credential_before_advancing() {
        let mut mgr = AuthManager::new();
        mgr.add(Credential::password("admin", "p0"));
        mgr.add(Credential::password("admin", "p1"));
        let mut tried = Vec::new();
        let result = mgr
            .authenticate("force10-sw1", true, |_cred, secret| {
                let ResolvedSecret::Password(p) = secret else {
                    unreachable!()
                };
                tried.push(p.clone());
                async move {
                    if p == "p1" {
                        Ok(())
                    } else {
                        Err(AuthError::BadAuthenticationType)
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(tried.len() as u32, FORCE10_PASSWORD_RETRY_CAP + 1);
        assert_eq!(tried[..3], ["p0", "p0", "p0"]);
        assert_eq!(tried[3], "p1");
    }

    #[test]
    fn parse_authfile_reads_password_pkcsoaep_and_keyfile_tags() {
        let contents = "\
# comment line
hunter2
password|plainpass
password|10.0.0.0/24|scopedpass
keyfile|/home/op/.ssh/id_rsa
";
        let credentials = parse_authfile(contents, None).unwrap();
        assert_eq!(credentials.len(), 4);
        assert!(matches!(&credentials[0].secret, Secret::Password(p) if p == "hunter2"));
        assert!(matches!(&credentials[1].secret, Secret::Password(p) if p == "plainpass"));
        assert!(matches!(&credentials[2].filter, HostFilter::Cidr(_)));
        assert!(matches!(&credentials[3].secret, Secret::KeyFile { path, .. } if path == "/home/op/.ssh/id_rsa"));
        assert!(credentials.iter().all(|c| c.username.is_none()));
    }

    #[test]
    fn parse_authfile_rejects_unrecognized_tag() {
        let err = parse_authfile("bogus|value", None).unwrap_err();
        assert!(matches!(err, AuthError::AuthfileParse(_)));
    }

    #[test]
    fn parse_authfile_requires_decoder_for_pkcsoaep_lines() {
        let err = parse_authfile("pkcsoaep|AAAA", None).unwrap_err();
        assert!(matches!(err, AuthError::NoOaepKey));
    }
}
