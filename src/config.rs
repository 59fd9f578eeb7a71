//! SSH configuration constants for maximum compatibility.
//!
//! This module contains comprehensive lists of all supported SSH algorithms,
//! ciphers, MAC algorithms, and compression methods. These configurations
//! are designed to provide maximum compatibility with various network devices
//! and SSH server implementations, including older or legacy systems.

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{cipher, compression, kex, mac};

/// All supported key exchange algorithms in order of preference.
///
/// Includes modern algorithms like Curve25519 as well as legacy Diffie-Hellman
/// variants for compatibility with older devices.
pub const ALL_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::DH_GEX_SHA1,
    kex::DH_GEX_SHA256,
    kex::DH_G1_SHA1,
    kex::DH_G14_SHA1,
    kex::DH_G14_SHA256,
    kex::DH_G15_SHA512,
    kex::DH_G16_SHA512,
    kex::DH_G17_SHA512,
    kex::DH_G18_SHA512,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::NONE,
];

/// All supported cipher algorithms for encryption.
///
/// Includes modern ciphers like AES-GCM and ChaCha20-Poly1305, as well as
/// legacy CBC mode ciphers for compatibility with older devices.
pub static ALL_CIPHERS: &[cipher::Name] = &[
    cipher::CLEAR,
    cipher::NONE,
    cipher::AES_128_CTR,
    cipher::AES_192_CTR,
    cipher::AES_256_CTR,
    cipher::AES_256_GCM,
    cipher::AES_128_CBC,
    cipher::AES_192_CBC,
    cipher::AES_256_CBC,
    cipher::CHACHA20_POLY1305,
];

/// All supported MAC (Message Authentication Code) algorithms.
///
/// Includes both standard HMAC variants and ETM (Encrypt-then-MAC) variants
/// for enhanced security.
pub const ALL_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::NONE,
    mac::HMAC_SHA1,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
];

/// All supported compression algorithms.
///
/// Includes ZLIB compression variants as well as no compression for
/// maximum compatibility.
pub const ALL_COMPRESSION_ALGORITHMS: &[compression::Name] = &[
    compression::NONE,
    compression::ZLIB,
    compression::ZLIB_LEGACY,
];

/// All supported host key algorithms.
///
/// Includes modern algorithms like Ed25519 and ECDSA, as well as legacy
/// RSA and DSA for compatibility with older devices.
pub const ALL_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Dsa,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Ed25519,
    Algorithm::Rsa { hash: None },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::SkEcdsaSha2NistP256,
    Algorithm::SkEd25519,
];

/// Key exchange algorithms accepted under [`crate::session::SecurityLevel::Secure`].
///
/// Curve25519 only; no Diffie-Hellman group, no `NONE`.
pub const SECURE_KEX_ORDER: &[kex::Name] = &[kex::CURVE25519, kex::CURVE25519_PRE_RFC_8731];

/// Ciphers accepted under [`crate::session::SecurityLevel::Secure`].
pub const SECURE_CIPHERS: &[cipher::Name] =
    &[cipher::AES_256_GCM, cipher::CHACHA20_POLY1305, cipher::AES_256_CTR];

/// MACs accepted under [`crate::session::SecurityLevel::Secure`].
///
/// Encrypt-then-MAC only.
pub const SECURE_MAC_ALGORITHMS: &[mac::Name] =
    &[mac::HMAC_SHA256_ETM, mac::HMAC_SHA512_ETM];

/// Host key types accepted under [`crate::session::SecurityLevel::Secure`].
pub const SECURE_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
];

/// Key exchange algorithms accepted under [`crate::session::SecurityLevel::Balanced`].
pub const BALANCED_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_GEX_SHA256,
    kex::DH_G14_SHA256,
];

/// Ciphers accepted under [`crate::session::SecurityLevel::Balanced`].
pub const BALANCED_CIPHERS: &[cipher::Name] = &[
    cipher::AES_256_GCM,
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
];

/// MACs accepted under [`crate::session::SecurityLevel::Balanced`].
pub const BALANCED_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
];

/// Host key types accepted under [`crate::session::SecurityLevel::Balanced`].
pub const BALANCED_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
];

/// Key exchange algorithms accepted under [`crate::session::SecurityLevel::LegacyCompatible`].
///
/// Includes `diffie-hellman-group1-sha1` for ancient devices (Cisco/Force10-era
/// firmware) that offer nothing newer.
pub const LEGACY_KEX_ORDER: &[kex::Name] = ALL_KEX_ORDER;

/// Ciphers accepted under [`crate::session::SecurityLevel::LegacyCompatible`].
///
/// Includes `none` so an operator can explicitly opt into a cleartext session
/// for lab/bench devices; `ConnectionSecurityOptions::legacy_compatible()` also
/// switches host-key checking off, since such devices rarely carry stable keys.
pub const LEGACY_CIPHERS: &[cipher::Name] = ALL_CIPHERS;

/// MACs accepted under [`crate::session::SecurityLevel::LegacyCompatible`].
pub const LEGACY_MAC_ALGORITHMS: &[mac::Name] = ALL_MAC_ALGORITHMS;

/// Host key types accepted under [`crate::session::SecurityLevel::LegacyCompatible`].
pub const LEGACY_KEY_TYPES: &[Algorithm] = ALL_KEY_TYPES;

/// Compression algorithms offered regardless of security level.
pub const DEFAULT_COMPRESSION_ALGORITHMS: &[compression::Name] = ALL_COMPRESSION_ALGORITHMS;

/// Package-supplied ambient defaults, layered at the bottom of the
/// [`crate::options::SshOptions`] chain (lowest priority). Mirrors the
/// `default_config` block of the original RadSSH package configuration.
pub mod defaults {
    /// Maximum dispatcher worker-pool size when unspecified by the caller.
    pub const MAX_THREADS: usize = 120;
    /// Default output ordering mode name (`stream` | `ordered` | `off`).
    pub const OUTPUT_MODE: &str = "stream";
    /// TCP connect timeout, in seconds.
    pub const SOCKET_TIMEOUT_SECS: u64 = 30;
    /// Keepalive global-request interval, in seconds (OpenSSH `ServerAliveInterval`).
    pub const KEEPALIVE_SECS: u64 = 180;
    /// Idle-time quota, in seconds; `0` means unbounded.
    pub const QUOTA_TIME_SECS: u64 = 0;
    /// Line-count quota; `0` means unbounded.
    pub const QUOTA_LINES: u64 = 0;
    /// Byte-count quota; `0` means unbounded.
    pub const QUOTA_BYTES: u64 = 0;
    /// Comma-separated server version substrings that force persistent-shell mode.
    pub const FORCE_TTY: &str = "Cisco,force10networks";
    /// Command sent once after opening a forced persistent shell.
    pub const FORCE_TTY_SIGNON: &str = "term length 0";
    /// Command sent once before closing a forced persistent shell.
    pub const FORCE_TTY_SIGNOFF: &str = "term length 20";
    /// How many consecutive quiet 0.4s ticks before a keepalive ping is sent.
    pub const KEEPALIVE_QUIET_TICKS: u32 = 5 * (1000 / 400);
    /// How many consecutive unanswered keepalive pings mark the server unresponsive.
    pub const KEEPALIVE_FAILURE_THRESHOLD: u32 = 5;
    /// Silence, in milliseconds, after which persistent-shell mode presumes completion.
    pub const PRESUMED_COMPLETE_QUIET_MS: u64 = 30_000;
    /// Cap on retrying the same password against the Force10 "still lists password" quirk.
    pub const FORCE10_PASSWORD_RETRY_CAP: u32 = 3;
    /// Window, in milliseconds, in which a second Ctrl-C escalates to a hard abort.
    pub const DOUBLE_INTERRUPT_WINDOW_MS: u64 = 2_000;
    /// Whether newly accepted host keys are persisted hashed (`|1|salt|digest`)
    /// rather than as a literal hostname, matching OpenSSH's `HashKnownHosts`.
    pub const HASH_KNOWN_HOSTS: bool = true;
}

/// Does `ssh_version` (the server's identification banner) match one of the
/// comma-separated substrings in [`defaults::FORCE_TTY`]? These are the
/// device families whose CLI has no real one-shot exec and must instead be
/// driven through a persistent shell.
pub fn is_force_tty(ssh_version: &str) -> bool {
    defaults::FORCE_TTY
        .split(',')
        .any(|needle| !needle.is_empty() && ssh_version.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_force_tty_matches_known_device_banners() {
        assert!(is_force_tty("SSH-2.0-Cisco-1.25"));
        assert!(is_force_tty("SSH-2.0-force10networks_1.0"));
        assert!(!is_force_tty("SSH-2.0-OpenSSH_9.6"));
    }
}
