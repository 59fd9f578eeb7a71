//! PKCS#1 RSAES-OAEP/SHA-1 decryption of stored passwords.
//!
//! Ported from RadSSH's `pkcs.py`: a short base64-encoded ciphertext (a
//! password, encrypted once by an operator against their own public key) is
//! decrypted lazily, on first use, with the loaded RSA private key.

use std::path::Path;
use std::sync::OnceLock;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Oaep, RsaPrivateKey};
use sha1::Sha1;

use crate::error::AuthError;

/// Loads once and decrypts RSAES-OAEP/SHA-1 ciphertexts against one RSA private key.
///
/// Construction does not touch the filesystem; the key is read and parsed
/// lazily on first [`OaepDecoder::decrypt`] call and cached, mirroring the
/// "decode once, reuse" pattern used throughout the original for key
/// material and decrypted secrets.
pub struct OaepDecoder {
    key_path: std::path::PathBuf,
    key: OnceLock<RsaPrivateKey>,
}

impl OaepDecoder {
    /// Defer loading the private key at `key_path` (typically `~/.ssh/id_rsa`) until first use.
    pub fn new(key_path: impl AsRef<Path>) -> Self {
        OaepDecoder {
            key_path: key_path.as_ref().to_path_buf(),
            key: OnceLock::new(),
        }
    }

    fn private_key(&self) -> Result<&RsaPrivateKey, AuthError> {
        if let Some(key) = self.key.get() {
            return Ok(key);
        }
        let pem = std::fs::read_to_string(&self.key_path)
            .map_err(|e| AuthError::OaepDecrypt(format!("reading {:?}: {e}", self.key_path)))?;
        let key = RsaPrivateKey::from_pkcs1_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&pem))
            .map_err(|e| AuthError::OaepDecrypt(format!("parsing {:?}: {e}", self.key_path)))?;
        Ok(self.key.get_or_init(|| key))
    }

    /// Decrypt a base64-encoded RSAES-OAEP/SHA-1 ciphertext into the plaintext password bytes.
    pub fn decrypt(&self, ciphertext_b64: &str) -> Result<Vec<u8>, AuthError> {
        let key = self.private_key()?;
        let ciphertext = BASE64
            .decode(ciphertext_b64.trim())
            .map_err(|e| AuthError::OaepDecrypt(format!("invalid base64: {e}")))?;
        key.decrypt(Oaep::new::<Sha1>(), &ciphertext)
            .map_err(|e| AuthError::OaepDecrypt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPublicKey;
    use rsa::pkcs1::EncodeRsaPrivateKey;

    #[test]
    fn round_trips_through_a_freshly_generated_key() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = RsaPublicKey::from(&private);

        let pem = private
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .unwrap()
            .to_string();
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("id_rsa");
        std::fs::write(&key_path, pem).unwrap();

        let ciphertext = public
            .encrypt(&mut rng, Oaep::new::<Sha1>(), b"hunter2")
            .unwrap();
        let ciphertext_b64 = BASE64.encode(ciphertext);

        let decoder = OaepDecoder::new(&key_path);
        let plaintext = decoder.decrypt(&ciphertext_b64).unwrap();
        assert_eq!(plaintext, b"hunter2");
        // Second call exercises the cached key path.
        assert_eq!(decoder.decrypt(&ciphertext_b64).unwrap(), b"hunter2");
    }
}
