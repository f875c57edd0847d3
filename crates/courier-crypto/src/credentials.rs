use std::fmt;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use anyhow::{Result, anyhow};

use courier_types::models::SealedCredential;

/// Seals and opens per-account send credentials with AES-256-GCM.
///
/// Accounts store only the sealed form; the outbound path opens it right
/// before calling the platform.
#[derive(Clone)]
pub struct CredentialVault {
    key: [u8; 32],
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialVault(<redacted>)")
    }
}

impl CredentialVault {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn seal(&self, credential: &str) -> Result<SealedCredential> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, credential.as_bytes())
            .map_err(|e| anyhow!("Credential encryption failed: {}", e))?;

        Ok(SealedCredential {
            ciphertext,
            nonce: nonce_bytes.to_vec(),
        })
    }

    pub fn open(&self, sealed: &SealedCredential) -> Result<String> {
        if sealed.nonce.len() != 12 {
            return Err(anyhow!("Invalid credential nonce length: {}", sealed.nonce.len()));
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Nonce::from_slice(&sealed.nonce);

        let plaintext = cipher
            .decrypt(nonce, sealed.ciphertext.as_ref())
            .map_err(|e| anyhow!("Credential decryption failed: {}", e))?;

        Ok(String::from_utf8(plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key;

    #[test]
    fn seal_open_roundtrip() {
        let vault = CredentialVault::new(generate_key());

        let sealed = vault.seal("EAAG-page-token").unwrap();
        assert_ne!(sealed.ciphertext, b"EAAG-page-token");

        assert_eq!(vault.open(&sealed).unwrap(), "EAAG-page-token");
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = CredentialVault::new(generate_key()).seal("token").unwrap();
        assert!(CredentialVault::new(generate_key()).open(&sealed).is_err());
    }

    #[test]
    fn truncated_nonce_is_rejected() {
        let vault = CredentialVault::new(generate_key());
        let mut sealed = vault.seal("token").unwrap();
        sealed.nonce.truncate(4);
        assert!(vault.open(&sealed).is_err());
    }

    #[test]
    fn debug_output_hides_the_key() {
        let vault = CredentialVault::new([7u8; 32]);
        assert_eq!(format!("{vault:?}"), "CredentialVault(<redacted>)");
    }
}
