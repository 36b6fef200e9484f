use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use ring::{aead, pbkdf2, rand::{SecureRandom, SystemRandom}};
use std::num::NonZeroU32;

const APP_SECRET: &[u8] = b"ledgerbox-secret-v1";
const PBKDF2_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
const SERVICE_NAME: &str = "ledgerbox";

/// At-rest protection for provider API credentials. Prefers the OS
/// keychain; falls back to AES-256-GCM with a PBKDF2-derived key when no
/// keychain is reachable (headless servers). Stored values are tagged with
/// a `keychain:` or `enc:` prefix so either form can be decrypted later.
pub struct CryptoService;

impl CryptoService {
    pub fn encrypt_credential(provider_key: &str, credential: &str) -> Result<String> {
        if let Ok(reference) = Self::store_in_keychain(provider_key, credential) {
            return Ok(reference);
        }
        Self::encrypt_symmetric(credential)
    }

    pub fn decrypt_credential(stored: &str) -> Result<String> {
        if let Some(rest) = stored.strip_prefix("keychain:") {
            return Self::retrieve_from_keychain(rest);
        }
        if stored.starts_with("enc:") {
            return Self::decrypt_symmetric(stored);
        }
        // Plain value, e.g. pasted straight into the settings table.
        Ok(stored.to_string())
    }

    fn store_in_keychain(provider_key: &str, credential: &str) -> Result<String> {
        keyring::Entry::new(SERVICE_NAME, provider_key)
            .map_err(|e| anyhow!("Keychain error: {}", e))?
            .set_password(credential)
            .map_err(|e| anyhow!("Keychain store error: {}", e))?;
        Ok(format!("keychain:{}", provider_key))
    }

    fn retrieve_from_keychain(provider_key: &str) -> Result<String> {
        keyring::Entry::new(SERVICE_NAME, provider_key)
            .map_err(|e| anyhow!("Keychain error: {}", e))?
            .get_password()
            .map_err(|e| anyhow!("Keychain fetch error: {}", e))
    }

    fn encrypt_symmetric(plaintext: &str) -> Result<String> {
        let rng = SystemRandom::new();
        let mut salt = [0u8; SALT_LEN];
        rng.fill(&mut salt)
            .map_err(|_| anyhow!("Failed to generate salt"))?;

        let key = derive_key(&salt)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill(&mut nonce_bytes)
            .map_err(|_| anyhow!("Failed to generate nonce"))?;

        let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);
        let mut in_out = plaintext.as_bytes().to_vec();

        key.seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
            .map_err(|_| anyhow!("Encryption failed"))?;

        Ok(format!(
            "enc:{}:{}:{}",
            general_purpose::STANDARD.encode(salt),
            general_purpose::STANDARD.encode(nonce_bytes),
            general_purpose::STANDARD.encode(in_out)
        ))
    }

    fn decrypt_symmetric(ciphertext: &str) -> Result<String> {
        let parts: Vec<&str> = ciphertext.split(':').collect();
        if parts.len() != 4 {
            return Err(anyhow!("Invalid encrypted payload"));
        }
        let salt = general_purpose::STANDARD
            .decode(parts[1])
            .map_err(|e| anyhow!("Decode salt: {}", e))?;
        let nonce_bytes = general_purpose::STANDARD
            .decode(parts[2])
            .map_err(|e| anyhow!("Decode nonce: {}", e))?;
        let mut data = general_purpose::STANDARD
            .decode(parts[3])
            .map_err(|e| anyhow!("Decode ciphertext: {}", e))?;

        let key = derive_key(&salt)?;
        let nonce = aead::Nonce::assume_unique_for_key(
            nonce_bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("Invalid nonce length"))?,
        );

        let decrypted = key
            .open_in_place(nonce, aead::Aad::empty(), &mut data)
            .map_err(|_| anyhow!("Decryption failed"))?;
        let text = String::from_utf8(decrypted.to_vec())?;
        Ok(text)
    }
}

fn derive_key(salt: &[u8]) -> Result<aead::LessSafeKey> {
    let mut key_bytes = [0u8; 32];
    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).ok_or_else(|| anyhow!("Invalid iterations"))?;
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        APP_SECRET,
        &mut key_bytes,
    );
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key_bytes)
        .map_err(|_| anyhow!("Invalid key material"))?;
    Ok(aead::LessSafeKey::new(unbound))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_round_trip() {
        let stored = CryptoService::encrypt_symmetric("sk-live-abc123").unwrap();
        assert!(stored.starts_with("enc:"));
        assert_eq!(CryptoService::decrypt_symmetric(&stored).unwrap(), "sk-live-abc123");
    }

    #[test]
    fn symmetric_output_is_salted() {
        let a = CryptoService::encrypt_symmetric("same input").unwrap();
        let b = CryptoService::encrypt_symmetric("same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_payload_fails_to_decrypt() {
        let stored = CryptoService::encrypt_symmetric("secret").unwrap();
        let mut tampered = stored.clone();
        tampered.pop();
        tampered.push('A');
        assert!(CryptoService::decrypt_symmetric(&tampered).is_err());
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(CryptoService::decrypt_symmetric("enc:only-two-parts").is_err());
    }

    #[test]
    fn plain_values_pass_through_decrypt() {
        assert_eq!(
            CryptoService::decrypt_credential("sk-pasted-directly").unwrap(),
            "sk-pasted-directly"
        );
    }
}
