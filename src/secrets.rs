//! Encrypted rows in the `settings` table.
//!
//! A value such as `ALERT_WEBHOOK_URL` may be stored as
//! `enc:v1:<iv>:<ciphertext>:<tag>` (base64 parts, AES-256-GCM). The key comes
//! from `DATABASE_KEY`, given as 64 hex characters or base64.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use std::collections::HashMap;

pub const DATABASE_KEY_ENV_VAR: &str = "DATABASE_KEY";
const ENCRYPTED_PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Resolves stored settings to plain values. Plain values pass through, and
/// `DATABASE_KEY` is only read when an encrypted value is present.
pub fn decrypt_settings(stored: HashMap<String, String>) -> Result<HashMap<String, String>> {
    let raw_key = std::env::var(DATABASE_KEY_ENV_VAR).ok();
    decrypt_settings_with_key(stored, raw_key.as_deref())
}

fn decrypt_settings_with_key(
    stored: HashMap<String, String>,
    raw_key: Option<&str>,
) -> Result<HashMap<String, String>> {
    let mut key: Option<SettingsKey> = None;
    let mut resolved = HashMap::with_capacity(stored.len());

    for (name, value) in stored {
        if !value.starts_with(ENCRYPTED_PREFIX) {
            resolved.insert(name, value);
            continue;
        }

        let settings_key = match key.take() {
            Some(settings_key) => settings_key,
            None => SettingsKey::parse(raw_key.unwrap_or_default())
                .with_context(|| format!("cannot decrypt setting {}", name))?,
        };
        let plain = settings_key.open(&name, &value[ENCRYPTED_PREFIX.len()..])?;
        key = Some(settings_key);
        resolved.insert(name, plain);
    }

    Ok(resolved)
}

struct SettingsKey {
    cipher: Aes256Gcm,
}

impl SettingsKey {
    fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            bail!(
                "{} is not set. Generate one with \"openssl rand -hex 32\".",
                DATABASE_KEY_ENV_VAR
            );
        }

        let bytes = if trimmed.len() == 64 && trimmed.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            hex::decode(trimmed).with_context(|| format!("{} is not valid hex", DATABASE_KEY_ENV_VAR))?
        } else {
            BASE64_STANDARD.decode(trimmed).map_err(|_| {
                anyhow!(
                    "{} must be 64 hex characters or base64",
                    DATABASE_KEY_ENV_VAR
                )
            })?
        };
        let cipher = Aes256Gcm::new_from_slice(&bytes).map_err(|_| {
            anyhow!(
                "{} must decode to 32 bytes (got {})",
                DATABASE_KEY_ENV_VAR,
                bytes.len()
            )
        })?;
        Ok(Self { cipher })
    }

    fn open(&self, name: &str, payload: &str) -> Result<String> {
        let sealed = SealedValue::parse(payload)
            .with_context(|| format!("setting {} is not a valid enc:v1 value", name))?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_ref())
            .map_err(|_| {
                anyhow!(
                    "setting {} could not be decrypted with {}",
                    name,
                    DATABASE_KEY_ENV_VAR
                )
            })?;
        String::from_utf8(plaintext)
            .with_context(|| format!("setting {} decrypted to invalid UTF-8", name))
    }
}

/// The decoded `iv:ciphertext:tag` triple, with the tag appended to the
/// ciphertext as `aes-gcm` expects.
struct SealedValue {
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl SealedValue {
    fn parse(payload: &str) -> Result<Self> {
        let parts: Vec<&str> = payload.split(':').collect();
        let &[iv, data, tag] = parts.as_slice() else {
            bail!("expected iv:ciphertext:tag, found {} parts", parts.len());
        };

        let decode = |label: &str, part: &str| {
            BASE64_STANDARD
                .decode(part)
                .map_err(|_| anyhow!("{} is not base64", label))
        };
        let nonce = decode("iv", iv)?;
        let mut ciphertext = decode("ciphertext", data)?;
        let tag = decode("tag", tag)?;

        if nonce.len() != NONCE_LEN {
            bail!("iv must be {} bytes (got {})", NONCE_LEN, nonce.len());
        }
        if tag.len() != TAG_LEN {
            bail!("tag must be {} bytes (got {})", TAG_LEN, tag.len());
        }
        ciphertext.extend_from_slice(&tag);
        Ok(Self { nonce, ciphertext })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "0f0e0d0c0b0a090807060504030201000102030405060708090a0b0c0d0e0f10";
    const WEBHOOK: &str = "https://hooks.example.kz/intake-alerts";

    fn key_bytes() -> Vec<u8> {
        hex::decode(KEY_HEX).unwrap()
    }

    fn seal(plain: &str, key: &[u8]) -> String {
        let iv = [7u8; NONCE_LEN];
        let cipher = Aes256Gcm::new_from_slice(key).unwrap();
        let sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plain.as_bytes())
            .unwrap();
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        format!(
            "{}{}:{}:{}",
            ENCRYPTED_PREFIX,
            BASE64_STANDARD.encode(iv),
            BASE64_STANDARD.encode(ciphertext),
            BASE64_STANDARD.encode(tag)
        )
    }

    fn stored(pairs: &[(&str, String)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn plain_intake_settings_need_no_key() {
        let resolved = decrypt_settings_with_key(
            stored(&[
                ("HOT_SCORE_THRESHOLD", "65".to_string()),
                ("PRICING_KEYWORDS", "price,tariff".to_string()),
            ]),
            None,
        )
        .unwrap();
        assert_eq!(resolved["HOT_SCORE_THRESHOLD"], "65");
        assert_eq!(resolved["PRICING_KEYWORDS"], "price,tariff");
    }

    #[test]
    fn encrypted_webhook_is_resolved_with_hex_or_base64_key() {
        let settings = stored(&[
            ("ALERT_WEBHOOK_URL", seal(WEBHOOK, &key_bytes())),
            ("ALERT_SOURCE_LABEL", "kz-shop".to_string()),
        ]);

        let with_hex = decrypt_settings_with_key(settings.clone(), Some(KEY_HEX)).unwrap();
        assert_eq!(with_hex["ALERT_WEBHOOK_URL"], WEBHOOK);
        assert_eq!(with_hex["ALERT_SOURCE_LABEL"], "kz-shop");

        let base64_key = BASE64_STANDARD.encode(key_bytes());
        let with_base64 = decrypt_settings_with_key(settings, Some(&base64_key)).unwrap();
        assert_eq!(with_base64["ALERT_WEBHOOK_URL"], WEBHOOK);
    }

    #[test]
    fn missing_key_names_the_encrypted_setting() {
        let error = decrypt_settings_with_key(
            stored(&[("ALERT_WEBHOOK_URL", seal(WEBHOOK, &key_bytes()))]),
            None,
        )
        .unwrap_err();
        let message = format!("{:#}", error);
        assert!(message.contains("ALERT_WEBHOOK_URL"));
        assert!(message.contains(DATABASE_KEY_ENV_VAR));
    }

    #[test]
    fn wrong_key_names_the_encrypted_setting() {
        let other_key = [1u8; 32];
        let error = decrypt_settings_with_key(
            stored(&[("ALERT_WEBHOOK_URL", seal(WEBHOOK, &other_key))]),
            Some(KEY_HEX),
        )
        .unwrap_err();
        assert!(error.to_string().contains("ALERT_WEBHOOK_URL"));
    }

    #[test]
    fn malformed_payload_and_short_key_are_rejected() {
        let error = decrypt_settings_with_key(
            stored(&[("ALERT_WEBHOOK_URL", "enc:v1:abc:def".to_string())]),
            Some(KEY_HEX),
        )
        .unwrap_err();
        assert!(format!("{:#}", error).contains("iv:ciphertext:tag"));

        let short = BASE64_STANDARD.encode([9u8; 16]);
        let error = decrypt_settings_with_key(
            stored(&[("ALERT_WEBHOOK_URL", seal(WEBHOOK, &key_bytes()))]),
            Some(&short),
        )
        .unwrap_err();
        assert!(format!("{:#}", error).contains("32 bytes"));
    }
}
