//! AuthMaterial load/refresh and encryption at rest (spec §9).
//!
//! The OAuth handshake itself is out of scope; this module only knows
//! the narrow refresh-token grant call needed to renew an already-
//! issued token. Sensitive fields are AES-256-GCM sealed before they
//! reach `Store::put_auth` and opened right after `Store::get_auth` —
//! the Store itself never sees plaintext when a key is configured.

use crate::config::{Config, StoreBackend};
use crate::error::AuthError;
use crate::models::AuthMaterial;
use crate::store::StoreHandle;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub struct AuthManager {
    store: StoreHandle,
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    cipher: Option<Aes256Gcm>,
}

impl AuthManager {
    pub fn new(store: StoreHandle, config: &Config) -> Result<Self, AuthError> {
        let cipher = match &config.token_encryption_key {
            Some(key_b64) => {
                let bytes = STANDARD
                    .decode(key_b64)
                    .map_err(|e| AuthError::Crypto(e.to_string()))?;
                if bytes.len() != 32 {
                    return Err(AuthError::Crypto(
                        "CLANK_TOKEN_KEY must decode to 32 bytes".to_string(),
                    ));
                }
                Some(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&bytes)))
            }
            None => {
                if config.store_backend == StoreBackend::Postgres {
                    return Err(AuthError::KeyRequired);
                }
                warn!(
                    "no CLANK_TOKEN_KEY configured; AuthMaterial will be stored in plaintext \
                     (permitted only with the embedded store)"
                );
                None
            }
        };

        Ok(AuthManager {
            store,
            http: reqwest::Client::new(),
            token_url: config.chat_token_url.clone(),
            client_id: config.chat_client_id.clone(),
            client_secret: config.chat_client_secret.clone(),
            cipher,
        })
    }

    /// Spec §4.G step 3: load AuthMaterial, refresh once if expired.
    pub async fn load_or_refresh(&self) -> Result<AuthMaterial, AuthError> {
        let stored = self
            .store
            .get_auth()
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?
            .ok_or(AuthError::Missing)?;
        let material = self.decrypt(stored)?;

        if material.expires_at <= Utc::now() {
            let refreshed = self.refresh(&material).await?;
            self.persist(&refreshed).await?;
            Ok(refreshed)
        } else {
            Ok(material)
        }
    }

    pub async fn persist(&self, material: &AuthMaterial) -> Result<(), AuthError> {
        let sealed = self.encrypt(material)?;
        self.store
            .put_auth(sealed)
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))
    }

    async fn refresh(&self, current: &AuthMaterial) -> Result<AuthMaterial, AuthError> {
        #[derive(Serialize)]
        struct RefreshRequest<'a> {
            grant_type: &'a str,
            refresh_token: &'a str,
            client_id: &'a str,
            client_secret: &'a str,
        }
        #[derive(Deserialize)]
        struct RefreshResponse {
            access_token: String,
            #[serde(default)]
            refresh_token: Option<String>,
            expires_in: i64,
        }

        let resp = self
            .http
            .post(&self.token_url)
            .form(&RefreshRequest {
                grant_type: "refresh_token",
                refresh_token: &current.refresh_token,
                client_id: &self.client_id,
                client_secret: &self.client_secret,
            })
            .send()
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AuthError::RefreshFailed(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }

        let body: RefreshResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;

        Ok(AuthMaterial {
            access_token: body.access_token,
            refresh_token: body.refresh_token.unwrap_or_else(|| current.refresh_token.clone()),
            expires_at: Utc::now() + chrono::Duration::seconds(body.expires_in),
            bot_username: current.bot_username.clone(),
        })
    }

    fn encrypt(&self, material: &AuthMaterial) -> Result<AuthMaterial, AuthError> {
        match &self.cipher {
            None => Ok(material.clone()),
            Some(cipher) => Ok(AuthMaterial {
                access_token: seal(cipher, &material.access_token)?,
                refresh_token: seal(cipher, &material.refresh_token)?,
                expires_at: material.expires_at,
                bot_username: material.bot_username.clone(),
            }),
        }
    }

    fn decrypt(&self, material: AuthMaterial) -> Result<AuthMaterial, AuthError> {
        match &self.cipher {
            None => Ok(material),
            Some(cipher) => Ok(AuthMaterial {
                access_token: open(cipher, &material.access_token)?,
                refresh_token: open(cipher, &material.refresh_token)?,
                expires_at: material.expires_at,
                bot_username: material.bot_username,
            }),
        }
    }
}

/// Nonce is generated fresh per call and prepended to the ciphertext;
/// the combined bytes are base64-encoded as the single stored string.
fn seal(cipher: &Aes256Gcm, plaintext: &str) -> Result<String, AuthError> {
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| AuthError::Crypto(e.to_string()))?;

    let mut combined = nonce_bytes.to_vec();
    combined.extend(ciphertext);
    Ok(STANDARD.encode(combined))
}

fn open(cipher: &Aes256Gcm, encoded: &str) -> Result<String, AuthError> {
    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| AuthError::Crypto(e.to_string()))?;
    if raw.len() < 12 {
        return Err(AuthError::Crypto("ciphertext shorter than nonce".to_string()));
    }
    let (nonce_bytes, ciphertext) = raw.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| AuthError::Crypto(e.to_string()))?;
    String::from_utf8(plaintext).map_err(|e| AuthError::Crypto(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> Aes256Gcm {
        let key = [7u8; 32];
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key))
    }

    #[test]
    fn seal_then_open_round_trips() {
        let cipher = cipher();
        let sealed = seal(&cipher, "super-secret-token").unwrap();
        assert_ne!(sealed, "super-secret-token");
        let opened = open(&cipher, &sealed).unwrap();
        assert_eq!(opened, "super-secret-token");
    }

    #[test]
    fn seal_is_nondeterministic() {
        let cipher = cipher();
        let a = seal(&cipher, "same-input").unwrap();
        let b = seal(&cipher, "same-input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn open_rejects_truncated_ciphertext() {
        let cipher = cipher();
        assert!(open(&cipher, &STANDARD.encode([1, 2, 3])).is_err());
    }
}
