use crate::errors::{GatewayServiceError, Result};
use gateway_core::{Clock, Envelope, KeyDeriver};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// Envelope sealing and opening off the async executor.
///
/// AES and MD5 key stretching are CPU work; every call runs on the blocking
/// pool and at most `workers` of them run at once.
#[derive(Debug, Clone)]
pub struct CryptoService {
    keys: KeyDeriver,
    permits: Arc<Semaphore>,
}

impl CryptoService {
    pub fn new(clock: Arc<dyn Clock>, workers: usize) -> Self {
        Self {
            keys: KeyDeriver::new(clock),
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn keys(&self) -> &KeyDeriver {
        &self.keys
    }

    /// Seal `plaintext` with today's key for `secret`
    pub async fn seal(&self, plaintext: String, secret: &str) -> Result<String> {
        let key = self.keys.current(secret);
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| GatewayServiceError::Crypto(e.to_string()))?;

        tokio::task::spawn_blocking(move || Envelope::seal(&plaintext, &key))
            .await
            .map_err(|e| GatewayServiceError::Internal(format!("crypto worker failed: {e}")))?
            .map_err(GatewayServiceError::from)
    }

    /// Open with today's key; `None` for anything that does not decrypt
    pub async fn open(&self, ciphertext: &str, secret: &str) -> Option<String> {
        let key = self.keys.current(secret);
        let ciphertext = ciphertext.to_string();
        let _permit = self.permits.acquire().await.ok()?;

        match tokio::task::spawn_blocking(move || Envelope::open(&ciphertext, &key)).await {
            Ok(opened) => opened,
            Err(e) => {
                debug!(error = %e, "Crypto worker failed while opening envelope");
                None
            }
        }
    }

    pub async fn seal_json<T: Serialize + ?Sized>(&self, value: &T, secret: &str) -> Result<String> {
        let plaintext = serde_json::to_string(value)?;
        self.seal(plaintext, secret).await
    }

    pub async fn open_json<T: DeserializeOwned>(&self, ciphertext: &str, secret: &str) -> Option<T> {
        let plaintext = self.open(ciphertext, secret).await?;
        serde_json::from_str(&plaintext).ok()
    }
}
