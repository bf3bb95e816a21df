// SPDX-License-Identifier: BSD-3-Clause

//! Credential provider boundary.
//!
//! Externally-authenticated clusters (exec-based cloud IAM tokens and the
//! like) plug in through [`CredentialProvider`]. Requests read the last
//! cached token and never block on a refresh in progress, except when no
//! valid cached token exists yet: then a synchronous fetch runs with
//! bounded retries. A per-cluster background task keeps the cache warm,
//! decoupled from request handling.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Maximum synchronous fetch attempts before surfacing a credential error.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff between fetch attempts.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// How often the background task nudges the provider to refresh.
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// A bearer token and its expiry.
#[derive(Debug, Clone)]
pub struct Token {
    pub token: String,
    pub expiry: SystemTime,
}

/// External credential source for one cluster.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Fetch a fresh token; the provider caches it internally.
    async fn fetch_token(&self) -> Result<Token>;

    /// The last fetched token, if any (possibly stale).
    fn cached_token(&self) -> Option<Token>;

    /// Whether the cached token is still usable.
    fn is_token_valid(&self) -> bool;

    /// Fire-and-forget asynchronous refresh.
    fn trigger_refresh(&self);

    /// Drop the cached token, forcing the next read to fetch.
    fn clear_token_cache(&self);
}

/// Token read path used before each request: cached when valid, otherwise a
/// bounded-retry synchronous fetch.
pub(crate) async fn token_with_retry(provider: &dyn CredentialProvider) -> Result<Token> {
    if provider.is_token_valid() {
        if let Some(token) = provider.cached_token() {
            return Ok(token);
        }
    }

    let mut last_err: Option<Error> = None;
    for attempt in 0..MAX_RETRIES {
        match provider.fetch_token().await {
            Ok(token) => return Ok(token),
            Err(e) => {
                let delay = RETRY_BASE_DELAY * 2_u32.pow(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = MAX_RETRIES,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "token fetch failed, backing off"
                );
                last_err = Some(e);
                if attempt + 1 < MAX_RETRIES {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(Error::credential(format!(
        "token fetch failed after {MAX_RETRIES} attempts: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Background refresh loop; exits promptly when `cancel` fires.
pub(crate) fn spawn_refresh(
    provider: Arc<dyn CredentialProvider>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("credential refresh task cancelled");
                    return;
                }
                _ = tokio::time::sleep(REFRESH_INTERVAL) => {
                    if !provider.is_token_valid() {
                        provider.trigger_refresh();
                    }
                }
            }
        }
    })
}
