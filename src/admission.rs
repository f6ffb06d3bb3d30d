//! Admission control for outbound exchange calls
//!
//! Snapshot requests and WebSocket (re)connects acquire a permit first.
//! [`GovernorAdmission`] implements GCRA rate limiting per limit id via the
//! governor crate, plus a cap on concurrent in-flight calls.

use async_trait::async_trait;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{MarketDataError, Result};

/// Rate-limit gate consulted before every outbound call
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Wait until a call under `limit_id` may proceed. The permit is
    /// released when dropped.
    async fn acquire(&self, limit_id: &str) -> Result<AdmissionPermit>;
}

/// Scoped permission to perform one outbound call
#[derive(Debug)]
pub struct AdmissionPermit {
    limit_id: String,
    _slot: Option<OwnedSemaphorePermit>,
}

impl AdmissionPermit {
    pub fn limit_id(&self) -> &str {
        &self.limit_id
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        debug!(limit_id = %self.limit_id, "Admission permit released");
    }
}

/// Limits for [`GovernorAdmission`]
#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    /// Requests per minute, per limit id
    pub requests_per_minute: u32,
    /// Calls in flight at once, across all limit ids
    pub max_concurrent: usize,
    /// Maximum time to wait before rejecting a request
    pub queue_timeout: Duration,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: 1000,
            max_concurrent: 5,
            queue_timeout: Duration::from_secs(30),
        }
    }
}

/// Keyed GCRA limiter with a concurrency cap
pub struct GovernorAdmission {
    limiter: DefaultKeyedRateLimiter<String>,
    slots: Arc<Semaphore>,
    queue_timeout: Duration,
}

impl GovernorAdmission {
    pub fn new(settings: AdmissionSettings) -> Result<Self> {
        let per_minute = NonZeroU32::new(settings.requests_per_minute).ok_or_else(|| {
            MarketDataError::ConfigError("requests_per_minute must be non-zero".to_string())
        })?;
        if settings.max_concurrent == 0 {
            return Err(MarketDataError::ConfigError(
                "max_concurrent must be non-zero".to_string(),
            ));
        }

        Ok(Self {
            limiter: RateLimiter::keyed(Quota::per_minute(per_minute)),
            slots: Arc::new(Semaphore::new(settings.max_concurrent)),
            queue_timeout: settings.queue_timeout,
        })
    }
}

#[async_trait]
impl AdmissionControl for GovernorAdmission {
    async fn acquire(&self, limit_id: &str) -> Result<AdmissionPermit> {
        let key = limit_id.to_string();
        let wait = async {
            self.limiter.until_key_ready(&key).await;
            Arc::clone(&self.slots).acquire_owned().await
        };

        match timeout(self.queue_timeout, wait).await {
            Ok(Ok(slot)) => {
                debug!(limit_id, "Admission permit granted");
                Ok(AdmissionPermit {
                    limit_id: key,
                    _slot: Some(slot),
                })
            }
            Ok(Err(_closed)) => Err(MarketDataError::RateLimited(format!(
                "admission for '{}' is closed",
                limit_id
            ))),
            Err(_) => {
                warn!(
                    limit_id,
                    timeout_secs = self.queue_timeout.as_secs(),
                    "Admission queue timeout exceeded"
                );
                Err(MarketDataError::AdmissionTimeout {
                    limit_id: key,
                    secs: self.queue_timeout.as_secs(),
                })
            }
        }
    }
}

/// Admits everything immediately
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

#[async_trait]
impl AdmissionControl for Unlimited {
    async fn acquire(&self, limit_id: &str) -> Result<AdmissionPermit> {
        Ok(AdmissionPermit {
            limit_id: limit_id.to_string(),
            _slot: None,
        })
    }
}
