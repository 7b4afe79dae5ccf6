//! APNs provider connection: ES256 JWT auth over HTTP/2
//!
//! One [`ApnsConnection`] is built at startup and shared. `push` spawns one
//! request per device token onto a [`TaskTracker`], bounded by a semaphore of
//! `max_connections`; rejections are reported through the error callback.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::notification::PushNotification;
use super::{OfflinePush, PushErrorCallback, PushErrorCode};
use crate::error::{Error, Result};
use pushroute_core::config::ApnsConfig;

/// Provider tokens are refreshed before Apple's one-hour limit
const TOKEN_VALIDITY: Duration = Duration::from_secs(55 * 60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct ApnsClaims {
    iss: String,
    iat: i64,
}

struct CachedToken {
    token: String,
    created_at: Instant,
}

struct ApnsInner {
    config: ApnsConfig,
    encoding_key: EncodingKey,
    client: reqwest::Client,
    cached_token: Mutex<Option<CachedToken>>,
    on_error: PushErrorCallback,
}

pub struct ApnsConnection {
    inner: Arc<ApnsInner>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for ApnsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApnsConnection")
            .field("key_id", &self.inner.config.key_id)
            .field("environment", &self.inner.config.environment)
            .field("in_flight", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

impl ApnsConnection {
    /// Read the signing key and build the HTTP/2 client
    pub fn new(config: ApnsConfig, on_error: PushErrorCallback) -> Result<Self> {
        let key_pem = std::fs::read(&config.key_path).map_err(|e| {
            Error::Configuration(format!(
                "failed to read APNs key at {}: {e}",
                config.key_path
            ))
        })?;
        let encoding_key = EncodingKey::from_ec_pem(&key_pem)
            .map_err(|e| Error::Configuration(format!("failed to parse APNs key: {e}")))?;

        let client = reqwest::Client::builder()
            .http2_prior_knowledge()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;

        info!(
            key_id = %config.key_id,
            team_id = %config.team_id,
            host = %config.environment.host(),
            max_connections = config.max_connections,
            "APNs connection initialized"
        );

        let permits = Arc::new(Semaphore::new(config.max_connections.max(1)));

        Ok(Self {
            inner: Arc::new(ApnsInner {
                config,
                encoding_key,
                client,
                cached_token: Mutex::new(None),
                on_error,
            }),
            permits,
            tracker: TaskTracker::new(),
            cancel_token: CancellationToken::new(),
        })
    }

    /// Requests spawned and not yet finished
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

/// Body of an APNs request
#[must_use]
pub fn build_payload(notification: &PushNotification) -> Value {
    let mut aps = json!({ "sound": notification.sound });
    if let Some(badge) = notification.badge {
        aps["badge"] = json!(badge);
    }
    if let Some(alert) = &notification.alert {
        aps["alert"] = alert.clone();
    }

    let mut payload = json!({ "aps": aps });

    // Custom payload keys live next to "aps"
    if let (Some(root), Some(custom)) = (payload.as_object_mut(), notification.payload.as_object()) {
        for (key, value) in custom {
            if key != "aps" {
                root.insert(key.clone(), value.clone());
            }
        }
    }

    payload
}

impl ApnsInner {
    fn provider_token(&self) -> Result<String> {
        let mut cached = self.cached_token.lock();

        if let Some(token) = cached.as_ref() {
            if token.created_at.elapsed() < TOKEN_VALIDITY {
                return Ok(token.token.clone());
            }
        }

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.config.key_id.clone());
        let claims = ApnsClaims {
            iss: self.config.team_id.clone(),
            iat: chrono::Utc::now().timestamp(),
        };
        let token = jsonwebtoken::encode(&header, &claims, &self.encoding_key)
            .map_err(|e| Error::Push(format!("failed to sign provider token: {e}")))?;

        *cached = Some(CachedToken {
            token: token.clone(),
            created_at: Instant::now(),
        });
        Ok(token)
    }

    fn report(&self, code: PushErrorCode, device_token: &str) {
        (self.on_error)(code, device_token);
    }

    async fn send(&self, device_token: &str, payload: &Value, expiry: i64) {
        let jwt = match self.provider_token() {
            Ok(jwt) => jwt,
            Err(e) => {
                warn!(error = %e, "APNs provider token unavailable");
                self.report(PushErrorCode::ProcessingError, device_token);
                return;
            }
        };

        let url = format!(
            "https://{}/3/device/{}",
            self.config.environment.host(),
            device_token
        );

        let result = self
            .client
            .post(&url)
            .header("authorization", format!("bearer {jwt}"))
            .header("apns-topic", &self.config.bundle_id)
            .header("apns-push-type", "alert")
            .header("apns-priority", "10")
            .header("apns-expiration", expiry.to_string())
            .json(payload)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, token_len = device_token.len(), "APNs request failed");
                self.report(PushErrorCode::ProcessingError, device_token);
                return;
            }
        };

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "APNs send OK");
            return;
        }

        let body = response.text().await.unwrap_or_default();
        let reason = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("reason")?.as_str().map(String::from));

        if reason.as_deref() == Some("ExpiredProviderToken") {
            self.cached_token.lock().take();
        }

        let code = PushErrorCode::from_response(status.as_u16(), reason.as_deref());
        warn!(
            status = status.as_u16(),
            reason = ?reason,
            code = %code,
            token_len = device_token.len(),
            "APNs rejected notification"
        );
        self.report(code, device_token);
    }
}

#[async_trait]
impl OfflinePush for ApnsConnection {
    async fn push(&self, notification: &PushNotification, tokens: &[String]) {
        if self.tracker.is_closed() {
            warn!(tokens = tokens.len(), "APNs connection shut down, dropping push");
            for token in tokens {
                self.inner.report(PushErrorCode::Shutdown, token);
            }
            return;
        }

        let payload = Arc::new(build_payload(notification));
        let expiry = notification.expiry;

        for token in tokens {
            let inner = Arc::clone(&self.inner);
            let permits = Arc::clone(&self.permits);
            let cancel_token = self.cancel_token.clone();
            let payload = Arc::clone(&payload);
            let token = token.clone();

            self.tracker.spawn(async move {
                let permit = tokio::select! {
                    () = cancel_token.cancelled() => None,
                    permit = permits.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    inner.report(PushErrorCode::Shutdown, &token);
                    return;
                };
                inner.send(&token, &payload, expiry).await;
            });
        }

        debug!(tokens = tokens.len(), "APNs push queued");
    }

    /// Requests already sending are awaited; ones still waiting for a slot
    /// are dropped and reported as `Shutdown`.
    async fn shutdown(&self) {
        self.tracker.close();
        self.cancel_token.cancel();
        self.tracker.wait().await;
        info!("APNs connection shut down");
    }
}
