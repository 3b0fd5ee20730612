use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushMessage {
    pub token: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReceipt {
    pub message_id: String,
}

#[derive(Debug, Error)]
pub enum PushError {
    /// The device token is unknown to the gateway and will never succeed.
    #[error("invalid push token: {0}")]
    InvalidToken(String),

    #[error("push delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send(&self, message: &PushMessage) -> Result<DeliveryReceipt, PushError>;
}

const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Tokens are refreshed this long before Google expires them.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Google service-account key, the JSON file downloaded from the console.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(default)]
    pub project_id: Option<String>,
    pub client_email: String,
    pub private_key: String,
    pub token_uri: String,
}

impl ServiceAccountKey {
    /// Accepts either inline JSON or a path to the key file.
    pub fn load(source: &str) -> Result<Self, PushError> {
        let raw = if source.trim_start().starts_with('{') {
            source.to_string()
        } else {
            std::fs::read_to_string(source).map_err(|err| {
                PushError::Delivery(format!("failed to read service account key {source}: {err}"))
            })?
        };

        serde_json::from_str(&raw)
            .map_err(|err| PushError::Delivery(format!("invalid service account key: {err}")))
    }
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at > now + TOKEN_REFRESH_MARGIN
    }
}

/// Firebase Cloud Messaging HTTP v1 client. Access tokens are minted from a
/// service-account key and cached until shortly before they expire.
pub struct FcmPushGateway {
    client: Client,
    endpoint: String,
    key: ServiceAccountKey,
    token: RwLock<Option<CachedToken>>,
}

#[derive(Serialize)]
struct FcmRequest<'a> {
    message: FcmPayload<'a>,
}

#[derive(Serialize)]
struct FcmPayload<'a> {
    token: &'a str,
    notification: FcmNotification<'a>,
    data: &'a serde_json::Map<String, Value>,
    android: FcmAndroid,
    apns: FcmApns,
}

#[derive(Serialize)]
struct FcmNotification<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Serialize)]
struct FcmAndroid {
    priority: &'static str,
    notification: FcmAndroidNotification,
}

#[derive(Serialize)]
struct FcmAndroidNotification {
    sound: &'static str,
    click_action: &'static str,
}

#[derive(Serialize)]
struct FcmApns {
    headers: FcmApnsHeaders,
    payload: Value,
}

#[derive(Serialize)]
struct FcmApnsHeaders {
    #[serde(rename = "apns-priority")]
    priority: &'static str,
}

#[derive(Deserialize)]
struct FcmResponse {
    name: String,
}

impl FcmPushGateway {
    /// `project_id` overrides the one named in the key.
    pub fn new(
        key: ServiceAccountKey,
        project_id: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PushError> {
        let project_id = project_id
            .or_else(|| key.project_id.clone())
            .ok_or_else(|| PushError::Delivery("no fcm project id configured".to_string()))?;

        Self::with_endpoint(
            key,
            format!("https://fcm.googleapis.com/v1/projects/{project_id}/messages:send"),
            timeout,
        )
    }

    pub fn with_endpoint(
        key: ServiceAccountKey,
        endpoint: String,
        timeout: Duration,
    ) -> Result<Self, PushError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| PushError::Delivery(format!("failed to build http client: {err}")))?;

        Ok(Self {
            client,
            endpoint,
            key,
            token: RwLock::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, PushError> {
        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.is_fresh(Instant::now()) {
                return Ok(cached.access_token.clone());
            }
        }

        let mut slot = self.token.write().await;
        // Another send may have refreshed while we waited for the lock.
        if let Some(cached) = slot.as_ref() {
            if cached.is_fresh(Instant::now()) {
                return Ok(cached.access_token.clone());
            }
        }

        let fresh = self.fetch_access_token().await?;
        let access_token = fresh.access_token.clone();
        *slot = Some(fresh);
        Ok(access_token)
    }

    async fn fetch_access_token(&self) -> Result<CachedToken, PushError> {
        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &self.key.client_email,
            scope: FCM_SCOPE,
            aud: &self.key.token_uri,
            iat: now,
            exp: now + 3600,
        };

        let signing_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|err| PushError::Delivery(format!("invalid service account private key: {err}")))?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|err| PushError::Delivery(format!("failed to sign fcm jwt: {err}")))?;

        let response = self
            .client
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|err| PushError::Delivery(format!("fcm token exchange failed: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::Delivery(format!(
                "fcm token exchange returned {status}: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| PushError::Delivery(format!("unreadable token response: {err}")))?;
        debug!(expires_in = token.expires_in, "fcm access token refreshed");

        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }

    async fn forget_token(&self) {
        *self.token.write().await = None;
    }

    #[cfg(test)]
    async fn seed_token(&self, access_token: &str, valid_for: Duration) {
        *self.token.write().await = Some(CachedToken {
            access_token: access_token.to_string(),
            expires_at: Instant::now() + valid_for,
        });
    }
}

/// Dead registrations come back as 404 `UNREGISTERED`, or as 400
/// `INVALID_ARGUMENT` naming the token. Any other 400 is a payload problem and
/// says nothing about the token.
fn is_invalid_token_response(status: u16, body: &str) -> bool {
    if status != 400 && status != 404 {
        return false;
    }
    if body.contains("UNREGISTERED") {
        return true;
    }
    if status != 400 {
        return false;
    }

    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return false;
    };
    let error = &parsed["error"];
    if error["status"] != "INVALID_ARGUMENT" {
        return false;
    }

    let names_token_field = error["details"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|detail| detail["fieldViolations"].as_array())
        .flatten()
        .any(|violation| violation["field"] == "message.token");
    let message_names_token = error["message"]
        .as_str()
        .is_some_and(|message| message.contains("registration token"));

    names_token_field || message_names_token
}

#[async_trait]
impl PushGateway for FcmPushGateway {
    async fn send(&self, message: &PushMessage) -> Result<DeliveryReceipt, PushError> {
        let request = FcmRequest {
            message: FcmPayload {
                token: &message.token,
                notification: FcmNotification {
                    title: &message.title,
                    body: &message.body,
                },
                data: &message.data,
                android: FcmAndroid {
                    priority: "high",
                    notification: FcmAndroidNotification {
                        sound: "default",
                        click_action: "FLUTTER_NOTIFICATION_CLICK",
                    },
                },
                apns: FcmApns {
                    headers: FcmApnsHeaders { priority: "10" },
                    payload: serde_json::json!({
                        "aps": { "sound": "default", "badge": 1, "content-available": 1 }
                    }),
                },
            },
        };

        let access_token = self.access_token().await?;
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&access_token)
            .json(&request)
            .send()
            .await
            .map_err(|err| PushError::Delivery(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body: FcmResponse = response
                .json()
                .await
                .map_err(|err| PushError::Delivery(format!("unreadable fcm response: {err}")))?;
            debug!(message_id = %body.name, "fcm message accepted");
            return Ok(DeliveryReceipt {
                message_id: body.name,
            });
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED {
            warn!("fcm rejected access token; refreshing before the next send");
            self.forget_token().await;
        }
        if is_invalid_token_response(status.as_u16(), &body) {
            return Err(PushError::InvalidToken(body));
        }

        Err(PushError::Delivery(format!("fcm returned {status}: {body}")))
    }
}

/// Accepts every message and only logs it. Used when FCM is not configured.
#[derive(Debug, Default, Clone)]
pub struct LogPushGateway;

#[async_trait]
impl PushGateway for LogPushGateway {
    async fn send(&self, message: &PushMessage) -> Result<DeliveryReceipt, PushError> {
        info!(
            token = %message.token,
            title = %message.title,
            "push gateway disabled; notification logged only"
        );
        Ok(DeliveryReceipt {
            message_id: format!("log-{}", Uuid::new_v4()),
        })
    }
}
