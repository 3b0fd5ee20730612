use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct FcmConfig {
    /// Service-account key: a file path or the JSON itself.
    pub credentials: String,
    /// Overrides the project named in the key.
    pub project_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub inactivity_threshold: Duration,
    pub match_radius_km: f64,
    pub notify_window: Duration,
    pub event_buffer_size: usize,
    pub session_queue_size: usize,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub fcm: Option<FcmConfig>,
    pub push_title: String,
    pub chat_webhook_url: Option<String>,
    pub alerts_enabled: bool,
    pub alert_interval: Duration,
    pub overdue_ride_after: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let match_radius_km: f64 = parse_or_default("MATCH_RADIUS_KM", 10.0)?;
        if !match_radius_km.is_finite() || match_radius_km <= 0.0 {
            return Err(AppError::Config(format!(
                "invalid MATCH_RADIUS_KM: {match_radius_km}"
            )));
        }

        let fcm = optional("FCM_CREDENTIALS").map(|credentials| FcmConfig {
            credentials,
            project_id: optional("FCM_PROJECT_ID"),
        });

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3003)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            poll_interval: seconds_or_default("POLL_INTERVAL_SECS", 5)?,
            heartbeat_interval: seconds_or_default("HEARTBEAT_INTERVAL_SECS", 30)?,
            inactivity_threshold: seconds_or_default("INACTIVITY_THRESHOLD_SECS", 30)?,
            match_radius_km,
            notify_window: seconds_or_default("NOTIFY_WINDOW_SECS", 300)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            session_queue_size: parse_or_default("SESSION_QUEUE_SIZE", 64)?,
            database_url: optional("DATABASE_URL"),
            db_max_connections: parse_or_default("DB_MAX_CONNECTIONS", 10)?,
            fcm,
            push_title: env::var("PUSH_TITLE").unwrap_or_else(|_| "New ride request".to_string()),
            chat_webhook_url: optional("CHAT_WEBHOOK_URL"),
            alerts_enabled: parse_or_default("ALERTS_ENABLED", true)?,
            alert_interval: seconds_or_default("ALERT_INTERVAL_SECS", 60)?,
            overdue_ride_after: seconds_or_default("OVERDUE_RIDE_SECS", 600)?,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|err| AppError::Config(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

/// Timer settings; zero would spin the loops, so it is rejected.
fn seconds_or_default(key: &str, default: u64) -> Result<Duration, AppError> {
    match parse_or_default(key, default)? {
        0 => Err(AppError::Config(format!("{key} must be greater than zero"))),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
