//! JSON frames exchanged with live clients.

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};

use crate::models::driver::DriverId;
use crate::models::matching::CandidateSummary;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(ServerEvent),
    Heartbeat(Heartbeat),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    RequestedDrivers {
        #[serde(rename = "phoneNumbers")]
        phone_numbers: Vec<String>,
    },
    DriverStatusUpdated {
        data: CandidateSummary,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Heartbeat {
    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
}

impl ServerMessage {
    pub fn initial_snapshot(summary: &CandidateSummary) -> Self {
        ServerMessage::Event(ServerEvent::RequestedDrivers {
            phone_numbers: summary.requested_drivers.clone(),
        })
    }

    pub fn status_updated(summary: CandidateSummary) -> Self {
        ServerMessage::Event(ServerEvent::DriverStatusUpdated { data: summary })
    }

    pub fn ping() -> Self {
        ServerMessage::Heartbeat(Heartbeat::Ping {
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    pub fn pong() -> Self {
        ServerMessage::Heartbeat(Heartbeat::Pong {
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Init {
        #[serde(deserialize_with = "driver_id_from_number_or_text")]
        driver_id: DriverId,
    },
    Ping,
    Pong,
    #[serde(other)]
    Unknown,
}

/// Mobile clients send the id either as a JSON number or as a string.
fn driver_id_from_number_or_text<'de, D>(deserializer: D) -> Result<DriverId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(DriverId),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(id) => Ok(id),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
