//! Store and gateway doubles shared by the engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::gateway::{ChatError, ChatGateway, DeliveryReceipt, PushError, PushGateway, PushMessage};
use crate::models::driver::{Driver, DriverId};
use crate::models::matching::{ExistingMatch, MatchRecord, PendingNotification};
use crate::models::ride::{RequestedRide, RideId, RideRequest, RideStatus};
use crate::store::{DriverFilter, MemoryStore, RideStore, StoreError};

/// Wraps a [`MemoryStore`] and injects failures on demand.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    fail_reads: AtomicBool,
    fail_inserts: AtomicBool,
    hide_details: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_inserts: AtomicBool::new(false),
            hide_details: AtomicBool::new(false),
        }
    }

    pub fn fail_reads(&self, on: bool) {
        self.fail_reads.store(on, Ordering::SeqCst);
    }

    pub fn fail_inserts(&self, on: bool) {
        self.fail_inserts.store(on, Ordering::SeqCst);
    }

    pub fn hide_details(&self, on: bool) {
        self.hide_details.store(on, Ordering::SeqCst);
    }

    fn check_reads(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RideStore for FlakyStore {
    async fn requested_rides(&self) -> Result<Vec<RequestedRide>, StoreError> {
        self.check_reads()?;
        self.inner.requested_rides().await
    }

    async fn ride_detail(&self, ride_id: RideId) -> Result<Option<RideRequest>, StoreError> {
        if self.hide_details.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.ride_detail(ride_id).await
    }

    async fn drivers(&self, filter: &DriverFilter) -> Result<Vec<Driver>, StoreError> {
        self.inner.drivers(filter).await
    }

    async fn existing_matches(&self, ride_ids: &[RideId]) -> Result<Vec<ExistingMatch>, StoreError> {
        self.inner.existing_matches(ride_ids).await
    }

    async fn busy_driver_ids(&self) -> Result<HashSet<DriverId>, StoreError> {
        self.inner.busy_driver_ids().await
    }

    async fn insert_match(&self, record: &MatchRecord) -> Result<(), StoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("deadlock detected".to_string()));
        }
        self.inner.insert_match(record).await
    }

    async fn pending_notifications(
        &self,
        window: Duration,
    ) -> Result<Vec<PendingNotification>, StoreError> {
        self.check_reads()?;
        self.inner.pending_notifications(window).await
    }

    async fn mark_notified(&self, ride_id: RideId, driver_id: DriverId) -> Result<(), StoreError> {
        self.inner.mark_notified(ride_id, driver_id).await
    }

    async fn clear_driver_token(&self, driver_id: DriverId) -> Result<(), StoreError> {
        self.inner.clear_driver_token(driver_id).await
    }

    async fn rides_created_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RideRequest>, StoreError> {
        self.check_reads()?;
        self.inner.rides_created_since(since).await
    }

    async fn ride_statuses(
        &self,
        ride_ids: &[RideId],
    ) -> Result<Vec<(RideId, RideStatus)>, StoreError> {
        self.check_reads()?;
        self.inner.ride_statuses(ride_ids).await
    }
}

#[derive(Debug, Clone, Copy)]
pub enum PushBehavior {
    InvalidToken,
    Unavailable,
}

/// Records every message; tokens can be scripted to fail.
#[derive(Default)]
pub struct ScriptedPush {
    behaviors: Mutex<HashMap<String, PushBehavior>>,
    sent: Mutex<Vec<PushMessage>>,
}

impl ScriptedPush {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, token: &str, behavior: PushBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(token.to_string(), behavior);
    }

    pub fn clear_script(&self, token: &str) {
        self.behaviors.lock().unwrap().remove(token);
    }

    pub fn sent(&self) -> Vec<PushMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, token: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|message| message.token == token)
            .count()
    }
}

#[async_trait]
impl PushGateway for ScriptedPush {
    async fn send(&self, message: &PushMessage) -> Result<DeliveryReceipt, PushError> {
        self.sent.lock().unwrap().push(message.clone());
        let behavior = self.behaviors.lock().unwrap().get(&message.token).copied();
        match behavior {
            Some(PushBehavior::InvalidToken) => {
                Err(PushError::InvalidToken("UNREGISTERED".to_string()))
            }
            Some(PushBehavior::Unavailable) => Err(PushError::Delivery("503".to_string())),
            None => Ok(DeliveryReceipt {
                message_id: format!("msg-{}", message.token),
            }),
        }
    }
}

#[derive(Default)]
pub struct RecordingChat {
    messages: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl RecordingChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn set_failing(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatGateway for RecordingChat {
    async fn post_message(&self, text: &str) -> Result<(), ChatError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChatError::Rejected(500));
        }
        self.messages.lock().unwrap().push(text.to_string());
        Ok(())
    }
}
