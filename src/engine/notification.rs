use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::gateway::{PushError, PushGateway, PushMessage};
use crate::models::driver::DriverId;
use crate::models::matching::PendingNotification;
use crate::store::{RideStore, StoreError};

pub const DEFAULT_NOTIFY_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub missing_token: usize,
    pub invalid_tokens: usize,
    pub failed: usize,
}

pub struct NotificationDispatcher {
    store: Arc<dyn RideStore>,
    push: Arc<dyn PushGateway>,
    window: Duration,
    title: String,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn RideStore>,
        push: Arc<dyn PushGateway>,
        window: Duration,
        title: impl Into<String>,
    ) -> Self {
        Self {
            store,
            push,
            window,
            title: title.into(),
        }
    }

    /// Pushes every pending match once. Each record is handled on its own:
    /// a failure leaves that record unnotified for the next cycle. A token
    /// rejected as invalid is not used again for the rest of the batch.
    pub async fn dispatch_pending(&self) -> Result<DispatchReport, StoreError> {
        let pending = self.store.pending_notifications(self.window).await?;
        let mut report = DispatchReport::default();
        let mut cleared: HashSet<DriverId> = HashSet::new();

        for notification in pending {
            let token = notification
                .push_token
                .clone()
                .filter(|_| !cleared.contains(&notification.driver_id));
            let Some(token) = token else {
                warn!(
                    ride_id = notification.ride_id,
                    driver_id = notification.driver_id,
                    "driver has no push token; skipping notification"
                );
                report.missing_token += 1;
                continue;
            };

            let message = self.build_message(token, &notification);
            match self.push.send(&message).await {
                Ok(receipt) => {
                    if let Err(err) = self
                        .store
                        .mark_notified(notification.ride_id, notification.driver_id)
                        .await
                    {
                        error!(
                            ride_id = notification.ride_id,
                            driver_id = notification.driver_id,
                            error = %err,
                            "push sent but match could not be marked notified"
                        );
                        report.failed += 1;
                        continue;
                    }
                    info!(
                        ride_id = notification.ride_id,
                        driver_id = notification.driver_id,
                        message_id = %receipt.message_id,
                        "ride request pushed to driver"
                    );
                    report.sent += 1;
                }
                Err(PushError::InvalidToken(reason)) => {
                    warn!(
                        ride_id = notification.ride_id,
                        driver_id = notification.driver_id,
                        reason = %reason,
                        "push token rejected; clearing it"
                    );
                    if let Err(err) = self.store.clear_driver_token(notification.driver_id).await {
                        error!(
                            driver_id = notification.driver_id,
                            error = %err,
                            "failed to clear invalid push token"
                        );
                    }
                    cleared.insert(notification.driver_id);
                    report.invalid_tokens += 1;
                }
                Err(err @ PushError::Delivery(_)) => {
                    error!(
                        ride_id = notification.ride_id,
                        driver_id = notification.driver_id,
                        error = %err,
                        "push delivery failed; will retry next cycle"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    fn build_message(&self, token: String, notification: &PendingNotification) -> PushMessage {
        let mut data = Map::new();
        data.insert(
            "ride_id".to_string(),
            Value::String(notification.ride_id.to_string()),
        );
        data.insert(
            "pickup_address".to_string(),
            Value::String(notification.pickup_address.clone()),
        );
        data.insert(
            "dropoff_address".to_string(),
            Value::String(notification.dropoff_address.clone()),
        );

        PushMessage {
            token,
            title: self.title.clone(),
            body: format!(
                "Pickup: {}\nDropoff: {}",
                notification.pickup_address, notification.dropoff_address
            ),
            data,
        }
    }
}
