use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::protocol::ServerMessage;
use crate::models::driver::DriverId;

pub type SessionId = Uuid;

/// One live client connection. Dropping the session drops `outbound`, which
/// ends the connection task.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_alive: bool,
    pub driver_id: Option<DriverId>,
    outbound: mpsc::Sender<ServerMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<SessionId>,
    pub pinged: usize,
}

pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
    queue_size: usize,
}

impl SessionRegistry {
    pub fn new(queue_size: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            queue_size: queue_size.max(1),
        }
    }

    /// Creates a session and hands back the receiving end of its direct queue.
    pub fn register(&self, now: DateTime<Utc>) -> (SessionId, mpsc::Receiver<ServerMessage>) {
        let (outbound, rx) = mpsc::channel(self.queue_size);
        let id = Uuid::new_v4();

        self.sessions.insert(
            id,
            Session {
                id,
                connected_at: now,
                last_activity: now,
                is_alive: true,
                driver_id: None,
                outbound,
            },
        );

        (id, rx)
    }

    /// Marks inbound traffic. Returns `false` when the session is gone.
    pub fn record_activity(&self, id: SessionId, now: DateTime<Utc>) -> bool {
        match self.sessions.get_mut(&id) {
            Some(mut session) => {
                session.last_activity = now;
                session.is_alive = true;
                true
            }
            None => false,
        }
    }

    /// Binds a driver to the session, replacing any earlier binding. Returns
    /// the previous driver id, or `None` when the session is gone.
    pub fn bind_driver(&self, id: SessionId, driver_id: DriverId) -> Option<Option<DriverId>> {
        self.sessions
            .get_mut(&id)
            .map(|mut session| session.driver_id.replace(driver_id))
    }

    pub fn remove(&self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    /// Queues a frame for one session without waiting.
    pub fn send_to(&self, id: SessionId, message: ServerMessage) -> bool {
        let Some(session) = self.sessions.get(&id) else {
            return false;
        };

        match session.outbound.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(session_id = %id, "session queue full; dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// One liveness tick. Sessions that stayed silent since the previous tick
    /// are evicted; the rest are marked pending and idle ones get a ping.
    pub fn sweep(&self, now: DateTime<Utc>, inactivity: Duration) -> SweepReport {
        let mut report = SweepReport::default();

        self.sessions.retain(|id, session| {
            if !session.is_alive {
                info!(
                    session_id = %id,
                    driver_id = ?session.driver_id,
                    "session missed heartbeat; closing"
                );
                report.evicted.push(*id);
                return false;
            }

            session.is_alive = false;

            if now - session.last_activity > inactivity {
                match session.outbound.try_send(ServerMessage::ping()) {
                    Ok(()) => {
                        debug!(session_id = %id, "ping sent to idle session");
                        report.pinged += 1;
                    }
                    Err(TrySendError::Full(_)) => {
                        warn!(session_id = %id, "session queue full; ping skipped");
                    }
                    Err(TrySendError::Closed(_)) => {
                        warn!(session_id = %id, "failed to ping session; closing");
                        report.evicted.push(*id);
                        return false;
                    }
                }
            }

            true
        });

        report
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn driver_of(&self, id: SessionId) -> Option<DriverId> {
        self.sessions.get(&id).and_then(|session| session.driver_id)
    }

    pub fn is_alive(&self, id: SessionId) -> Option<bool> {
        self.sessions.get(&id).map(|session| session.is_alive)
    }
}
