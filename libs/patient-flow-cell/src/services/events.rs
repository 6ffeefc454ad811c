use anyhow::Result;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::TransitionEvent;

pub const EVENTS_CHANNEL: &str = "clinic_events";

/// In-process fan-out of committed transition events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TransitionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: TransitionEvent) {
        match self.sender.send(event) {
            Ok(receivers) => debug!("Transition event delivered to {} subscribers", receivers),
            Err(_) => debug!("No subscribers for transition event"),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Forwards bus events to the Redis pub/sub channel [`EVENTS_CHANNEL`].
pub struct RedisEventRelay {
    pool: Pool,
}

impl RedisEventRelay {
    pub fn new(redis_url: &str) -> Result<Self> {
        let pool = Config::from_url(redis_url).create_pool(Some(Runtime::Tokio1))?;
        Ok(Self { pool })
    }

    pub fn spawn(self, mut events: broadcast::Receiver<TransitionEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Relaying transition events to Redis channel {}", EVENTS_CHANNEL);
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Err(e) = self.publish(&event).await {
                            warn!("Failed to relay event for appointment {}: {}", event.appointment_id, e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event relay lagged, {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn publish(&self, event: &TransitionEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.pool.get().await?;
        let _: () = conn.publish(EVENTS_CHANNEL, payload).await?;
        Ok(())
    }
}
