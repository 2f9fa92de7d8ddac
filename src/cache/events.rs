use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::cache::CacheService;
use crate::error::StoreError;
use crate::models::EventId;
use crate::services::catalog::EventDetails;

pub fn details_key(event_id: EventId) -> String {
    format!("event:{}:details", event_id)
}

impl CacheService {
    /// Cached details, or `None` on a miss or any cache failure.
    pub async fn get_event_details(&self, event_id: EventId) -> Option<EventDetails> {
        match self.read_details(event_id).await {
            Ok(details) => details,
            Err(StoreError::Corrupt(reason)) => {
                warn!("Dropping unreadable cache entry for event {}: {}", event_id, reason);
                self.invalidate_event(event_id).await;
                None
            }
            Err(e) => {
                warn!("Cache read for event {} failed: {}", event_id, e);
                None
            }
        }
    }

    pub async fn cache_event_details(&self, details: &EventDetails) {
        if let Err(e) = self.write_details(details).await {
            warn!("Cache write for event {} failed: {}", details.event.id, e);
        }
    }

    pub async fn invalidate_event(&self, event_id: EventId) {
        let mut conn = self.redis.conn.clone();
        let result: Result<(), _> = conn.del(details_key(event_id)).await;
        match result {
            Ok(()) => debug!("Invalidated details cache for event {}", event_id),
            Err(e) => warn!("Failed to invalidate cache for event {}: {}", event_id, e),
        }
    }

    pub async fn invalidate_events(&self, event_ids: impl IntoIterator<Item = EventId>) {
        let keys: Vec<String> = event_ids.into_iter().map(details_key).collect();
        if keys.is_empty() {
            return;
        }

        let mut conn = self.redis.conn.clone();
        let result: Result<(), _> = conn.del(&keys).await;
        match result {
            Ok(()) => debug!("Invalidated details cache for {} events", keys.len()),
            Err(e) => warn!("Failed to invalidate cache for {} events: {}", keys.len(), e),
        }
    }

    // === Redis access ===

    async fn read_details(&self, event_id: EventId) -> Result<Option<EventDetails>, StoreError> {
        let mut conn = self.redis.conn.clone();
        let data: Option<String> = conn.get(details_key(event_id)).await?;
        data.map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    async fn write_details(&self, details: &EventDetails) -> Result<(), StoreError> {
        let data = serde_json::to_string(details).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut conn = self.redis.conn.clone();
        let () = conn.set_ex(details_key(details.event.id), data, self.ttl_secs).await?;
        Ok(())
    }
}
