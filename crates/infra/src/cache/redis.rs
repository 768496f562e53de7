//! Redis-backed order cache.
//!
//! `SET order:{id} <json> EX <ttl>` / `GET` / `DEL`. A missing key (never
//! written, expired or invalidated) reads as `None`.

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use orderflow_core::{Order, OrderId};

use super::{CacheError, OrderCache, cache_key, decode_snapshot, encode_snapshot};

#[derive(Debug, Clone)]
pub struct RedisOrderCache {
    client: Arc<redis::Client>,
}

impl RedisOrderCache {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Fail fast at startup if Redis is unreachable.
    pub fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("PING")
            .query(&mut conn)
            .map_err(|e| CacheError::Unavailable(format!("PING failed: {}", e)))?;
        Ok(())
    }

    fn connection(&self) -> Result<redis::Connection, CacheError> {
        self.client
            .get_connection()
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }
}

impl OrderCache for RedisOrderCache {
    #[instrument(skip(self), fields(order_id = %id), err)]
    fn read(&self, id: OrderId) -> Result<Option<Order>, CacheError> {
        let mut conn = self.connection()?;

        let raw: Option<String> = redis::cmd("GET")
            .arg(cache_key(id))
            .query(&mut conn)
            .map_err(|e| CacheError::Unavailable(format!("GET failed: {}", e)))?;

        raw.as_deref().map(decode_snapshot).transpose()
    }

    #[instrument(skip(self, order), fields(order_id = %order.id, ttl_secs = ttl.as_secs()), err)]
    fn write(&self, order: &Order, ttl: Duration) -> Result<(), CacheError> {
        let snapshot = encode_snapshot(order)?;
        let mut conn = self.connection()?;

        // EX rejects 0; a sub-second TTL still gets one second.
        let ttl_secs = ttl.as_secs().max(1);
        let _: () = redis::cmd("SET")
            .arg(cache_key(order.id))
            .arg(snapshot)
            .arg("EX")
            .arg(ttl_secs)
            .query(&mut conn)
            .map_err(|e| CacheError::Unavailable(format!("SET failed: {}", e)))?;

        Ok(())
    }

    #[instrument(skip(self), fields(order_id = %id), err)]
    fn invalidate(&self, id: OrderId) -> Result<(), CacheError> {
        let mut conn = self.connection()?;

        let _: u64 = redis::cmd("DEL")
            .arg(cache_key(id))
            .query(&mut conn)
            .map_err(|e| CacheError::Unavailable(format!("DEL failed: {}", e)))?;

        Ok(())
    }
}
