use std::collections::HashMap;
use std::time::Duration;

use arena_models::connection::{ConnectionEntry, ConnectionState};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::store::StoreError;

/// Records which user is behind each live gateway connection and what it did last.
#[allow(async_fn_in_trait)]
pub trait ConnectionRegistry: Send + Sync {
    async fn set(
        &self,
        connection_id: &str,
        user_id: &str,
        state: ConnectionState,
    ) -> Result<(), StoreError>;
    /// Changes the lifecycle state only. The bound user id is preserved.
    async fn update_state(
        &self,
        connection_id: &str,
        state: ConnectionState,
    ) -> Result<(), StoreError>;
    async fn get(&self, connection_id: &str) -> Result<Option<ConnectionEntry>, StoreError>;
    async fn delete(&self, connection_id: &str) -> Result<(), StoreError>;
    async fn count(&self) -> Result<usize, StoreError>;
}

/// Process-local registry.
#[derive(Default)]
pub struct LocalRegistry {
    entries: DashMap<String, ConnectionEntry>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectionRegistry for LocalRegistry {
    async fn set(
        &self,
        connection_id: &str,
        user_id: &str,
        state: ConnectionState,
    ) -> Result<(), StoreError> {
        self.entries.insert(
            connection_id.to_string(),
            ConnectionEntry::new(connection_id, user_id, state),
        );
        Ok(())
    }

    async fn update_state(
        &self,
        connection_id: &str,
        state: ConnectionState,
    ) -> Result<(), StoreError> {
        if let Some(mut entry) = self.entries.get_mut(connection_id) {
            entry.state = state;
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get(&self, connection_id: &str) -> Result<Option<ConnectionEntry>, StoreError> {
        Ok(self.entries.get(connection_id).map(|e| e.value().clone()))
    }

    async fn delete(&self, connection_id: &str) -> Result<(), StoreError> {
        self.entries.remove(connection_id);
        Ok(())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.entries.len())
    }
}

/// Registry shared by every gateway instance through Redis. Entries are hashes
/// under `conn:<id>` that expire unless refreshed, so a crashed instance's
/// connections disappear on their own.
#[derive(Clone)]
pub struct SharedRegistry {
    conn: ConnectionManager,
    ttl: Duration,
}

fn entry_key(connection_id: &str) -> String {
    format!("conn:{connection_id}")
}

impl SharedRegistry {
    pub fn new(conn: ConnectionManager, ttl: Duration) -> Self {
        Self { conn, ttl }
    }

    fn ttl_secs(&self) -> i64 {
        self.ttl.as_secs().max(1) as i64
    }
}

impl ConnectionRegistry for SharedRegistry {
    async fn set(
        &self,
        connection_id: &str,
        user_id: &str,
        state: ConnectionState,
    ) -> Result<(), StoreError> {
        let key = entry_key(connection_id);
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset_multiple(
                &key,
                &[
                    ("user_id", user_id.to_string()),
                    ("state", state.as_str().to_string()),
                    ("updated_at", Utc::now().to_rfc3339()),
                ],
            )
            .ignore()
            .expire(&key, self.ttl_secs())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn update_state(
        &self,
        connection_id: &str,
        state: ConnectionState,
    ) -> Result<(), StoreError> {
        let key = entry_key(connection_id);
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset_multiple(
                &key,
                &[
                    ("state", state.as_str().to_string()),
                    ("updated_at", Utc::now().to_rfc3339()),
                ],
            )
            .ignore()
            .expire(&key, self.ttl_secs())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, connection_id: &str) -> Result<Option<ConnectionEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let mut fields: HashMap<String, String> = conn.hgetall(entry_key(connection_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let updated_at = fields
            .get("updated_at")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Ok(Some(ConnectionEntry {
            connection_id: connection_id.to_string(),
            user_id: fields.remove("user_id").unwrap_or_default(),
            state: fields
                .remove("state")
                .map(ConnectionState::from)
                .unwrap_or(ConnectionState::Unknown),
            updated_at,
        }))
    }

    async fn delete(&self, connection_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(entry_key(connection_id)).await?;
        Ok(())
    }

    /// Approximate: keys may expire or appear while the scan runs.
    async fn count(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut total = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg("conn:*")
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            total += keys.len();
            if next == 0 {
                return Ok(total);
            }
            cursor = next;
        }
    }
}

/// Registry backing selected by `gateway.registry`.
pub enum Registry {
    Local(LocalRegistry),
    Shared(SharedRegistry),
}

impl Registry {
    pub fn local() -> Self {
        Registry::Local(LocalRegistry::new())
    }
}

impl ConnectionRegistry for Registry {
    async fn set(
        &self,
        connection_id: &str,
        user_id: &str,
        state: ConnectionState,
    ) -> Result<(), StoreError> {
        match self {
            Registry::Local(r) => r.set(connection_id, user_id, state).await,
            Registry::Shared(r) => r.set(connection_id, user_id, state).await,
        }
    }

    async fn update_state(
        &self,
        connection_id: &str,
        state: ConnectionState,
    ) -> Result<(), StoreError> {
        match self {
            Registry::Local(r) => r.update_state(connection_id, state).await,
            Registry::Shared(r) => r.update_state(connection_id, state).await,
        }
    }

    async fn get(&self, connection_id: &str) -> Result<Option<ConnectionEntry>, StoreError> {
        match self {
            Registry::Local(r) => r.get(connection_id).await,
            Registry::Shared(r) => r.get(connection_id).await,
        }
    }

    async fn delete(&self, connection_id: &str) -> Result<(), StoreError> {
        match self {
            Registry::Local(r) => r.delete(connection_id).await,
            Registry::Shared(r) => r.delete(connection_id).await,
        }
    }

    async fn count(&self) -> Result<usize, StoreError> {
        match self {
            Registry::Local(r) => r.count().await,
            Registry::Shared(r) => r.count().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_state_preserves_user() {
        let registry = LocalRegistry::new();
        registry
            .set("c1", "user_1", ConnectionState::Authed)
            .await
            .unwrap();
        registry
            .update_state("c1", ConnectionState::from("room:join"))
            .await
            .unwrap();

        let entry = registry.get("c1").await.unwrap().unwrap();
        assert_eq!(entry.user_id, "user_1");
        assert_eq!(entry.state, ConnectionState::Event("room:join".to_string()));
    }

    #[tokio::test]
    async fn update_state_ignores_unknown_connection() {
        let registry = LocalRegistry::new();
        registry
            .update_state("ghost", ConnectionState::Closed)
            .await
            .unwrap();
        assert!(registry.get("ghost").await.unwrap().is_none());
        assert_eq!(registry.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let registry = Registry::local();
        registry
            .set("c1", "", ConnectionState::Connecting)
            .await
            .unwrap();
        registry
            .set("c2", "", ConnectionState::Connecting)
            .await
            .unwrap();
        assert_eq!(registry.count().await.unwrap(), 2);

        registry.delete("c1").await.unwrap();
        assert!(registry.get("c1").await.unwrap().is_none());
        assert_eq!(registry.count().await.unwrap(), 1);
    }

    #[test]
    fn shared_entries_use_conn_prefix() {
        assert_eq!(entry_key("abc"), "conn:abc");
    }
}
