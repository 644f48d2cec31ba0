//! Shared Redis connection for the job, window and metrics stores.

use crate::config::RedisConfig;
use crate::error::{ErrorCode, RelayError, Result};
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;

/// Lazily connected, auto-reconnecting Redis handle.
///
/// The first command establishes the connection. A failed attempt leaves the
/// cell empty, so the next command tries again instead of poisoning the
/// process when Redis starts after Relay does.
pub struct RedisBackend {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
    key_prefix: String,
}

impl RedisBackend {
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            RelayError::with_internal(
                ErrorCode::InvalidConfiguration,
                "Invalid Redis URL",
                e.to_string(),
            )
        })?;

        Ok(Self {
            client,
            manager: OnceCell::new(),
            key_prefix: config.key_prefix.clone(),
        })
    }

    /// Get a connection handle; clones share one multiplexed connection.
    pub async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| RelayError::store_unavailable(e.to_string()).with_source(e))
            })
            .await?;
        Ok(manager.clone())
    }

    /// Build a namespaced key: `{prefix}:{part}:{part}...`.
    pub fn key(&self, parts: &[&str]) -> String {
        let mut key = self.key_prefix.clone();
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    pub fn prefix(&self) -> &str {
        &self.key_prefix
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("key_prefix", &self.key_prefix)
            .field("connected", &self.manager.initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let backend = RedisBackend::new(&RedisConfig::default()).unwrap();
        assert_eq!(backend.key(&["job", "abc"]), "relay:job:abc");
        assert_eq!(backend.key(&[]), "relay");
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = RedisConfig {
            url: "not a url".to_string(),
            key_prefix: "relay".to_string(),
        };
        assert_eq!(
            RedisBackend::new(&config).unwrap_err().code(),
            ErrorCode::InvalidConfiguration
        );
    }
}
