use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::MultiplexedConnection};
use tracing::info;

use crate::clients::store::SharedStore;

/// `ARGV[1]` is "1" when the key is expected to be absent.
const COMPARE_AND_SWAP: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current then return 0 end
elseif current ~= ARGV[2] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    compare_and_swap: Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, Error> {
        info!("Connecting to Redis");

        let client =
            Client::open(redis_url).map_err(|e| anyhow!("Failed to create redis client: {}", e))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| anyhow!("Failed to connect to redis: {}", e))?;

        info!("Redis connection established");

        Ok(Self {
            connection,
            compare_and_swap: Script::new(COMPARE_AND_SWAP),
        })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut conn = self.connection.clone();
        conn.get::<_, Option<String>>(key)
            .await
            .map_err(|e| anyhow!("Failed to get {}: {}", key, e))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut conn = self.connection.clone();
        conn.set::<_, _, ()>(key, value)
            .await
            .map_err(|e| anyhow!("Failed to set {}: {}", key, e))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), Error> {
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_seconds)
            .await
            .map_err(|e| anyhow!("Failed to set {} with ttl: {}", key, e))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, Error> {
        let mut conn = self.connection.clone();
        let (expect_absent, expected) = match expected {
            Some(value) => ("0", value),
            None => ("1", ""),
        };

        let swapped: i32 = self
            .compare_and_swap
            .key(key)
            .arg(expect_absent)
            .arg(expected)
            .arg(new)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Compare-and-swap on {} failed: {}", key, e))?;

        Ok(swapped == 1)
    }

    async fn push(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), Error> {
        let mut conn = self.connection.clone();
        redis::pipe()
            .atomic()
            .rpush(key, value)
            .ignore()
            .expire(key, ttl_seconds as i64)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to append to {}: {}", key, e))
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.connection.clone();
        conn.lrange::<_, Vec<String>>(key, 0, -1)
            .await
            .map_err(|e| anyhow!("Failed to read list {}: {}", key, e))
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| anyhow!("Failed to delete {}: {}", key, e))
    }

    async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| anyhow!("Ping failed: {}", e))?;
        Ok(())
    }
}
