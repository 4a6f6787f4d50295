use std::{collections::HashMap, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use tokio::{sync::Mutex, time::Instant};

/// Key-value store shared by every worker. Implementations must make each
/// operation atomic for a single key.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn set(&self, key: &str, value: &str) -> Result<(), Error>;

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), Error>;

    /// Writes `new` only if the current value equals `expected` (`None` means
    /// the key must be absent). Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, Error>;

    /// Appends to a list and refreshes its TTL.
    async fn push(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), Error>;

    async fn range(&self, key: &str) -> Result<Vec<String>, Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;

    async fn ping(&self) -> Result<(), Error>;
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn SharedStore,
    key: &str,
) -> Result<Option<T>, Error> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(
            serde_json::from_str(&raw).map_err(|e| anyhow!("Corrupt value at {}: {}", key, e))?,
        )),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize>(
    store: &dyn SharedStore,
    key: &str,
    value: &T,
    ttl_seconds: Option<u64>,
) -> Result<(), Error> {
    let raw = serde_json::to_string(value)?;
    match ttl_seconds {
        Some(ttl) => store.set_ex(key, &raw, ttl).await,
        None => store.set(key, &raw).await,
    }
}

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Single-process store for tests and local development. Not shared across
/// processes, so breaker state is only coordinated within one process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(entries: &'a HashMap<String, Entry>, key: &str) -> Option<&'a Entry> {
        entries.get(key).filter(|e| e.is_live(Instant::now()))
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let entries = self.entries.lock().await;
        match Self::live(&entries, key).map(|e| &e.value) {
            Some(StoredValue::Text(v)) => Ok(Some(v.clone())),
            Some(StoredValue::List(_)) => Err(anyhow!("Key {} holds a list", key)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.entries.lock().await.insert(
            key.to_string(),
            Entry {
                value: StoredValue::Text(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), Error> {
        self.entries.lock().await.insert(
            key.to_string(),
            Entry {
                value: StoredValue::Text(value.to_string()),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, Error> {
        let mut entries = self.entries.lock().await;

        let current = match Self::live(&entries, key).map(|e| &e.value) {
            Some(StoredValue::Text(v)) => Some(v.as_str()),
            Some(StoredValue::List(_)) => return Err(anyhow!("Key {} holds a list", key)),
            None => None,
        };

        if current != expected {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: StoredValue::Text(new.to_string()),
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn push(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), Error> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let expires_at = Some(now + Duration::from_secs(ttl_seconds));

        match entries.get_mut(key).filter(|e| e.is_live(now)) {
            Some(Entry {
                value: StoredValue::List(items),
                expires_at: ttl,
            }) => {
                items.push(value.to_string());
                *ttl = expires_at;
            }
            Some(_) => return Err(anyhow!("Key {} does not hold a list", key)),
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: StoredValue::List(vec![value.to_string()]),
                        expires_at,
                    },
                );
            }
        }
        Ok(())
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, Error> {
        let entries = self.entries.lock().await;
        match Self::live(&entries, key).map(|e| &e.value) {
            Some(StoredValue::List(items)) => Ok(items.clone()),
            Some(StoredValue::Text(_)) => Err(anyhow!("Key {} does not hold a list", key)),
            None => Ok(Vec::new()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }
}
