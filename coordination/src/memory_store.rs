//! In-process backend for the cache store.
//!
//! Same observable semantics as the Redis backend: lazy TTL expiry, atomic
//! counters, owner-token locks. Published events are kept in a log so tests
//! can assert on progress streams.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{CacheError, CacheResult};

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

pub struct MemoryStore {
    prefix: String,
    entries: Mutex<HashMap<String, Entry>>,
    events: Mutex<Vec<(String, String)>>,
}

impl MemoryStore {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            entries: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    fn k(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn deadline(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|t| Instant::now() + t)
    }

    /// Drop the entry if its TTL has lapsed, then run `f` on what remains.
    fn with_live_entry<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, Entry>, String) -> T,
    ) -> T {
        let full = self.k(key);
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if entries.get(&full).is_some_and(|e| e.expired(now)) {
            entries.remove(&full);
        }
        f(&mut entries, full)
    }

    pub fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.with_live_entry(key, |entries, full| {
            Ok(entries.get(&full).and_then(|e| match &e.value {
                Value::Str(s) => Some(s.clone()),
                Value::Hash(_) => None,
            }))
        })
    }

    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.with_live_entry(key, |entries, full| {
            entries.insert(
                full,
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Self::deadline(ttl),
                },
            );
            Ok(())
        })
    }

    pub fn delete(&self, key: &str) -> CacheResult<()> {
        let full = self.k(key);
        self.entries.lock().unwrap().remove(&full);
        Ok(())
    }

    pub fn increment_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> CacheResult<i64> {
        self.with_live_entry(key, |entries, full| {
            let current = match entries.get(&full) {
                Some(Entry {
                    value: Value::Str(s),
                    ..
                }) => s.parse::<i64>().map_err(|_| {
                    CacheError::Command(format!("key {full} holds a non-integer value"))
                })?,
                Some(_) => {
                    return Err(CacheError::Command(format!("key {full} holds a hash")));
                }
                None => 0,
            };
            let next = current + delta;
            let expires_at = match (ttl, entries.get(&full)) {
                (Some(t), _) => Some(Instant::now() + t),
                (None, Some(e)) => e.expires_at,
                (None, None) => None,
            };
            entries.insert(
                full,
                Entry {
                    value: Value::Str(next.to_string()),
                    expires_at,
                },
            );
            Ok(next)
        })
    }

    pub fn hash_set(&self, key: &str, field: &str, value: &str) -> CacheResult<()> {
        self.hash_set_multi(key, &[(field, value.to_string())], None)
    }

    pub fn hash_set_multi(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        self.with_live_entry(key, |entries, full| {
            let entry = entries.entry(full).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Hash(map) => {
                    for (f, v) in fields {
                        map.insert((*f).to_string(), v.clone());
                    }
                }
                Value::Str(_) => {
                    return Err(CacheError::Command("key holds a plain value".into()));
                }
            }
            if ttl.is_some() {
                entry.expires_at = Self::deadline(ttl);
            }
            Ok(())
        })
    }

    pub fn hash_get_all(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        self.with_live_entry(key, |entries, full| {
            Ok(match entries.get(&full) {
                Some(Entry {
                    value: Value::Hash(map),
                    ..
                }) => map.clone(),
                _ => HashMap::new(),
            })
        })
    }

    pub fn hash_delete(&self, key: &str, field: &str) -> CacheResult<()> {
        self.with_live_entry(key, |entries, full| {
            if let Some(Entry {
                value: Value::Hash(map),
                ..
            }) = entries.get_mut(&full)
            {
                map.remove(field);
            }
            Ok(())
        })
    }

    pub fn acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> CacheResult<bool> {
        self.with_live_entry(key, |entries, full| {
            if entries.contains_key(&full) {
                return Ok(false);
            }
            entries.insert(
                full,
                Entry {
                    value: Value::Str(token.to_string()),
                    expires_at: Self::deadline(Some(ttl)),
                },
            );
            Ok(true)
        })
    }

    pub fn release_lock(&self, key: &str, token: &str) -> CacheResult<bool> {
        self.with_live_entry(key, |entries, full| {
            match entries.get(&full) {
                Some(Entry {
                    value: Value::Str(owner),
                    ..
                }) if owner == token => {
                    entries.remove(&full);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    pub fn refresh_lock(&self, key: &str, token: &str, ttl: Duration) -> CacheResult<bool> {
        self.with_live_entry(key, |entries, full| {
            match entries.get_mut(&full) {
                Some(entry) => match &entry.value {
                    Value::Str(owner) if owner == token => {
                        entry.expires_at = Self::deadline(Some(ttl));
                        Ok(true)
                    }
                    _ => Ok(false),
                },
                None => Ok(false),
            }
        })
    }

    pub fn publish(&self, channel: &str, payload: &str) -> CacheResult<()> {
        self.events
            .lock()
            .unwrap()
            .push((self.k(channel), payload.to_string()));
        Ok(())
    }

    /// Events published so far, in order. Test observability only.
    pub fn published(&self) -> Vec<(String, String)> {
        self.events.lock().unwrap().clone()
    }
}
