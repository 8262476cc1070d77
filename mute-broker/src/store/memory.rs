//! Process-local store used for single-instance deployments and tests.
//! Mirrors the semantics of the store commands the service relies on,
//! including TTLs (measured on the tokio clock) and blocking list pops.

use super::{Store, StoreError, Subscription};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

#[derive(Debug)]
enum Value {
    Text(String),
    Set(BTreeSet<String>),
    List(VecDeque<String>),
    Sorted(HashMap<String, f64>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    const fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }
}

/// Minimum time between full scans for expired keys
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    channels: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    last_sweep: Option<Instant>,
}

impl State {
    /// Drops every key whose TTL has lapsed, at most once per sweep interval.
    /// Keys that are never touched again would otherwise stay in memory.
    fn sweep_expired(&mut self) {
        let now = Instant::now();
        if self
            .last_sweep
            .map_or(false, |at| now.duration_since(at) < SWEEP_INTERVAL)
        {
            return;
        }
        self.last_sweep = Some(now);
        self.entries
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
    }

    /// Forgets subscribers whose subscription was dropped, and channels left without any
    fn prune_channels(&mut self) {
        self.channels.retain(|_, subscribers| {
            subscribers.retain(|tx| !tx.is_closed());
            !subscribers.is_empty()
        });
    }

    /// Looks up a key, dropping it first if its TTL has lapsed
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map_or(false, |at| at <= now);
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn live_or_insert(&mut self, key: &str, value: impl FnOnce() -> Value) -> &mut Entry {
        self.live(key);
        self.entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(value()))
    }

    fn pop_front(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        let (item, now_empty) = match self.live(key) {
            None => return Ok(None),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => {
                let item = list.pop_front();
                (item, list.is_empty())
            }
            Some(_) => return Err(StoreError::WrongType(key.to_owned())),
        };
        if now_empty {
            self.entries.remove(key);
        }
        Ok(item)
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
    /// Bumped on every list push to wake blocked pops
    pushes: watch::Sender<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (pushes, _) = watch::channel(0);
        Self {
            state: Mutex::new(State::default()),
            pushes,
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().expect("memory store poisoned");
        state.sweep_expired();
        f(&mut state)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.with_state(|state| {
            let entry = state.live_or_insert(key, || Value::Text(String::from("0")));
            match &mut entry.value {
                Value::Text(text) => {
                    let count = text
                        .parse::<i64>()
                        .map_err(|_| StoreError::WrongType(key.to_owned()))?
                        + delta;
                    *text = count.to_string();
                    Ok(count)
                }
                _ => Err(StoreError::WrongType(key.to_owned())),
            }
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.with_state(|state| {
            if let Some(entry) = state.live(key) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_state(|state| match state.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_owned())),
        })
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.with_state(|state| {
            state.entries.insert(
                key.to_owned(),
                Entry {
                    value: Value::Text(value.to_owned()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
        });
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        Ok(self.with_state(|state| {
            if state.live(key).is_some() {
                return false;
            }
            state.entries.insert(
                key.to_owned(),
                Entry {
                    value: Value::Text(value.to_owned()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            true
        }))
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        Ok(self.with_state(|state| {
            let matches = matches!(
                state.live(key),
                Some(Entry { value: Value::Text(text), .. }) if text.as_str() == value
            );
            if matches {
                state.entries.remove(key);
            }
            matches
        }))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.with_state(|state| state.live(key).is_some()))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.with_state(|state| {
            match &mut state.live_or_insert(key, || Value::Set(BTreeSet::new())).value {
                Value::Set(set) => {
                    set.insert(member.to_owned());
                    Ok(())
                }
                _ => Err(StoreError::WrongType(key.to_owned())),
            }
        })
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.with_state(|state| match state.live(key) {
            None => Ok(()),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                set.remove(member);
                Ok(())
            }
            Some(_) => Err(StoreError::WrongType(key.to_owned())),
        })
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_state(|state| match state.live(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_owned())),
        })
    }

    async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.set_members(key).await?.len() as u64)
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_state(|state| {
            match &mut state.live_or_insert(key, || Value::List(VecDeque::new())).value {
                Value::List(list) => {
                    list.push_back(value.to_owned());
                    Ok(())
                }
                _ => Err(StoreError::WrongType(key.to_owned())),
            }
        })?;
        self.pushes.send_modify(|pushes| *pushes = pushes.wrapping_add(1));
        Ok(())
    }

    async fn list_pop_blocking(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        // Subscribe before checking so a push between the check and the wait is seen
        let mut pushes = self.pushes.subscribe();
        loop {
            if let Some(item) = self.with_state(|state| state.pop_front(key))? {
                return Ok(Some(item));
            }
            match tokio::time::timeout_at(deadline, pushes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(StoreError::Closed),
                Err(_) => return Ok(None),
            }
        }
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.with_state(|state| {
            let (removed, now_empty) = match state.live(key) {
                None => return Ok(false),
                Some(Entry {
                    value: Value::List(list),
                    ..
                }) => {
                    let removed = match list.iter().position(|item| item == value) {
                        Some(index) => list.remove(index).is_some(),
                        None => false,
                    };
                    (removed, list.is_empty())
                }
                Some(_) => return Err(StoreError::WrongType(key.to_owned())),
            };
            if now_empty {
                state.entries.remove(key);
            }
            Ok(removed)
        })
    }

    async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        self.with_state(|state| match state.live(key) {
            None => Ok(0),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.len() as u64),
            Some(_) => Err(StoreError::WrongType(key.to_owned())),
        })
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.with_state(|state| {
            match &mut state.live_or_insert(key, || Value::Sorted(HashMap::new())).value {
                Value::Sorted(members) => {
                    members.insert(member.to_owned(), score);
                    Ok(())
                }
                _ => Err(StoreError::WrongType(key.to_owned())),
            }
        })
    }

    async fn sorted_set_count(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        self.with_state(|state| match state.live(key) {
            None => Ok(0),
            Some(Entry {
                value: Value::Sorted(members),
                ..
            }) => Ok(members
                .values()
                .filter(|&&score| score >= min && score <= max)
                .count() as u64),
            Some(_) => Err(StoreError::WrongType(key.to_owned())),
        })
    }

    async fn sorted_set_remove_below(&self, key: &str, min: f64) -> Result<u64, StoreError> {
        self.with_state(|state| {
            let (removed, now_empty) = match state.live(key) {
                None => return Ok(0),
                Some(Entry {
                    value: Value::Sorted(members),
                    ..
                }) => {
                    let before = members.len();
                    members.retain(|_, score| *score >= min);
                    ((before - members.len()) as u64, members.is_empty())
                }
                Some(_) => return Err(StoreError::WrongType(key.to_owned())),
            };
            if now_empty {
                state.entries.remove(key);
            }
            Ok(removed)
        })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.with_state(|state| {
            if let Some(subscribers) = state.channels.get_mut(channel) {
                subscribers.retain(|tx| tx.send(payload.to_owned()).is_ok());
                if subscribers.is_empty() {
                    state.channels.remove(channel);
                }
            }
        });
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_state(|state| {
            state.prune_channels();
            state
                .channels
                .entry(channel.to_owned())
                .or_default()
                .push(tx);
        });
        let messages = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        })
        .boxed();
        Ok(Subscription::new(channel, messages))
    }
}
