use crate::daemon::{CoinDaemon, DaemonError, RpcCall, RpcReply};
use crate::database::{Batch, Command, Guard, LedgerStore};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone)]
enum Entry {
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
    SortedSet(BTreeMap<String, i64>),
}

/// In-memory ledger with the same batch semantics as the Redis script.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, Entry>>,
    applied: Mutex<Vec<Batch>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `apply` fail as if the connection dropped.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn applied(&self) -> Vec<Batch> {
        self.applied.lock().unwrap().clone()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.data.lock().unwrap().contains_key(key)
    }

    pub fn hash(&self, key: &str) -> BTreeMap<String, String> {
        match self.data.lock().unwrap().get(key) {
            Some(Entry::Hash(hash)) => hash.clone(),
            _ => BTreeMap::new(),
        }
    }

    pub fn hash_f64(&self, key: &str, field: &str) -> Option<f64> {
        self.hash(key).get(field).and_then(|v| v.parse().ok())
    }

    pub fn set(&self, key: &str) -> BTreeSet<String> {
        match self.data.lock().unwrap().get(key) {
            Some(Entry::Set(set)) => set.clone(),
            _ => BTreeSet::new(),
        }
    }

    pub fn sorted_set(&self, key: &str) -> BTreeMap<String, i64> {
        match self.data.lock().unwrap().get(key) {
            Some(Entry::SortedSet(zset)) => zset.clone(),
            _ => BTreeMap::new(),
        }
    }

    pub fn seed_hash(&self, key: &str, pairs: &[(&str, &str)]) {
        let mut data = self.data.lock().unwrap();
        let hash = pairs
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect();
        data.insert(key.to_string(), Entry::Hash(hash));
    }

    pub fn seed_set(&self, key: &str, members: &[String]) {
        let mut data = self.data.lock().unwrap();
        data.insert(
            key.to_string(),
            Entry::Set(members.iter().cloned().collect()),
        );
    }

    fn guard_holds(data: &BTreeMap<String, Entry>, guard: &Guard) -> bool {
        match guard {
            Guard::Member { key, member } => {
                matches!(data.get(key), Some(Entry::Set(set)) if set.contains(member))
            }
            Guard::Field { key, field, value } => {
                let current = match data.get(key) {
                    Some(Entry::Hash(hash)) => hash.get(field),
                    _ => None,
                };
                current == value.as_ref()
            }
        }
    }

    fn hash_mut<'a>(data: &'a mut BTreeMap<String, Entry>, key: &str) -> &'a mut BTreeMap<String, String> {
        match data
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(BTreeMap::new()))
        {
            Entry::Hash(hash) => hash,
            other => panic!("{} holds {:?}, not a hash", key, other),
        }
    }

    fn set_mut<'a>(data: &'a mut BTreeMap<String, Entry>, key: &str) -> &'a mut BTreeSet<String> {
        match data
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(BTreeSet::new()))
        {
            Entry::Set(set) => set,
            other => panic!("{} holds {:?}, not a set", key, other),
        }
    }

    fn run(data: &mut BTreeMap<String, Entry>, command: &Command) {
        match command {
            Command::HIncrBy { key, field, delta } => {
                let hash = Self::hash_mut(data, key);
                let current: i64 = hash.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
                hash.insert(field.clone(), (current + delta).to_string());
            }
            Command::HIncrByFloat { key, field, delta } => {
                let hash = Self::hash_mut(data, key);
                let current: f64 = hash.get(field).and_then(|v| v.parse().ok()).unwrap_or(0.0);
                hash.insert(field.clone(), (current + delta).to_string());
            }
            Command::HSet { key, field, value } => {
                Self::hash_mut(data, key).insert(field.clone(), value.clone());
            }
            Command::HDel { key, field } => {
                let hash = Self::hash_mut(data, key);
                hash.remove(field);
                if hash.is_empty() {
                    data.remove(key);
                }
            }
            Command::ZAdd { key, score, member } => {
                match data
                    .entry(key.clone())
                    .or_insert_with(|| Entry::SortedSet(BTreeMap::new()))
                {
                    Entry::SortedSet(zset) => {
                        zset.insert(member.clone(), *score);
                    }
                    other => panic!("{} holds {:?}, not a sorted set", key, other),
                }
            }
            Command::SAdd { key, member } => {
                Self::set_mut(data, key).insert(member.clone());
            }
            Command::SMove {
                source,
                destination,
                member,
            } => {
                let moved = match data.get_mut(source) {
                    Some(Entry::Set(set)) => set.remove(member),
                    _ => false,
                };
                if moved {
                    if matches!(data.get(source), Some(Entry::Set(set)) if set.is_empty()) {
                        data.remove(source);
                    }
                    Self::set_mut(data, destination).insert(member.clone());
                }
            }
            Command::Rename { from, to } => {
                if let Some(entry) = data.remove(from) {
                    data.insert(to.clone(), entry);
                }
            }
            Command::Del { keys } => {
                for key in keys {
                    data.remove(key);
                }
            }
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn apply(&self, batch: &Batch) -> Result<bool> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into());
        }

        let mut data = self.data.lock().unwrap();
        if !batch.guards.iter().all(|g| Self::guard_holds(&data, g)) {
            return Ok(false);
        }
        for command in &batch.commands {
            Self::run(&mut data, command);
        }
        self.applied.lock().unwrap().push(batch.clone());
        Ok(true)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.hash(key).get(field).cloned())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.hash(key).into_iter().collect())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.set(key).into_iter().collect())
    }
}

type Handler = Box<dyn Fn(&str, &[Value]) -> std::result::Result<RpcReply, DaemonError> + Send + Sync>;

/// Daemon answering every call through one closure. A transport error for
/// any call of a batch fails the whole batch.
pub struct MockDaemon {
    handler: Handler,
    calls: Mutex<Vec<RpcCall>>,
}

impl MockDaemon {
    pub fn new(
        handler: impl Fn(&str, &[Value]) -> std::result::Result<RpcReply, DaemonError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn unreachable() -> Self {
        Self::new(|_, _| Err(DaemonError::Unreachable("connection refused".to_string())))
    }

    pub fn calls(&self) -> Vec<RpcCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<RpcCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == method)
            .collect()
    }
}

#[async_trait]
impl CoinDaemon for MockDaemon {
    async fn call(&self, method: &str, params: Vec<Value>) -> std::result::Result<RpcReply, DaemonError> {
        self.calls
            .lock()
            .unwrap()
            .push(RpcCall::new(method, params.clone()));
        (self.handler)(method, &params)
    }

    async fn batch(&self, calls: Vec<RpcCall>) -> std::result::Result<Vec<RpcReply>, DaemonError> {
        let mut replies = Vec::with_capacity(calls.len());
        for call in calls {
            self.calls.lock().unwrap().push(call.clone());
            replies.push((self.handler)(&call.method, &call.params)?);
        }
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_rejection_leaves_store_untouched() {
        let store = MemoryStore::new();
        store.seed_set("pending", &["a".to_string()]);

        let mut batch = Batch::new();
        batch.guard(Guard::Member {
            key: "pending".into(),
            member: "b".into(),
        });
        batch.push(Command::SAdd {
            key: "pending".into(),
            member: "c".into(),
        });

        assert!(!store.apply(&batch).await.unwrap());
        assert_eq!(store.set("pending").len(), 1);
        assert!(store.applied().is_empty());
    }

    #[tokio::test]
    async fn test_rename_of_missing_key_is_noop() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch.push(Command::Rename {
            from: "missing".into(),
            to: "target".into(),
        });
        assert!(store.apply(&batch).await.unwrap());
        assert!(!store.exists("target"));
    }
}
