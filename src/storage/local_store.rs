use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;

/// Peer ids registered as holding a file, in registration order.
pub type OwnerList = Vec<String>;

/// This node's partition of the index: file name -> owner list.
///
/// One lock guards the whole map; every operation holds it for its full
/// duration.
#[derive(Default)]
pub struct LocalStore {
    map: Mutex<HashMap<String, OwnerList>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, key: &str, value: OwnerList) {
        self.map.lock().await.insert(key.to_string(), value);
    }

    pub async fn get(&self, key: &str) -> Option<OwnerList> {
        self.map.lock().await.get(key).cloned()
    }

    /// Remove `key`; absent keys are ignored.
    pub async fn remove(&self, key: &str) {
        self.map.lock().await.remove(key);
    }

    pub async fn keys(&self) -> BTreeSet<String> {
        self.map.lock().await.keys().cloned().collect()
    }

    /// Append `owner` to the list under `key` unless it is already there.
    ///
    /// Returns the resulting list.
    pub async fn append_owner(&self, key: &str, owner: &str) -> OwnerList {
        let mut map = self.map.lock().await;
        let owners = map.entry(key.to_string()).or_default();
        if !owners.iter().any(|o| o == owner) {
            owners.push(owner.to_string());
        }
        owners.clone()
    }

    pub async fn len(&self) -> usize {
        self.map.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.map.lock().await.is_empty()
    }
}
