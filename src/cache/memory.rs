//! In-memory storage used to exercise gateway logic without SQLite.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::storage::CacheStorage;
use super::traits::{CachedEntry, RequestKey};
use crate::http::Response;

#[derive(Default)]
struct Store {
  name: String,
  entries: Vec<(RequestKey, CachedEntry)>,
}

/// Storage backed by a vector of stores. Can be told to fail deletions.
#[derive(Default)]
pub struct MemoryStorage {
  stores: Mutex<Vec<Store>>,
  fail_deletes: AtomicBool,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every subsequent `delete` return an error.
  pub fn fail_deletes(&self, fail: bool) {
    self.fail_deletes.store(fail, Ordering::SeqCst);
  }

  fn with_stores<T>(&self, f: impl FnOnce(&mut Vec<Store>) -> T) -> Result<T> {
    let mut stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(f(&mut stores))
  }
}

fn store_mut<'a>(stores: &'a mut Vec<Store>, name: &str) -> &'a mut Store {
  if let Some(idx) = stores.iter().position(|s| s.name == name) {
    &mut stores[idx]
  } else {
    stores.push(Store {
      name: name.to_string(),
      entries: Vec::new(),
    });
    let last = stores.len() - 1;
    &mut stores[last]
  }
}

fn upsert(store: &mut Store, key: &RequestKey, response: &Response) {
  let entry = CachedEntry {
    response: response.clone(),
    cached_at: Utc::now(),
  };
  match store.entries.iter_mut().find(|(k, _)| k == key) {
    Some(slot) => slot.1 = entry,
    None => store.entries.push((key.clone(), entry)),
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, name: &str) -> Result<()> {
    self.with_stores(|stores| {
      store_mut(stores, name);
    })
  }

  fn has(&self, name: &str) -> Result<bool> {
    self.with_stores(|stores| stores.iter().any(|s| s.name == name))
  }

  fn delete(&self, name: &str) -> Result<bool> {
    if self.fail_deletes.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to delete cache store {}: injected failure", name));
    }
    self.with_stores(|stores| {
      let before = stores.len();
      stores.retain(|s| s.name != name);
      stores.len() != before
    })
  }

  fn keys(&self) -> Result<Vec<String>> {
    self.with_stores(|stores| stores.iter().map(|s| s.name.clone()).collect())
  }

  fn match_entry(&self, name: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    self.with_stores(|stores| {
      stores
        .iter()
        .find(|s| s.name == name)
        .and_then(|s| s.entries.iter().find(|(k, _)| k == key))
        .map(|(_, entry)| entry.clone())
    })
  }

  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<bool> {
    self.with_stores(|stores| match stores.iter_mut().find(|s| s.name == name) {
      Some(store) => {
        upsert(store, key, response);
        true
      }
      None => false,
    })
  }

  fn put_all(&self, name: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    self.with_stores(|stores| {
      let store = store_mut(stores, name);
      for (key, response) in entries {
        upsert(store, key, response);
      }
    })
  }

  fn entries(&self, name: &str) -> Result<Vec<RequestKey>> {
    self.with_stores(|stores| {
      stores
        .iter()
        .find(|s| s.name == name)
        .map(|s| s.entries.iter().map(|(k, _)| k.clone()).collect())
        .unwrap_or_default()
    })
  }
}
