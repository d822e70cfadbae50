use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::{CollectionItem, CollectionSet, PlaylistRecord};

/// Local reflection of the synced sets and playlists: a per-(set,
/// item-type) revision token, a per-collection item count, a last-sync
/// timestamp, and a uri-keyed set of entities. Item count is derivable
/// from `items(set).len()`; the rest are explicit.
/// Implementors only need to hold data; revision bookkeeping and diffing
/// live in the sync engine.
pub trait LibraryStore: Send + Sync {
  fn replace_set(&self, set: CollectionSet, items: Vec<CollectionItem>);
  fn apply_diff(&self, set: CollectionSet, added_or_updated: Vec<CollectionItem>, removed_uris: Vec<String>);
  fn items(&self, set: CollectionSet) -> Vec<CollectionItem>;

  fn revision(&self, set: CollectionSet) -> Option<String>;
  fn set_revision(&self, set: CollectionSet, token: String);

  fn last_synced_at(&self, set: CollectionSet) -> Option<DateTime<Utc>>;
  fn mark_synced_now(&self, set: CollectionSet, at: DateTime<Utc>);

  fn playlists(&self) -> Vec<PlaylistRecord>;
  fn remove_playlists_not_in(&self, present_uris: &[String]);
  fn upsert_playlist(&self, playlist: PlaylistRecord);
}

#[derive(Default)]
struct SetState {
  items: HashMap<String, CollectionItem>,
  revision: Option<String>,
  last_synced_at: Option<DateTime<Utc>>,
}

/// Default, process-local [`LibraryStore`]. Good enough as the library's
/// own cache; a persistent backend can implement the same trait.
#[derive(Default)]
pub struct InMemoryLibraryStore {
  sets: Mutex<HashMap<u8, SetState>>,
  playlists: Mutex<HashMap<String, PlaylistRecord>>,
}

impl InMemoryLibraryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn set_key(set: CollectionSet) -> u8 {
    set as u8
  }
}

impl LibraryStore for InMemoryLibraryStore {
  fn replace_set(&self, set: CollectionSet, items: Vec<CollectionItem>) {
    let mut sets = self.sets.lock().expect("library store mutex poisoned");
    let entry = sets.entry(Self::set_key(set)).or_default();
    entry.items = items.into_iter().map(|item| (item.uri.clone(), item)).collect();
  }

  fn apply_diff(&self, set: CollectionSet, added_or_updated: Vec<CollectionItem>, removed_uris: Vec<String>) {
    let mut sets = self.sets.lock().expect("library store mutex poisoned");
    let entry = sets.entry(Self::set_key(set)).or_default();
    for uri in removed_uris {
      entry.items.remove(&uri);
    }
    for item in added_or_updated {
      entry.items.insert(item.uri.clone(), item);
    }
  }

  fn items(&self, set: CollectionSet) -> Vec<CollectionItem> {
    let sets = self.sets.lock().expect("library store mutex poisoned");
    sets.get(&Self::set_key(set)).map(|state| state.items.values().cloned().collect()).unwrap_or_default()
  }

  fn revision(&self, set: CollectionSet) -> Option<String> {
    let sets = self.sets.lock().expect("library store mutex poisoned");
    sets.get(&Self::set_key(set)).and_then(|state| state.revision.clone())
  }

  fn set_revision(&self, set: CollectionSet, token: String) {
    let mut sets = self.sets.lock().expect("library store mutex poisoned");
    sets.entry(Self::set_key(set)).or_default().revision = Some(token);
  }

  fn last_synced_at(&self, set: CollectionSet) -> Option<DateTime<Utc>> {
    let sets = self.sets.lock().expect("library store mutex poisoned");
    sets.get(&Self::set_key(set)).and_then(|state| state.last_synced_at)
  }

  fn mark_synced_now(&self, set: CollectionSet, at: DateTime<Utc>) {
    let mut sets = self.sets.lock().expect("library store mutex poisoned");
    sets.entry(Self::set_key(set)).or_default().last_synced_at = Some(at);
  }

  fn playlists(&self) -> Vec<PlaylistRecord> {
    let guard = self.playlists.lock().expect("library store mutex poisoned");
    guard.values().cloned().collect()
  }

  fn remove_playlists_not_in(&self, present_uris: &[String]) {
    let mut guard = self.playlists.lock().expect("library store mutex poisoned");
    guard.retain(|uri, _| present_uris.contains(uri));
  }

  fn upsert_playlist(&self, playlist: PlaylistRecord) {
    let mut guard = self.playlists.lock().expect("library store mutex poisoned");
    guard.insert(playlist.uri.clone(), playlist);
  }
}
