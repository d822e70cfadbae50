use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use log::warn;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{CollectionItem, CollectionSet, LibraryStore, LibrarySyncApi, MetadataKind, PlaylistRecord, SyncError};
use crate::dealer::DealerMessage;
use crate::http::HttpError;
use crate::proto::collection::{DeltaRequest, PageRequest, WriteRequest};
use crate::proto::playlist::{ListChanges, PlaylistItem, SelectedListContent};

const PAGE_LIMIT: i32 = 300;
const METADATA_BATCH: usize = 100;

/// Emitted once a set or playlist has been reconciled, whether the
/// trigger was a scheduled sync or a dealer-driven invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryChangeEvent {
  CollectionChanged(CollectionSet),
  PlaylistChanged(String),
}

/// Combines page+delta HTTP sync with dealer-driven invalidation to keep
/// a [`LibraryStore`] current.
pub struct SpotifyLibrarySync {
  api: Arc<dyn LibrarySyncApi>,
  store: Arc<dyn LibraryStore>,
  username: String,
  change_tx: broadcast::Sender<LibraryChangeEvent>,
}

impl SpotifyLibrarySync {
  pub fn new(api: Arc<dyn LibrarySyncApi>, store: Arc<dyn LibraryStore>, username: impl Into<String>) -> Arc<Self> {
    let (change_tx, _) = broadcast::channel(64);
    Arc::new(Self { api, store, username: username.into(), change_tx })
  }

  pub fn subscribe_changes(&self) -> broadcast::Receiver<LibraryChangeEvent> {
    self.change_tx.subscribe()
  }

  pub fn store(&self) -> &Arc<dyn LibraryStore> {
    &self.store
  }

  /// Delta sync if a revision is already known, else a full page sync
  ///.
  pub async fn sync_set(&self, set: CollectionSet) -> Result<(), SyncError> {
    if let Some(revision) = self.store.revision(set) {
      let request = DeltaRequest { username: self.username.clone(), filter: set.filter().to_string(), sync_token: revision, ..Default::default() };
      match self.api.collection_delta(&request).await {
        Ok(response) if response.delta_update_possible => {
          let mut added = Vec::new();
          let mut removed = Vec::new();
          for diff in response.diff {
            if !Self::belongs_to_set(set, &diff.uri) {
              continue;
            }
            if diff.is_removed {
              removed.push(diff.uri);
            } else {
              added.push(CollectionItem { uri: diff.uri, added_at: 0, metadata: None });
            }
          }
          self.store.apply_diff(set, added, removed);
          self.store.set_revision(set, response.sync_token);
          self.store.mark_synced_now(set, chrono::Utc::now());
          return Ok(());
        }
        Ok(_) => {}
        Err(e) => return Err(e.into()),
      }
    }
    self.full_sync_set(set).await
  }

  pub async fn sync_all_sets(&self) {
    for set in CollectionSet::ALL {
      if let Err(e) = self.sync_set(set).await {
        warn!("sync of collection set {:?} failed: {e}", set);
      }
    }
  }

  /// `Collection` mixes tracks and albums; every other set is homogeneous.
  fn belongs_to_set(set: CollectionSet, uri: &str) -> bool {
    if set != CollectionSet::Collection {
      return true;
    }
    uri.starts_with("spotify:track:") || uri.starts_with("spotify:album:")
  }

  async fn full_sync_set(&self, set: CollectionSet) -> Result<(), SyncError> {
    let mut items = Vec::new();
    let mut sync_token = String::new();
    loop {
      let request = PageRequest { username: self.username.clone(), filter: set.filter().to_string(), limit: PAGE_LIMIT, sync_token: sync_token.clone(), ..Default::default() };
      let page = self.api.collection_page(&request).await?;
      let done = page.last_page || page.next_sync_token.is_empty();
      for item in page.items {
        if Self::belongs_to_set(set, &item.uri) {
          items.push(CollectionItem { uri: item.uri, added_at: item.added_at, metadata: None });
        }
      }
      sync_token = page.next_sync_token;
      if done {
        break;
      }
    }

    self.fetch_metadata_batches(&mut items).await;
    self.store.replace_set(set, items);
    self.store.set_revision(set, sync_token);
    self.store.mark_synced_now(set, chrono::Utc::now());
    Ok(())
  }

  /// Extended metadata in batches of 100 URIs per kind. No batch endpoint
  /// is documented, so each id within a batch is fetched concurrently
  /// over the single-id metadata endpoint.
  async fn fetch_metadata_batches(&self, items: &mut [CollectionItem]) {
    let mut by_kind: HashMap<MetadataKind, Vec<usize>> = HashMap::new();
    for (idx, item) in items.iter().enumerate() {
      if let Some(kind) = MetadataKind::from_uri(&item.uri) {
        by_kind.entry(kind).or_default().push(idx);
      }
    }

    for (kind, indices) in by_kind {
      for chunk in indices.chunks(METADATA_BATCH) {
        let fetches = chunk.iter().map(|&idx| {
          let id = items[idx].uri.rsplit(':').next().unwrap_or_default().to_string();
          async move { (idx, self.api.metadata(kind.path_segment(), &id).await) }
        });
        for (idx, result) in join_all(fetches).await {
          match result {
            Ok(bytes) => items[idx].metadata = Some(bytes),
            Err(e) => warn!("metadata fetch failed for {}: {e}", items[idx].uri),
          }
        }
      }
    }
  }

  /// Optimistic save: update the local store first, then push the write;
  /// roll back on failure.
  pub async fn save(&self, set: CollectionSet, uris: Vec<String>) -> Result<(), SyncError> {
    self.write(set, uris, Vec::new()).await
  }

  pub async fn remove(&self, set: CollectionSet, uris: Vec<String>) -> Result<(), SyncError> {
    self.write(set, Vec::new(), uris).await
  }

  async fn write(&self, set: CollectionSet, add_uris: Vec<String>, remove_uris: Vec<String>) -> Result<(), SyncError> {
    let previous = self.store.items(set);
    let added_items = add_uris.iter().cloned().map(|uri| CollectionItem { uri, added_at: 0, metadata: None }).collect::<Vec<_>>();
    self.store.apply_diff(set, added_items, remove_uris.clone());

    let request = WriteRequest { username: self.username.clone(), filter: set.filter().to_string(), add_uris, remove_uris, ..Default::default() };
    if let Err(e) = self.api.collection_write(&request).await {
      self.store.replace_set(set, previous);
      return Err(e.into());
    }
    Ok(())
  }

  /// Walks the rootlist, tracking folder paths via start/end-group
  /// markers, then fetches each playlist's metadata.
  pub async fn sync_playlists(&self) -> Result<(), SyncError> {
    let rootlist_path = format!("user/{}/rootlist", self.username);
    let rootlist = self.api.playlist(&rootlist_path, 0, 10_000).await?;
    let walked = walk_rootlist(&rootlist.items);

    let mut fetched_uris = Vec::with_capacity(walked.len());
    for entry in &walked {
      let playlist_path = entry.uri.trim_start_matches("spotify:playlist:");
      match self.api.playlist(playlist_path, 0, 100).await {
        Ok(content) => {
          let record = playlist_record_from(entry.uri.clone(), entry.folder_path.clone(), &content);
          fetched_uris.push(record.uri.clone());
          self.store.upsert_playlist(record);
        }
        Err(e) => warn!("failed to fetch playlist {}: {e}", entry.uri),
      }
    }

    self.store.remove_playlists_not_in(&fetched_uris);
    Ok(())
  }

  /// A `409` means the server's revision moved under us; refetch and
  /// surface `ConflictRevision` rather than silently diverging.
  pub async fn change_playlist(&self, uri: &str, changes: &ListChanges) -> Result<SelectedListContent, SyncError> {
    let path = uri.trim_start_matches("spotify:playlist:");
    match self.api.playlist_change(path, changes).await {
      Ok(content) => Ok(content),
      Err(HttpError::RequestFailed(msg)) if msg.contains("409") => {
        let _ = self.api.playlist(path, 0, 100).await;
        Err(SyncError::ConflictRevision)
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Drives real-time invalidation from dealer traffic: playlist events
  /// refetch metadata, collection events trigger a resync of that set
  ///.
  pub fn spawn_realtime_invalidation(self: &Arc<Self>, mut messages: broadcast::Receiver<DealerMessage>) -> JoinHandle<()> {
    let engine = Arc::clone(self);
    tokio::spawn(async move {
      loop {
        match messages.recv().await {
          Ok(message) => engine.handle_dealer_message(&message).await,
          Err(broadcast::error::RecvError::Lagged(_)) => continue,
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    })
  }

  async fn handle_dealer_message(&self, message: &DealerMessage) {
    if let Some(playlist_path) = message.uri.strip_prefix("hm://playlist/") {
      if let Ok(content) = self.api.playlist(playlist_path, 0, 100).await {
        let uri = format!("spotify:playlist:{playlist_path}");
        let record = playlist_record_from(uri.clone(), Vec::new(), &content);
        self.store.upsert_playlist(record);
        let _ = self.change_tx.send(LibraryChangeEvent::PlaylistChanged(uri));
      }
      return;
    }

    if message.uri.starts_with("hm://collection/") {
      if let Some(set) = CollectionSet::ALL.into_iter().find(|set| message.uri.contains(set.filter())) {
        if self.sync_set(set).await.is_ok() {
          let _ = self.change_tx.send(LibraryChangeEvent::CollectionChanged(set));
        }
      }
    }
  }
}

struct WalkedPlaylist {
  uri: String,
  folder_path: Vec<String>,
}

/// `spotify:start-group:<id>:<name>` pushes a folder name onto the
/// current path; `spotify:end-group:<id>` pops it.
fn walk_rootlist(items: &[PlaylistItem]) -> Vec<WalkedPlaylist> {
  let mut out = Vec::new();
  let mut path: Vec<String> = Vec::new();

  for item in items {
    if let Some(rest) = item.uri.strip_prefix("spotify:start-group:") {
      let name = rest.splitn(2, ':').nth(1).unwrap_or(rest).to_string();
      path.push(name);
    } else if item.uri.starts_with("spotify:end-group:") {
      path.pop();
    } else if item.uri.starts_with("spotify:playlist:") {
      out.push(WalkedPlaylist { uri: item.uri.clone(), folder_path: path.clone() });
    }
  }

  out
}

fn playlist_record_from(uri: String, folder_path: Vec<String>, content: &SelectedListContent) -> PlaylistRecord {
  let revision = content.revision.clone().into_option().unwrap_or_default();
  PlaylistRecord { uri, folder_path, revision_counter: revision.counter, revision_hash: revision.hash, length: content.length }
}

#[cfg(test)]
mod tests {
  use async_trait::async_trait;
  use std::sync::Mutex as StdMutex;

  use super::*;
  use crate::proto::collection::{DeltaResponse, PageResponse};
  use crate::sync::InMemoryLibraryStore;

  #[derive(Default)]
  struct FakeApi {
    pages: StdMutex<Vec<PageResponse>>,
    delta: StdMutex<Option<DeltaResponse>>,
    rootlist: StdMutex<Option<SelectedListContent>>,
  }

  #[async_trait]
  impl LibrarySyncApi for FakeApi {
    async fn collection_page(&self, _request: &PageRequest) -> Result<PageResponse, HttpError> {
      Ok(self.pages.lock().unwrap().pop().unwrap_or_default())
    }

    async fn collection_delta(&self, _request: &DeltaRequest) -> Result<DeltaResponse, HttpError> {
      Ok(self.delta.lock().unwrap().clone().unwrap_or_default())
    }

    async fn collection_write(&self, _request: &WriteRequest) -> Result<(), HttpError> {
      Ok(())
    }

    async fn metadata(&self, _kind: &str, _id: &str) -> Result<Vec<u8>, HttpError> {
      Ok(vec![1, 2, 3])
    }

    async fn playlist(&self, _uri_as_path: &str, _from: u32, _length: u32) -> Result<SelectedListContent, HttpError> {
      self.rootlist.lock().unwrap().clone().ok_or(HttpError::NotFound)
    }

    async fn playlist_change(&self, _uri_as_path: &str, _changes: &ListChanges) -> Result<SelectedListContent, HttpError> {
      Err(HttpError::RequestFailed("unexpected status 409".to_string()))
    }
  }

  #[tokio::test]
  async fn full_sync_populates_the_store_and_records_a_revision() {
    let mut page = PageResponse::default();
    page.items.push({
      let mut item = crate::proto::collection::CollectionItem::default();
      item.uri = "spotify:track:abc".to_string();
      item
    });
    page.last_page = true;
    page.next_sync_token = "token-1".to_string();

    let api = Arc::new(FakeApi { pages: StdMutex::new(vec![page]), ..Default::default() });
    let store = Arc::new(InMemoryLibraryStore::new());
    let sync = SpotifyLibrarySync::new(api, store.clone(), "user1");

    sync.sync_set(CollectionSet::Collection).await.unwrap();

    assert_eq!(store.items(CollectionSet::Collection).len(), 1);
    assert_eq!(store.revision(CollectionSet::Collection), Some("token-1".to_string()));
  }

  #[tokio::test]
  async fn collection_mixes_only_track_and_album_uris() {
    let mut page = PageResponse::default();
    for uri in ["spotify:track:a", "spotify:artist:b"] {
      let mut item = crate::proto::collection::CollectionItem::default();
      item.uri = uri.to_string();
      page.items.push(item);
    }
    page.last_page = true;

    let api = Arc::new(FakeApi { pages: StdMutex::new(vec![page]), ..Default::default() });
    let store = Arc::new(InMemoryLibraryStore::new());
    let sync = SpotifyLibrarySync::new(api, store.clone(), "user1");

    sync.sync_set(CollectionSet::Collection).await.unwrap();

    let uris: Vec<_> = store.items(CollectionSet::Collection).into_iter().map(|i| i.uri).collect();
    assert_eq!(uris, vec!["spotify:track:a".to_string()]);
  }

  #[tokio::test]
  async fn failed_write_rolls_back_the_optimistic_update() {
    struct FailingWriteApi;

    #[async_trait]
    impl LibrarySyncApi for FailingWriteApi {
      async fn collection_page(&self, _r: &PageRequest) -> Result<PageResponse, HttpError> {
        Ok(PageResponse::default())
      }
      async fn collection_delta(&self, _r: &DeltaRequest) -> Result<DeltaResponse, HttpError> {
        Ok(DeltaResponse::default())
      }
      async fn collection_write(&self, _r: &WriteRequest) -> Result<(), HttpError> {
        Err(HttpError::ServerError)
      }
      async fn metadata(&self, _k: &str, _i: &str) -> Result<Vec<u8>, HttpError> {
        Ok(vec![])
      }
      async fn playlist(&self, _u: &str, _f: u32, _l: u32) -> Result<SelectedListContent, HttpError> {
        Err(HttpError::NotFound)
      }
      async fn playlist_change(&self, _u: &str, _c: &ListChanges) -> Result<SelectedListContent, HttpError> {
        Err(HttpError::NotFound)
      }
    }

    let store = Arc::new(InMemoryLibraryStore::new());
    store.replace_set(CollectionSet::Artist, vec![CollectionItem { uri: "spotify:artist:a".to_string(), added_at: 0, metadata: None }]);
    let sync = SpotifyLibrarySync::new(Arc::new(FailingWriteApi), store.clone(), "user1");

    let result = sync.save(CollectionSet::Artist, vec!["spotify:artist:b".to_string()]).await;

    assert!(result.is_err());
    let uris: Vec<_> = store.items(CollectionSet::Artist).into_iter().map(|i| i.uri).collect();
    assert_eq!(uris, vec!["spotify:artist:a".to_string()]);
  }

  #[test]
  fn rootlist_walk_tracks_folder_paths() {
    let mut items = Vec::new();
    let mut start = PlaylistItem::default();
    start.uri = "spotify:start-group:1:Rock".to_string();
    items.push(start);
    let mut playlist = PlaylistItem::default();
    playlist.uri = "spotify:playlist:abc".to_string();
    items.push(playlist);
    let mut end = PlaylistItem::default();
    end.uri = "spotify:end-group:1".to_string();
    items.push(end);

    let walked = walk_rootlist(&items);
    assert_eq!(walked.len(), 1);
    assert_eq!(walked[0].folder_path, vec!["Rock".to_string()]);
  }

  #[tokio::test]
  async fn playlist_change_conflict_maps_to_conflict_revision() {
    let api = Arc::new(FakeApi::default());
    let store = Arc::new(InMemoryLibraryStore::new());
    let sync = SpotifyLibrarySync::new(api, store, "user1");

    let result = sync.change_playlist("spotify:playlist:abc", &ListChanges::default()).await;

    assert_eq!(result.unwrap_err(), SyncError::ConflictRevision);
  }
}
