//! Keeps a local reflection of the user's library by combining
//! page+delta HTTP sync with live dealer-driven invalidation.

mod engine;
mod store;

pub use engine::{LibraryChangeEvent, SpotifyLibrarySync};
pub use store::{InMemoryLibraryStore, LibraryStore};

use async_trait::async_trait;
use thiserror::Error;

use crate::http::{HttpError, SpotifyHttpApi};
use crate::proto::collection::{DeltaRequest, DeltaResponse, PageRequest, PageResponse, WriteRequest};
use crate::proto::playlist::{ListChanges, SelectedListContent};

/// Closed set of library-sync failure reasons.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
  #[error("delta sync is not possible, a full resync is required")]
  DeltaImpossible,
  #[error("playlist revision conflict, refetch required")]
  ConflictRevision,
  #[error("transport error: {0}")]
  Transport(String),
}

impl From<HttpError> for SyncError {
  fn from(e: HttpError) -> Self {
    SyncError::Transport(e.to_string())
  }
}

/// A single item held in a collection-style set.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionItem {
  pub uri: String,
  pub added_at: i64,
  /// Raw protobuf bytes from the per-kind metadata endpoint, once fetched.
  pub metadata: Option<Vec<u8>>,
}

/// One entry in the rootlist walk, already resolved to its folder path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistRecord {
  pub uri: String,
  pub folder_path: Vec<String>,
  pub revision_counter: i32,
  pub revision_hash: Vec<u8>,
  pub length: i32,
}

/// The collection-style sets. `Collection` mixes tracks and albums,
/// disambiguated by URI prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionSet {
  Collection,
  Artist,
  Show,
  Ban,
  ArtistBan,
  ListenLater,
  YlPin,
  Enhanced,
}

impl CollectionSet {
  pub const ALL: [CollectionSet; 8] = [
    CollectionSet::Collection,
    CollectionSet::Artist,
    CollectionSet::Show,
    CollectionSet::Ban,
    CollectionSet::ArtistBan,
    CollectionSet::ListenLater,
    CollectionSet::YlPin,
    CollectionSet::Enhanced,
  ];

  /// The `filter` value spclient expects for this set.
  pub fn filter(&self) -> &'static str {
    match self {
      CollectionSet::Collection => "collection",
      CollectionSet::Artist => "artist",
      CollectionSet::Show => "show",
      CollectionSet::Ban => "ban",
      CollectionSet::ArtistBan => "artistban",
      CollectionSet::ListenLater => "listenlater",
      CollectionSet::YlPin => "ylpin",
      CollectionSet::Enhanced => "enhanced",
    }
  }
}

/// The extended-metadata kinds fetched in batches once a set's item list
/// is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKind {
  TrackV4,
  AlbumV4,
  ArtistV4,
  ShowV4,
  EpisodeV4,
}

impl MetadataKind {
  /// Chooses a kind from a Spotify URI's type segment, e.g.
  /// `spotify:track:...` → `TrackV4`. Returns `None` for URI shapes the
  /// metadata endpoint doesn't cover (playlists, folders).
  pub fn from_uri(uri: &str) -> Option<Self> {
    let mut parts = uri.splitn(3, ':');
    parts.next()?;
    match parts.next()? {
      "track" => Some(MetadataKind::TrackV4),
      "album" => Some(MetadataKind::AlbumV4),
      "artist" => Some(MetadataKind::ArtistV4),
      "show" => Some(MetadataKind::ShowV4),
      "episode" => Some(MetadataKind::EpisodeV4),
      _ => None,
    }
  }

  pub fn path_segment(&self) -> &'static str {
    match self {
      MetadataKind::TrackV4 => "track",
      MetadataKind::AlbumV4 => "album",
      MetadataKind::ArtistV4 => "artist",
      MetadataKind::ShowV4 => "show",
      MetadataKind::EpisodeV4 => "episode",
    }
  }
}

/// Narrow seam the sync engine needs from the HTTP layer, so engine.rs
/// can be tested against a fake instead of a live `SpotifyHttpApi`.
#[async_trait]
pub trait LibrarySyncApi: Send + Sync {
  async fn collection_page(&self, request: &PageRequest) -> Result<PageResponse, HttpError>;
  async fn collection_delta(&self, request: &DeltaRequest) -> Result<DeltaResponse, HttpError>;
  async fn collection_write(&self, request: &WriteRequest) -> Result<(), HttpError>;
  async fn metadata(&self, kind: &str, id: &str) -> Result<Vec<u8>, HttpError>;
  async fn playlist(&self, uri_as_path: &str, from: u32, length: u32) -> Result<SelectedListContent, HttpError>;
  async fn playlist_change(&self, uri_as_path: &str, changes: &ListChanges) -> Result<SelectedListContent, HttpError>;
}

#[async_trait]
impl LibrarySyncApi for SpotifyHttpApi {
  async fn collection_page(&self, request: &PageRequest) -> Result<PageResponse, HttpError> {
    SpotifyHttpApi::collection_page(self, request).await
  }

  async fn collection_delta(&self, request: &DeltaRequest) -> Result<DeltaResponse, HttpError> {
    SpotifyHttpApi::collection_delta(self, request).await
  }

  async fn collection_write(&self, request: &WriteRequest) -> Result<(), HttpError> {
    SpotifyHttpApi::collection_write(self, request).await
  }

  async fn metadata(&self, kind: &str, id: &str) -> Result<Vec<u8>, HttpError> {
    SpotifyHttpApi::metadata(self, kind, id).await
  }

  async fn playlist(&self, uri_as_path: &str, from: u32, length: u32) -> Result<SelectedListContent, HttpError> {
    SpotifyHttpApi::playlist(self, uri_as_path, "", from, length).await
  }

  async fn playlist_change(&self, uri_as_path: &str, changes: &ListChanges) -> Result<SelectedListContent, HttpError> {
    SpotifyHttpApi::playlist_change(self, uri_as_path, changes).await
  }
}
